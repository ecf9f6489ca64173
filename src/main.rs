// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Process entry point: CLI parsing, logging setup + component wiring.
//!

use clap::Parser;
use futures::FutureExt;
use gpkg_featureserv::{
    MyError,
    config::Config,
    ds,
    openapi::OpenApiValidator,
    proxy::ReverseProxy,
    server::{self, AppState, ServerOpts, ShutdownHook},
    templates::TemplateStore,
};
use std::{
    net::SocketAddr,
    path::{Path, PathBuf},
    sync::Arc,
    time::Duration,
};
use tracing::info;
use tracing_subscriber::EnvFilter;

/// OGC API server over GeoPackage.
#[derive(Debug, Parser)]
#[command(version, about)]
struct Cli {
    /// Address the main listener binds.
    #[arg(long, env = "HOST", default_value = "0.0.0.0")]
    host: String,

    /// Port the main listener binds.
    #[arg(long, env = "PORT", default_value_t = 8080)]
    port: u16,

    /// Loopback port of the debug listener; disabled when absent.
    #[arg(long, env = "DEBUG_PORT")]
    debug_port: Option<u16>,

    /// Seconds to keep serving after a termination signal, letting load
    /// balancers drop this instance first.
    #[arg(long, env = "SHUTDOWN_DELAY", default_value_t = 0)]
    shutdown_delay: u64,

    /// Path to the TOML configuration file.
    #[arg(long, env = "CONFIG_FILE", default_value = "config.toml")]
    config_file: PathBuf,

    /// Path to the canonical OpenAPI document; sibling `fragments/*.json`
    /// files merge over it.
    #[arg(long, env = "OPENAPI_FILE", default_value = "openapi/openapi.json")]
    openapi_file: PathBuf,

    /// Accept (and strip) trailing slashes on request paths.
    #[arg(long, env = "ALLOW_TRAILING_SLASH", default_value_t = false)]
    allow_trailing_slash: bool,
}

#[tokio::main]
async fn main() -> Result<(), MyError> {
    // pick up a `.env` if present; real variables win.
    dotenvy::dotenv().ok();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .init();

    let cli = Cli::parse();
    let config = Arc::new(Config::from_file(&cli.config_file)?);
    info!("Loaded configuration from {:?}", cli.config_file);

    let fragments = openapi_fragments(&cli.openapi_file)?;
    let fragment_refs: Vec<&Path> = fragments.iter().map(PathBuf::as_path).collect();
    let openapi = Arc::new(OpenApiValidator::from_files(
        &cli.openapi_file,
        &fragment_refs,
    )?);
    info!(
        "Prepared OpenAPI document from {:?} + {} fragment(s)",
        cli.openapi_file,
        fragments.len()
    );

    let mut templates = TemplateStore::new(Path::new(&config.templates_dir), &config.languages)?;
    server::prerender_static(&mut templates, &config, &openapi)?;

    let source = ds::from_config(&config).await?;
    let proxy = Arc::new(ReverseProxy::new(&config.base_url));

    let state = AppState {
        config,
        source: source.clone(),
        templates: Arc::new(templates),
        openapi,
        proxy,
    };

    let hooks: Vec<ShutdownHook> = vec![Box::new(move || {
        async move { source.close().await }.boxed()
    })];

    let addr: SocketAddr = format!("{}:{}", cli.host, cli.port)
        .parse()
        .map_err(|_| MyError::Runtime("Malformed listen address".into()))?;
    let opts = ServerOpts {
        addr,
        debug_port: cli.debug_port,
        shutdown_delay: Duration::from_secs(cli.shutdown_delay),
        allow_trailing_slash: cli.allow_trailing_slash,
    };
    server::run(state, opts, hooks).await
}

// `fragments/*.json` next to the canonical document, in name order so the
// merge outcome is deterministic.
fn openapi_fragments(base: &Path) -> Result<Vec<PathBuf>, MyError> {
    let dir = base.parent().unwrap_or(Path::new(".")).join("fragments");
    if !dir.is_dir() {
        return Ok(Vec::new());
    }
    let mut it: Vec<PathBuf> = std::fs::read_dir(&dir)?
        .filter_map(|x| x.ok())
        .map(|x| x.path())
        .filter(|x| x.extension().is_some_and(|e| e == "json"))
        .collect();
    it.sort();
    Ok(it)
}
