// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Route wiring, middleware, startup pre-rendering + graceful shutdown.
//!

use crate::{
    MyError,
    config::Config,
    ds::FeatureSource,
    features,
    negotiate::{self, FORMAT_PARAM, Format, LANGUAGE_COOKIE, LANGUAGE_PARAM},
    openapi::OpenApiValidator,
    proxy::{ProxyRules, ReverseProxy},
    templates::{TemplateKey, TemplateStore},
};
use axum::{
    Extension, Router, ServiceExt, middleware,
    extract::{ConnectInfo, Path, RawQuery, Request, State},
    http::{HeaderMap, HeaderName, HeaderValue, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
    routing::get,
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use futures::future::BoxFuture;
use std::{
    net::{IpAddr, SocketAddr},
    sync::Arc,
    time::Duration,
};
use tower::Layer;
use tokio::{
    net::TcpListener,
    signal::unix::{SignalKind, signal},
    sync::watch,
};
use tower_http::{
    CompressionLevel, catch_panic::CatchPanicLayer, compression::CompressionLayer,
    normalize_path::NormalizePathLayer, set_header::SetResponseHeaderLayer, trace::TraceLayer,
};
use tracing::{error, info};
use url::Url;

/// Value of the `API-Version` header stamped on every response.
const API_VERSION: &str = env!("CARGO_PKG_VERSION");

/// Hard cap on the drain phase of a graceful shutdown.
const SHUTDOWN_CAP: Duration = Duration::from_secs(5);

// formats the pre-rendered pages negotiate over.
const PAGE_FORMATS: [Format; 2] = [Format::Json, Format::Html];

/// Shared, read-mostly state handlers operate on.  Populated strictly
/// before the server starts listening; immutable afterwards.
#[derive(Clone)]
pub struct AppState {
    /// Startup configuration.
    pub config: Arc<Config>,
    /// The selected feature datasource.
    pub source: Arc<dyn FeatureSource>,
    /// Parsed templates + pre-rendered payloads.
    pub templates: Arc<TemplateStore>,
    /// Prepared merged OpenAPI document.
    pub openapi: Arc<OpenApiValidator>,
    /// Upstream forwarder for tiles + 3D tiles.
    pub proxy: Arc<ReverseProxy>,
}

/// A closure run between signal receipt and listener shutdown.
pub type ShutdownHook = Box<dyn FnOnce() -> BoxFuture<'static, ()> + Send>;

/// Address the request really came from, extracted once per request from
/// `X-Forwarded-For`/`X-Real-IP` (falling back to the socket peer) so
/// handlers + the proxy see through intermediaries.
#[derive(Debug, Clone, Copy)]
pub struct ClientIp(pub Option<IpAddr>);

async fn real_ip(mut req: Request, next: Next) -> Response {
    let headers = req.headers();
    let forwarded = headers
        .get("x-forwarded-for")
        .and_then(|x| x.to_str().ok())
        .and_then(|x| x.split(',').next())
        .and_then(|x| x.trim().parse().ok());
    let ip = forwarded
        .or_else(|| {
            headers
                .get("x-real-ip")
                .and_then(|x| x.to_str().ok())
                .and_then(|x| x.trim().parse().ok())
        })
        .or_else(|| {
            req.extensions()
                .get::<ConnectInfo<SocketAddr>>()
                .map(|x| x.0.ip())
        });
    req.extensions_mut().insert(ClientIp(ip));
    next.run(req).await
}

/// Listener + lifecycle knobs resolved by the CLI.
#[derive(Debug, Clone)]
pub struct ServerOpts {
    /// Address the main listener binds.
    pub addr: SocketAddr,
    /// Optional loopback port for the debug listener.
    pub debug_port: Option<u16>,
    /// Grace period before shutdown, letting load balancers drop this
    /// instance first.
    pub shutdown_delay: Duration,
    /// Strip trailing slashes from request paths.
    pub allow_trailing_slash: bool,
}

/// Render the full static page set into the store, validating each payload.
///
/// Runs before the listener opens; any failure aborts startup.
pub fn prerender_static(
    store: &mut TemplateStore,
    config: &Config,
    openapi: &OpenApiValidator,
) -> Result<(), MyError> {
    for language in &config.languages {
        for format in PAGE_FORMATS {
            store.prerender(
                TemplateKey::new("landing-page", format, language),
                "/",
                config,
                openapi,
            )?;
            store.prerender(
                TemplateKey::new("conformance", format, language),
                "/conformance",
                config,
                openapi,
            )?;
            store.prerender(
                TemplateKey::new("collections", format, language),
                "/collections",
                config,
                openapi,
            )?;
            for collection in &config.collections {
                store.prerender(
                    TemplateKey::instanced("collection", format, language, &collection.id),
                    "/collections/{collectionId}",
                    &serde_json::json!({ "config": config, "collection": collection }),
                    openapi,
                )?;
            }
            store.prerender(
                TemplateKey::new("styles", format, language),
                "/styles",
                config,
                openapi,
            )?;
            for style in &config.styles {
                store.prerender(
                    TemplateKey::instanced("style", format, language, &style.id),
                    "/styles/{styleId}",
                    &serde_json::json!({ "config": config, "style": style }),
                    openapi,
                )?;
                store.prerender(
                    TemplateKey::instanced("style-metadata", format, language, &style.id),
                    "/styles/{styleId}/metadata",
                    &serde_json::json!({ "config": config, "style": style }),
                    openapi,
                )?;
            }
        }
    }
    Ok(())
}

/// Assemble the main application router.
pub fn router(state: AppState) -> Router {
    Router::new()
        .route("/", get(landing_page))
        .route("/conformance", get(conformance))
        .route("/api", get(api_document))
        .route("/collections", get(collections))
        .route("/collections/{collectionId}", get(collection))
        .route("/collections/{collectionId}/items", get(features::get_features))
        .route(
            "/collections/{collectionId}/items/{featureId}",
            get(features::get_feature),
        )
        .route("/styles", get(styles))
        .route("/styles/{styleId}", get(style))
        .route("/styles/{styleId}/metadata", get(style_metadata))
        .route("/tiles/{*path}", get(tiles))
        .route("/3dtiles/{*path}", get(geovolumes))
        .route("/health", get(health))
        .with_state(state)
        .layer(
            SetResponseHeaderLayer::overriding(
                HeaderName::from_static("api-version"),
                HeaderValue::from_static(API_VERSION),
            ),
        )
        .layer(CompressionLayer::new().gzip(true).quality(CompressionLevel::Precise(5)))
        .layer(CatchPanicLayer::new())
        .layer(middleware::from_fn(real_ip))
        .layer(TraceLayer::new_for_http())
}

// loopback-only introspection routes.
fn debug_router(state: AppState) -> Router {
    Router::new()
        .route("/debug/config", get(debug_config))
        .route("/debug/version", get(|| async { API_VERSION }))
        .with_state(state)
}

/// Run the main listener (and the optional debug one) until a termination
/// signal, then drain gracefully: wait `shutdown_delay`, run all shutdown
/// hooks, and cap the drain at a hard 5 s.
pub async fn run(state: AppState, opts: ServerOpts, hooks: Vec<ShutdownHook>) -> Result<(), MyError> {
    let (tx, rx) = watch::channel(false);
    tokio::spawn(async move {
        wait_for_termination().await;
        let _ = tx.send(true);
    });

    if let Some(port) = opts.debug_port {
        let addr = SocketAddr::from(([127, 0, 0, 1], port));
        let listener = TcpListener::bind(addr).await?;
        info!("Debug listener on {addr}");
        let app = debug_router(state.clone());
        tokio::spawn(async move {
            if let Err(x) = axum::serve(listener, app).await {
                error!("Debug listener failed: {x}");
            }
        });
    }

    let listener = TcpListener::bind(opts.addr).await?;
    info!("Listening on {}", opts.addr);

    let delay = opts.shutdown_delay;
    let mut graceful_rx = rx.clone();
    let graceful = async move {
        let _ = graceful_rx.wait_for(|x| *x).await;
        info!("Termination signal received; draining in {delay:?}");
        tokio::time::sleep(delay).await;
        for hook in hooks {
            hook().await;
        }
    };

    let mut cap_rx = rx;
    let hard_cap = async move {
        let _ = cap_rx.wait_for(|x| *x).await;
        tokio::time::sleep(delay + SHUTDOWN_CAP).await;
    };

    let app = router(state);
    // path normalization has to wrap the router itself; as a plain route
    // layer it would run only after the route already matched.
    if opts.allow_trailing_slash {
        let app = NormalizePathLayer::trim_trailing_slash().layer(app);
        let make = ServiceExt::<Request>::into_make_service(app);
        tokio::select! {
            x = axum::serve(listener, make).with_graceful_shutdown(graceful) => x?,
            _ = hard_cap => error!("Graceful drain exceeded {SHUTDOWN_CAP:?}; terminating"),
        }
    } else {
        tokio::select! {
            x = axum::serve(listener, app).with_graceful_shutdown(graceful) => x?,
            _ = hard_cap => error!("Graceful drain exceeded {SHUTDOWN_CAP:?}; terminating"),
        }
    }
    info!("Bye");
    Ok(())
}

async fn wait_for_termination() {
    let mut interrupt =
        signal(SignalKind::interrupt()).expect("Failed installing SIGINT handler. Abort");
    let mut terminate =
        signal(SignalKind::terminate()).expect("Failed installing SIGTERM handler. Abort");
    let mut quit = signal(SignalKind::quit()).expect("Failed installing SIGQUIT handler. Abort");
    tokio::select! {
        _ = interrupt.recv() => {},
        _ = terminate.recv() => {},
        _ = quit.recv() => {},
    }
}

// ---- pre-rendered page handlers ----------------------------------------

async fn landing_page(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
    cookies: CookieJar,
) -> Response {
    serve_page(&state, "landing-page", "", &raw, &headers, &cookies)
}

async fn conformance(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
    cookies: CookieJar,
) -> Response {
    serve_page(&state, "conformance", "", &raw, &headers, &cookies)
}

async fn collections(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
    cookies: CookieJar,
) -> Response {
    serve_page(&state, "collections", "", &raw, &headers, &cookies)
}

async fn collection(
    State(state): State<AppState>,
    Path(collection_id): Path<String>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
    cookies: CookieJar,
) -> Response {
    serve_page(&state, "collection", &collection_id, &raw, &headers, &cookies)
}

async fn styles(
    State(state): State<AppState>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
    cookies: CookieJar,
) -> Response {
    serve_page(&state, "styles", "", &raw, &headers, &cookies)
}

async fn style(
    State(state): State<AppState>,
    Path(style_id): Path<String>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
    cookies: CookieJar,
) -> Response {
    serve_page(&state, "style", &style_id, &raw, &headers, &cookies)
}

async fn style_metadata(
    State(state): State<AppState>,
    Path(style_id): Path<String>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
    cookies: CookieJar,
) -> Response {
    serve_page(&state, "style-metadata", &style_id, &raw, &headers, &cookies)
}

// Serve a payload rendered at startup, negotiating (format, language).
fn serve_page(
    state: &AppState,
    name: &str,
    instance: &str,
    raw_query: &Option<String>,
    headers: &HeaderMap,
    cookies: &CookieJar,
) -> Response {
    let query: Vec<(String, String)> = match raw_query {
        Some(x) => url::form_urlencoded::parse(x.as_bytes())
            .into_owned()
            .collect(),
        None => Vec::new(),
    };
    let f_param = query
        .iter()
        .find(|(n, _)| n == FORMAT_PARAM)
        .map(|(_, v)| v.as_str());
    let accept = headers.get(header::ACCEPT).and_then(|x| x.to_str().ok());
    let format = match negotiate::format(f_param, accept, &PAGE_FORMATS) {
        Ok(x) => x,
        Err(x) => return (StatusCode::NOT_FOUND, x.to_string()).into_response(),
    };
    let lang_param = query
        .iter()
        .find(|(n, _)| n == LANGUAGE_PARAM)
        .map(|(_, v)| v.as_str());
    let language = negotiate::language(
        lang_param,
        cookies.get(LANGUAGE_COOKIE).map(|x| x.value()),
        headers
            .get(header::ACCEPT_LANGUAGE)
            .and_then(|x| x.to_str().ok()),
        &state.config.languages,
    );

    let key = TemplateKey::instanced(name, format, &language, instance);
    match state.templates.rendered(&key) {
        Some(body) => {
            let media_type = match format {
                Format::Html => format.media_type(),
                _ => "application/json",
            };
            let jar = cookies
                .to_owned()
                .add(Cookie::new(LANGUAGE_COOKIE.to_owned(), language));
            (
                StatusCode::OK,
                jar,
                [(header::CONTENT_TYPE, media_type.to_owned())],
                body,
            )
                .into_response()
        }
        None => (
            StatusCode::NOT_FOUND,
            format!("No such page: {name} {instance}"),
        )
            .into_response(),
    }
}

// ---- remaining handlers -------------------------------------------------

async fn api_document(State(state): State<AppState>) -> Response {
    (
        StatusCode::OK,
        [(
            header::CONTENT_TYPE,
            "application/vnd.oai.openapi+json;version=3.0".to_owned(),
        )],
        state.openapi.document().to_string(),
    )
        .into_response()
}

async fn health() -> &'static str {
    "OK"
}

async fn debug_config(State(state): State<AppState>) -> Response {
    match serde_json::to_string_pretty(state.config.as_ref()) {
        Ok(x) => (
            StatusCode::OK,
            [(header::CONTENT_TYPE, "application/json".to_owned())],
            x,
        )
            .into_response(),
        Err(x) => (StatusCode::INTERNAL_SERVER_ERROR, x.to_string()).into_response(),
    }
}

async fn tiles(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(raw): RawQuery,
    Extension(client_ip): Extension<ClientIp>,
    headers: HeaderMap,
) -> Response {
    let Some(tiles) = &state.config.tiles else {
        return (StatusCode::NOT_FOUND, "Tiles are not configured").into_response();
    };
    let rules = ProxyRules {
        prefer_204: true,
        content_type: None,
    };
    forward(
        state.proxy.as_ref(),
        &tiles.upstream_url,
        &path,
        &raw,
        &headers,
        client_ip,
        &rules,
    )
    .await
}

async fn geovolumes(
    State(state): State<AppState>,
    Path(path): Path<String>,
    RawQuery(raw): RawQuery,
    Extension(client_ip): Extension<ClientIp>,
    headers: HeaderMap,
) -> Response {
    let Some(geovolumes) = &state.config.geovolumes else {
        return (StatusCode::NOT_FOUND, "3D GeoVolumes are not configured").into_response();
    };
    // tileset descriptors are JSON; everything else is a binary payload
    // whose upstream content type passes through.
    let rules = ProxyRules {
        prefer_204: false,
        content_type: path
            .ends_with(".json")
            .then(|| "application/json".to_owned()),
    };
    forward(
        state.proxy.as_ref(),
        &geovolumes.upstream_url,
        &path,
        &raw,
        &headers,
        client_ip,
        &rules,
    )
    .await
}

#[allow(clippy::too_many_arguments)]
async fn forward(
    proxy: &ReverseProxy,
    upstream_base: &str,
    path: &str,
    raw_query: &Option<String>,
    headers: &HeaderMap,
    client_ip: ClientIp,
    rules: &ProxyRules,
) -> Response {
    let target = format!(
        "{}/{path}{}",
        upstream_base.trim_end_matches('/'),
        match raw_query {
            Some(x) => format!("?{x}"),
            None => String::new(),
        }
    );
    let url = match Url::parse(&target) {
        Ok(x) => x,
        Err(x) => {
            error!("Failed assembling upstream URL from '{target}': {x}");
            return (StatusCode::INTERNAL_SERVER_ERROR, "Failed to forward request")
                .into_response();
        }
    };
    match proxy.forward(url, headers, client_ip.0, rules).await {
        Ok(x) => x.into_response(),
        Err(x) => {
            error!("Upstream forwarding failed: {x}");
            (StatusCode::BAD_GATEWAY, "Upstream request failed").into_response()
        }
    }
}
