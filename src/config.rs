// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Configuration parameters affecting the behaviour of this server.
//!
//! The configuration is read once at startup from a TOML file and is
//! immutable afterwards.  Every structure here is `Serialize` as well so
//! instances can double as template rendering context.
//!

use crate::MyError;
use serde::{Deserialize, Serialize};
use std::{fs, path::Path};
use url::Url;

/// Default page size when a request carries no `limit` parameter.
const DEFAULT_LIMIT: u32 = 10;
/// Hard ceiling a requested `limit` is clamped at.
const MAX_LIMIT: u32 = 1_000;
/// Default per-query timeout in seconds.
const DEFAULT_QUERY_TIMEOUT: u64 = 15;

/// Root configuration object.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Config {
    /// Public absolute base URL this instance is reachable at.
    pub base_url: String,
    /// Service title used on rendered pages.
    pub title: String,
    /// Service abstract used on rendered pages.
    #[serde(default)]
    pub description: String,
    /// Languages pages are offered in; the first one is the default.
    pub languages: Vec<String>,
    /// Directory holding the language-keyed template sets.
    #[serde(default = "default_templates_dir")]
    pub templates_dir: String,
    /// The collections this instance serves.
    pub collections: Vec<Collection>,
    /// Feature datasource settings.
    pub datasource: Datasource,
    /// Optional tile serving (proxied) settings.
    #[serde(default)]
    pub tiles: Option<Proxied>,
    /// Optional 3D GeoVolumes (proxied) settings.
    #[serde(default)]
    pub geovolumes: Option<Proxied>,
    /// Styles offered through the pre-rendered pages.
    #[serde(default)]
    pub styles: Vec<Style>,
    /// Features paging limits.
    #[serde(default)]
    pub limit: Limit,
}

fn default_templates_dir() -> String {
    "templates".to_owned()
}

/// One published collection.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Collection {
    /// Public identifier; also the default match key against the
    /// GeoPackage `gpkg_contents.identifier` column.
    pub id: String,
    /// Human readable title.
    #[serde(default)]
    pub title: Option<String>,
    /// Human readable description.
    #[serde(default)]
    pub description: Option<String>,
    /// Features-specific settings.
    #[serde(default)]
    pub features: CollectionFeatures,
}

/// Features-specific per-collection settings.
#[derive(Debug, Clone, Default, Deserialize, Serialize)]
pub struct CollectionFeatures {
    /// Overrides the `gpkg_contents.identifier` value this collection's
    /// feature table is matched on.
    #[serde(default)]
    pub datasource_id: Option<String>,
}

/// Which backing store provides features, selected at startup.
#[derive(Debug, Clone, Deserialize, Serialize)]
#[serde(tag = "kind", rename_all = "lowercase")]
pub enum Datasource {
    /// A spatialite-enabled GeoPackage file.
    GeoPackage {
        /// Path to the `.gpkg` file.
        file: String,
        /// Per-query timeout in seconds.
        #[serde(default = "default_query_timeout")]
        query_timeout: u64,
    },
    /// A PostGIS-enabled PostgreSQL database.
    PostGIS {
        /// Connection URL.
        url: String,
        /// Per-query timeout in seconds.
        #[serde(default = "default_query_timeout")]
        query_timeout: u64,
    },
}

fn default_query_timeout() -> u64 {
    DEFAULT_QUERY_TIMEOUT
}

/// Settings of an endpoint family answered by forwarding to an upstream
/// server.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Proxied {
    /// Upstream base URL requests are forwarded to.
    pub upstream_url: String,
}

/// One published style.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Style {
    /// Public style identifier.
    pub id: String,
    /// Human readable title.
    #[serde(default)]
    pub title: Option<String>,
}

/// Features paging limits.
#[derive(Debug, Clone, Deserialize, Serialize)]
pub struct Limit {
    /// Page size used when the request carries no `limit`.
    pub default: u32,
    /// Ceiling a requested `limit` is silently clamped at.
    pub max: u32,
}

impl Default for Limit {
    fn default() -> Self {
        Self {
            default: DEFAULT_LIMIT,
            max: MAX_LIMIT,
        }
    }
}

impl Config {
    /// Read + validate the configuration from a TOML file.
    pub fn from_file(path: &Path) -> Result<Self, MyError> {
        let text = fs::read_to_string(path)?;
        let config: Config = toml::from_str(&text)?;
        config.validate()?;
        Ok(config)
    }

    /// Return the default language tag.
    pub fn default_language(&self) -> &str {
        &self.languages[0]
    }

    /// Look up a configured collection by its public id.
    pub fn collection(&self, id: &str) -> Option<&Collection> {
        self.collections.iter().find(|x| x.id == id)
    }

    fn validate(&self) -> Result<(), MyError> {
        let _ = Url::parse(&self.base_url)?;
        if self.languages.is_empty() {
            return Err(MyError::Runtime("No languages configured".into()));
        }
        if self.collections.is_empty() {
            return Err(MyError::Runtime("No collections configured".into()));
        }
        if self.limit.default > self.limit.max {
            return Err(MyError::Runtime(
                "Default limit exceeds maximum limit".into(),
            ));
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const SAMPLE: &str = r#"
        base_url = "http://localhost:8080"
        title = "Addresses"
        languages = ["nl", "en"]

        [[collections]]
        id = "addresses"

        [collections.features]
        datasource_id = "adressen"

        [datasource]
        kind = "geopackage"
        file = "data/addresses.gpkg"
    "#;

    #[test]
    fn test_sample_parses() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        config.validate().unwrap();
        assert_eq!(config.default_language(), "nl");
        assert_eq!(config.limit.default, DEFAULT_LIMIT);
        assert_eq!(config.limit.max, MAX_LIMIT);
        let c = config.collection("addresses").unwrap();
        assert_eq!(c.features.datasource_id.as_deref(), Some("adressen"));
        match &config.datasource {
            Datasource::GeoPackage { query_timeout, .. } => {
                assert_eq!(*query_timeout, DEFAULT_QUERY_TIMEOUT)
            }
            x => panic!("Unexpected datasource: {x:?}"),
        }
    }

    #[test]
    fn test_bad_base_url_is_rejected() {
        let text = SAMPLE.replace("http://localhost:8080", "not a url");
        let config: Config = toml::from_str(&text).unwrap();
        assert!(config.validate().is_err());
    }

    #[test]
    fn test_unknown_collection_is_none() {
        let config: Config = toml::from_str(SAMPLE).unwrap();
        assert!(config.collection("unknown").is_none());
    }
}
