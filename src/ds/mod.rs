// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Groups artifacts providing _Features_ from known types of geospatial
//! stores such as GeoPackage files.
//!

mod gpkg;
pub(crate) mod mapper;
pub(crate) mod sql;

pub use gpkg::*;

use crate::{
    MyError,
    config::{Config, Datasource},
    model::{Feature, FeatureCollection, FeatureTable},
};
use async_trait::async_trait;
use std::sync::Arc;

/// Spatial restriction + paging window of a feature-collection query.
#[derive(Debug, Clone, Default)]
pub struct FeatureCriteria {
    /// FID the page starts at; `0` for the first page.
    pub start_fid: i64,
    /// Maximum number of features to return.
    pub limit: u32,
    /// Optional bounding box as `(minx, miny, maxx, maxy)`.
    pub bbox: Option<[f64; 4]>,
}

/// Capability of a backing store to answer the _Features_ operations.
///
/// Implementations are selected once at startup; handlers are polymorphic
/// over this trait and hold no store-specific state.
#[async_trait]
pub trait FeatureSource: Send + Sync {
    /// Return one page of features of `collection` satisfying `criteria`,
    /// in ascending FID order, together w/ the adjacent-page FID pair.
    async fn get_features(
        &self,
        collection: &str,
        criteria: &FeatureCriteria,
    ) -> Result<FeatureCollection, MyError>;

    /// Return the feature of `collection` w/ the given ID, or `None` when
    /// it does not exist.  Absence is NOT an error; distinguishing the two
    /// is the handler's responsibility.
    async fn get_feature(&self, collection: &str, fid: i64) -> Result<Option<Feature>, MyError>;

    /// Return the startup-resolved table descriptor of `collection`.
    fn table(&self, collection: &str) -> Option<&FeatureTable>;

    /// Release held resources.  Registered as a shutdown hook.
    async fn close(&self);
}

/// Construct the [FeatureSource] the configuration designates.
pub async fn from_config(config: &Config) -> Result<Arc<dyn FeatureSource>, MyError> {
    match &config.datasource {
        Datasource::GeoPackage {
            file,
            query_timeout,
        } => {
            let it = GpkgSource::connect(file, *query_timeout, &config.collections).await?;
            Ok(Arc::new(it))
        }
        // TODO (rsn) 20260801 - implement a PostGIS source w/ the same
        // adaptive paging queries on top of `sqlx` Postgres.
        Datasource::PostGIS { .. } => Err(MyError::Runtime(
            "PostGIS feature sources are not supported yet".into(),
        )),
    }
}
