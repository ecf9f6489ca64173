// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Artifacts specific to handling geospatial data stored in GeoPackage
//! database files.
//!

use crate::{
    MyError,
    config::Collection,
    ds::{
        FeatureCriteria, FeatureSource,
        mapper::map_rows,
        sql::{self, SPATIAL_INDEX_COLUMNS, spatial_index_name},
    },
    model::{Feature, FeatureCollection, FeatureTable},
    wkb::decode_geometry,
};
use async_trait::async_trait;
use sqlx::{
    AssertSqlSafe, FromRow, Pool, Sqlite, pool::PoolOptions, sqlite::SqliteConnectOptions,
};
use std::{collections::HashMap, str::FromStr, time::Duration};
use tracing::{debug, error, info};

/// GeoPackage SQLite DB files are expected to carry this `application_id`
/// in the DB header.
const GPKG_APPLICATION_ID: i32 = 0x47504B47;

/// Environment variable overriding the search path for the spatialite
/// loadable extension.
const SPATIALITE_ENV: &str = "SPATIALITE_LIBRARY_PATH";

/// CRS all bbox parameters are interpreted in.
// FIXME (rsn) 20260801 - multi-CRS bbox handling; right now everything is
// Rijksdriehoek.
const BBOX_CRS: i64 = 28_992;

const FIND_TABLES: &str = "SELECT c.table_name, c.identifier, g.column_name, \
    g.geometry_type_name, c.min_x, c.min_y, c.max_x, c.max_y, c.srs_id, c.last_change \
    FROM gpkg_contents c JOIN gpkg_geometry_columns g ON c.table_name = g.table_name \
    WHERE c.data_type = 'features' \
    AND c.min_x IS NOT NULL AND c.min_y IS NOT NULL \
    AND c.max_x IS NOT NULL AND c.max_y IS NOT NULL";

// structure to read back a textual PRAGMA value.
#[derive(Debug, FromRow)]
struct Pragma(String);

// Structure to use when SQL is returning an integer, be it a row ID or a
// numeric PRAGMA value.
#[derive(Debug, FromRow)]
struct RowID(i32);

// Row of the `gpkg_contents` x `gpkg_geometry_columns` join.
#[derive(Debug, Clone, FromRow)]
struct TFeatureTable {
    table_name: String,
    identifier: String,
    column_name: String,
    geometry_type_name: String,
    min_x: f64,
    min_y: f64,
    max_x: f64,
    max_y: f64,
    srs_id: i64,
    last_change: String,
}

impl From<TFeatureTable> for FeatureTable {
    fn from(x: TFeatureTable) -> Self {
        FeatureTable {
            table_name: x.table_name,
            identifier: x.identifier,
            geometry_column: x.column_name,
            geometry_type: x.geometry_type_name,
            bbox: [x.min_x, x.min_y, x.max_x, x.max_y],
            srs_id: x.srs_id,
            last_change: x.last_change,
        }
    }
}

/// _GeoPackage_ [FeatureSource] binding a `.gpkg` database file + the
/// startup-resolved descriptor of every configured collection.
#[derive(Debug)]
pub struct GpkgSource {
    pool: Pool<Sqlite>,
    query_timeout: Duration,
    // keyed by collection id.
    tables: HashMap<String, FeatureTable>,
}

impl GpkgSource {
    /// Open `file` read-only w/ the spatialite extension loaded, resolve a
    /// [FeatureTable] for every configured collection and verify the
    /// compound spatial indexes.  Any mismatch fails loudly; a server w/ a
    /// half-wired datasource must not start.
    pub async fn connect(
        file: &str,
        query_timeout: u64,
        collections: &[Collection],
    ) -> Result<Self, MyError> {
        let spatialite =
            dotenvy::var(SPATIALITE_ENV).unwrap_or_else(|_| "mod_spatialite".to_owned());

        // IMPORTANT - this is UNSAFE but i have no control over how to do it
        // differently since handling GeoPackage data sources is a no go w/o
        // `spatialite`...
        let pool_opts = unsafe {
            SqliteConnectOptions::from_str(&format!("sqlite:{file}"))?
                .read_only(true)
                .extension(spatialite)
        };
        let pool = PoolOptions::new().connect_with(pool_opts).await?;

        let versions = sqlx::query_as::<_, (String, String)>(
            "SELECT sqlite_version(), spatialite_version()",
        )
        .fetch_one(&pool)
        .await?;
        let revision = sqlx::query_as::<_, RowID>("PRAGMA user_version")
            .fetch_one(&pool)
            .await?;
        info!(
            "Connected to {file}: sqlite {}, spatialite {}, {} cpu, gpkg revision {}",
            versions.0,
            versions.1,
            std::env::consts::ARCH,
            revision.0
        );

        let pragma = sqlx::query_as::<_, RowID>("PRAGMA application_id")
            .fetch_one(&pool)
            .await?;
        if pragma.0 != GPKG_APPLICATION_ID {
            return Err(MyError::Runtime("Unexpected application_id".into()));
        }

        let candidates: Vec<TFeatureTable> = sqlx::query_as(FIND_TABLES).fetch_all(&pool).await?;
        debug!("Found {} feature table(s)", candidates.len());

        let mut tables = HashMap::new();
        for collection in collections {
            let match_id = collection
                .features
                .datasource_id
                .as_deref()
                .unwrap_or(&collection.id);
            let found = candidates.iter().find(|x| x.identifier == match_id);
            let Some(found) = found else {
                return Err(MyError::Runtime(
                    format!("No feature table matches collection '{}'", collection.id).into(),
                ));
            };
            verify_spatial_index(&pool, &found.table_name).await?;
            tables.insert(collection.id.to_owned(), FeatureTable::from(found.clone()));
        }

        Ok(Self {
            pool,
            query_timeout: Duration::from_secs(query_timeout),
            tables,
        })
    }

    fn table_of(&self, collection: &str) -> Result<&FeatureTable, MyError> {
        self.tables.get(collection).ok_or_else(|| {
            MyError::NotFound(format!("Collection '{collection}' is not configured").into())
        })
    }

    async fn run<T>(
        &self,
        fut: impl Future<Output = Result<T, sqlx::Error>> + Send,
    ) -> Result<T, MyError> {
        match tokio::time::timeout(self.query_timeout, fut).await {
            Ok(x) => Ok(x?),
            Err(_) => Err(MyError::Runtime("Query deadline exceeded".into())),
        }
    }
}

// Fail unless `<table>_spatial_idx` exists and covers exactly
// `(fid, minx, maxx, miny, maxy)` in that order.
async fn verify_spatial_index(pool: &Pool<Sqlite>, table: &str) -> Result<(), MyError> {
    let index = spatial_index_name(table);
    let columns: Vec<Pragma> =
        sqlx::query_as("SELECT name FROM pragma_index_info($1) ORDER BY seqno")
            .bind(&index)
            .fetch_all(pool)
            .await?;
    if columns.is_empty() {
        return Err(MyError::Runtime(
            format!("Table '{table}' is missing the required '{index}' index").into(),
        ));
    }
    let got: Vec<&str> = columns.iter().map(|x| x.0.as_str()).collect();
    if got != SPATIAL_INDEX_COLUMNS {
        return Err(MyError::Runtime(
            format!(
                "Index '{index}' covers {got:?}, expected {:?}",
                SPATIAL_INDEX_COLUMNS
            )
            .into(),
        ));
    }
    Ok(())
}

// WKT form of a bbox, counter-clockwise, closed.
fn bbox_wkt(b: &[f64; 4]) -> String {
    format!(
        "POLYGON(({minx} {miny}, {maxx} {miny}, {maxx} {maxy}, {minx} {maxy}, {minx} {miny}))",
        minx = b[0],
        miny = b[1],
        maxx = b[2],
        maxy = b[3],
    )
}

#[async_trait]
impl FeatureSource for GpkgSource {
    async fn get_features(
        &self,
        collection: &str,
        criteria: &FeatureCriteria,
    ) -> Result<FeatureCollection, MyError> {
        let table = self.table_of(collection)?;
        let rows = match &criteria.bbox {
            None => {
                let sql = sql::features_default(&table.table_name);
                debug!("features sql: {sql}");
                self.run(
                    sqlx::query(AssertSqlSafe(sql))
                        .bind(criteria.start_fid)
                        .bind(criteria.limit as i64)
                        .fetch_all(&self.pool),
                )
                .await?
            }
            Some(bbox) => {
                let sql = sql::features_bbox(&table.table_name, &table.geometry_column);
                debug!("features bbox sql: {sql}");
                self.run(
                    sqlx::query(AssertSqlSafe(sql))
                        .bind(criteria.start_fid)
                        .bind(criteria.limit as i64)
                        .bind(bbox[0])
                        .bind(bbox[1])
                        .bind(bbox[2])
                        .bind(bbox[3])
                        .bind(bbox_wkt(bbox))
                        .bind(BBOX_CRS)
                        .fetch_all(&self.pool),
                )
                .await?
            }
        };
        let geometry_column = table.geometry_column.to_owned();
        map_rows(&rows, &geometry_column, decode_geometry).map_err(|x| {
            error!("Failed mapping rows of collection '{collection}': {x}");
            x
        })
    }

    async fn get_feature(&self, collection: &str, fid: i64) -> Result<Option<Feature>, MyError> {
        let table = self.table_of(collection)?;
        let sql = sql::single_feature(&table.table_name);
        let rows = self
            .run(
                sqlx::query(AssertSqlSafe(sql))
                    .bind(fid)
                    .fetch_all(&self.pool),
            )
            .await?;
        if rows.is_empty() {
            return Ok(None);
        }
        let geometry_column = table.geometry_column.to_owned();
        let mut fc = map_rows(&rows, &geometry_column, decode_geometry)?;
        Ok(fc.features.pop())
    }

    fn table(&self, collection: &str) -> Option<&FeatureTable> {
        self.tables.get(collection)
    }

    async fn close(&self) {
        info!("Closing GeoPackage connection pool");
        self.pool.close().await;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_bbox_wkt_is_closed() {
        let it = bbox_wkt(&[5.0, 5.0, 6.0, 6.0]);
        assert_eq!(it, "POLYGON((5 5, 6 5, 6 6, 5 6, 5 5))");
    }

    #[test]
    fn test_spatial_index_name() {
        assert_eq!(spatial_index_name("addresses"), "addresses_spatial_idx");
    }
}
