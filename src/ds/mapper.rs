// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Translation of raw SQL rows into [Feature] records.
//!

use crate::{
    MyError,
    ds::sql::{FID_COLUMN, NEXT_FID_COLUMN, PREV_FID_COLUMN},
    model::{Feature, FeatureCollection, Properties, PropertyValue},
};
use jiff::{Timestamp, civil::DateTime, tz::TimeZone};
use sqlx::{Column, Row, TypeInfo, sqlite::SqliteRow};

/// Column names that are storage artifacts of the spatial indexes, never
/// feature properties.
const RESERVED_COLUMNS: [&str; 6] = ["minx", "miny", "maxx", "maxy", "min_zoom", "max_zoom"];

/// Signature of a geometry BLOB decoder.
pub(crate) type GeometryDecoder = fn(&[u8]) -> Result<Option<serde_json::Value>, MyError>;

/// Map `rows` into a [FeatureCollection], dispatching each column by name:
/// the `fid` column becomes the feature identity, `geometry_column` passes
/// through `decode`, reserved columns are skipped, the synthetic
/// `prevfid`/`nextfid` pair feeds the cursors, and everything else becomes
/// a property.
///
/// `NULL` values are omitted from the property map.  A column of a type
/// outside the supported set fails the whole response; silent type loss is
/// unacceptable.
pub(crate) fn map_rows(
    rows: &[SqliteRow],
    geometry_column: &str,
    decode: GeometryDecoder,
) -> Result<FeatureCollection, MyError> {
    let mut fc = FeatureCollection::default();
    for row in rows {
        let mut fid = None;
        let mut geometry = None;
        let mut properties = Properties::new();
        for (i, column) in row.columns().iter().enumerate() {
            let name = column.name();
            if name == FID_COLUMN {
                fid = Some(row.try_get::<i64, _>(i)?);
            } else if name == geometry_column {
                if let Some(ba) = row.try_get::<Option<Vec<u8>>, _>(i)? {
                    geometry = decode(&ba)?;
                }
            } else if name == PREV_FID_COLUMN {
                if fc.prev_fid == 0
                    && let Some(x) = row.try_get::<Option<i64>, _>(i)?
                {
                    fc.prev_fid = x;
                }
            } else if name == NEXT_FID_COLUMN {
                if fc.next_fid == 0
                    && let Some(x) = row.try_get::<Option<i64>, _>(i)?
                {
                    fc.next_fid = x;
                }
            } else if RESERVED_COLUMNS.contains(&name) {
                continue;
            } else if let Some(value) = map_value(row, i, column.type_info().name())? {
                properties.insert(name.to_owned(), value);
            }
        }
        let fid = fid.ok_or_else(|| {
            MyError::Runtime(format!("Row w/o a '{FID_COLUMN}' column").into())
        })?;
        fc.features.push(Feature {
            fid,
            geometry,
            properties,
        });
    }
    Ok(fc)
}

// Decode one property cell; `None` for SQL NULL.
fn map_value(row: &SqliteRow, i: usize, type_name: &str) -> Result<Option<PropertyValue>, MyError> {
    let it = match type_name {
        "INTEGER" | "INT4" | "INT8" | "BIGINT" => {
            row.try_get::<Option<i64>, _>(i)?.map(PropertyValue::Int)
        }
        "REAL" | "NUMERIC" => row.try_get::<Option<f64>, _>(i)?.map(PropertyValue::Float),
        "TEXT" => row.try_get::<Option<String>, _>(i)?.map(PropertyValue::Str),
        // UTF-8 assumed for non-geometry blobs.
        "BLOB" => row
            .try_get::<Option<Vec<u8>>, _>(i)?
            .map(|x| PropertyValue::Str(String::from_utf8_lossy(&x).into_owned())),
        "BOOLEAN" => row.try_get::<Option<bool>, _>(i)?.map(PropertyValue::Bool),
        "DATETIME" | "TIMESTAMP" | "DATE" => match row.try_get::<Option<String>, _>(i)? {
            Some(x) => Some(PropertyValue::Timestamp(parse_timestamp(&x)?)),
            None => None,
        },
        "NULL" => None,
        x => {
            return Err(MyError::Runtime(
                format!("Unexpected ({x}) SQL type for a feature property").into(),
            ));
        }
    };
    Ok(it)
}

// GeoPackage producers write either RFC 3339 instants or zone-less civil
// date-times; accept both, the latter interpreted as UTC.
fn parse_timestamp(s: &str) -> Result<Timestamp, MyError> {
    if let Ok(x) = s.parse::<Timestamp>() {
        return Ok(x);
    }
    let civil: DateTime = s.parse()?;
    Ok(civil.to_zoned(TimeZone::UTC)?.timestamp())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::wkb::decode_geometry;
    use sqlx::SqlitePool;

    async fn pool() -> SqlitePool {
        let pool = SqlitePool::connect("sqlite::memory:").await.unwrap();
        sqlx::query(
            "CREATE TABLE t (fid INTEGER PRIMARY KEY, geom BLOB, name TEXT, \
             floors INTEGER, area REAL, listed BOOLEAN, built DATETIME, \
             minx REAL, maxx REAL, miny REAL, maxy REAL)",
        )
        .execute(&pool)
        .await
        .unwrap();
        pool
    }

    #[tokio::test]
    async fn test_maps_columns_by_name() {
        let pool = pool().await;
        sqlx::query(
            "INSERT INTO t VALUES \
             (1, NULL, 'kerkstraat 1', 3, 12.5, 1, '2001-02-03 04:05:06', 0, 1, 0, 1)",
        )
        .execute(&pool)
        .await
        .unwrap();
        let rows = sqlx::query("SELECT *, NULL AS prevfid, 4 AS nextfid FROM t")
            .fetch_all(&pool)
            .await
            .unwrap();

        let fc = map_rows(&rows, "geom", decode_geometry).unwrap();
        assert_eq!(fc.features.len(), 1);
        assert_eq!(fc.prev_fid, 0);
        assert_eq!(fc.next_fid, 4);

        let f = &fc.features[0];
        assert_eq!(f.fid, 1);
        assert!(f.geometry.is_none());
        assert_eq!(
            f.properties.get("name"),
            Some(&PropertyValue::Str("kerkstraat 1".into()))
        );
        assert_eq!(f.properties.get("floors"), Some(&PropertyValue::Int(3)));
        assert_eq!(f.properties.get("area"), Some(&PropertyValue::Float(12.5)));
        assert_eq!(f.properties.get("listed"), Some(&PropertyValue::Bool(true)));
        assert!(matches!(
            f.properties.get("built"),
            Some(PropertyValue::Timestamp(_))
        ));
        // storage artifacts never surface as properties...
        for reserved in RESERVED_COLUMNS {
            assert!(!f.properties.contains_key(reserved));
        }
    }

    #[tokio::test]
    async fn test_null_properties_are_omitted() {
        let pool = pool().await;
        sqlx::query("INSERT INTO t (fid, name) VALUES (7, NULL)")
            .execute(&pool)
            .await
            .unwrap();
        let rows = sqlx::query("SELECT * FROM t").fetch_all(&pool).await.unwrap();
        let fc = map_rows(&rows, "geom", decode_geometry).unwrap();
        assert!(!fc.features[0].properties.contains_key("name"));
    }

    #[tokio::test]
    async fn test_prev_next_taken_from_first_non_null() {
        let pool = pool().await;
        sqlx::query("INSERT INTO t (fid) VALUES (3), (4)")
            .execute(&pool)
            .await
            .unwrap();
        // mimics the windowed CTE where only some rows carry the pair...
        let rows = sqlx::query(
            "SELECT *, \
             CASE fid WHEN 3 THEN 1 ELSE NULL END AS prevfid, \
             CASE fid WHEN 3 THEN 5 ELSE NULL END AS nextfid \
             FROM t ORDER BY fid",
        )
        .fetch_all(&pool)
        .await
        .unwrap();
        let fc = map_rows(&rows, "geom", decode_geometry).unwrap();
        assert_eq!(fc.prev_fid, 1);
        assert_eq!(fc.next_fid, 5);
    }

    #[tokio::test]
    async fn test_timestamp_parsing() {
        assert!(parse_timestamp("2001-02-03T04:05:06Z").is_ok());
        assert!(parse_timestamp("2001-02-03 04:05:06").is_ok());
        assert!(parse_timestamp("not a date").is_err());
    }
}
