// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Domain model of the _Features_ pipeline: feature records, pages + the
//! per-table descriptor derived from the GeoPackage metadata tables.
//!

use jiff::Timestamp;
use serde::{Serialize, Serializer, ser::SerializeMap};
use std::collections::BTreeMap;

/// A single non-geometry attribute value of a _Feature_.
///
/// SQL `NULL` columns never materialize as a variant; they are dropped from
/// the property map instead.  An SQL type outside this set is an explicit
/// mapping error, never a silent coercion.
#[derive(Debug, Clone, PartialEq)]
pub enum PropertyValue {
    /// A 64-bit signed integer.
    Int(i64),
    /// A 64-bit float.
    Float(f64),
    /// A Unicode UTF-8 string.  Byte blobs in non-geometry columns
    /// materialize as this variant.
    Str(String),
    /// A boolean.
    Bool(bool),
    /// An _Instant_ w/ a granularity of a second or smaller, always in UTC.
    Timestamp(Timestamp),
}

impl Serialize for PropertyValue {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        match self {
            PropertyValue::Int(x) => serializer.serialize_i64(*x),
            PropertyValue::Float(x) => serializer.serialize_f64(*x),
            PropertyValue::Str(x) => serializer.serialize_str(x),
            PropertyValue::Bool(x) => serializer.serialize_bool(*x),
            PropertyValue::Timestamp(x) => x.serialize(serializer),
        }
    }
}

/// An unordered mapping of property names to scalar values.
pub type Properties = BTreeMap<String, PropertyValue>;

/// A single feature record read from a datasource.
#[derive(Debug, Clone)]
pub struct Feature {
    /// Datasource-scoped stable integer identity.
    pub fid: i64,
    /// GeoJSON geometry decoded from the stored GeoPackage blob; `None`
    /// when the geometry column was `NULL`.
    pub geometry: Option<serde_json::Value>,
    /// Non-geometry, non-reserved attributes.
    pub properties: Properties,
}

impl Serialize for Feature {
    // GeoJSON Feature object.
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        let mut map = serializer.serialize_map(Some(4))?;
        map.serialize_entry("type", "Feature")?;
        map.serialize_entry("id", &self.fid)?;
        map.serialize_entry("geometry", &self.geometry)?;
        map.serialize_entry("properties", &self.properties)?;
        map.end()
    }
}

/// Hyperlink as mandated by OGC API Common for all resource representations.
#[derive(Debug, Clone, Serialize)]
pub struct Link {
    /// Target URL.
    pub href: String,
    /// Link relation; e.g. `self`, `next`, `prev`, `alternate`.
    pub rel: String,
    /// Media type of the target.
    #[serde(rename = "type", skip_serializing_if = "Option::is_none")]
    pub type_: Option<String>,
    /// Human readable label.
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
}

/// An ordered page of features plus the adjacent-page feature IDs the
/// cursor codec turns into navigation tokens.
///
/// Features are in strict ascending `fid` order.  Across pages obtained by
/// following `next` the `fid` domains are disjoint and increasing.
#[derive(Debug, Default)]
pub struct FeatureCollection {
    /// The page content.
    pub features: Vec<Feature>,
    /// FID the previous page starts at; `0` when on the first page.
    pub prev_fid: i64,
    /// FID the next page starts at; `0` when no further page exists.
    pub next_fid: i64,
}

impl FeatureCollection {
    /// Number of features in this page.
    pub fn number_returned(&self) -> usize {
        self.features.len()
    }
}

/// Serializable GeoJSON `FeatureCollection` document.
#[derive(Debug, Serialize)]
pub struct FeatureCollectionDoc {
    /// Always the literal `FeatureCollection`.
    #[serde(rename = "type")]
    pub type_: &'static str,
    /// Document generation instant.
    #[serde(rename = "timeStamp")]
    pub time_stamp: Timestamp,
    /// Navigation + alternate representation links.
    pub links: Vec<Link>,
    /// Number of features in this document.
    #[serde(rename = "numberReturned")]
    pub number_returned: usize,
    /// The features themselves.
    pub features: Vec<Feature>,
}

/// Descriptor of one feature table, derived at startup from
/// `gpkg_contents` joined w/ `gpkg_geometry_columns`.
///
/// Exactly one descriptor resolves per configured collection, matched on
/// `identifier == collection.id` or on the collection's explicit
/// `datasource_id` override.
#[derive(Debug, Clone)]
pub struct FeatureTable {
    /// Physical SQLite table name.
    pub table_name: String,
    /// Human-oriented identifier from `gpkg_contents`.
    pub identifier: String,
    /// Name of the geometry column.
    pub geometry_column: String,
    /// Declared geometry type name; e.g. `POINT`.
    pub geometry_type: String,
    /// Extent as `(minx, miny, maxx, maxy)`.
    pub bbox: [f64; 4],
    /// Spatial reference system FK.
    pub srs_id: i64,
    /// Last change timestamp as recorded by the producer.
    pub last_change: String,
}
