// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Resolution of the `(format, language)` pair of a request.
//!
//! Format: the `f` query parameter wins over the `Accept` header which is
//! parsed as a weighted list and intersected w/ the formats the endpoint
//! supports.  Language: the `lang` query parameter, then the language
//! cookie, then `Accept-Language`; the outcome is written back to the
//! cookie so subsequent requests stay consistent.
//!

use crate::MyError;
use core::fmt;

/// Name of the format query parameter.
pub const FORMAT_PARAM: &str = "f";
/// Name of the language query parameter.
pub const LANGUAGE_PARAM: &str = "lang";
/// Name of the cookie remembering the negotiated language.
pub const LANGUAGE_COOKIE: &str = "lang";

/// Negotiable representation formats.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Format {
    /// Rendered pages for browsers.
    Html,
    /// Plain JSON, or GeoJSON on the features endpoints.
    Json,
    /// [JSON-FG](https://docs.ogc.org/DRAFTS/21-045.html).
    JsonFg,
    /// Mapbox Vector Tile payloads; proxied, never rendered here.
    Mvt,
    /// TileJSON tileset metadata; proxied as well.
    TileJson,
}

impl fmt::Display for Format {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Format::Html => write!(f, "html"),
            Format::Json => write!(f, "json"),
            Format::JsonFg => write!(f, "jsonfg"),
            Format::Mvt => write!(f, "mvt"),
            Format::TileJson => write!(f, "tilejson"),
        }
    }
}

impl Format {
    /// Parse a `f=` query parameter value.
    pub fn from_param(s: &str) -> Option<Self> {
        match s {
            "html" => Some(Format::Html),
            "json" => Some(Format::Json),
            "jsonfg" => Some(Format::JsonFg),
            "mvt" | "pbf" => Some(Format::Mvt),
            "tilejson" => Some(Format::TileJson),
            _ => None,
        }
    }

    /// Map a concrete media type to a format.
    fn from_media_type(s: &str) -> Option<Self> {
        match s {
            "text/html" => Some(Format::Html),
            "application/json" | "application/geo+json" => Some(Format::Json),
            "application/vnd.ogc.fg+json" => Some(Format::JsonFg),
            "application/vnd.mapbox-vector-tile" => Some(Format::Mvt),
            _ => None,
        }
    }

    /// Media type of generic (non-features) payloads in this format.
    pub fn media_type(&self) -> &'static str {
        match self {
            Format::Html => "text/html; charset=utf-8",
            Format::Json => "application/json",
            Format::JsonFg => "application/vnd.ogc.fg+json",
            Format::Mvt => "application/vnd.mapbox-vector-tile",
            Format::TileJson => "application/json",
        }
    }

    /// Media type of features payloads in this format; GeoJSON instead of
    /// plain JSON.
    pub fn media_type_features(&self) -> &'static str {
        match self {
            Format::Json => "application/geo+json",
            x => x.media_type(),
        }
    }
}

// One entry of a weighted header list.
#[derive(Debug, PartialEq)]
struct Weighted<'a> {
    value: &'a str,
    q: f32,
}

// Parse `Accept`-style headers into a list sorted by descending quality.
fn parse_weighted(header: &str) -> Vec<Weighted<'_>> {
    let mut items: Vec<Weighted> = header
        .split(',')
        .filter_map(|part| {
            let mut it = part.trim().split(';');
            let value = it.next()?.trim();
            if value.is_empty() {
                return None;
            }
            let q = it
                .filter_map(|p| p.trim().strip_prefix("q="))
                .find_map(|x| x.parse::<f32>().ok())
                .unwrap_or(1.0);
            Some(Weighted { value, q })
        })
        .collect();
    // stable: equal weights keep header order.
    items.sort_by(|a, b| b.q.partial_cmp(&a.q).unwrap_or(std::cmp::Ordering::Equal));
    items
}

/// Resolve the output format.
///
/// An explicit `f` parameter that names a format the endpoint does not
/// offer is a 404, per OGC API Common.  W/o `f`, the weighted `Accept`
/// intersection picks; w/o any match the endpoint's first (canonical)
/// format wins.
pub fn format(
    f_param: Option<&str>,
    accept: Option<&str>,
    supported: &[Format],
) -> Result<Format, MyError> {
    if let Some(s) = f_param {
        let requested = Format::from_param(s)
            .ok_or_else(|| MyError::NotFound(format!("Unknown ({s}) output format").into()))?;
        if !supported.contains(&requested) {
            return Err(MyError::NotFound(
                format!("Output format '{requested}' is not offered here").into(),
            ));
        }
        return Ok(requested);
    }
    if let Some(header) = accept {
        for entry in parse_weighted(header) {
            if entry.value == "*/*" {
                break;
            }
            if let Some(x) = Format::from_media_type(entry.value)
                && supported.contains(&x)
            {
                return Ok(x);
            }
        }
    }
    Ok(supported[0])
}

/// Resolve the response language from the configured set.
///
/// Precedence: query parameter, cookie, `Accept-Language` (weighted,
/// matching on the primary subtag), then the configured default.
pub fn language(
    lang_param: Option<&str>,
    cookie: Option<&str>,
    accept_language: Option<&str>,
    supported: &[String],
) -> String {
    let matches = |tag: &str| {
        let primary = tag.split('-').next().unwrap_or(tag);
        supported
            .iter()
            .find(|x| x.as_str() == tag || x.as_str() == primary)
    };
    if let Some(x) = lang_param.and_then(matches) {
        return x.to_owned();
    }
    if let Some(x) = cookie.and_then(matches) {
        return x.to_owned();
    }
    if let Some(header) = accept_language {
        for entry in parse_weighted(header) {
            if let Some(x) = matches(entry.value) {
                return x.to_owned();
            }
        }
    }
    supported[0].to_owned()
}
