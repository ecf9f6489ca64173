// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Strict parsing of the features query surface + the filters checksum
//! pagination cursors are bound to.
//!

use crate::{MyError, config::Limit, cursor::DecodedCursor};
use sha2::{Digest, Sha256};

/// Number of checksum bytes carried inside a cursor.
const CHECKSUM_LEN: usize = 8;

/// Query parameters accepted by the feature-collection endpoint.  Anything
/// else is rejected; the URL surface is a strict schema.
const KNOWN_PARAMS: [&str; 6] = ["f", "lang", "limit", "bbox", "cursor", "datetime"];

/// Parsed + validated query of a feature-collection request.
#[derive(Debug)]
pub struct FeatureParams {
    /// Page size after clamping.
    pub limit: u32,
    /// Optional `(minx, miny, maxx, maxy)` restriction.
    pub bbox: Option<[f64; 4]>,
    /// Decoded pagination position; first page when absent or stale.
    pub cursor: DecodedCursor,
    /// Checksum of the active filters, for encoding the reply's cursors.
    pub checksum: Vec<u8>,
}

impl FeatureParams {
    /// Parse `query` pairs under the server `limits`.
    ///
    /// `f` and `lang` are negotiation concerns handled elsewhere and pass
    /// through here unexamined.
    pub fn parse(query: &[(String, String)], limits: &Limit) -> Result<Self, MyError> {
        for (name, _) in query {
            if !KNOWN_PARAMS.contains(&name.as_str()) {
                return Err(MyError::BadRequest(
                    format!("Unknown query parameter '{name}'").into(),
                ));
            }
        }
        if query.iter().any(|(n, _)| n == "datetime") {
            return Err(MyError::BadRequest(
                "The 'datetime' parameter is not supported".into(),
            ));
        }

        let limit = match find(query, "limit") {
            None => limits.default,
            Some(s) => {
                let it: i64 = s.parse().map_err(|_| {
                    MyError::BadRequest(format!("Malformed ({s}) 'limit' parameter").into())
                })?;
                if it < 0 {
                    return Err(MyError::BadRequest(
                        "The 'limit' parameter cannot be negative".into(),
                    ));
                }
                // above the ceiling is silently clamped, not an error.
                (it as u64).min(limits.max as u64) as u32
            }
        };

        let bbox = match find(query, "bbox") {
            None => None,
            Some(s) => Some(parse_bbox(s)?),
        };

        let checksum = checksum(query);
        let cursor =
            DecodedCursor::decode(find(query, "cursor").unwrap_or_default(), &checksum);

        Ok(Self {
            limit,
            bbox,
            cursor,
            checksum,
        })
    }
}

fn find<'a>(query: &'a [(String, String)], name: &str) -> Option<&'a str> {
    query
        .iter()
        .find(|(n, _)| n == name)
        .map(|(_, v)| v.as_str())
}

// exactly four comma-separated floats in `minx,miny,maxx,maxy` order.
fn parse_bbox(s: &str) -> Result<[f64; 4], MyError> {
    let parts: Vec<&str> = s.split(',').collect();
    if parts.len() != 4 {
        return Err(MyError::BadRequest(
            format!("Expected 4 comma-separated bbox values, got {}", parts.len()).into(),
        ));
    }
    let mut it = [0f64; 4];
    for (i, part) in parts.iter().enumerate() {
        it[i] = part.trim().parse().map_err(|_| {
            MyError::BadRequest(format!("Malformed ({part}) bbox ordinate").into())
        })?;
    }
    Ok(it)
}

/// Digest of the active query parameters minus the cursor itself.
///
/// Pair order does not matter; `?limit=2&bbox=…` and `?bbox=…&limit=2`
/// yield the same checksum so link reordering never invalidates a cursor.
pub fn checksum(query: &[(String, String)]) -> Vec<u8> {
    let mut pairs: Vec<&(String, String)> =
        query.iter().filter(|(n, _)| n != "cursor").collect();
    pairs.sort();
    let mut hasher = Sha256::new();
    for (name, value) in pairs {
        hasher.update(name.as_bytes());
        hasher.update([0x3D]);
        hasher.update(value.as_bytes());
        hasher.update([0x26]);
    }
    hasher.finalize()[..CHECKSUM_LEN].to_vec()
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::cursor;

    fn q(pairs: &[(&str, &str)]) -> Vec<(String, String)> {
        pairs
            .iter()
            .map(|(n, v)| (n.to_string(), v.to_string()))
            .collect()
    }

    fn limits() -> Limit {
        Limit {
            default: 10,
            max: 100,
        }
    }

    #[test]
    fn test_defaults() {
        let it = FeatureParams::parse(&[], &limits()).unwrap();
        assert_eq!(it.limit, 10);
        assert!(it.bbox.is_none());
        assert_eq!(it.cursor.fid(), 0);
    }

    #[test]
    fn test_limit_clamped_not_rejected() {
        let it = FeatureParams::parse(&q(&[("limit", "5000")]), &limits()).unwrap();
        assert_eq!(it.limit, 100);
    }

    #[test]
    fn test_limit_zero_is_legal() {
        let it = FeatureParams::parse(&q(&[("limit", "0")]), &limits()).unwrap();
        assert_eq!(it.limit, 0);
    }

    #[test]
    fn test_negative_limit_is_rejected() {
        assert!(matches!(
            FeatureParams::parse(&q(&[("limit", "-1")]), &limits()),
            Err(MyError::BadRequest(_))
        ));
    }

    #[test]
    fn test_bbox_arity() {
        let it = FeatureParams::parse(&q(&[("bbox", "5,5,6,6")]), &limits()).unwrap();
        assert_eq!(it.bbox, Some([5.0, 5.0, 6.0, 6.0]));

        for bad in ["5,5,6", "5,5,6,6,7", "5,5,6,x", ""] {
            assert!(
                FeatureParams::parse(&q(&[("bbox", bad)]), &limits()).is_err(),
                "bbox '{bad}' should be rejected"
            );
        }
    }

    #[test]
    fn test_datetime_is_rejected() {
        assert!(matches!(
            FeatureParams::parse(&q(&[("datetime", "2020-01-01")]), &limits()),
            Err(MyError::BadRequest(_))
        ));
    }

    #[test]
    fn test_unknown_parameter_is_rejected() {
        assert!(matches!(
            FeatureParams::parse(&q(&[("offset", "5")]), &limits()),
            Err(MyError::BadRequest(_))
        ));
    }

    #[test]
    fn test_checksum_excludes_cursor_and_ignores_order() {
        let a = checksum(&q(&[("limit", "2"), ("bbox", "5,5,6,6"), ("cursor", "xyz")]));
        let b = checksum(&q(&[("bbox", "5,5,6,6"), ("limit", "2")]));
        assert_eq!(a, b);

        let c = checksum(&q(&[("limit", "3"), ("bbox", "5,5,6,6")]));
        assert_ne!(a, c);
    }

    #[test]
    fn test_stale_cursor_resets_to_first_page() {
        // a cursor minted under different filters...
        let stale = cursor::encode(5, &checksum(&q(&[("limit", "3")])));
        let query = q(&[("limit", "2"), ("cursor", &stale)]);
        let it = FeatureParams::parse(&query, &limits()).unwrap();
        assert_eq!(it.cursor.fid(), 0);
    }

    #[test]
    fn test_live_cursor_round_trips() {
        let query = q(&[("limit", "2")]);
        let live = cursor::encode(3, &checksum(&query));
        let query = q(&[("limit", "2"), ("cursor", &live)]);
        let it = FeatureParams::parse(&query, &limits()).unwrap();
        assert_eq!(it.cursor.fid(), 3);
    }
}
