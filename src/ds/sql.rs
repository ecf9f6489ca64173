// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! SQL generation for the GeoPackage datasource.
//!
//! Identifiers (table + geometry column names) interpolated here originate
//! from the GeoPackage metadata tables validated at startup, never from the
//! request; everything user-supplied binds as a parameter.  Parameters use
//! the explicitly-numbered `?N` form: indices must not depend on where a
//! parameter first appears in the statement.
//!

/// Inflection point between the R-tree and the compound B-tree arms of the
/// bbox query.  Below this many R-tree candidates the R-tree wins; above it
/// the R-tree degrades towards a full join and the `<table>_spatial_idx`
/// compound index takes over.
pub(crate) const BBOX_SIZE_BIG: i64 = 10_000;

/// Name of the feature ID column.
pub(crate) const FID_COLUMN: &str = "fid";

/// Synthetic column carrying the previous page's first FID.
pub(crate) const PREV_FID_COLUMN: &str = "prevfid";

/// Synthetic column carrying the next page's first FID.
pub(crate) const NEXT_FID_COLUMN: &str = "nextfid";

/// Name of the required compound B-tree index of `table`.
pub(crate) fn spatial_index_name(table: &str) -> String {
    format!("{table}_spatial_idx")
}

/// Column list the compound index must cover, in this exact order.
pub(crate) const SPATIAL_INDEX_COLUMNS: [&str; 5] = ["fid", "minx", "maxx", "miny", "maxy"];

// Double-quote an SQL identifier.
fn quote(ident: &str) -> String {
    format!(r#""{}""#, ident.replace('"', "\"\""))
}

// Name of the R-tree virtual table SQLite maintains for `table`.`geom`.
fn rtree(table: &str, geom: &str) -> String {
    quote(&format!("rtree_{table}_{geom}"))
}

/// `SELECT` for a single feature by ID.  Binds: `?1` = fid.
pub(crate) fn single_feature(table: &str) -> String {
    format!(
        "SELECT * FROM {t} WHERE {FID_COLUMN} = ?1 LIMIT 1",
        t = quote(table)
    )
}

/// Pageful of features w/o spatial filtering.  Binds: `?1` = cursor fid,
/// `?2` = limit.
///
/// `next` over-fetches one row so the windowed `lead` can answer the
/// has-next question w/o a second round trip; `prev` walks backwards from
/// the cursor so `lag` can point at the previous page's first row.
pub(crate) fn features_default(table: &str) -> String {
    let t = quote(table);
    format!(
        "WITH \
         next AS (SELECT * FROM {t} WHERE {FID_COLUMN} >= ?1 ORDER BY {FID_COLUMN} ASC LIMIT ?2 + 1), \
         prev AS (SELECT * FROM {t} WHERE {FID_COLUMN} < ?1 ORDER BY {FID_COLUMN} DESC LIMIT ?2), \
         candidates AS (SELECT * FROM next UNION ALL SELECT * FROM prev), \
         windowed AS (SELECT *, \
             lag({FID_COLUMN}, ?2) OVER (ORDER BY {FID_COLUMN}) AS {PREV_FID_COLUMN}, \
             lead({FID_COLUMN}, ?2) OVER (ORDER BY {FID_COLUMN}) AS {NEXT_FID_COLUMN} \
             FROM candidates) \
         SELECT * FROM windowed WHERE {FID_COLUMN} >= ?1 LIMIT ?2"
    )
}

// One directional arm of the bbox query.  `forward` selects the `next` page
// direction, `rt` the R-tree (vs compound B-tree) access path.
fn bbox_arm(table: &str, geom: &str, forward: bool, rt: bool) -> String {
    let t = quote(table);
    let g = quote(geom);
    let (cmp, ord) = if forward { (">=", "ASC") } else { ("<", "DESC") };
    // the over-fetched extra row only makes sense in the forward direction.
    let extra = if forward { " + 1" } else { "" };
    let size = if rt { "small" } else { "big" };
    let (source, window) = if rt {
        (
            format!(
                "{t} f JOIN {r} rt ON f.{FID_COLUMN} = rt.id",
                r = rtree(table, geom)
            ),
            "rt.minx <= ?5 AND rt.maxx >= ?3 AND rt.miny <= ?6 AND rt.maxy >= ?4".to_owned(),
        )
    } else {
        (
            format!(
                "{t} f INDEXED BY {i}",
                i = quote(&spatial_index_name(table))
            ),
            "f.minx <= ?5 AND f.maxx >= ?3 AND f.miny <= ?6 AND f.maxy >= ?4".to_owned(),
        )
    };
    format!(
        "SELECT f.* FROM {source} \
         WHERE (SELECT size FROM bbox_size) = '{size}' \
         AND f.{FID_COLUMN} {cmp} ?1 \
         AND {window} \
         AND st_intersects((SELECT bbox FROM given_bbox), castautomagic(f.{g})) = 1 \
         ORDER BY f.{FID_COLUMN} {ord} \
         LIMIT (CASE WHEN (SELECT size FROM bbox_size) = '{size}' THEN ?2{extra} ELSE 0 END)"
    )
}

/// Pageful of features intersecting a bounding box.  Binds: `?1` = cursor
/// fid, `?2` = limit, `?3..?6` = minx, miny, maxx, maxy, `?7` = bbox WKT,
/// `?8` = bbox CRS (SRID).
///
/// `bbox_size` counts R-tree candidates up to [BBOX_SIZE_BIG]; a `'small'`
/// outcome activates the R-tree arms and zeroes the B-tree ones, `'big'`
/// the reverse.  Both access paths finish w/ an exact `st_intersects`
/// predicate over the candidates the index pruned.
pub(crate) fn features_bbox(table: &str, geom: &str) -> String {
    format!(
        "WITH \
         given_bbox AS (SELECT geomfromtext(?7, ?8) AS bbox), \
         bbox_size AS (SELECT CASE WHEN count(id) < {BBOX_SIZE_BIG} THEN 'small' ELSE 'big' END AS size \
             FROM (SELECT id FROM {r} \
                   WHERE minx <= ?5 AND maxx >= ?3 AND miny <= ?6 AND maxy >= ?4 \
                   LIMIT {BBOX_SIZE_BIG})), \
         next_rtree AS ({nr}), \
         next_btree AS ({nb}), \
         prev_rtree AS ({pr}), \
         prev_btree AS ({pb}), \
         candidates AS (SELECT * FROM next_rtree UNION ALL SELECT * FROM next_btree \
             UNION ALL SELECT * FROM prev_rtree UNION ALL SELECT * FROM prev_btree), \
         windowed AS (SELECT *, \
             lag({FID_COLUMN}, ?2) OVER (ORDER BY {FID_COLUMN}) AS {PREV_FID_COLUMN}, \
             lead({FID_COLUMN}, ?2) OVER (ORDER BY {FID_COLUMN}) AS {NEXT_FID_COLUMN} \
             FROM candidates) \
         SELECT * FROM windowed WHERE {FID_COLUMN} >= ?1 LIMIT ?2",
        r = rtree(table, geom),
        nr = bbox_arm(table, geom, true, true),
        nb = bbox_arm(table, geom, true, false),
        pr = bbox_arm(table, geom, false, true),
        pb = bbox_arm(table, geom, false, false),
    )
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_single_feature_shape() {
        let sql = single_feature("addresses");
        assert_eq!(
            sql,
            r#"SELECT * FROM "addresses" WHERE fid = ?1 LIMIT 1"#
        );
    }

    #[test]
    fn test_default_query_overfetches_next_only() {
        let sql = features_default("addresses");
        // one extra row forward answers has-next; backwards stays exact.
        assert!(sql.contains("ORDER BY fid ASC LIMIT ?2 + 1"));
        assert!(sql.contains("ORDER BY fid DESC LIMIT ?2)"));
    }

    #[test]
    fn test_default_query_windowing() {
        let sql = features_default("addresses");
        assert!(sql.contains("lag(fid, ?2) OVER (ORDER BY fid) AS prevfid"));
        assert!(sql.contains("lead(fid, ?2) OVER (ORDER BY fid) AS nextfid"));
        assert!(sql.ends_with("SELECT * FROM windowed WHERE fid >= ?1 LIMIT ?2"));
    }

    #[test]
    fn test_bbox_query_has_both_access_paths() {
        let sql = features_bbox("addresses", "geom");
        assert!(sql.contains(r#""rtree_addresses_geom""#));
        assert!(sql.contains(r#"INDEXED BY "addresses_spatial_idx""#));
        assert!(sql.contains("= 'small'"));
        assert!(sql.contains("= 'big'"));
        assert!(sql.contains(&format!("LIMIT {BBOX_SIZE_BIG})")));
    }

    #[test]
    fn test_bbox_query_exact_predicate_is_parameterized() {
        let sql = features_bbox("addresses", "geom");
        assert!(
            sql.contains(r#"st_intersects((SELECT bbox FROM given_bbox), castautomagic(f."geom")) = 1"#)
        );
        assert!(sql.contains("geomfromtext(?7, ?8)"));
        // no literal coordinates anywhere; ordinates bind as ?3..?6.
        assert!(sql.contains("minx <= ?5 AND maxx >= ?3 AND miny <= ?6 AND maxy >= ?4"));
    }

    #[test]
    fn test_identifier_quoting() {
        let sql = single_feature(r#"bad"name"#);
        assert!(sql.contains(r#""bad""name""#));
    }
}
