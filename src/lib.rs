// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! An OGC API server over GeoPackage.
//!
//! This crate serves the OGC API family --Common, Collections, Features,
//! Tiles, Styles and 3D GeoVolumes-- from a single configuration file.
//! Clients discover collections via the landing page, negotiate a
//! representation (HTML, GeoJSON, JSON-FG, vector tiles + 3D tile
//! payloads) and retrieve features by collection or by identifier,
//! optionally filtered by bounding box and paginated.
//!
//! # The Features pipeline
//!
//! The kernel of this project is cursor-based pagination over a
//! spatially-indexed GeoPackage ([`ds`]).  A page is answered by a single
//! CTE that over-fetches one row forward and window-functions the
//! adjacent-page feature IDs into every row, so the _has-next_ question
//! costs no second round trip.  Bounding-box requests adaptively choose
//! between the SQLite R-tree sidecar and a compound B-tree index: an
//! initial bounded count decides which arm of the query is active.
//!
//! Pagination state lives entirely in the client-held token ([`cursor`]):
//! the encoded pair of a feature ID and a digest of the active filters.
//! A token presented w/ different filters silently resets to the first
//! page --cursors are cheap to validate and impossible to abuse for
//! skip/repeat bugs across filter changes.
//!
//! # The request lifecycle
//!
//! Around that kernel sits the lifecycle every request passes through:
//! content negotiation ([`negotiate`]), OpenAPI request + response
//! validation ([`openapi`]), a dual template engine serving pre-rendered
//! static pages and on-the-fly dynamic ones ([`templates`]), and a
//! reverse proxy w/ OGC-specific status rewriting for tile payloads
//! ([`proxy`]).  The router + lifecycle wiring live in [`server`].
//!
//! The server owns no persisted state; the GeoPackage file is read-only
//! input and feature payloads are never cached between requests.
//!

pub mod config;
pub mod cursor;
pub mod ds;
mod error;
pub mod features;
pub mod model;
pub mod negotiate;
pub mod openapi;
pub mod proxy;
pub mod server;
pub mod templates;
mod wkb;

pub use error::MyError;
pub use wkb::decode_geometry;
