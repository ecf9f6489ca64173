// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Errors raised from this server.
//!

use std::borrow::Cow;
use thiserror::Error;

/// Variants of error raised from this server.
#[derive(Debug, Error)]
pub enum MyError {
    /// File-system + network I/O errors.
    #[error("I/O error: {0}")]
    IO(#[from] std::io::Error),

    /// Date, time + timestamp (`jiff`) parsing error.
    #[error("Date-Time error: {0}")]
    Time(#[from] jiff::Error),

    /// SQL driver (`sqlx`) related error.
    #[error("SQL error: {0}")]
    SQL(#[from] sqlx::Error),

    /// JSON (de)serialization (`serde`) related error.
    #[error("Json [Try]From error: {0}")]
    Json(#[from] serde_json::Error),

    /// Configuration file (`toml`) parsing error.
    #[error("TOML error: {0}")]
    Toml(#[from] toml::de::Error),

    /// Geometry decoding (`geozero`) related error.
    #[error("Geometry error: {0}")]
    Geometry(#[from] geozero::error::GeozeroError),

    /// Template parsing + rendering (`minijinja`) related error.
    #[error("Template error: {0}")]
    Template(#[from] minijinja::Error),

    /// Upstream HTTP client (`reqwest`) related error.
    #[error("Upstream error: {0}")]
    Upstream(#[from] reqwest::Error),

    /// URL parsing error.
    #[error("URL error: {0}")]
    Url(#[from] url::ParseError),

    /// Malformed or failed-validation request input.  Surfaces as a 400.
    #[error("Bad request: {0}")]
    BadRequest(Cow<'static, str>),

    /// A collection, feature or negotiable format is absent.  Surfaces as
    /// a 404.
    #[error("Not found: {0}")]
    NotFound(Cow<'static, str>),

    /// Runtime error.  Surfaces as a 500 w/ a sanitized message.
    #[error("Runtime error: {0}")]
    Runtime(Cow<'static, str>),
}
