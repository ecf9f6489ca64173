// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Forwarding of tile + 3D-tile requests to an upstream tile server.
//!
//! OGC tile specs require a 204 for empty-but-valid tiles w/in declared
//! limits while upstreams commonly answer 404; the `prefer204` rule aligns
//! those semantics at this boundary w/o touching the upstream.
//!

use crate::MyError;
use axum::{
    body::Body,
    http::{HeaderMap, HeaderValue, Response, StatusCode, header},
};
use std::net::IpAddr;
use tracing::debug;
use url::Url;

/// Header carrying the public base URL to upstreams that render links.
const X_BASE_URL: &str = "x-baseurl";

// hop-by-hop headers never forwarded in either direction.
const HOP_BY_HOP: [&str; 8] = [
    "connection",
    "keep-alive",
    "proxy-authenticate",
    "proxy-authorization",
    "te",
    "trailer",
    "transfer-encoding",
    "upgrade",
];

/// Per-call response adjustment rules.
#[derive(Debug, Clone, Default)]
pub struct ProxyRules {
    /// Rewrite an upstream 404 into an empty 204.
    pub prefer_204: bool,
    /// Replace the upstream `Content-Type` w/ this value.
    pub content_type: Option<String>,
}

/// Forwards requests to a configured upstream, rewriting both directions.
pub struct ReverseProxy {
    client: reqwest::Client,
    // public base URL of this instance, injected as `X-BaseUrl`.
    base_url: String,
}

impl ReverseProxy {
    /// Constructor.
    pub fn new(base_url: &str) -> Self {
        Self {
            client: reqwest::Client::new(),
            base_url: base_url.to_owned(),
        }
    }

    /// Forward a GET of `upstream`, relaying `headers` minus `Host` and the
    /// hop-by-hop set, adding `X-Forwarded-*` + `X-BaseUrl`, and streaming
    /// the upstream body back after applying `rules`.
    pub async fn forward(
        &self,
        upstream: Url,
        headers: &HeaderMap,
        client_ip: Option<IpAddr>,
        rules: &ProxyRules,
    ) -> Result<Response<Body>, MyError> {
        debug!("Forwarding to {upstream}");
        let mut outbound = HeaderMap::new();
        for (name, value) in headers {
            let n = name.as_str();
            if n == "host" || HOP_BY_HOP.contains(&n) {
                continue;
            }
            outbound.insert(name, value.to_owned());
        }
        if let Some(host) = headers.get(header::HOST) {
            outbound.insert("x-forwarded-host", host.to_owned());
        }
        outbound.insert("x-forwarded-proto", HeaderValue::from_static("http"));
        if let Some(ip) = client_ip
            && let Ok(value) = HeaderValue::from_str(&ip.to_string())
        {
            outbound.insert("x-forwarded-for", value);
        }
        outbound.insert(
            X_BASE_URL,
            HeaderValue::from_str(&self.base_url)
                .map_err(|_| MyError::Runtime("Base URL is not a valid header value".into()))?,
        );

        let reply = self
            .client
            .get(upstream)
            .headers(outbound)
            .send()
            .await?;

        let status = reply.status();
        let mut headers = HeaderMap::new();
        for (name, value) in reply.headers() {
            if HOP_BY_HOP.contains(&name.as_str()) {
                continue;
            }
            headers.insert(name, value.to_owned());
        }
        let status = apply_rules(status, &mut headers, rules);

        let mut builder = Response::builder().status(status);
        if let Some(slot) = builder.headers_mut() {
            *slot = headers;
        }
        let body = if status == StatusCode::NO_CONTENT {
            Body::empty()
        } else {
            Body::from_stream(reply.bytes_stream())
        };
        builder
            .body(body)
            .map_err(|x| MyError::Runtime(format!("Failed assembling proxy reply: {x}").into()))
    }
}

// Adjust the upstream (status, headers) pair according to `rules`.
fn apply_rules(status: StatusCode, headers: &mut HeaderMap, rules: &ProxyRules) -> StatusCode {
    if rules.prefer_204 && status == StatusCode::NOT_FOUND {
        headers.remove(header::CONTENT_LENGTH);
        headers.remove(header::CONTENT_TYPE);
        return StatusCode::NO_CONTENT;
    }
    if let Some(ct) = &rules.content_type
        && let Ok(value) = HeaderValue::from_str(ct)
    {
        headers.insert(header::CONTENT_TYPE, value);
    }
    status
}
