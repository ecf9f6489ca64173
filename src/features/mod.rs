// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! The `/collections/{collectionId}/items` endpoints, gluing the cursor
//! codec, feature mapper, datasource, negotiator, template store and
//! OpenAPI validator together.
//!

pub mod params;

use crate::{
    MyError,
    cursor::Cursors,
    ds::FeatureCriteria,
    model::{Feature, FeatureCollection, FeatureCollectionDoc, Link},
    negotiate::{self, FORMAT_PARAM, Format, LANGUAGE_COOKIE, LANGUAGE_PARAM},
    server::AppState,
    templates::TemplateKey,
};
use axum::{
    Json,
    extract::{Path, RawQuery, State},
    http::{HeaderMap, StatusCode, header},
    response::{IntoResponse, Response},
};
use axum_extra::extract::cookie::{Cookie, CookieJar};
use jiff::Timestamp;
use params::FeatureParams;
use serde::Serialize;
use serde_json::json;
use tracing::error;

/// OpenAPI path template of the feature-collection endpoint.
pub const ITEMS_PATH: &str = "/collections/{collectionId}/items";
/// OpenAPI path template of the single-feature endpoint.
pub const ITEM_PATH: &str = "/collections/{collectionId}/items/{featureId}";

// formats the features endpoints negotiate over.  JSON-FG is declared so
// negotiation recognizes it; its encoder does not exist yet and requests
// for it answer 404 rather than a wrong payload.
const SUPPORTED: [Format; 3] = [Format::Json, Format::Html, Format::JsonFg];

/// An error message serialized as JSON on failures.
#[derive(Debug, Serialize)]
struct ErrorResponse {
    message: String,
}

// Map a [MyError] onto the HTTP surface.  Client-induced variants carry
// their message; anything else is logged and replaced by a sanitized one
// naming only the failed operation.
fn error_response(operation: &str, err: MyError) -> Response {
    let (status, message) = match &err {
        MyError::BadRequest(x) => (StatusCode::BAD_REQUEST, x.to_string()),
        MyError::NotFound(x) => (StatusCode::NOT_FOUND, x.to_string()),
        _ => {
            error!("Failed to {operation}: {err}");
            (
                StatusCode::INTERNAL_SERVER_ERROR,
                format!("Failed to {operation}"),
            )
        }
    };
    (status, Json(ErrorResponse { message })).into_response()
}

// (format, language) of this request, resolved once.
fn negotiated(
    state: &AppState,
    query: &[(String, String)],
    headers: &HeaderMap,
    cookies: &CookieJar,
) -> Result<(Format, String), MyError> {
    let f_param = query
        .iter()
        .find(|(n, _)| n == FORMAT_PARAM)
        .map(|(_, v)| v.as_str());
    let accept = headers
        .get(header::ACCEPT)
        .and_then(|x| x.to_str().ok());
    let format = negotiate::format(f_param, accept, &SUPPORTED)?;

    let lang_param = query
        .iter()
        .find(|(n, _)| n == LANGUAGE_PARAM)
        .map(|(_, v)| v.as_str());
    let cookie = cookies.get(LANGUAGE_COOKIE).map(|x| x.value());
    let accept_language = headers
        .get(header::ACCEPT_LANGUAGE)
        .and_then(|x| x.to_str().ok());
    let language = negotiate::language(
        lang_param,
        cookie,
        accept_language,
        &state.config.languages,
    );
    Ok((format, language))
}

// URL of the items endpoint w/ `query` minus any stale cursor, plus the
// given one.
fn items_url(
    state: &AppState,
    collection: &str,
    query: &[(String, String)],
    cursor: Option<&str>,
) -> String {
    let mut pairs: Vec<String> = query
        .iter()
        .filter(|(n, _)| n != "cursor")
        .map(|(n, v)| format!("{n}={v}"))
        .collect();
    if let Some(x) = cursor {
        pairs.push(format!("cursor={x}"));
    }
    let base = format!("{}/collections/{collection}/items", state.config.base_url);
    if pairs.is_empty() {
        base
    } else {
        format!("{base}?{}", pairs.join("&"))
    }
}

/// `GET /collections/{collectionId}/items`
pub async fn get_features(
    State(state): State<AppState>,
    Path(collection_id): Path<String>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
    cookies: CookieJar,
) -> Response {
    let query = parse_query(raw.as_deref());
    match try_get_features(&state, &collection_id, &query, &headers, &cookies).await {
        Ok(x) => x,
        Err(x) => error_response(
            &format!("retrieve feature collection {collection_id}"),
            x,
        ),
    }
}

async fn try_get_features(
    state: &AppState,
    collection_id: &str,
    query: &[(String, String)],
    headers: &HeaderMap,
    cookies: &CookieJar,
) -> Result<Response, MyError> {
    state
        .openapi
        .validate_request(ITEMS_PATH, "GET", query)?;
    if state.config.collection(collection_id).is_none() {
        return Err(MyError::NotFound(
            format!("Collection '{collection_id}' does not exist").into(),
        ));
    }
    let (format, language) = negotiated(state, query, headers, cookies)?;
    if format == Format::JsonFg {
        return Err(MyError::NotFound(
            "JSON-FG output is not available yet".into(),
        ));
    }
    let params = FeatureParams::parse(query, &state.config.limit)?;

    // a zero limit still answers the has-next question: probe one row and
    // keep the page empty.
    let fc = if params.limit == 0 {
        let probe = FeatureCriteria {
            start_fid: params.cursor.fid(),
            limit: 1,
            bbox: params.bbox,
        };
        let probed = state.source.get_features(collection_id, &probe).await?;
        FeatureCollection {
            features: Vec::new(),
            prev_fid: 0,
            next_fid: probed.features.first().map(|x| x.fid).unwrap_or(0),
        }
    } else {
        let criteria = FeatureCriteria {
            start_fid: params.cursor.fid(),
            limit: params.limit,
            bbox: params.bbox,
        };
        state.source.get_features(collection_id, &criteria).await?
    };

    let cursors = Cursors::new(fc.prev_fid, fc.next_fid, &params.checksum);
    let mut links = vec![Link {
        href: items_url(state, collection_id, query, None),
        rel: "self".to_owned(),
        type_: Some(format.media_type_features().to_owned()),
        title: None,
    }];
    if cursors.has_next {
        links.push(Link {
            href: items_url(state, collection_id, query, Some(&cursors.next)),
            rel: "next".to_owned(),
            type_: Some(format.media_type_features().to_owned()),
            title: None,
        });
    }
    if cursors.has_prev {
        links.push(Link {
            href: items_url(state, collection_id, query, Some(&cursors.prev)),
            rel: "prev".to_owned(),
            type_: Some(format.media_type_features().to_owned()),
            title: None,
        });
    }

    let reply = match format {
        Format::Html => {
            let key = TemplateKey::new("features", Format::Html, &language);
            let context = json!({
                "collection": state.config.collection(collection_id),
                "features": fc.features,
                "numberReturned": fc.number_returned(),
                "cursors": {
                    "next": cursors.next,
                    "prev": cursors.prev,
                    "hasNext": cursors.has_next,
                    "hasPrev": cursors.has_prev,
                },
                "links": links,
            });
            let body = state.templates.render(&key, &context)?;
            into_reply(StatusCode::OK, Format::Html.media_type(), body.to_vec())
        }
        _ => {
            let doc = FeatureCollectionDoc {
                type_: "FeatureCollection",
                time_stamp: Timestamp::now(),
                links,
                number_returned: fc.number_returned(),
                features: fc.features,
            };
            let body = serde_json::to_vec(&doc)?;
            let media_type = Format::Json.media_type_features();
            state
                .openapi
                .validate_response(ITEMS_PATH, "GET", media_type, &body)?;
            into_reply(StatusCode::OK, media_type, body)
        }
    };
    Ok(with_language_cookie(reply, cookies, &language))
}

/// `GET /collections/{collectionId}/items/{featureId}`
pub async fn get_feature(
    State(state): State<AppState>,
    Path((collection_id, feature_id)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
    headers: HeaderMap,
    cookies: CookieJar,
) -> Response {
    let query = parse_query(raw.as_deref());
    match try_get_feature(&state, &collection_id, &feature_id, &query, &headers, &cookies).await {
        Ok(x) => x,
        Err(x) => error_response(
            &format!("retrieve feature {feature_id} of collection {collection_id}"),
            x,
        ),
    }
}

async fn try_get_feature(
    state: &AppState,
    collection_id: &str,
    feature_id: &str,
    query: &[(String, String)],
    headers: &HeaderMap,
    cookies: &CookieJar,
) -> Result<Response, MyError> {
    state.openapi.validate_request(ITEM_PATH, "GET", query)?;
    if state.config.collection(collection_id).is_none() {
        return Err(MyError::NotFound(
            format!("Collection '{collection_id}' does not exist").into(),
        ));
    }
    let fid: i64 = feature_id.parse().map_err(|_| {
        MyError::BadRequest(format!("Feature ID '{feature_id}' is not a number").into())
    })?;
    let (format, language) = negotiated(state, query, headers, cookies)?;
    if format == Format::JsonFg {
        return Err(MyError::NotFound(
            "JSON-FG output is not available yet".into(),
        ));
    }

    let Some(feature) = state.source.get_feature(collection_id, fid).await? else {
        return Err(MyError::NotFound(
            format!("Feature {fid} does not exist in collection '{collection_id}'").into(),
        ));
    };

    let reply = match format {
        Format::Html => {
            let key = TemplateKey::new("feature", Format::Html, &language);
            let context = json!({
                "collection": state.config.collection(collection_id),
                "feature": feature,
            });
            let body = state.templates.render(&key, &context)?;
            into_reply(StatusCode::OK, Format::Html.media_type(), body.to_vec())
        }
        _ => render_feature_json(state, &feature)?,
    };
    Ok(with_language_cookie(reply, cookies, &language))
}

fn render_feature_json(state: &AppState, feature: &Feature) -> Result<Response, MyError> {
    let body = serde_json::to_vec(feature)?;
    let media_type = Format::Json.media_type_features();
    state
        .openapi
        .validate_response(ITEM_PATH, "GET", media_type, &body)?;
    Ok(into_reply(StatusCode::OK, media_type, body))
}

fn parse_query(raw: Option<&str>) -> Vec<(String, String)> {
    match raw {
        Some(x) => url::form_urlencoded::parse(x.as_bytes())
            .into_owned()
            .collect(),
        None => Vec::new(),
    }
}

fn into_reply(status: StatusCode, media_type: &str, body: Vec<u8>) -> Response {
    (status, [(header::CONTENT_TYPE, media_type.to_owned())], body).into_response()
}

// write the negotiated language back so subsequent requests agree.
fn with_language_cookie(reply: Response, cookies: &CookieJar, language: &str) -> Response {
    let jar = cookies
        .to_owned()
        .add(Cookie::new(LANGUAGE_COOKIE.to_owned(), language.to_owned()));
    (jar, reply).into_response()
}
