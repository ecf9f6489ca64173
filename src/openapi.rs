// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Request + response validation against a merged OpenAPI document.
//!
//! The canonical OpenAPI file is shallow-deep-merged w/ per-endpoint
//! fragments at startup.  The same validator runs in two modes: during
//! startup (pre-rendered payloads; failures are fatal) and at runtime
//! (failures become 400s for requests, 500s for responses).
//!

use crate::MyError;
use jsonschema::Validator;
use serde_json::Value;
use std::{collections::HashMap, fs, path::Path};
use tracing::debug;

// Schema $ref chains deeper than this indicate a reference cycle.
const MAX_REF_DEPTH: usize = 32;

// Declared query parameter of one operation.
#[derive(Debug)]
struct ParamSpec {
    required: bool,
    // "integer", "number", "string", "boolean", or "array".
    type_: Option<String>,
}

// Validation artifacts of one (path, method) operation.
struct Operation {
    params: HashMap<String, ParamSpec>,
    // compiled 200-response schema per media type.
    responses: HashMap<String, Validator>,
}

/// Validator over the merged OpenAPI document.
///
/// Prepared once at startup and immutable afterwards.
pub struct OpenApiValidator {
    doc: Value,
    operations: HashMap<(String, String), Operation>,
}

impl OpenApiValidator {
    /// Load the canonical document from `base` and merge every fragment
    /// over it, later fragments winning key-by-key.
    pub fn from_files(base: &Path, fragments: &[&Path]) -> Result<Self, MyError> {
        let mut doc: Value = serde_json::from_str(&fs::read_to_string(base)?)?;
        for fragment in fragments {
            let it: Value = serde_json::from_str(&fs::read_to_string(fragment)?)?;
            merge(&mut doc, it);
        }
        Self::from_document(doc)
    }

    /// Prepare a validator from an already-merged document.
    pub fn from_document(doc: Value) -> Result<Self, MyError> {
        let mut operations = HashMap::new();
        let paths = doc
            .get("paths")
            .and_then(Value::as_object)
            .ok_or_else(|| MyError::Runtime("OpenAPI document w/o 'paths'".into()))?;
        for (path, methods) in paths {
            let Some(methods) = methods.as_object() else {
                continue;
            };
            for (method, op) in methods {
                let mut params = HashMap::new();
                if let Some(declared) = op.get("parameters").and_then(Value::as_array) {
                    for p in declared {
                        if p.get("in").and_then(Value::as_str) != Some("query") {
                            continue;
                        }
                        let Some(name) = p.get("name").and_then(Value::as_str) else {
                            continue;
                        };
                        params.insert(
                            name.to_owned(),
                            ParamSpec {
                                required: p
                                    .get("required")
                                    .and_then(Value::as_bool)
                                    .unwrap_or(false),
                                type_: p
                                    .pointer("/schema/type")
                                    .and_then(Value::as_str)
                                    .map(str::to_owned),
                            },
                        );
                    }
                }
                let mut responses = HashMap::new();
                if let Some(content) = op.pointer("/responses/200/content").and_then(Value::as_object)
                {
                    for (media_type, body) in content {
                        let Some(schema) = body.get("schema") else {
                            continue;
                        };
                        let resolved = resolve_refs(schema, &doc, 0)?;
                        let validator = jsonschema::validator_for(&resolved).map_err(|x| {
                            MyError::Runtime(
                                format!("Invalid schema for {method} {path}: {x}").into(),
                            )
                        })?;
                        responses.insert(media_type.to_owned(), validator);
                    }
                }
                debug!(
                    "Prepared {method} {path}: {} query parameter(s), {} response schema(s)",
                    params.len(),
                    responses.len()
                );
                operations.insert(
                    (path.to_owned(), method.to_uppercase()),
                    Operation { params, responses },
                );
            }
        }
        Ok(Self { doc, operations })
    }

    /// The merged document, for serving at `/api`.
    pub fn document(&self) -> &Value {
        &self.doc
    }

    /// Validate the query string of a request against the declared
    /// parameters of `(path, method)`.  Unknown parameters are rejected;
    /// the URL surface is a strict schema.
    pub fn validate_request(
        &self,
        path: &str,
        method: &str,
        query: &[(String, String)],
    ) -> Result<(), MyError> {
        let Some(op) = self.operations.get(&(path.to_owned(), method.to_uppercase())) else {
            // an unregistered operation has nothing to validate against.
            return Ok(());
        };
        for (name, value) in query {
            let Some(spec) = op.params.get(name) else {
                return Err(MyError::BadRequest(
                    format!("Unknown query parameter '{name}'").into(),
                ));
            };
            let ok = match spec.type_.as_deref() {
                Some("integer") => value.parse::<i64>().is_ok(),
                Some("number") => value.parse::<f64>().is_ok(),
                Some("boolean") => matches!(value.as_str(), "true" | "false"),
                _ => true,
            };
            if !ok {
                return Err(MyError::BadRequest(
                    format!("Malformed value for query parameter '{name}'").into(),
                ));
            }
        }
        for (name, spec) in &op.params {
            if spec.required && !query.iter().any(|(n, _)| n == name) {
                return Err(MyError::BadRequest(
                    format!("Missing required query parameter '{name}'").into(),
                ));
            }
        }
        Ok(())
    }

    /// Validate a response `body` of `content_type` against the 200
    /// response schema of `(path, method)`.  Media types w/o a registered
    /// schema (e.g. HTML) pass through.
    pub fn validate_response(
        &self,
        path: &str,
        method: &str,
        content_type: &str,
        body: &[u8],
    ) -> Result<(), MyError> {
        let Some(op) = self.operations.get(&(path.to_owned(), method.to_uppercase())) else {
            return Ok(());
        };
        // strip parameters such as '; charset=utf-8'...
        let media_type = content_type.split(';').next().unwrap_or("").trim();
        let Some(validator) = op.responses.get(media_type) else {
            return Ok(());
        };
        let instance: Value = serde_json::from_slice(body)?;
        if let Err(x) = validator.validate(&instance) {
            return Err(MyError::Runtime(
                format!("Response of {method} {path} failed validation: {x}").into(),
            ));
        }
        Ok(())
    }
}

// RFC 7386 style merge: objects merge key-by-key, anything else replaces.
fn merge(doc: &mut Value, patch: Value) {
    match (doc, patch) {
        (Value::Object(a), Value::Object(b)) => {
            for (k, v) in b {
                match a.get_mut(&k) {
                    Some(slot) => merge(slot, v),
                    None => {
                        a.insert(k, v);
                    }
                }
            }
        }
        (slot, x) => *slot = x,
    }
}

// Inline `$ref` pointers so each response schema is self-contained for the
// `jsonschema` compiler.
fn resolve_refs(schema: &Value, doc: &Value, depth: usize) -> Result<Value, MyError> {
    if depth > MAX_REF_DEPTH {
        return Err(MyError::Runtime("Schema $ref chain too deep".into()));
    }
    match schema {
        Value::Object(map) => {
            if let Some(target) = map.get("$ref").and_then(Value::as_str) {
                let pointer = target.strip_prefix('#').ok_or_else(|| {
                    MyError::Runtime(format!("Unsupported external $ref '{target}'").into())
                })?;
                let resolved = doc.pointer(pointer).ok_or_else(|| {
                    MyError::Runtime(format!("Dangling $ref '{target}'").into())
                })?;
                return resolve_refs(resolved, doc, depth + 1);
            }
            let mut out = serde_json::Map::new();
            for (k, v) in map {
                out.insert(k.to_owned(), resolve_refs(v, doc, depth + 1)?);
            }
            Ok(Value::Object(out))
        }
        Value::Array(items) => Ok(Value::Array(
            items
                .iter()
                .map(|x| resolve_refs(x, doc, depth + 1))
                .collect::<Result<_, _>>()?,
        )),
        x => Ok(x.clone()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const ITEMS: &str = "/collections/{collectionId}/items";

    fn doc() -> Value {
        json!({
            "openapi": "3.0.3",
            "info": { "title": "t", "version": "1" },
            "paths": {
                "/collections/{collectionId}/items": {
                    "get": {
                        "parameters": [
                            { "name": "limit", "in": "query", "schema": { "type": "integer" } },
                            { "name": "bbox", "in": "query", "schema": { "type": "string" } },
                            { "name": "cursor", "in": "query", "schema": { "type": "string" } },
                            { "name": "f", "in": "query", "schema": { "type": "string" } },
                            { "name": "lang", "in": "query", "schema": { "type": "string" } }
                        ],
                        "responses": { "200": { "description": "page", "content": {
                            "application/geo+json": {
                                "schema": { "$ref": "#/components/schemas/FeatureCollection" }
                            }
                        }}}
                    }
                }
            },
            "components": { "schemas": {
                "FeatureCollection": {
                    "type": "object",
                    "required": ["type", "features"],
                    "properties": {
                        "type": { "const": "FeatureCollection" },
                        "features": { "type": "array" }
                    }
                }
            }}
        })
    }

    #[test]
    fn test_unknown_parameter_is_rejected() {
        let v = OpenApiValidator::from_document(doc()).unwrap();
        let q = vec![("datetime".to_owned(), "2020".to_owned())];
        assert!(matches!(
            v.validate_request(ITEMS, "GET", &q),
            Err(MyError::BadRequest(_))
        ));
    }

    #[test]
    fn test_typed_parameter_values() {
        let v = OpenApiValidator::from_document(doc()).unwrap();
        let q = vec![("limit".to_owned(), "10".to_owned())];
        assert!(v.validate_request(ITEMS, "GET", &q).is_ok());
        let q = vec![("limit".to_owned(), "ten".to_owned())];
        assert!(v.validate_request(ITEMS, "GET", &q).is_err());
    }

    #[test]
    fn test_response_schema_with_ref() {
        let v = OpenApiValidator::from_document(doc()).unwrap();
        let good = br#"{ "type": "FeatureCollection", "features": [] }"#;
        assert!(
            v.validate_response(ITEMS, "GET", "application/geo+json; charset=utf-8", good)
                .is_ok()
        );
        let bad = br#"{ "type": "Feature" }"#;
        assert!(
            v.validate_response(ITEMS, "GET", "application/geo+json", bad)
                .is_err()
        );
    }

    #[test]
    fn test_html_passes_through() {
        let v = OpenApiValidator::from_document(doc()).unwrap();
        assert!(
            v.validate_response(ITEMS, "GET", "text/html", b"<html></html>")
                .is_ok()
        );
    }

    #[test]
    fn test_merge_fragments() {
        let mut base = json!({ "paths": { "/a": { "get": {} } }, "x": 1 });
        merge(
            &mut base,
            json!({ "paths": { "/b": { "get": {} } }, "x": 2 }),
        );
        assert!(base["paths"].get("/a").is_some());
        assert!(base["paths"].get("/b").is_some());
        assert_eq!(base["x"], 2);
    }

    #[test]
    fn test_dangling_ref_fails_startup() {
        let mut it = doc();
        it["components"]["schemas"] = json!({});
        assert!(OpenApiValidator::from_document(it).is_err());
    }
}
