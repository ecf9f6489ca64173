// SPDX-License-Identifier: Apache-2.0

#![warn(missing_docs)]

//! Parsing, rendering + caching of language- and format-keyed templates.
//!
//! Two engines run side by side b/c their escaping rules differ: HTML
//! templates autoescape, JSON ones do not.  Localization holds one
//! template set per configured language under
//! `<templates_dir>/<language>/`.  Pages w/ static content are rendered
//! once at startup into byte payloads and validated against the OpenAPI
//! document; dynamic pages render per request.
//!

use crate::{MyError, negotiate::Format, openapi::OpenApiValidator};
use bytes::Bytes;
use minijinja::{AutoEscape, Environment, path_loader};
use serde::Serialize;
use std::{collections::HashMap, path::Path};
use tracing::debug;

/// Identity of a renderable artifact.
///
/// Two keys are equal iff all five constituents match.  Parsed templates
/// are shared across instances: they are looked up by `(name, directory,
/// format, language)` only, while rendered payloads are cached under the
/// full key.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct TemplateKey {
    /// Base template name; e.g. `landing-page`.
    pub name: String,
    /// Directory under the per-language root; empty for top-level pages.
    pub directory: String,
    /// Output format; only [Format::Html] and [Format::Json] have engines.
    pub format: Format,
    /// Distinguishes payloads of one template rendered per instance; e.g.
    /// a style id.  Empty for singleton pages.
    pub instance: String,
    /// Language tag the template set belongs to.
    pub language: String,
}

impl TemplateKey {
    /// Key of a singleton top-level page.
    pub fn new(name: &str, format: Format, language: &str) -> Self {
        Self {
            name: name.to_owned(),
            directory: String::new(),
            format,
            instance: String::new(),
            language: language.to_owned(),
        }
    }

    /// Same, w/ an instance discriminator.
    pub fn instanced(name: &str, format: Format, language: &str, instance: &str) -> Self {
        Self {
            instance: instance.to_owned(),
            ..Self::new(name, format, language)
        }
    }

    // path of the backing file relative to the per-language root.
    fn relative_path(&self) -> String {
        let ext = match self.format {
            Format::Html => "html",
            _ => "json",
        };
        if self.directory.is_empty() {
            format!("{}.{ext}.jinja", self.name)
        } else {
            format!("{}/{}.{ext}.jinja", self.directory, self.name)
        }
    }
}

/// Holds the parsed template engines plus the payloads pre-rendered at
/// startup.  Populated strictly before the server starts listening and
/// read-only afterwards; handlers share it w/o locking.
pub struct TemplateStore {
    // one engine per (language, escaping-class) pair.
    html: HashMap<String, Environment<'static>>,
    json: HashMap<String, Environment<'static>>,
    rendered: HashMap<TemplateKey, Bytes>,
}

impl TemplateStore {
    /// Build the per-language engines rooted at `templates_dir`.
    pub fn new(templates_dir: &Path, languages: &[String]) -> Result<Self, MyError> {
        let mut html = HashMap::new();
        let mut json = HashMap::new();
        for language in languages {
            let root = templates_dir.join(language);
            if !root.is_dir() {
                return Err(MyError::Runtime(
                    format!("No template set for language '{language}' in {templates_dir:?}")
                        .into(),
                ));
            }
            let mut env = Environment::new();
            env.set_loader(path_loader(&root));
            env.set_auto_escape_callback(|_| AutoEscape::Html);
            html.insert(language.to_owned(), env);

            let mut env = Environment::new();
            env.set_loader(path_loader(&root));
            env.set_auto_escape_callback(|_| AutoEscape::None);
            json.insert(language.to_owned(), env);
        }
        Ok(Self {
            html,
            json,
            rendered: HashMap::new(),
        })
    }

    // the engine a key's format + language resolve to.
    fn engine(&self, key: &TemplateKey) -> Result<&Environment<'static>, MyError> {
        let engines = match key.format {
            Format::Html => &self.html,
            _ => &self.json,
        };
        engines.get(&key.language).ok_or_else(|| {
            MyError::Runtime(format!("No engine for language '{}'", key.language).into())
        })
    }

    /// Render `key` w/ `params` on the fly.
    pub fn render<S: Serialize>(&self, key: &TemplateKey, params: &S) -> Result<Bytes, MyError> {
        let template = self.engine(key)?.get_template(&key.relative_path())?;
        let it = template.render(params)?;
        Ok(Bytes::from(it))
    }

    /// Render `key` once, validate the payload against the OpenAPI 200
    /// response of `(path, GET)` and cache it.  A failure here aborts
    /// startup: a server that would serve an invalid static page must not
    /// come up.
    pub fn prerender<S: Serialize>(
        &mut self,
        key: TemplateKey,
        path: &str,
        params: &S,
        validator: &OpenApiValidator,
    ) -> Result<(), MyError> {
        let payload = self.render(&key, params)?;
        let media_type = match key.format {
            Format::Html => key.format.media_type(),
            _ => "application/json",
        };
        validator.validate_response(path, "GET", media_type, &payload)?;
        debug!("Pre-rendered {key:?} ({} bytes)", payload.len());
        self.rendered.insert(key, payload);
        Ok(())
    }

    /// Look up a payload pre-rendered at startup.
    pub fn rendered(&self, key: &TemplateKey) -> Option<Bytes> {
        self.rendered.get(key).cloned()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;
    use std::fs;
    use tempfile::TempDir;

    fn fixture() -> TempDir {
        let dir = TempDir::new().unwrap();
        let en = dir.path().join("en");
        fs::create_dir_all(en.join("styles")).unwrap();
        fs::write(
            en.join("landing-page.html.jinja"),
            "<h1>{{ title }}</h1>",
        )
        .unwrap();
        fs::write(
            en.join("landing-page.json.jinja"),
            r#"{ "title": "{{ title }}" }"#,
        )
        .unwrap();
        fs::write(
            en.join("styles/style.json.jinja"),
            r#"{ "id": "{{ id }}" }"#,
        )
        .unwrap();
        dir
    }

    fn langs() -> Vec<String> {
        vec!["en".to_owned()]
    }

    #[test]
    fn test_html_escapes_json_does_not() {
        let dir = fixture();
        let store = TemplateStore::new(dir.path(), &langs()).unwrap();
        let params = json!({ "title": "<Addresses>" });

        let key = TemplateKey::new("landing-page", Format::Html, "en");
        let it = store.render(&key, &params).unwrap();
        assert_eq!(&it[..], b"<h1>&lt;Addresses&gt;</h1>");

        let key = TemplateKey::new("landing-page", Format::Json, "en");
        let it = store.render(&key, &params).unwrap();
        assert_eq!(&it[..], br#"{ "title": "<Addresses>" }"#);
    }

    #[test]
    fn test_instanced_key_uses_directory() {
        let dir = fixture();
        let store = TemplateStore::new(dir.path(), &langs()).unwrap();
        let mut key = TemplateKey::instanced("style", Format::Json, "en", "night");
        key.directory = "styles".to_owned();
        let it = store.render(&key, &json!({ "id": "night" })).unwrap();
        assert_eq!(&it[..], br#"{ "id": "night" }"#);
    }

    #[test]
    fn test_missing_language_set_fails() {
        let dir = fixture();
        let result = TemplateStore::new(dir.path(), &["nl".to_owned()]);
        assert!(result.is_err());
    }

    #[test]
    fn test_prerender_caches_by_full_key() {
        let dir = fixture();
        let mut store = TemplateStore::new(dir.path(), &langs()).unwrap();
        let validator = OpenApiValidator::from_document(json!({ "paths": {} })).unwrap();
        let key = TemplateKey::new("landing-page", Format::Json, "en");
        store
            .prerender(key.clone(), "/", &json!({ "title": "A" }), &validator)
            .unwrap();
        assert!(store.rendered(&key).is_some());
        // a different instance is a different payload...
        let other = TemplateKey::instanced("landing-page", Format::Json, "en", "x");
        assert!(store.rendered(&other).is_none());
    }

    #[test]
    fn test_prerender_validation_failure_aborts() {
        let dir = fixture();
        fs::write(
            dir.path().join("en/broken.json.jinja"),
            r#"{ "title": 42 }"#,
        )
        .unwrap();
        let mut store = TemplateStore::new(dir.path(), &langs()).unwrap();
        let validator = OpenApiValidator::from_document(json!({ "paths": {
            "/broken": { "get": { "responses": { "200": { "content": {
                "application/json": { "schema": {
                    "type": "object",
                    "properties": { "title": { "type": "string" } }
                }}
            }}}}}
        }}))
        .unwrap();
        let key = TemplateKey::new("broken", Format::Json, "en");
        let result = store.prerender(key, "/broken", &json!({}), &validator);
        assert!(result.is_err());
    }
}
