//! Per-collection schemas.
//!
//! A [`CollectionSchema`] names a collection and carries the default
//! template a document is synthesised from the first time its key is
//! accessed. Top-level template fields are the only fields
//! [`DocumentService::get_field`](crate::service::DocumentService::get_field)
//! will hand out.

use serde_json::{Value, json};

use crate::document::{Document, DocumentKey, ID_FIELD};

/// Name of the per-guild settings collection.
pub const SETTINGS: &str = "settings";

/// Name of the per-user collection.
pub const USERS: &str = "users";

/// Name and default template of one collection.
#[derive(Debug, Clone, PartialEq)]
pub struct CollectionSchema {
    name: String,
    template: Document,
}

impl CollectionSchema {
    /// A schema whose template is `template` (a JSON object; anything else
    /// yields an empty template).
    pub fn new(name: impl Into<String>, template: Value) -> Self {
        let template = match template {
            Value::Object(map) => map,
            _ => Document::new(),
        };
        Self {
            name: name.into(),
            template,
        }
    }

    /// Guild settings: no fixed fields beyond `_id`.
    pub fn settings() -> Self {
        Self::new(SETTINGS, json!({}))
    }

    /// Users: a favourites playlist, play history and an inbox.
    pub fn users() -> Self {
        Self::new(
            USERS,
            json!({
                "playlist": {
                    "200": {
                        "tracks": [],
                        "perms": { "read": [], "write": [], "remove": [] },
                        "name": "Favourite",
                        "type": "playlist",
                    }
                },
                "history": [],
                "inbox": [],
            }),
        )
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn template(&self) -> &Document {
        &self.template
    }

    /// Default value of a top-level template field.
    pub fn field_default(&self, field: &str) -> Option<&Value> {
        self.template.get(field)
    }

    /// A fresh document for `key`, deep-copied from the template.
    pub fn instantiate(&self, key: &DocumentKey) -> Document {
        let mut doc = self.template.clone();
        doc.insert(ID_FIELD.to_string(), key.to_value());
        doc
    }
}
