//! Documents and document paths
//!
//! A path is an alternating chain of collection and id segments, e.g.
//! `tenants/T1/orders/O1`. The collection of a document is the second to last
//! segment, its id the last.

use std::fmt;

use chrono::{DateTime, SecondsFormat, Utc};
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use super::errors::{StorageError, StorageResult};

/// A validated, normalized document path.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct DocumentPath(String);

impl DocumentPath {
    /// Parse and normalize a path. Leading and trailing slashes are ignored.
    pub fn parse(raw: &str) -> StorageResult<Self> {
        let trimmed = raw.trim_matches('/');
        if trimmed.is_empty() {
            return Err(StorageError::invalid_path(raw, "path is empty"));
        }

        let mut count = 0;
        for segment in trimmed.split('/') {
            if segment.is_empty() {
                return Err(StorageError::invalid_path(raw, "empty path segment"));
            }
            if segment.trim() != segment {
                return Err(StorageError::invalid_path(
                    raw,
                    "segments must not carry surrounding whitespace",
                ));
            }
            count += 1;
        }

        if count % 2 != 0 {
            return Err(StorageError::invalid_path(
                raw,
                "a document path needs an even number of segments",
            ));
        }

        Ok(Self(trimmed.to_string()))
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }

    pub fn segments(&self) -> impl Iterator<Item = &str> {
        self.0.split('/')
    }

    /// The last segment.
    pub fn id(&self) -> &str {
        self.0.rsplit('/').next().unwrap_or(&self.0)
    }

    /// The collection this document lives in (second to last segment).
    pub fn collection(&self) -> &str {
        self.0.rsplit('/').nth(1).unwrap_or_default()
    }
}

impl fmt::Display for DocumentPath {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl TryFrom<String> for DocumentPath {
    type Error = StorageError;

    fn try_from(value: String) -> StorageResult<Self> {
        Self::parse(&value)
    }
}

impl From<DocumentPath> for String {
    fn from(path: DocumentPath) -> Self {
        path.0
    }
}

/// A stored document.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct Document {
    pub id: String,
    pub path: DocumentPath,
    pub collection: String,
    /// Opaque structured payload
    pub data: Value,
    /// Starts at 1, +1 per successful mutation
    pub version: u64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
    pub tenant_id: String,
}

impl Document {
    pub(crate) fn new(path: DocumentPath, data: Value, tenant: &str, now: DateTime<Utc>) -> Self {
        Self {
            id: path.id().to_string(),
            collection: path.collection().to_string(),
            path,
            data,
            version: 1,
            created_at: now,
            updated_at: now,
            tenant_id: tenant.to_string(),
        }
    }

    /// Resolve a field for indexing or rule evaluation.
    ///
    /// Dotted names walk nested objects in the payload. When the payload has
    /// no such field, the metadata names `id`, `createdAt`, `updatedAt` and
    /// `version` fall back to the document's own metadata. Timestamps render
    /// as fixed-precision RFC 3339 strings so they order lexicographically.
    pub fn field(&self, name: &str) -> Option<Value> {
        if let Some(value) = lookup_dotted(&self.data, name) {
            return Some(value.clone());
        }
        match name {
            "id" => Some(Value::String(self.id.clone())),
            "createdAt" => Some(Value::String(format_timestamp(&self.created_at))),
            "updatedAt" => Some(Value::String(format_timestamp(&self.updated_at))),
            "version" => Some(Value::from(self.version)),
            _ => None,
        }
    }
}

/// Walk `a.b.c` through nested objects.
pub fn lookup_dotted<'a>(value: &'a Value, name: &str) -> Option<&'a Value> {
    let mut current = value;
    for part in name.split('.') {
        current = current.as_object()?.get(part)?;
    }
    Some(current)
}

pub(crate) fn format_timestamp(ts: &DateTime<Utc>) -> String {
    ts.to_rfc3339_opts(SecondsFormat::Micros, true)
}

/// Shallow merge: top-level fields of `patch` overwrite those of `base`.
///
/// If either side is not an object the patch replaces the base.
pub fn merge_shallow(base: &Value, patch: Value) -> Value {
    match (base.as_object(), patch) {
        (Some(existing), Value::Object(fields)) => {
            let mut merged: Map<String, Value> = existing.clone();
            for (key, value) in fields {
                merged.insert(key, value);
            }
            Value::Object(merged)
        }
        (_, patch) => patch,
    }
}
