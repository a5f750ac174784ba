//! Request, key and response types shared by every BatchRPC crate.

use std::collections::HashMap;

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Per-item identifier: integer or string.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(untagged)]
pub enum ItemId {
    Number(i64),
    String(String),
}

impl From<i64> for ItemId {
    fn from(n: i64) -> Self {
        Self::Number(n)
    }
}

impl From<i32> for ItemId {
    fn from(n: i32) -> Self {
        Self::Number(n.into())
    }
}

impl From<&str> for ItemId {
    fn from(s: &str) -> Self {
        Self::String(s.to_string())
    }
}

impl From<String> for ItemId {
    fn from(s: String) -> Self {
        Self::String(s)
    }
}

impl std::fmt::Display for ItemId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            Self::Number(n) => write!(f, "{n}"),
            Self::String(s) => write!(f, "{s}"),
        }
    }
}

/// Identity of "requests that can be merged".
///
/// Two calls are coalesced into one backend call if and only if their keys
/// are equal. The parameter fingerprint is the canonical JSON rendering of
/// the batch-compatible parameters; the per-item id is never part of it.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct BatchKey {
    resource: String,
    method: String,
    fingerprint: String,
}

impl BatchKey {
    /// Key for `method` on `resource` with no extra parameters.
    pub fn new(resource: impl Into<String>, method: impl Into<String>) -> Self {
        Self::with_params(resource, method, &Value::Null)
    }

    /// Key for `method` on `resource` carrying batch-compatible `params`.
    pub fn with_params(
        resource: impl Into<String>,
        method: impl Into<String>,
        params: &Value,
    ) -> Self {
        Self {
            resource: resource.into(),
            method: method.into(),
            fingerprint: fingerprint(params),
        }
    }

    pub fn resource(&self) -> &str {
        &self.resource
    }

    pub fn method(&self) -> &str {
        &self.method
    }

    pub fn fingerprint(&self) -> &str {
        &self.fingerprint
    }
}

impl std::fmt::Display for BatchKey {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        if self.fingerprint.is_empty() {
            write!(f, "{}.{}", self.resource, self.method)
        } else {
            write!(f, "{}.{}{}", self.resource, self.method, self.fingerprint)
        }
    }
}

/// Canonical rendering of request parameters. `serde_json` keeps object
/// keys sorted, so equal parameter sets render identically.
fn fingerprint(params: &Value) -> String {
    match params {
        Value::Null => String::new(),
        Value::Object(map) if map.is_empty() => String::new(),
        other => other.to_string(),
    }
}

/// A single-item call issued by application code.
#[derive(Debug, Clone)]
pub struct SingleRequest {
    pub key: BatchKey,
    pub id: ItemId,
    pub params: Value,
}

impl SingleRequest {
    /// Create a request for `id` via `method` on `resource`.
    pub fn new(
        resource: impl Into<String>,
        method: impl Into<String>,
        id: impl Into<ItemId>,
    ) -> Self {
        Self::with_params(resource, method, id, Value::Null)
    }

    /// Create a request that carries batch-compatible parameters.
    pub fn with_params(
        resource: impl Into<String>,
        method: impl Into<String>,
        id: impl Into<ItemId>,
        params: Value,
    ) -> Self {
        Self {
            key: BatchKey::with_params(resource, method, &params),
            id: id.into(),
            params,
        }
    }
}

/// One backend call covering every item of a pending group.
#[derive(Debug, Clone)]
pub struct BatchRequest {
    pub key: BatchKey,
    /// Backend method executed for the batch (e.g. `batch_get`).
    pub batch_method: String,
    /// Item ids in enqueue order. Duplicates are kept.
    pub ids: Vec<ItemId>,
    pub params: Value,
}

impl BatchRequest {
    /// Number of distinct ids in the request.
    pub fn distinct_ids(&self) -> usize {
        let mut ids: Vec<&ItemId> = self.ids.iter().collect();
        ids.sort();
        ids.dedup();
        ids.len()
    }
}

/// Backend-reported failure for one item inside a successful batch.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ItemError {
    pub status: u16,
    #[serde(default)]
    pub message: String,
}

impl ItemError {
    pub fn is_not_found(&self) -> bool {
        self.status == 404
    }
}

/// Result of a batched backend call, addressed by item id.
#[derive(Debug, Clone, Default)]
pub struct BatchResponse {
    pub results: HashMap<ItemId, Value>,
    pub errors: HashMap<ItemId, ItemError>,
}

impl BatchResponse {
    /// Add a successful entry.
    pub fn with_result(mut self, id: impl Into<ItemId>, value: Value) -> Self {
        self.results.insert(id.into(), value);
        self
    }

    /// Add a per-item failure.
    pub fn with_error(mut self, id: impl Into<ItemId>, error: ItemError) -> Self {
        self.errors.insert(id.into(), error);
        self
    }
}
