//! Data types shared by the DAO traits.

use octofhir_core::{FhirDateTime, ResourceType};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use std::collections::BTreeMap;

/// A FHIR resource as stored in the storage backend.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct StoredResource {
    pub id: String,
    pub version_id: String,
    pub resource_type: ResourceType,
    /// The full resource content, with `id` and `meta` stamped by the backend.
    pub resource: Value,
    pub last_updated: FhirDateTime,
}

impl StoredResource {
    /// Relative reference (`Type/id`) to this resource.
    pub fn reference(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

/// Result of a search operation.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchResult {
    pub entries: Vec<StoredResource>,
    /// Total matches before `_count` was applied.
    pub total: usize,
}

impl SearchResult {
    #[must_use]
    pub fn with_entries(entries: Vec<StoredResource>, total: usize) -> Self {
        Self { entries, total }
    }

    #[must_use]
    pub fn len(&self) -> usize {
        self.entries.len()
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// Consumes the result, returning only the resource bodies.
    #[must_use]
    pub fn into_resources(self) -> Vec<Value> {
        self.entries.into_iter().map(|e| e.resource).collect()
    }
}

/// Parameters for a search query.
///
/// Multiple values for the same key represent OR conditions; distinct keys are
/// combined with AND.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct SearchParams {
    pub parameters: BTreeMap<String, Vec<String>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub count: Option<usize>,
}

impl SearchParams {
    #[must_use]
    pub fn new() -> Self {
        Self::default()
    }

    #[must_use]
    pub fn with_param(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.parameters
            .entry(key.into())
            .or_default()
            .push(value.into());
        self
    }

    #[must_use]
    pub fn with_count(mut self, count: usize) -> Self {
        self.count = Some(count);
        self
    }

    /// Builds search parameters from raw query pairs; `_count` is lifted out.
    pub fn from_query<'a>(pairs: impl IntoIterator<Item = (&'a str, &'a str)>) -> Self {
        let mut params = Self::new();
        for (key, value) in pairs {
            if key == "_count" {
                params.count = value.parse().ok();
            } else {
                for v in value.split(',').filter(|v| !v.is_empty()) {
                    params = params.with_param(key, v);
                }
            }
        }
        params
    }

    #[must_use]
    pub fn is_empty(&self) -> bool {
        self.parameters.is_empty()
    }
}
