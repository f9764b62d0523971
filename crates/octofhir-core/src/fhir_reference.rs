//! FHIR Reference and canonical parsing utilities.
//!
//! # Reference Formats
//!
//! - Relative: `Patient/123`
//! - Versioned: `Patient/123/_history/1`
//! - Absolute URL: `http://example.org/fhir/Patient/123`
//!
//! Contained (`#id`) and URN references cannot be resolved against storage and
//! are reported as errors.
//!
//! # Example
//!
//! ```
//! use octofhir_core::{ResourceType, parse_reference};
//!
//! let reference = parse_reference("Patient/123/_history/2").unwrap();
//! assert_eq!(reference.resource_type, ResourceType::Patient);
//! assert_eq!(reference.id, "123");
//! assert_eq!(reference.version.as_deref(), Some("2"));
//! ```

use std::fmt;

use crate::error::CoreError;
use crate::fhir::ResourceType;

/// A successfully parsed FHIR reference.
#[derive(Debug, Clone, PartialEq, Eq, Hash)]
pub struct FhirReference {
    pub resource_type: ResourceType,
    pub id: String,
    /// Optional version ID from `_history` suffix
    pub version: Option<String>,
}

impl FhirReference {
    pub fn new(resource_type: ResourceType, id: impl Into<String>) -> Self {
        Self {
            resource_type,
            id: id.into(),
            version: None,
        }
    }

    /// Returns the reference as a relative string (Type/id).
    pub fn to_relative(&self) -> String {
        format!("{}/{}", self.resource_type, self.id)
    }
}

impl fmt::Display for FhirReference {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.to_relative())
    }
}

/// Parses a literal reference string into its typed parts.
pub fn parse_reference(reference: &str) -> Result<FhirReference, CoreError> {
    let reference = reference.trim();
    if reference.is_empty() || reference.starts_with('#') || reference.starts_with("urn:") {
        return Err(CoreError::invalid_reference(reference));
    }

    let segments: Vec<&str> = reference
        .trim_end_matches('/')
        .split('/')
        .filter(|s| !s.is_empty())
        .collect();

    // Look for `Type/id[/_history/vid]` at the tail of the path
    let (type_idx, version) = match segments.as_slice() {
        [.., _, _, "_history", vid] => (segments.len() - 4, Some((*vid).to_string())),
        [.., _, _] => (segments.len() - 2, None),
        _ => return Err(CoreError::invalid_reference(reference)),
    };

    let resource_type = segments[type_idx]
        .parse::<ResourceType>()
        .map_err(|_| CoreError::invalid_reference(reference))?;
    let id = segments[type_idx + 1];
    crate::id::validate_id(id).map_err(|_| CoreError::invalid_reference(reference))?;

    Ok(FhirReference {
        resource_type,
        id: id.to_string(),
        version,
    })
}

/// Splits a canonical URL into `(url, version)` on the `|` separator.
pub fn split_canonical(canonical: &str) -> (&str, Option<&str>) {
    match canonical.split_once('|') {
        Some((url, version)) if !version.is_empty() => (url, Some(version)),
        Some((url, _)) => (url, None),
        None => (canonical, None),
    }
}

/// Last path segment of a canonical URL (`http://x/Library/FHIRHelpers` → `FHIRHelpers`).
pub fn canonical_tail(canonical: &str) -> &str {
    let (url, _) = split_canonical(canonical);
    url.rsplit('/').next().unwrap_or(url)
}
