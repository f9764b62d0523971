//! Terminology for CQL evaluation
//!
//! [`TerminologyReadService`] is the server-wide terminology bean: it expands
//! ValueSet documents and looks codes up in stored CodeSystems.
//! [`LocalTerminologyProvider`] is what the engine sees; it resolves value
//! set identifiers (canonical url or id) through the ValueSet DAO and then
//! delegates to the read service.

use std::collections::HashSet;
use std::sync::Arc;

use async_trait::async_trait;
use octofhir_core::{canonical_tail, split_canonical};
use octofhir_storage::{DynResourceDao, SearchParams};
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::error::{CqlError, CqlResult};

/// A coded value.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Code {
    pub system: String,
    pub code: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub display: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub version: Option<String>,
}

impl Code {
    pub fn new(system: impl Into<String>, code: impl Into<String>) -> Self {
        Self {
            system: system.into(),
            code: code.into(),
            display: None,
            version: None,
        }
    }

    pub fn with_display(mut self, display: impl Into<String>) -> Self {
        self.display = Some(display.into());
        self
    }

    /// Same system and code; display and version are ignored.
    pub fn same_concept(&self, other: &Code) -> bool {
        self.system == other.system && self.code == other.code
    }

    /// Builds a code from a FHIR `Coding` or expansion `contains` entry.
    pub fn from_coding(coding: &Value) -> Option<Self> {
        Some(Self {
            system: coding.get("system")?.as_str()?.to_string(),
            code: coding.get("code")?.as_str()?.to_string(),
            display: coding.get("display").and_then(Value::as_str).map(String::from),
            version: coding.get("version").and_then(Value::as_str).map(String::from),
        })
    }

    pub fn to_coding(&self) -> Value {
        let mut coding = serde_json::Map::new();
        coding.insert("system".into(), Value::String(self.system.clone()));
        coding.insert("code".into(), Value::String(self.code.clone()));
        if let Some(display) = &self.display {
            coding.insert("display".into(), Value::String(display.clone()));
        }
        if let Some(version) = &self.version {
            coding.insert("version".into(), Value::String(version.clone()));
        }
        Value::Object(coding)
    }
}

/// Server-wide terminology access.
#[async_trait]
pub trait TerminologyReadService: Send + Sync {
    /// Expands a ValueSet document into its member codes.
    async fn expand_value_set(&self, value_set: &Value) -> CqlResult<Vec<Code>>;

    /// Looks a code up in the stored CodeSystem with the given url.
    async fn lookup(&self, system: &str, code: &str) -> CqlResult<Option<Code>>;
}

pub type DynTerminologyReadService = Arc<dyn TerminologyReadService>;

/// Terminology read service over the stored CodeSystem resources.
#[derive(Clone)]
pub struct StoredTerminologyService {
    code_systems: DynResourceDao,
}

impl StoredTerminologyService {
    pub fn new(code_systems: DynResourceDao) -> Self {
        Self { code_systems }
    }

    async fn code_system(&self, url: &str) -> CqlResult<Option<Value>> {
        let found = self
            .code_systems
            .search(&SearchParams::new().with_param("url", url).with_count(1))
            .await?;
        Ok(found.entries.into_iter().next().map(|e| e.resource))
    }

    async fn codes_of_include(&self, include: &Value) -> CqlResult<Vec<Code>> {
        let Some(system) = include.get("system").and_then(Value::as_str) else {
            // Includes that only reference other value sets are not expanded
            return Ok(Vec::new());
        };
        let version = include.get("version").and_then(Value::as_str);

        if let Some(concepts) = include.get("concept").and_then(Value::as_array) {
            return Ok(concepts
                .iter()
                .filter_map(|c| {
                    let code = c.get("code")?.as_str()?;
                    let mut code = Code::new(system, code);
                    code.display = c.get("display").and_then(Value::as_str).map(String::from);
                    code.version = version.map(String::from);
                    Some(code)
                })
                .collect());
        }

        let Some(code_system) = self.code_system(system).await? else {
            return Err(CqlError::TerminologyError(format!(
                "CodeSystem {system} is not available to expand"
            )));
        };
        let filters = include
            .get("filter")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[]);
        let mut codes = Vec::new();
        if let Some(concepts) = code_system.get("concept").and_then(Value::as_array) {
            collect_concepts(system, concepts, filters, &mut Vec::new(), &mut codes)?;
        }
        Ok(codes)
    }
}

#[async_trait]
impl TerminologyReadService for StoredTerminologyService {
    async fn expand_value_set(&self, value_set: &Value) -> CqlResult<Vec<Code>> {
        if let Some(contains) = value_set
            .pointer("/expansion/contains")
            .and_then(Value::as_array)
        {
            return Ok(contains.iter().filter_map(Code::from_coding).collect());
        }

        let Some(compose) = value_set.get("compose") else {
            return Err(CqlError::TerminologyError(
                "ValueSet has neither an expansion nor a compose".into(),
            ));
        };

        let mut included = Vec::new();
        for include in compose
            .get("include")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            included.extend(self.codes_of_include(include).await?);
        }

        let mut excluded = HashSet::new();
        for exclude in compose
            .get("exclude")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            for code in self.codes_of_include(exclude).await? {
                excluded.insert((code.system, code.code));
            }
        }

        let mut seen = HashSet::new();
        included.retain(|c| {
            !excluded.contains(&(c.system.clone(), c.code.clone()))
                && seen.insert((c.system.clone(), c.code.clone()))
        });
        Ok(included)
    }

    async fn lookup(&self, system: &str, code: &str) -> CqlResult<Option<Code>> {
        let Some(code_system) = self.code_system(system).await? else {
            return Ok(None);
        };
        let mut codes = Vec::new();
        if let Some(concepts) = code_system.get("concept").and_then(Value::as_array) {
            collect_concepts(system, concepts, &[], &mut Vec::new(), &mut codes)?;
        }
        let mut found = codes.into_iter().find(|c| c.code == code);
        if let Some(found) = found.as_mut() {
            found.version = code_system
                .get("version")
                .and_then(Value::as_str)
                .map(String::from);
        }
        Ok(found)
    }
}

/// Walks a concept hierarchy, keeping the concepts that pass every
/// `compose.include.filter`. `ancestors` holds the codes above `concepts`.
fn collect_concepts(
    system: &str,
    concepts: &[Value],
    filters: &[Value],
    ancestors: &mut Vec<String>,
    out: &mut Vec<Code>,
) -> CqlResult<()> {
    for concept in concepts {
        let code = concept.get("code").and_then(Value::as_str);
        if let Some(code) = code {
            let mut keep = true;
            for filter in filters {
                if !filter_matches(filter, code, concept, ancestors)? {
                    keep = false;
                    break;
                }
            }
            if keep {
                let mut entry = Code::new(system, code);
                entry.display = concept.get("display").and_then(Value::as_str).map(String::from);
                out.push(entry);
            }
        }
        if let Some(children) = concept.get("concept").and_then(Value::as_array) {
            if let Some(code) = code {
                ancestors.push(code.to_string());
            }
            collect_concepts(system, children, filters, ancestors, out)?;
            if code.is_some() {
                ancestors.pop();
            }
        }
    }
    Ok(())
}

fn filter_matches(
    filter: &Value,
    code: &str,
    concept: &Value,
    ancestors: &[String],
) -> CqlResult<bool> {
    let (property, op, value) = (
        filter_text(filter, "property"),
        filter_text(filter, "op"),
        filter_text(filter, "value"),
    );
    let below = || ancestors.iter().any(|a| a == value);
    let on_code = matches!(property, "concept" | "code");
    Ok(match (op, on_code) {
        ("is-a", true) => code == value || below(),
        ("descendent-of", true) => below(),
        ("is-not-a", true) => code != value && !below(),
        ("=", true) => code == value,
        ("in", true) => value.split(',').map(str::trim).any(|v| v == code),
        ("=", false) => property_values(concept, property).any(|v| v == value),
        ("exists", false) => property_values(concept, property).next().is_some() == (value == "true"),
        _ => {
            return Err(CqlError::TerminologyError(format!(
                "unsupported ValueSet filter '{property} {op} {value}'"
            )));
        }
    })
}

fn filter_text<'a>(filter: &'a Value, key: &str) -> &'a str {
    filter.get(key).and_then(Value::as_str).unwrap_or_default()
}

/// Values of a CodeSystem concept property, rendered as strings.
fn property_values<'a>(concept: &'a Value, property: &'a str) -> impl Iterator<Item = String> + 'a {
    concept
        .get("property")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter(move |p| p.get("code").and_then(Value::as_str) == Some(property))
        .filter_map(|p| {
            let (_, value) = p.as_object()?.iter().find(|(k, _)| k.starts_with("value"))?;
            Some(match value {
                Value::String(s) => s.clone(),
                other => other.to_string(),
            })
        })
}

/// Terminology operations an engine performs during evaluation.
#[async_trait]
pub trait TerminologyProvider: Send + Sync {
    async fn in_value_set(&self, code: &Code, value_set: &str) -> CqlResult<bool>;

    async fn expand(&self, value_set: &str) -> CqlResult<Vec<Code>>;

    async fn lookup(&self, code: &Code) -> CqlResult<Option<Code>>;
}

/// Terminology provider backed by value sets stored on this server.
#[derive(Clone)]
pub struct LocalTerminologyProvider {
    read_service: DynTerminologyReadService,
    value_sets: DynResourceDao,
}

impl LocalTerminologyProvider {
    pub fn new(read_service: DynTerminologyReadService, value_sets: DynResourceDao) -> Self {
        Self {
            read_service,
            value_sets,
        }
    }

    /// Finds a ValueSet by canonical url (optionally `|version`), falling back
    /// to the id in the last path segment.
    async fn resolve(&self, value_set: &str) -> CqlResult<Value> {
        let (url, version) = split_canonical(value_set);
        let mut params = SearchParams::new().with_param("url", url).with_count(1);
        if let Some(v) = version {
            params = params.with_param("version", v);
        }
        if let Some(entry) = self.value_sets.search(&params).await?.entries.into_iter().next() {
            return Ok(entry.resource);
        }
        if let Some(stored) = self.value_sets.read(canonical_tail(value_set)).await? {
            return Ok(stored.resource);
        }
        Err(CqlError::TerminologyError(format!(
            "ValueSet {value_set} not found"
        )))
    }
}

#[async_trait]
impl TerminologyProvider for LocalTerminologyProvider {
    async fn in_value_set(&self, code: &Code, value_set: &str) -> CqlResult<bool> {
        let members = self.expand(value_set).await?;
        Ok(members.iter().any(|m| m.same_concept(code)))
    }

    async fn expand(&self, value_set: &str) -> CqlResult<Vec<Code>> {
        let resource = self.resolve(value_set).await?;
        self.read_service.expand_value_set(&resource).await
    }

    async fn lookup(&self, code: &Code) -> CqlResult<Option<Code>> {
        self.read_service.lookup(&code.system, &code.code).await
    }
}
