//! Seam between the server and a CQL engine implementation.
//!
//! The server never interprets CQL itself. Everything it needs from an
//! engine is captured by [`CqlEngine::evaluate`]: a library (plus the
//! libraries it includes), the expressions to evaluate, an optional subject
//! context and parameter values. Data access and terminology are supplied by
//! the server through [`FhirDataProvider`] and [`TerminologyProvider`].

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use octofhir_core::ResourceType;
use serde_json::Value;

use crate::data_provider::FhirDataProvider;
use crate::error::{CqlError, CqlResult};
use crate::library::LibrarySource;
use crate::terminology_provider::TerminologyProvider;

/// Subject context of an evaluation (`context Patient` bound to one patient).
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct EvaluationContext {
    pub context_type: ResourceType,
    pub id: String,
}

impl EvaluationContext {
    pub fn patient(id: impl Into<String>) -> Self {
        Self {
            context_type: ResourceType::Patient,
            id: id.into(),
        }
    }
}

/// Everything an engine needs to evaluate one library.
#[derive(Debug, Clone)]
pub struct EvaluationRequest {
    pub library: LibrarySource,
    /// Libraries referenced by `include` statements, already resolved.
    pub dependencies: Vec<LibrarySource>,
    /// Expression names to evaluate; empty means every `define`.
    pub expressions: Vec<String>,
    pub context: Option<EvaluationContext>,
    pub parameters: IndexMap<String, Value>,
}

impl EvaluationRequest {
    pub fn new(library: LibrarySource) -> Self {
        Self {
            library,
            dependencies: Vec::new(),
            expressions: Vec::new(),
            context: None,
            parameters: IndexMap::new(),
        }
    }

    pub fn with_dependencies(mut self, dependencies: Vec<LibrarySource>) -> Self {
        self.dependencies = dependencies;
        self
    }

    pub fn with_expressions(mut self, expressions: impl IntoIterator<Item = String>) -> Self {
        self.expressions = expressions.into_iter().collect();
        self
    }

    pub fn with_context(mut self, context: Option<EvaluationContext>) -> Self {
        self.context = context;
        self
    }

    pub fn with_parameter(mut self, name: impl Into<String>, value: Value) -> Self {
        self.parameters.insert(name.into(), value);
        self
    }
}

/// Expression results keyed by expression name, in library order.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EvaluationResult {
    pub expressions: IndexMap<String, Value>,
}

impl EvaluationResult {
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.expressions.get(name)
    }

    /// CQL truthiness as used for population membership and applicability:
    /// `true`, a non-empty list, or a single non-null value.
    pub fn is_true(&self, name: &str) -> bool {
        match self.expressions.get(name) {
            Some(Value::Bool(b)) => *b,
            Some(Value::Array(items)) => !items.is_empty(),
            Some(Value::Object(_)) => true,
            _ => false,
        }
    }
}

/// A CQL engine implementation.
#[async_trait]
pub trait CqlEngine: Send + Sync {
    /// Short name used in logs.
    fn name(&self) -> &str;

    async fn evaluate(
        &self,
        request: &EvaluationRequest,
        data: &FhirDataProvider,
        terminology: &dyn TerminologyProvider,
    ) -> CqlResult<EvaluationResult>;
}

pub type DynCqlEngine = Arc<dyn CqlEngine>;

/// Engine used when the application context supplies none.
///
/// Every evaluation fails with [`CqlError::EngineUnavailable`], so operations
/// that need CQL report a clear error while the rest of the server works.
#[derive(Debug, Default, Clone, Copy)]
pub struct UnavailableEngine;

#[async_trait]
impl CqlEngine for UnavailableEngine {
    fn name(&self) -> &str {
        "unavailable"
    }

    async fn evaluate(
        &self,
        request: &EvaluationRequest,
        _data: &FhirDataProvider,
        _terminology: &dyn TerminologyProvider,
    ) -> CqlResult<EvaluationResult> {
        Err(CqlError::EngineUnavailable(format!(
            "no CQL engine installed to evaluate library {}",
            request.library.identifier()
        )))
    }
}
