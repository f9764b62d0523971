//! Evaluation provider factory
//!
//! Shared by every provider that evaluates CQL. It owns the engine handle,
//! hands out data providers for the supported model, and applies the
//! configured evaluation timeout.

use std::sync::Arc;
use std::time::Duration;

use octofhir_core::FhirVersion;
use octofhir_storage::DaoRegistry;

use crate::config::CqlConfig;
use crate::data_provider::FhirDataProvider;
use crate::engine::{DynCqlEngine, EvaluationRequest, EvaluationResult};
use crate::error::{CqlError, CqlResult};
use crate::library::LibraryHeader;
use crate::terminology_provider::TerminologyProvider;

const FHIR_MODEL: &str = "FHIR";

#[derive(Clone)]
pub struct EvaluationProviderFactory {
    fhir_version: FhirVersion,
    registry: DaoRegistry,
    terminology: Arc<dyn TerminologyProvider>,
    engine: DynCqlEngine,
    config: CqlConfig,
}

impl EvaluationProviderFactory {
    pub fn new(
        fhir_version: FhirVersion,
        registry: DaoRegistry,
        terminology: Arc<dyn TerminologyProvider>,
        engine: DynCqlEngine,
        config: CqlConfig,
    ) -> Self {
        Self {
            fhir_version,
            registry,
            terminology,
            engine,
            config,
        }
    }

    /// Data provider for `model` at `version`. Only the server's own FHIR
    /// version is supported; a missing version means "the server's".
    pub fn data_provider(&self, model: &str, version: Option<&str>) -> CqlResult<FhirDataProvider> {
        if model != FHIR_MODEL {
            return Err(CqlError::UnsupportedModel(format!(
                "model {model} (only {FHIR_MODEL} is supported)"
            )));
        }
        if let Some(v) = version {
            let requested: FhirVersion = v
                .parse()
                .map_err(|_| CqlError::UnsupportedModel(format!("{FHIR_MODEL} version {v}")))?;
            if requested != self.fhir_version {
                return Err(CqlError::UnsupportedModel(format!(
                    "{FHIR_MODEL} version {v} (server runs {})",
                    self.fhir_version
                )));
            }
        }
        Ok(FhirDataProvider::new(
            self.registry.clone(),
            self.config.max_retrieve_size,
        ))
    }

    /// Evaluates a request with the engine, bounded by the configured timeout.
    pub async fn evaluate(&self, request: &EvaluationRequest) -> CqlResult<EvaluationResult> {
        let header = LibraryHeader::parse(&request.library.cql);
        let (model, version) = header
            .using
            .first()
            .map(|(m, v)| (m.as_str(), v.as_deref()))
            .unwrap_or((FHIR_MODEL, None));
        let data = self.data_provider(model, version)?;

        tracing::info!(
            library = %request.library.identifier(),
            engine = self.engine.name(),
            expressions = request.expressions.len(),
            "Evaluating CQL library"
        );

        let timeout_ms = self.config.evaluation_timeout_ms;
        tokio::time::timeout(
            Duration::from_millis(timeout_ms),
            self.engine.evaluate(request, &data, self.terminology.as_ref()),
        )
        .await
        .map_err(|_| CqlError::Timeout(format!("CQL evaluation timed out after {timeout_ms}ms")))?
    }

    pub fn fhir_version(&self) -> FhirVersion {
        self.fhir_version
    }

    pub fn registry(&self) -> &DaoRegistry {
        &self.registry
    }

    pub fn terminology(&self) -> Arc<dyn TerminologyProvider> {
        self.terminology.clone()
    }

    pub fn engine_name(&self) -> &str {
        self.engine.name()
    }

    pub fn config(&self) -> &CqlConfig {
        &self.config
    }
}

impl std::fmt::Debug for EvaluationProviderFactory {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("EvaluationProviderFactory")
            .field("fhir_version", &self.fhir_version)
            .field("engine", &self.engine.name())
            .field("config", &self.config)
            .finish()
    }
}
