//! FHIR data provider for CQL evaluation

use crate::engine::EvaluationContext;
use crate::error::{CqlError, CqlResult};
use crate::terminology_provider::Code;
use octofhir_core::ResourceType;
use octofhir_storage::{DaoRegistry, SearchParams};
use serde_json::Value;

/// Serves CQL `retrieve` requests from the server's DAOs.
#[derive(Debug, Clone)]
pub struct FhirDataProvider {
    registry: DaoRegistry,
    max_retrieve_size: usize,
}

impl FhirDataProvider {
    pub fn new(registry: DaoRegistry, max_retrieve_size: usize) -> Self {
        Self {
            registry,
            max_retrieve_size,
        }
    }

    pub fn max_retrieve_size(&self) -> usize {
        self.max_retrieve_size
    }

    /// Retrieves resources of `data_type`, restricted to the context subject
    /// when a patient context is given.
    pub async fn retrieve(
        &self,
        data_type: ResourceType,
        context: Option<&EvaluationContext>,
    ) -> CqlResult<Vec<Value>> {
        tracing::debug!(data_type = %data_type, "CQL retrieve starting");

        let dao = self.registry.resource_dao(data_type).map_err(|e| {
            CqlError::DataProviderError(format!("Cannot retrieve {data_type}: {e}"))
        })?;

        let mut params = SearchParams::new().with_count(self.max_retrieve_size);
        if let Some(ctx) = context {
            match Self::context_param(data_type, ctx) {
                Some((name, value)) => params = params.with_param(name, value),
                // Types unrelated to the context subject contribute nothing
                None => return Ok(Vec::new()),
            }
        }

        let result = dao
            .search(&params)
            .await
            .map_err(|e| CqlError::DataProviderError(format!("Search failed: {e}")))?;
        if result.total > self.max_retrieve_size {
            tracing::warn!(
                data_type = %data_type,
                total = result.total,
                limit = self.max_retrieve_size,
                "CQL retrieve truncated"
            );
        }
        Ok(result.into_resources())
    }

    /// Retrieves resources whose `code_path` element carries any of `codes`.
    pub async fn retrieve_coded(
        &self,
        data_type: ResourceType,
        context: Option<&EvaluationContext>,
        code_path: &str,
        codes: &[Code],
    ) -> CqlResult<Vec<Value>> {
        let resources = self.retrieve(data_type, context).await?;
        Ok(resources
            .into_iter()
            .filter(|r| {
                codings_of(r.get(code_path))
                    .any(|coding| codes.iter().any(|c| c.same_concept(&coding)))
            })
            .collect())
    }

    fn context_param(
        data_type: ResourceType,
        ctx: &EvaluationContext,
    ) -> Option<(&'static str, String)> {
        if data_type == ctx.context_type {
            return Some(("_id", ctx.id.clone()));
        }
        if ctx.context_type != ResourceType::Patient {
            return None;
        }
        let reference = format!("Patient/{}", ctx.id);
        let name = match data_type {
            ResourceType::Coverage => "beneficiary",
            ResourceType::Claim | ResourceType::ClaimResponse => "patient",
            ResourceType::Observation
            | ResourceType::Condition
            | ResourceType::Procedure
            | ResourceType::MedicationRequest
            | ResourceType::DiagnosticReport
            | ResourceType::Encounter
            | ResourceType::ServiceRequest
            | ResourceType::CarePlan
            | ResourceType::Task
            | ResourceType::Communication
            | ResourceType::CommunicationRequest
            | ResourceType::RequestGroup
            | ResourceType::MeasureReport => "subject",
            _ => return None,
        };
        Some((name, reference))
    }
}

/// Codings of a `CodeableConcept` (or a bare `Coding`).
fn codings_of(element: Option<&Value>) -> impl Iterator<Item = Code> + '_ {
    let codings: Vec<&Value> = match element {
        Some(v) => match v.get("coding").and_then(Value::as_array) {
            Some(list) => list.iter().collect(),
            None => vec![v],
        },
        None => Vec::new(),
    };
    codings.into_iter().filter_map(Code::from_coding)
}
