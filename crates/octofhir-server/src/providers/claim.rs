//! Claim resource provider with `Claim/$submit`.
//!
//! The input is a Bundle whose first entry is the Claim; the remaining
//! entries are the resources the Claim refers to. Everything is stored in
//! one batch and a ClaimResponse for the Claim is created and returned.

use std::sync::Arc;

use async_trait::async_trait;
use octofhir_core::{ResourceType, now_utc};
use octofhir_storage::{DynResourceDao, DynSystemDao};
use serde_json::{Value, json};

use super::ResourceProvider;
use crate::operations::{
    OperationDefinition, OperationError, OperationProvider, OperationTarget, Parameters,
};

pub const SUBMIT: &str = "submit";

pub struct ClaimProvider {
    system: DynSystemDao,
    resources: Option<Arc<ResourceProvider>>,
}

impl ClaimProvider {
    pub fn new(system: DynSystemDao) -> Self {
        Self {
            system,
            resources: None,
        }
    }

    /// Attaches the Claim DAO used for CRUD.
    pub fn with_dao(mut self, claims: DynResourceDao) -> Self {
        self.resources = Some(Arc::new(ResourceProvider::new(claims)));
        self
    }

    pub async fn submit(&self, bundle: &Value) -> Result<Value, OperationError> {
        if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
            return Err(OperationError::InvalidParameters("$submit requires a Bundle".into()));
        }
        let resources: Vec<Value> = bundle
            .get("entry")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|e| e.get("resource").cloned())
            .collect();
        if resources.first().and_then(|r| r.get("resourceType")).and_then(Value::as_str)
            != Some("Claim")
        {
            return Err(OperationError::InvalidParameters(
                "the first Bundle entry must be a Claim".into(),
            ));
        }

        let stored = self.system.upsert_all(resources).await?;
        let Some(claim) = stored.first() else {
            return Err(OperationError::Internal("submitted Claim was not stored".into()));
        };
        let response = claim_response(&claim.resource, &claim.id);
        let mut responses = self.system.upsert_all(vec![response]).await?;
        let response = responses
            .pop()
            .ok_or_else(|| OperationError::Internal("ClaimResponse was not stored".into()))?;

        tracing::info!(
            claim = %claim.id,
            response = %response.id,
            resources = stored.len(),
            "Claim submitted"
        );
        Ok(response.resource)
    }
}

fn claim_response(claim: &Value, claim_id: &str) -> Value {
    let mut response = json!({
        "resourceType": "ClaimResponse",
        "status": "active",
        "use": claim.get("use").cloned().unwrap_or_else(|| json!("claim")),
        "created": now_utc().to_string(),
        "outcome": "queued",
        "request": {"reference": format!("Claim/{claim_id}")},
    });
    for key in ["type", "patient", "insurer", "provider"] {
        if let Some(value) = claim.get(key) {
            response[key] = value.clone();
        }
    }
    response
}

#[async_trait]
impl OperationProvider for ClaimProvider {
    fn name(&self) -> &'static str {
        "claim"
    }

    fn resource_type(&self) -> Option<ResourceType> {
        Some(ResourceType::Claim)
    }

    fn operations(&self) -> Vec<OperationDefinition> {
        vec![
            OperationDefinition::on(ResourceType::Claim, SUBMIT)
                .at_type()
                .affecting_state(),
        ]
    }

    fn resource_provider(&self) -> Option<Arc<ResourceProvider>> {
        self.resources.clone()
    }

    async fn invoke(
        &self,
        code: &str,
        target: &OperationTarget,
        params: &Parameters,
    ) -> Result<Value, OperationError> {
        let OperationTarget::Type(ResourceType::Claim) = target else {
            return Err(OperationError::unsupported(code, target));
        };
        let bundle = params
            .resource("resource")
            .or_else(|| params.resource("bundle"))
            .ok_or_else(|| OperationError::InvalidParameters("a Bundle must be supplied".into()))?;
        self.submit(bundle).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octofhir_core::FhirReference;
    use octofhir_storage::DaoRegistry;

    fn registry() -> DaoRegistry {
        DaoRegistry::in_memory([
            ResourceType::Claim,
            ResourceType::ClaimResponse,
            ResourceType::Patient,
        ])
    }

    #[tokio::test]
    async fn test_submit_stores_bundle_and_responds() {
        let registry = registry();
        let provider = ClaimProvider::new(registry.system_dao());
        let bundle = json!({
            "resourceType": "Bundle",
            "type": "collection",
            "entry": [
                {"resource": {
                    "resourceType": "Claim",
                    "id": "cl1",
                    "use": "preauthorization",
                    "patient": {"reference": "Patient/pt1"}
                }},
                {"resource": {"resourceType": "Patient", "id": "pt1"}}
            ]
        });

        let response = provider.submit(&bundle).await.unwrap();
        assert_eq!(response["resourceType"], "ClaimResponse");
        assert_eq!(response["request"]["reference"], "Claim/cl1");
        assert_eq!(response["use"], "preauthorization");
        assert_eq!(response["patient"]["reference"], "Patient/pt1");

        let system = registry.system_dao();
        let patient = system
            .read(&FhirReference::new(ResourceType::Patient, "pt1"))
            .await
            .unwrap();
        assert!(patient.is_some());
    }

    #[tokio::test]
    async fn test_submit_requires_claim_first() {
        let provider = ClaimProvider::new(registry().system_dao());
        let bundle = json!({
            "resourceType": "Bundle",
            "entry": [{"resource": {"resourceType": "Patient", "id": "pt1"}}]
        });
        let err = provider.submit(&bundle).await.unwrap_err();
        assert!(matches!(err, OperationError::InvalidParameters(_)));
        assert!(provider.resource_provider().is_none());
    }
}
