//! Patient resource provider with `Patient/$member-match`.
//!
//! `$member-match` finds the member a payer knows for a patient described by
//! another payer: coverages matching the supplied coverage (by identifier or
//! subscriber id) are collected, their beneficiaries are read, and the
//! beneficiaries whose demographics agree with `MemberPatient` are kept.
//! Exactly one surviving patient is a match.

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use octofhir_core::{ResourceType, parse_reference};
use octofhir_storage::{DynResourceDao, DynSystemDao, SearchParams};
use serde_json::{Value, json};

use super::ResourceProvider;
use crate::operations::{
    OperationDefinition, OperationError, OperationProvider, OperationTarget, Parameters,
};

pub const MEMBER_MATCH: &str = "member-match";

const IDENTIFIER_TYPE_SYSTEM: &str = "http://terminology.hl7.org/CodeSystem/v2-0203";

pub struct PatientProvider {
    system: DynSystemDao,
    coverages: DynResourceDao,
    resources: Option<Arc<ResourceProvider>>,
}

impl PatientProvider {
    pub fn new(system: DynSystemDao, coverages: DynResourceDao) -> Self {
        Self {
            system,
            coverages,
            resources: None,
        }
    }

    /// Attaches the Patient DAO used for CRUD.
    pub fn with_dao(mut self, patients: DynResourceDao) -> Self {
        self.resources = Some(Arc::new(ResourceProvider::new(patients)));
        self
    }

    /// Coverages matching any identifier or the subscriber id of `coverage`.
    async fn matching_coverages(&self, coverage: &Value) -> Result<Vec<Value>, OperationError> {
        let mut queries = Vec::new();
        for identifier in coverage
            .get("identifier")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
        {
            let Some(value) = identifier.get("value").and_then(Value::as_str) else {
                continue;
            };
            let token = match identifier.get("system").and_then(Value::as_str) {
                Some(system) => format!("{system}|{value}"),
                None => value.to_string(),
            };
            queries.push(SearchParams::new().with_param("identifier", token));
        }
        if let Some(subscriber) = coverage.get("subscriberId").and_then(Value::as_str) {
            queries.push(SearchParams::new().with_param("subscriberId", subscriber));
        }
        if queries.is_empty() {
            return Err(OperationError::InvalidParameters(
                "coverage to match has neither identifier nor subscriberId".into(),
            ));
        }

        let mut found = BTreeMap::new();
        for query in &queries {
            for stored in self.coverages.search(query).await?.entries {
                found.entry(stored.id).or_insert(stored.resource);
            }
        }
        Ok(found.into_values().collect())
    }

    pub async fn member_match(&self, params: &Parameters) -> Result<Value, OperationError> {
        let member = params.required_resource("MemberPatient")?;
        let coverage = params
            .resource("CoverageToMatch")
            .or_else(|| params.resource("OldCoverage"))
            .ok_or_else(|| {
                OperationError::InvalidParameters(
                    "parameter 'OldCoverage' or 'CoverageToMatch' is required".into(),
                )
            })?;

        let mut candidates = BTreeMap::new();
        for coverage in self.matching_coverages(coverage).await? {
            let Some(reference) = coverage
                .pointer("/beneficiary/reference")
                .and_then(Value::as_str)
                .and_then(|r| parse_reference(r).ok())
                .filter(|r| r.resource_type == ResourceType::Patient)
            else {
                continue;
            };
            if let Some(patient) = self.system.read(&reference).await? {
                if demographics_match(member, &patient.resource) {
                    candidates.insert(patient.id, patient.resource);
                }
            }
        }

        tracing::debug!(candidates = candidates.len(), "Member match candidates");
        if candidates.len() != 1 {
            return Err(OperationError::Unprocessable(format!(
                "no unique member match ({} candidates)",
                candidates.len()
            )));
        }
        let Some((id, patient)) = candidates.into_iter().next() else {
            return Err(OperationError::Unprocessable("no unique member match".into()));
        };
        Ok(Parameters::new()
            .with_resource("MemberPatient", patient.clone())
            .with_value("MemberIdentifier", "valueIdentifier", member_identifier(&id, &patient))
            .into_value())
    }
}

/// A shared identifier, or the same family name and birth date.
fn demographics_match(member: &Value, patient: &Value) -> bool {
    let identifiers = |resource: &Value| -> Vec<(Option<String>, String)> {
        resource
            .get("identifier")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|i| {
                let value = i.get("value").and_then(Value::as_str)?.to_string();
                let system = i.get("system").and_then(Value::as_str).map(String::from);
                Some((system, value))
            })
            .collect()
    };
    let theirs = identifiers(patient);
    if identifiers(member).iter().any(|i| theirs.contains(i)) {
        return true;
    }

    let families = |resource: &Value| -> Vec<String> {
        resource
            .get("name")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(|n| n.get("family").and_then(Value::as_str))
            .map(str::to_lowercase)
            .collect()
    };
    let birth_date = |resource: &Value| resource.get("birthDate").and_then(Value::as_str).map(String::from);
    let patient_families = families(patient);
    birth_date(member).is_some()
        && birth_date(member) == birth_date(patient)
        && families(member).iter().any(|f| patient_families.contains(f))
}

/// The patient's `MB` identifier, or one minted from its id.
fn member_identifier(id: &str, patient: &Value) -> Value {
    let is_member_id = |identifier: &&Value| {
        identifier
            .pointer("/type/coding")
            .and_then(Value::as_array)
            .is_some_and(|codings| {
                codings
                    .iter()
                    .any(|c| c.get("code").and_then(Value::as_str) == Some("MB"))
            })
    };
    patient
        .get("identifier")
        .and_then(Value::as_array)
        .and_then(|ids| ids.iter().find(is_member_id))
        .cloned()
        .unwrap_or_else(|| {
            json!({
                "type": {"coding": [{"system": IDENTIFIER_TYPE_SYSTEM, "code": "MB"}]},
                "value": id
            })
        })
}

#[async_trait]
impl OperationProvider for PatientProvider {
    fn name(&self) -> &'static str {
        "patient"
    }

    fn resource_type(&self) -> Option<ResourceType> {
        Some(ResourceType::Patient)
    }

    fn operations(&self) -> Vec<OperationDefinition> {
        vec![OperationDefinition::on(ResourceType::Patient, MEMBER_MATCH).at_type()]
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
        match target {
            OperationTarget::Type(ResourceType::Patient) => self.member_match(params).await,
            _ => Err(OperationError::unsupported(code, target)),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use octofhir_storage::DaoRegistry;

    async fn setup() -> PatientProvider {
        let registry = DaoRegistry::in_memory([ResourceType::Patient, ResourceType::Coverage]);
        let patients = registry.resource_dao(ResourceType::Patient).unwrap();
        let coverages = registry.resource_dao(ResourceType::Coverage).unwrap();
        for (id, family, birth) in [("p1", "Smith", "1970-01-01"), ("p2", "Jones", "1980-02-02")] {
            patients
                .create(json!({
                    "resourceType": "Patient",
                    "id": id,
                    "name": [{"family": family}],
                    "birthDate": birth
                }))
                .await
                .unwrap();
        }
        coverages
            .create(json!({
                "resourceType": "Coverage",
                "id": "c1",
                "subscriberId": "SUB-1",
                "identifier": [{"system": "http://payer.example", "value": "C-1"}],
                "beneficiary": {"reference": "Patient/p1"}
            }))
            .await
            .unwrap();
        PatientProvider::new(registry.system_dao(), coverages).with_dao(patients)
    }

    fn request(family: &str, coverage: Value) -> Parameters {
        Parameters::new()
            .with_resource(
                "MemberPatient",
                json!({"resourceType": "Patient", "name": [{"family": family}], "birthDate": "1970-01-01"}),
            )
            .with_resource("OldCoverage", coverage)
    }

    #[tokio::test]
    async fn test_member_match_by_identifier() {
        let provider = setup().await;
        let coverage = json!({
            "resourceType": "Coverage",
            "identifier": [{"system": "http://payer.example", "value": "C-1"}]
        });
        let result = provider.member_match(&request("smith", coverage)).await.unwrap();
        let params = Parameters::from_value(result);
        assert_eq!(params.resource("MemberPatient").unwrap()["id"], "p1");
        assert_eq!(params.get("MemberIdentifier").unwrap()["value"], "p1");
    }

    #[tokio::test]
    async fn test_member_match_demographics_mismatch() {
        let provider = setup().await;
        let coverage = json!({"resourceType": "Coverage", "subscriberId": "SUB-1"});
        let err = provider.member_match(&request("Jones", coverage)).await.unwrap_err();
        assert!(matches!(err, OperationError::Unprocessable(_)));
    }

    #[tokio::test]
    async fn test_member_match_requires_coverage() {
        let provider = setup().await;
        let params = Parameters::new().with_resource("MemberPatient", json!({"resourceType": "Patient"}));
        let err = provider.member_match(&params).await.unwrap_err();
        assert!(matches!(err, OperationError::InvalidParameters(_)));
    }

    #[test]
    fn test_member_identifier_prefers_mb() {
        let patient = json!({"identifier": [
            {"system": "urn:mrn", "value": "M"},
            {"type": {"coding": [{"code": "MB"}]}, "value": "MEMBER-7"}
        ]});
        assert_eq!(member_identifier("p", &patient)["value"], "MEMBER-7");
        assert_eq!(member_identifier("p", &json!({}))["type"]["coding"][0]["code"], "MB");
    }
}
