//! `ActivityDefinition/{id}/$apply`.
//!
//! Builds the request resource named by the definition's `kind` for a
//! patient, copies the definition's static elements onto it and then applies
//! each CQL `dynamicValue` in the context of that patient.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use octofhir_core::{ResourceType, generate_id};
use octofhir_cql_service::LibraryInclude;
use octofhir_storage::DynResourceDao;
use serde_json::{Map, Value, json};

use super::ResourceProvider;
use super::cql_execution::CqlExecutionProvider;
use super::library::LibraryResolver;
use crate::operations::{
    OperationDefinition, OperationError, OperationProvider, OperationTarget, Parameters,
};

pub const APPLY: &str = "apply";

const CQL_LANGUAGES: &[&str] = &["text/cql", "text/cql-expression", "text/cql.expression"];

/// Who and where a definition is applied for.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ApplyContext {
    pub patient: String,
    pub encounter: Option<String>,
    pub practitioner: Option<String>,
    pub organization: Option<String>,
}

impl ApplyContext {
    /// Reads `patient` (required), `encounter`, `practitioner` and
    /// `organization`. Ids may be given with or without their type prefix.
    pub fn from_params(params: &Parameters) -> Result<Self, OperationError> {
        let id = |name: &str, prefix: &str| {
            params
                .string(name)
                .map(|v| v.trim_start_matches(prefix).to_string())
        };
        Ok(Self {
            patient: params
                .required_string("patient")?
                .trim_start_matches("Patient/")
                .to_string(),
            encounter: id("encounter", "Encounter/"),
            practitioner: id("practitioner", "Practitioner/"),
            organization: id("organization", "Organization/"),
        })
    }

    pub fn patient_ref(&self) -> Value {
        json!({"reference": format!("Patient/{}", self.patient)})
    }

    pub fn encounter_ref(&self) -> Option<Value> {
        self.encounter
            .as_ref()
            .map(|e| json!({"reference": format!("Encounter/{e}")}))
    }

    /// Requester: the practitioner, else the organization.
    pub fn requester_ref(&self) -> Option<Value> {
        self.practitioner
            .as_ref()
            .map(|p| json!({"reference": format!("Practitioner/{p}")}))
            .or_else(|| {
                self.organization
                    .as_ref()
                    .map(|o| json!({"reference": format!("Organization/{o}")}))
            })
    }
}

/// `include`s for the libraries a definition lists in `library`.
pub(crate) async fn definition_includes(
    resolver: &LibraryResolver,
    definition: &Value,
) -> Result<Vec<LibraryInclude>, OperationError> {
    let mut includes = Vec::new();
    for canonical in definition
        .get("library")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .filter_map(Value::as_str)
    {
        let source = resolver.by_canonical(canonical).await?;
        includes.push(LibraryInclude {
            name: source.name.clone(),
            version: source.version.clone(),
            alias: Some(source.name.clone()),
        });
    }
    Ok(includes)
}

/// The CQL text of an `Expression`, if it is CQL.
pub(crate) fn cql_of(expression: &Value) -> Option<&str> {
    let language = expression.get("language").and_then(Value::as_str)?;
    if !CQL_LANGUAGES.contains(&language) {
        return None;
    }
    expression.get("expression").and_then(Value::as_str)
}

/// Sets a dotted element path, creating intermediate objects.
fn set_path(resource: &mut Value, path: &str, value: Value) {
    let mut segments: Vec<&str> = path.split('.').filter(|s| !s.is_empty()).collect();
    if segments.first() == resource.get("resourceType").and_then(Value::as_str).as_ref() {
        segments.remove(0);
    }
    let Some((last, parents)) = segments.split_last() else {
        return;
    };
    let mut node = resource;
    for segment in parents {
        if !node.get(*segment).is_some_and(Value::is_object) {
            node[*segment] = Value::Object(Map::new());
        }
        node = &mut node[*segment];
    }
    node[*last] = value;
}

pub struct ActivityDefinitionApplyProvider {
    cql: Arc<CqlExecutionProvider>,
    definitions: ResourceProvider,
}

impl ActivityDefinitionApplyProvider {
    pub fn new(cql: Arc<CqlExecutionProvider>, definitions: DynResourceDao) -> Self {
        Self {
            cql,
            definitions: ResourceProvider::new(definitions),
        }
    }

    pub fn definitions(&self) -> &ResourceProvider {
        &self.definitions
    }

    /// Builds the request resource for `definition` (not stored).
    pub async fn apply_definition(
        &self,
        definition: &Value,
        context: &ApplyContext,
    ) -> Result<Value, OperationError> {
        let mut resource = initial_resource(definition, context)?;

        let dynamic_values: Vec<&Value> = definition
            .get("dynamicValue")
            .and_then(Value::as_array)
            .map(|values| values.iter().collect())
            .unwrap_or_default();
        if dynamic_values.is_empty() {
            return Ok(resource);
        }
        let includes = definition_includes(self.cql.resolver(), definition).await?;
        for dynamic in dynamic_values {
            let (Some(path), Some(expression)) = (
                dynamic.get("path").and_then(Value::as_str),
                dynamic.get("expression"),
            ) else {
                continue;
            };
            let Some(cql) = cql_of(expression) else {
                tracing::warn!(path, "Skipping dynamicValue with a non-CQL expression");
                continue;
            };
            let value = self
                .cql
                .evaluate_in_context(cql, Some(&context.patient), &includes, IndexMap::new())
                .await?;
            if !value.is_null() {
                set_path(&mut resource, path, value);
            }
        }
        Ok(resource)
    }
}

/// The `kind` resource with the definition's static elements.
fn initial_resource(definition: &Value, context: &ApplyContext) -> Result<Value, OperationError> {
    let kind = definition
        .get("kind")
        .and_then(Value::as_str)
        .ok_or_else(|| OperationError::Unprocessable("ActivityDefinition has no kind".into()))?;
    let canonical = definition
        .get("url")
        .and_then(Value::as_str)
        .map(String::from)
        .or_else(|| {
            definition
                .get("id")
                .and_then(Value::as_str)
                .map(|id| format!("ActivityDefinition/{id}"))
        });
    let intent = definition
        .get("intent")
        .cloned()
        .unwrap_or_else(|| json!("proposal"));
    let code = definition.get("code").cloned();
    let product = definition
        .get("productCodeableConcept")
        .cloned()
        .or_else(|| code.clone());

    let mut resource = json!({"resourceType": kind, "id": generate_id()});
    let mut set = |key: &str, value: Option<Value>| {
        if let Some(v) = value {
            resource[key] = v;
        }
    };
    match kind {
        "ServiceRequest" => {
            set("status", Some(json!("draft")));
            set("intent", Some(intent));
            set("code", code);
            set("subject", Some(context.patient_ref()));
            set("encounter", context.encounter_ref());
            set("requester", context.requester_ref());
            set("priority", definition.get("priority").cloned());
            set("doNotPerform", definition.get("doNotPerform").cloned());
            set("instantiatesCanonical", canonical.map(|c| json!([c])));
        }
        "MedicationRequest" => {
            set("status", Some(json!("draft")));
            set("intent", Some(intent));
            set("medicationCodeableConcept", product);
            set("subject", Some(context.patient_ref()));
            set("encounter", context.encounter_ref());
            set("requester", context.requester_ref());
            set("dosageInstruction", definition.get("dosage").cloned());
            set("instantiatesCanonical", canonical.map(|c| json!([c])));
        }
        "Task" => {
            set("status", Some(json!("draft")));
            set("intent", Some(intent));
            set("code", code);
            set("for", Some(context.patient_ref()));
            set("encounter", context.encounter_ref());
            set("requester", context.requester_ref());
            set("description", definition.get("description").cloned());
            set("instantiatesCanonical", canonical.map(Value::String));
        }
        "CommunicationRequest" => {
            set("status", Some(json!("draft")));
            set("subject", Some(context.patient_ref()));
            set("encounter", context.encounter_ref());
            set("requester", context.requester_ref());
            set("category", code.map(|c| json!([c])));
            set(
                "payload",
                definition
                    .get("description")
                    .map(|d| json!([{"contentString": d}])),
            );
        }
        "SupplyRequest" => {
            set("status", Some(json!("draft")));
            set("itemCodeableConcept", product);
            set("quantity", definition.get("quantity").cloned());
            set("requester", context.requester_ref());
            set("deliverTo", Some(context.patient_ref()));
        }
        other => {
            return Err(OperationError::Unprocessable(format!(
                "ActivityDefinition kind '{other}' is not supported by $apply"
            )));
        }
    }
    Ok(resource)
}

#[async_trait]
impl OperationProvider for ActivityDefinitionApplyProvider {
    fn name(&self) -> &'static str {
        "activity-definition-apply"
    }

    fn resource_type(&self) -> Option<ResourceType> {
        Some(ResourceType::ActivityDefinition)
    }

    fn operations(&self) -> Vec<OperationDefinition> {
        vec![OperationDefinition::on(ResourceType::ActivityDefinition, APPLY).at_instance()]
    }

    async fn invoke(
        &self,
        code: &str,
        target: &OperationTarget,
        params: &Parameters,
    ) -> Result<Value, OperationError> {
        let OperationTarget::Instance(ResourceType::ActivityDefinition, id) = target else {
            return Err(OperationError::unsupported(code, target));
        };
        let context = ApplyContext::from_params(params)?;
        let definition = self.definitions.read(id).await?.resource;
        let resource = self.apply_definition(&definition, &context).await?;
        tracing::info!(
            definition = %id,
            patient = %context.patient,
            kind = resource["resourceType"].as_str().unwrap_or_default(),
            "Applied ActivityDefinition"
        );
        Ok(resource)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn context() -> ApplyContext {
        ApplyContext {
            patient: "p1".into(),
            encounter: Some("e1".into()),
            practitioner: None,
            organization: Some("o1".into()),
        }
    }

    #[test]
    fn test_context_from_params() {
        let params = Parameters::new()
            .with_string("patient", "Patient/p1")
            .with_string("encounter", "e1")
            .with_string("organization", "Organization/o1");
        assert_eq!(ApplyContext::from_params(&params).unwrap(), context());
        assert!(ApplyContext::from_params(&Parameters::new()).is_err());
    }

    #[test]
    fn test_service_request() {
        let definition = json!({
            "resourceType": "ActivityDefinition",
            "id": "ad1",
            "kind": "ServiceRequest",
            "intent": "order",
            "code": {"text": "Referral"}
        });
        let resource = initial_resource(&definition, &context()).unwrap();
        assert_eq!(resource["resourceType"], "ServiceRequest");
        assert_eq!(resource["intent"], "order");
        assert_eq!(resource["subject"]["reference"], "Patient/p1");
        assert_eq!(resource["encounter"]["reference"], "Encounter/e1");
        assert_eq!(resource["requester"]["reference"], "Organization/o1");
        assert_eq!(resource["instantiatesCanonical"], json!(["ActivityDefinition/ad1"]));
    }

    #[test]
    fn test_medication_request_uses_product() {
        let definition = json!({
            "kind": "MedicationRequest",
            "url": "http://example.org/ActivityDefinition/med",
            "productCodeableConcept": {"text": "Aspirin"},
            "dosage": [{"text": "daily"}]
        });
        let resource = initial_resource(&definition, &context()).unwrap();
        assert_eq!(resource["medicationCodeableConcept"]["text"], "Aspirin");
        assert_eq!(resource["intent"], "proposal");
        assert_eq!(resource["dosageInstruction"][0]["text"], "daily");
    }

    #[test]
    fn test_unsupported_kind() {
        let err = initial_resource(&json!({"kind": "Appointment"}), &context()).unwrap_err();
        assert!(matches!(err, OperationError::Unprocessable(_)));
    }

    #[test]
    fn test_set_path() {
        let mut resource = json!({"resourceType": "Task", "code": "x"});
        set_path(&mut resource, "Task.note.text", json!("hello"));
        set_path(&mut resource, "code", json!({"text": "y"}));
        assert_eq!(resource["note"]["text"], "hello");
        assert_eq!(resource["code"]["text"], "y");
    }
}
