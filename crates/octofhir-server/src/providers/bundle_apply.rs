//! `$apply-cql` on Bundles.
//!
//! Primitive elements may carry a `cqf-expression` extension on their
//! `_element` companion. Each such CQL expression is evaluated (in the
//! context of the patient the entry belongs to, when there is one) and the
//! result is written into the element. The Bundle is returned, not stored.

use async_trait::async_trait;
use octofhir_core::ResourceType;
use octofhir_cql_service::library::ADHOC_EXPRESSION;
use octofhir_cql_service::{
    EvaluationContext, EvaluationProviderFactory, EvaluationRequest, LibrarySource,
};
use octofhir_storage::DynResourceDao;
use serde_json::Value;

use crate::operations::{
    OperationDefinition, OperationError, OperationProvider, OperationTarget, Parameters,
};

use super::activity_definition::cql_of;

pub const CODE: &str = "apply-cql";
pub const CQF_EXPRESSION_URL: &str = "http://hl7.org/fhir/StructureDefinition/cqf-expression";

/// A CQL expression bound to the element it computes.
#[derive(Debug, Clone, PartialEq)]
struct BoundExpression {
    /// JSON pointer to the object holding the element
    parent: String,
    field: String,
    expression: String,
}

pub struct BundleApplyProvider {
    factory: EvaluationProviderFactory,
    bundles: DynResourceDao,
}

impl BundleApplyProvider {
    pub fn new(factory: EvaluationProviderFactory, bundles: DynResourceDao) -> Self {
        Self { factory, bundles }
    }

    /// Evaluates every cqf-expression in the bundle and writes the results in
    /// place. Returns the number of elements written.
    pub async fn apply(&self, bundle: &mut Value) -> Result<usize, OperationError> {
        if bundle.get("resourceType").and_then(Value::as_str) != Some("Bundle") {
            return Err(OperationError::InvalidParameters(
                "$apply-cql requires a Bundle".into(),
            ));
        }
        let entries = bundle
            .get("entry")
            .and_then(Value::as_array)
            .map(Vec::len)
            .unwrap_or(0);

        let mut applied = 0;
        for index in 0..entries {
            let pointer = format!("/entry/{index}/resource");
            let Some(resource) = bundle.pointer(&pointer) else {
                continue;
            };
            let patient = patient_of(resource);
            let mut bound = Vec::new();
            collect_expressions(resource, &pointer, &mut bound);

            for expression in bound {
                let value = self.evaluate(&expression.expression, patient.as_deref()).await?;
                let Some(parent) = bundle
                    .pointer_mut(&expression.parent)
                    .and_then(Value::as_object_mut)
                else {
                    continue;
                };
                if value.is_null() {
                    parent.remove(&expression.field);
                } else {
                    parent.insert(expression.field.clone(), value);
                }
                applied += 1;
            }
        }
        Ok(applied)
    }

    async fn evaluate(&self, expression: &str, patient: Option<&str>) -> Result<Value, OperationError> {
        let library = LibrarySource::adhoc(
            expression,
            self.factory.fhir_version(),
            patient.is_some(),
            &[],
        );
        let request = EvaluationRequest::new(library)
            .with_expressions([ADHOC_EXPRESSION.to_string()])
            .with_context(patient.map(EvaluationContext::patient));
        let mut result = self.factory.evaluate(&request).await?;
        Ok(result
            .expressions
            .shift_remove(ADHOC_EXPRESSION)
            .unwrap_or(Value::Null))
    }
}

/// Patient id an entry belongs to: the Patient itself, or its `subject` /
/// `patient` reference.
fn patient_of(resource: &Value) -> Option<String> {
    if resource.get("resourceType").and_then(Value::as_str) == Some("Patient") {
        return resource.get("id").and_then(Value::as_str).map(String::from);
    }
    ["subject", "patient"].iter().find_map(|key| {
        resource
            .get(*key)
            .and_then(|r| r.get("reference"))
            .and_then(Value::as_str)
            .and_then(|r| r.strip_prefix("Patient/"))
            .map(String::from)
    })
}

fn cql_expression(element: &Value) -> Option<String> {
    element
        .get("extension")
        .and_then(Value::as_array)?
        .iter()
        .filter(|ext| ext.get("url").and_then(Value::as_str) == Some(CQF_EXPRESSION_URL))
        .find_map(|ext| ext.get("valueExpression").and_then(cql_of).map(String::from))
}

fn collect_expressions(value: &Value, pointer: &str, out: &mut Vec<BoundExpression>) {
    match value {
        Value::Object(obj) => {
            for (key, child) in obj {
                if let Some(field) = key.strip_prefix('_') {
                    if let Some(expression) = cql_expression(child) {
                        out.push(BoundExpression {
                            parent: pointer.to_string(),
                            field: field.to_string(),
                            expression,
                        });
                    }
                    continue;
                }
                collect_expressions(child, &format!("{pointer}/{}", escape_pointer(key)), out);
            }
        }
        Value::Array(items) => {
            for (i, child) in items.iter().enumerate() {
                collect_expressions(child, &format!("{pointer}/{i}"), out);
            }
        }
        _ => {}
    }
}

fn escape_pointer(key: &str) -> String {
    key.replace('~', "~0").replace('/', "~1")
}

#[async_trait]
impl OperationProvider for BundleApplyProvider {
    fn name(&self) -> &'static str {
        "bundle-apply"
    }

    fn resource_type(&self) -> Option<ResourceType> {
        Some(ResourceType::Bundle)
    }

    fn operations(&self) -> Vec<OperationDefinition> {
        vec![
            OperationDefinition::on(ResourceType::Bundle, CODE)
                .at_type()
                .at_instance(),
        ]
    }

    async fn invoke(
        &self,
        code: &str,
        target: &OperationTarget,
        params: &Parameters,
    ) -> Result<Value, OperationError> {
        let mut bundle = match target {
            OperationTarget::Instance(ResourceType::Bundle, id) => {
                self.bundles.read_required(id).await?.resource
            }
            OperationTarget::Type(ResourceType::Bundle) => params
                .resource("resource")
                .or_else(|| params.resource("bundle"))
                .cloned()
                .ok_or_else(|| {
                    OperationError::InvalidParameters("a Bundle must be supplied".into())
                })?,
            _ => return Err(OperationError::unsupported(code, target)),
        };
        let applied = self.apply(&mut bundle).await?;
        tracing::info!(bundle = %target, applied, "Applied CQL expressions to Bundle");
        Ok(bundle)
    }
}
