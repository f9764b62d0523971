//! `PlanDefinition/{id}/$apply`.
//!
//! Produces a CarePlan for a patient. Actions are walked depth first; an
//! action whose `applicability` conditions all evaluate to `true` has its
//! `definitionCanonical` ActivityDefinition applied, and the resulting
//! resource is contained in the CarePlan and listed as an activity. An
//! action that is not applicable is skipped together with its sub-actions.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use octofhir_core::{ResourceType, generate_id};
use octofhir_cql_service::LibraryInclude;
use octofhir_storage::DynResourceDao;
use serde_json::{Value, json};

use super::ResourceProvider;
use super::activity_definition::{
    APPLY, ActivityDefinitionApplyProvider, ApplyContext, cql_of, definition_includes,
};
use super::cql_execution::CqlExecutionProvider;
use crate::operations::{
    OperationDefinition, OperationError, OperationProvider, OperationTarget, Parameters,
};

pub struct PlanDefinitionApplyProvider {
    activities: Arc<ActivityDefinitionApplyProvider>,
    plans: ResourceProvider,
    activity_definitions: ResourceProvider,
    cql: Arc<CqlExecutionProvider>,
}

/// State threaded through the action walk.
struct PlanBuilder<'a> {
    context: &'a ApplyContext,
    includes: &'a [LibraryInclude],
    contained: Vec<Value>,
    activity: Vec<Value>,
}

impl PlanDefinitionApplyProvider {
    pub fn new(
        activities: Arc<ActivityDefinitionApplyProvider>,
        plans: DynResourceDao,
        activity_definitions: DynResourceDao,
        cql: Arc<CqlExecutionProvider>,
    ) -> Self {
        Self {
            activities,
            plans: ResourceProvider::new(plans),
            activity_definitions: ResourceProvider::new(activity_definitions),
            cql,
        }
    }

    pub async fn apply_plan(
        &self,
        plan: &Value,
        context: &ApplyContext,
    ) -> Result<Value, OperationError> {
        let includes = definition_includes(self.cql.resolver(), plan).await?;
        let mut builder = PlanBuilder {
            context,
            includes: &includes,
            contained: Vec::new(),
            activity: Vec::new(),
        };
        let mut pending: Vec<&Value> = actions_of(plan).rev().collect();
        while let Some(action) = pending.pop() {
            if !self.applicable(action, &builder).await? {
                continue;
            }
            if let Some(canonical) = action.get("definitionCanonical").and_then(Value::as_str) {
                self.apply_action(canonical, action, &mut builder).await?;
            }
            pending.extend(actions_of(action).rev());
        }

        let canonical = plan
            .get("url")
            .and_then(Value::as_str)
            .map(String::from)
            .or_else(|| {
                plan.get("id")
                    .and_then(Value::as_str)
                    .map(|id| format!("PlanDefinition/{id}"))
            });
        let mut care_plan = json!({
            "resourceType": "CarePlan",
            "id": generate_id(),
            "status": "draft",
            "intent": "proposal",
            "subject": context.patient_ref(),
        });
        if let Some(c) = canonical {
            care_plan["instantiatesCanonical"] = json!([c]);
        }
        for key in ["title", "description"] {
            if let Some(value) = plan.get(key) {
                care_plan[key] = value.clone();
            }
        }
        if let Some(encounter) = context.encounter_ref() {
            care_plan["encounter"] = encounter;
        }
        if let Some(author) = context.requester_ref() {
            care_plan["author"] = author;
        }
        if !builder.contained.is_empty() {
            care_plan["contained"] = Value::Array(builder.contained);
            care_plan["activity"] = Value::Array(builder.activity);
        }
        Ok(care_plan)
    }

    async fn applicable(&self, action: &Value, builder: &PlanBuilder<'_>) -> Result<bool, OperationError> {
        for condition in action
            .get("condition")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|c| c.get("kind").and_then(Value::as_str) == Some("applicability"))
        {
            let Some(cql) = condition.get("expression").and_then(cql_of) else {
                continue;
            };
            let value = self
                .cql
                .evaluate_in_context(
                    cql,
                    Some(&builder.context.patient),
                    builder.includes,
                    IndexMap::new(),
                )
                .await?;
            if value != Value::Bool(true) {
                let title = action.get("title").and_then(Value::as_str).unwrap_or_default();
                tracing::debug!(action = title, "Action not applicable");
                return Ok(false);
            }
        }
        Ok(true)
    }

    async fn apply_action(
        &self,
        canonical: &str,
        action: &Value,
        builder: &mut PlanBuilder<'_>,
    ) -> Result<(), OperationError> {
        let definition = self
            .activity_definitions
            .resolve_canonical(canonical)
            .await?
            .resource;
        let resource = self
            .activities
            .apply_definition(&definition, builder.context)
            .await?;
        let id = resource
            .get("id")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(generate_id);
        let mut detail = json!({"reference": {"reference": format!("#{id}")}});
        if let Some(title) = action.get("title") {
            detail["reference"]["display"] = title.clone();
        }
        builder.contained.push(resource);
        builder.activity.push(detail);
        Ok(())
    }
}

fn actions_of(node: &Value) -> impl DoubleEndedIterator<Item = &Value> {
    node.get("action")
        .and_then(Value::as_array)
        .map(|a| a.as_slice())
        .unwrap_or(&[])
        .iter()
}

#[async_trait]
impl OperationProvider for PlanDefinitionApplyProvider {
    fn name(&self) -> &'static str {
        "plan-definition-apply"
    }

    fn resource_type(&self) -> Option<ResourceType> {
        Some(ResourceType::PlanDefinition)
    }

    fn operations(&self) -> Vec<OperationDefinition> {
        vec![OperationDefinition::on(ResourceType::PlanDefinition, APPLY).at_instance()]
    }

    async fn invoke(
        &self,
        code: &str,
        target: &OperationTarget,
        params: &Parameters,
    ) -> Result<Value, OperationError> {
        let OperationTarget::Instance(ResourceType::PlanDefinition, id) = target else {
            return Err(OperationError::unsupported(code, target));
        };
        let context = ApplyContext::from_params(params)?;
        let plan = self.plans.read(id).await?.resource;
        let care_plan = self.apply_plan(&plan, &context).await?;
        tracing::info!(
            plan = %id,
            patient = %context.patient,
            activities = care_plan["activity"].as_array().map(Vec::len).unwrap_or(0),
            "Applied PlanDefinition"
        );
        Ok(care_plan)
    }
}
