//! `$updateCodeSystems`: copies concepts enumerated by ValueSets into the
//! CodeSystems they draw from.
//!
//! For every `compose.include` with a `system` and explicit `concept`s the
//! CodeSystem with that url is created when missing (status `active`,
//! content `fragment`) and any absent codes are appended. Includes without a
//! system or without concepts are reported as warnings.

use std::collections::HashSet;

use async_trait::async_trait;
use octofhir_api::OperationOutcome;
use octofhir_core::ResourceType;
use octofhir_storage::{DynResourceDao, SearchParams};
use serde_json::{Value, json};

use crate::operations::{
    OperationDefinition, OperationError, OperationProvider, OperationTarget, Parameters,
};

pub const CODE: &str = "updateCodeSystems";

pub struct CodeSystemUpdateProvider {
    value_sets: DynResourceDao,
    code_systems: DynResourceDao,
}

impl CodeSystemUpdateProvider {
    pub fn new(value_sets: DynResourceDao, code_systems: DynResourceDao) -> Self {
        Self {
            value_sets,
            code_systems,
        }
    }

    /// Applies one ValueSet's includes, recording what happened in `outcome`.
    pub async fn update_from(
        &self,
        value_set: &Value,
        outcome: &mut OperationOutcome,
    ) -> Result<(), OperationError> {
        let label = value_set
            .get("id")
            .and_then(Value::as_str)
            .map(|id| format!("ValueSet/{id}"))
            .unwrap_or_else(|| "ValueSet".to_string());
        let includes = value_set
            .pointer("/compose/include")
            .and_then(Value::as_array)
            .cloned()
            .unwrap_or_default();

        if includes.is_empty() {
            outcome.push(
                "warning",
                "informational",
                format!("{label} has no compose.include entries"),
            );
            return Ok(());
        }

        for (index, include) in includes.iter().enumerate() {
            let Some(system) = include.get("system").and_then(Value::as_str) else {
                outcome.push(
                    "warning",
                    "incomplete",
                    format!("{label} include #{index} has no system"),
                );
                continue;
            };
            let concepts: Vec<Value> = include
                .get("concept")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
                .filter(|c| c.get("code").and_then(Value::as_str).is_some())
                .cloned()
                .collect();
            if concepts.is_empty() {
                outcome.push(
                    "warning",
                    "incomplete",
                    format!("{label} include #{index} lists no concepts for {system}"),
                );
                continue;
            }
            let version = include.get("version").and_then(Value::as_str);
            let message = self.merge_concepts(system, version, concepts).await?;
            outcome.push("information", "informational", message);
        }
        Ok(())
    }

    async fn merge_concepts(
        &self,
        system: &str,
        version: Option<&str>,
        concepts: Vec<Value>,
    ) -> Result<String, OperationError> {
        let existing = self
            .code_systems
            .search(&SearchParams::new().with_param("url", system).with_count(1))
            .await?
            .entries
            .into_iter()
            .next();

        match existing {
            Some(stored) => {
                let mut code_system = stored.resource;
                let mut known = HashSet::new();
                collect_codes(code_system.get("concept"), &mut known);
                let added: Vec<Value> = concepts
                    .into_iter()
                    .filter(|c| {
                        c.get("code")
                            .and_then(Value::as_str)
                            .is_some_and(|code| known.insert(code.to_string()))
                    })
                    .map(concept_entry)
                    .collect();
                if added.is_empty() {
                    return Ok(format!("CodeSystem {system} already contains every code"));
                }
                let count = added.len();
                if let Some(obj) = code_system.as_object_mut() {
                    let list = obj.entry("concept").or_insert_with(|| json!([]));
                    if let Some(list) = list.as_array_mut() {
                        list.extend(added);
                    }
                }
                self.code_systems.update(code_system).await?;
                tracing::debug!(system, added = count, "Appended codes to CodeSystem");
                Ok(format!("Added {count} code(s) to CodeSystem {system}"))
            }
            None => {
                let mut seen = HashSet::new();
                let concept: Vec<Value> = concepts
                    .into_iter()
                    .filter(|c| {
                        c.get("code")
                            .and_then(Value::as_str)
                            .is_some_and(|code| seen.insert(code.to_string()))
                    })
                    .map(concept_entry)
                    .collect();
                let count = concept.len();
                let mut code_system = json!({
                    "resourceType": "CodeSystem",
                    "url": system,
                    "status": "active",
                    "content": "fragment",
                    "concept": concept,
                });
                if let Some(v) = version {
                    code_system["version"] = json!(v);
                }
                self.code_systems.create(code_system).await?;
                tracing::debug!(system, codes = count, "Created CodeSystem");
                Ok(format!("Created CodeSystem {system} with {count} code(s)"))
            }
        }
    }
}

fn concept_entry(concept: Value) -> Value {
    let mut entry = json!({"code": concept.get("code").cloned().unwrap_or(Value::Null)});
    if let Some(display) = concept.get("display") {
        entry["display"] = display.clone();
    }
    entry
}

fn collect_codes(concepts: Option<&Value>, out: &mut HashSet<String>) {
    for concept in concepts.and_then(Value::as_array).into_iter().flatten() {
        if let Some(code) = concept.get("code").and_then(Value::as_str) {
            out.insert(code.to_string());
        }
        collect_codes(concept.get("concept"), out);
    }
}

#[async_trait]
impl OperationProvider for CodeSystemUpdateProvider {
    fn name(&self) -> &'static str {
        "code-system-update"
    }

    fn operations(&self) -> Vec<OperationDefinition> {
        vec![
            OperationDefinition::on(ResourceType::ValueSet, CODE)
                .at_system()
                .at_instance()
                .affecting_state(),
        ]
    }

    async fn invoke(
        &self,
        code: &str,
        target: &OperationTarget,
        _params: &Parameters,
    ) -> Result<Value, OperationError> {
        let mut outcome = OperationOutcome::empty();
        match target {
            OperationTarget::Instance(ResourceType::ValueSet, id) => {
                let value_set = self.value_sets.read_required(id).await?;
                self.update_from(&value_set.resource, &mut outcome).await?;
            }
            OperationTarget::System => {
                let value_sets = self.value_sets.search(&SearchParams::new()).await?;
                tracing::info!(count = value_sets.len(), "Updating CodeSystems from ValueSets");
                for stored in &value_sets.entries {
                    self.update_from(&stored.resource, &mut outcome).await?;
                }
            }
            _ => return Err(OperationError::unsupported(code, target)),
        }
        if !outcome.has_issues() {
            outcome.push("information", "informational", "No ValueSets to process");
        }
        Ok(outcome.to_value())
    }
}
