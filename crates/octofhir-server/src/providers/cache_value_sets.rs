//! `Endpoint/{id}/$cache-valuesets`: pulls ValueSets from a remote FHIR
//! terminology server into local storage.
//!
//! Every requested ValueSet is fetched from `{address}/ValueSet/{id}`
//! concurrently. Nothing is written unless all fetches succeed. ValueSets
//! that only carry an expansion get a `compose` built from it, so that
//! `$updateCodeSystems` and local expansion work on them.

use std::time::Duration;

use async_trait::async_trait;
use futures_util::future::try_join_all;
use indexmap::IndexMap;
use octofhir_api::OperationOutcome;
use octofhir_core::ResourceType;
use octofhir_storage::{DynResourceDao, DynSystemDao};
use serde_json::{Value, json};
use url::Url;

use crate::operations::{
    OperationDefinition, OperationError, OperationProvider, OperationTarget, Parameters,
};

pub const CODE: &str = "cache-valuesets";

/// Basic-auth credentials for the remote endpoint.
#[derive(Debug, Clone)]
struct Credentials {
    user: String,
    pass: Option<String>,
}

pub struct CacheValueSetsProvider {
    system: DynSystemDao,
    endpoints: DynResourceDao,
    client: reqwest::Client,
    timeout: Duration,
}

impl CacheValueSetsProvider {
    pub fn new(
        system: DynSystemDao,
        endpoints: DynResourceDao,
        client: reqwest::Client,
        timeout: Duration,
    ) -> Self {
        Self {
            system,
            endpoints,
            client,
            timeout,
        }
    }

    async fn fetch(
        &self,
        base: &Url,
        id: &str,
        credentials: Option<&Credentials>,
    ) -> Result<Value, OperationError> {
        let url = base
            .join(&format!("ValueSet/{id}"))
            .map_err(|e| OperationError::InvalidParameters(format!("invalid ValueSet id '{id}': {e}")))?;

        let mut request = self
            .client
            .get(url.clone())
            .header(reqwest::header::ACCEPT, octofhir_api::FHIR_JSON)
            .timeout(self.timeout);
        if let Some(c) = credentials {
            request = request.basic_auth(&c.user, c.pass.as_deref());
        }

        tracing::debug!(url = %url, "Fetching remote ValueSet");
        let response = request
            .send()
            .await
            .map_err(|e| OperationError::Upstream(format!("GET {url} failed: {e}")))?;
        let status = response.status();
        if !status.is_success() {
            return Err(OperationError::Upstream(format!("GET {url} returned {status}")));
        }
        let mut value_set: Value = response
            .json()
            .await
            .map_err(|e| OperationError::Upstream(format!("GET {url} returned invalid JSON: {e}")))?;
        if value_set.get("resourceType").and_then(Value::as_str) != Some("ValueSet") {
            return Err(OperationError::Upstream(format!(
                "GET {url} did not return a ValueSet"
            )));
        }
        if value_set.get("id").is_none() {
            value_set["id"] = json!(id);
        }
        Ok(with_compose(value_set))
    }
}

/// Builds `compose.include` from `expansion.contains` when a ValueSet has no
/// compose, grouping codes by system (and version).
pub fn with_compose(mut value_set: Value) -> Value {
    if value_set.get("compose").is_some() {
        return value_set;
    }
    let mut groups: IndexMap<(String, Option<String>), Vec<Value>> = IndexMap::new();
    let mut stack: Vec<&Value> = value_set
        .pointer("/expansion/contains")
        .and_then(Value::as_array)
        .map(|items| items.iter().rev().collect())
        .unwrap_or_default();
    while let Some(entry) = stack.pop() {
        if let (Some(system), Some(code)) = (
            entry.get("system").and_then(Value::as_str),
            entry.get("code").and_then(Value::as_str),
        ) {
            let version = entry.get("version").and_then(Value::as_str).map(String::from);
            let mut concept = json!({"code": code});
            if let Some(display) = entry.get("display") {
                concept["display"] = display.clone();
            }
            groups
                .entry((system.to_string(), version))
                .or_default()
                .push(concept);
        }
        if let Some(children) = entry.get("contains").and_then(Value::as_array) {
            stack.extend(children.iter().rev());
        }
    }
    if groups.is_empty() {
        return value_set;
    }
    let include: Vec<Value> = groups
        .into_iter()
        .map(|((system, version), concept)| {
            let mut include = json!({"system": system, "concept": concept});
            if let Some(v) = version {
                include["version"] = json!(v);
            }
            include
        })
        .collect();
    value_set["compose"] = json!({"include": include});
    value_set
}

#[async_trait]
impl OperationProvider for CacheValueSetsProvider {
    fn name(&self) -> &'static str {
        "cache-value-sets"
    }

    fn resource_type(&self) -> Option<ResourceType> {
        Some(ResourceType::Endpoint)
    }

    fn operations(&self) -> Vec<OperationDefinition> {
        vec![
            OperationDefinition::on(ResourceType::Endpoint, CODE)
                .at_instance()
                .affecting_state(),
        ]
    }

    async fn invoke(
        &self,
        code: &str,
        target: &OperationTarget,
        params: &Parameters,
    ) -> Result<Value, OperationError> {
        let OperationTarget::Instance(ResourceType::Endpoint, id) = target else {
            return Err(OperationError::unsupported(code, target));
        };
        let endpoint = self.endpoints.read_required(id).await?.resource;
        let address = endpoint
            .get("address")
            .and_then(Value::as_str)
            .filter(|a| !a.is_empty())
            .ok_or_else(|| {
                OperationError::InvalidParameters(format!("Endpoint/{id} has no address"))
            })?;
        let ids = params.strings("valueset");
        if ids.is_empty() {
            return Err(OperationError::InvalidParameters(
                "at least one 'valueset' parameter is required".into(),
            ));
        }
        let credentials = params.string("user").map(|user| Credentials {
            user,
            pass: params.string("pass"),
        });

        let base = if address.ends_with('/') {
            address.to_string()
        } else {
            format!("{address}/")
        };
        let base = Url::parse(&base).map_err(|e| {
            OperationError::InvalidParameters(format!("Endpoint/{id} address '{address}': {e}"))
        })?;

        tracing::info!(endpoint = %id, address = %base, count = ids.len(), "Caching remote ValueSets");
        let value_sets = try_join_all(
            ids.iter()
                .map(|vs| self.fetch(&base, vs, credentials.as_ref())),
        )
        .await?;
        let stored = self.system.upsert_all(value_sets).await?;

        let cached: Vec<String> = stored.iter().map(|s| s.reference()).collect();
        Ok(OperationOutcome::information(format!(
            "Cached {} ValueSet(s) from {address}: {}",
            cached.len(),
            cached.join(", ")
        ))
        .to_value())
    }
}
