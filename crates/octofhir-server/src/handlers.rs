use std::collections::BTreeMap;
use std::sync::Arc;

use axum::{
    Json,
    extract::{Path, State},
    http::{StatusCode, header},
    response::{IntoResponse, Response},
};
use octofhir_api::{ApiError, Bundle, BundleEntry, FhirResponse};
use octofhir_core::{ResourceType, now_utc};
use octofhir_storage::SearchParams;
use serde::Serialize;
use serde_json::{Value, json};

use crate::operations::OperationLevel;
use crate::providers::ResourceProvider;
use crate::server::AppState;

#[derive(Serialize)]
pub struct HealthResponse<'a> {
    status: &'a str,
}

pub async fn root(State(state): State<AppState>) -> impl IntoResponse {
    let body = json!({
        "service": "OctoFHIR Clinical Reasoning Server",
        "status": "ok",
        "version": env!("CARGO_PKG_VERSION"),
        "commit": env!("GIT_COMMIT"),
        "fhirBase": state.config.fhir_base_url(),
        "providers": state.registry.registrations(),
    });
    (StatusCode::OK, Json(body))
}

pub async fn healthz() -> impl IntoResponse {
    (StatusCode::OK, Json(HealthResponse { status: "ok" }))
}

/// CapabilityStatement describing the registered resource providers and
/// operations.
pub async fn metadata(State(state): State<AppState>) -> FhirResponse {
    let mut type_operations: BTreeMap<ResourceType, Vec<Value>> = BTreeMap::new();
    let mut system_operations = Vec::new();
    for (key, definition) in state.registry.operations() {
        let entry = json!({"name": key.code, "definition": definition.url()});
        match (key.level, key.resource_type) {
            (OperationLevel::System, _) | (_, None) => {
                if !system_operations.contains(&entry) {
                    system_operations.push(entry);
                }
            }
            (_, Some(rt)) => {
                let ops = type_operations.entry(rt).or_default();
                if !ops.contains(&entry) {
                    ops.push(entry);
                }
            }
        }
    }

    let mut types: Vec<ResourceType> = state.registry.resource_types().collect();
    for rt in type_operations.keys() {
        if !types.contains(rt) {
            types.push(*rt);
        }
    }
    types.sort();

    let resources: Vec<Value> = types
        .into_iter()
        .map(|rt| {
            let mut resource = json!({"type": rt.as_str()});
            if state.registry.resource_provider(rt).is_ok() {
                resource["interaction"] = json!([
                    {"code": "read"},
                    {"code": "create"},
                    {"code": "update"},
                    {"code": "delete"},
                    {"code": "search-type"}
                ]);
            }
            if let Some(ops) = type_operations.remove(&rt) {
                resource["operation"] = Value::Array(ops);
            }
            resource
        })
        .collect();

    FhirResponse::ok(json!({
        "resourceType": "CapabilityStatement",
        "status": "active",
        "kind": "instance",
        "date": now_utc().to_string(),
        "fhirVersion": state.config.fhir.version.as_str(),
        "format": ["application/fhir+json", "application/json"],
        "software": { "name": "OctoFHIR Clinical Reasoning Server", "version": env!("CARGO_PKG_VERSION") },
        "implementation": {
            "description": "OctoFHIR clinical reasoning",
            "url": state.config.fhir_base_url()
        },
        "rest": [{
            "mode": "server",
            "resource": resources,
            "operation": system_operations
        }]
    }))
}

// ---- CRUD & Search ----

pub(crate) fn parse_resource_type(name: &str) -> Result<ResourceType, ApiError> {
    name.parse()
        .map_err(|_| ApiError::not_found(format!("Unknown resource type '{name}'")))
}

fn resource_provider(state: &AppState, name: &str) -> Result<Arc<ResourceProvider>, ApiError> {
    let rt = parse_resource_type(name)?;
    state
        .registry
        .resource_provider(rt)
        .map_err(|e| ApiError::not_found(e.to_string()))
}

fn parse_body(body: &[u8]) -> Result<Value, ApiError> {
    serde_json::from_slice(body).map_err(|e| ApiError::bad_request(format!("Invalid JSON: {e}")))
}

pub async fn search_resource(
    state: &AppState,
    resource_type: &str,
    query: &[(String, String)],
) -> Result<Response, ApiError> {
    let provider = resource_provider(state, resource_type)?;
    let params = SearchParams::from_query(query.iter().map(|(k, v)| (k.as_str(), v.as_str())));
    let result = provider.search(&params).await.map_err(ApiError::from)?;
    let base = state.config.fhir_base_url();
    let entries = result
        .entries
        .into_iter()
        .map(|stored| BundleEntry::search_match(format!("{base}/{}", stored.reference()), stored.resource))
        .collect();
    Ok(FhirResponse::ok(Bundle::searchset(result.total as u64, entries).to_value()).into_response())
}

pub async fn create_resource(
    state: &AppState,
    resource_type: &str,
    body: &[u8],
) -> Result<Response, ApiError> {
    let provider = resource_provider(state, resource_type)?;
    let stored = provider.create(parse_body(body)?).await.map_err(ApiError::from)?;
    let location = format!("{}/{}", state.config.fhir_base_url(), stored.reference());
    tracing::debug!(resource = %stored.reference(), "Resource created");
    Ok((
        [(header::LOCATION, location)],
        FhirResponse::created(stored.resource),
    )
        .into_response())
}

pub async fn read_resource(
    state: &AppState,
    resource_type: &str,
    id: &str,
) -> Result<Response, ApiError> {
    let provider = resource_provider(state, resource_type)?;
    let stored = provider.read(id).await.map_err(ApiError::from)?;
    Ok(FhirResponse::ok(stored.resource).into_response())
}

pub async fn update_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
    body: axum::body::Bytes,
) -> Result<Response, ApiError> {
    let provider = resource_provider(&state, &resource_type)?;
    let stored = provider
        .update(&id, parse_body(&body)?)
        .await
        .map_err(ApiError::from)?;
    Ok(FhirResponse::ok(stored.resource).into_response())
}

pub async fn delete_resource(
    State(state): State<AppState>,
    Path((resource_type, id)): Path<(String, String)>,
) -> Result<Response, ApiError> {
    let provider = resource_provider(&state, &resource_type)?;
    provider.delete(&id).await.map_err(ApiError::from)?;
    Ok(StatusCode::NO_CONTENT.into_response())
}
