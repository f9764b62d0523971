//! HTTP handlers for FHIR operations.
//!
//! # Routing Strategy
//!
//! FHIR operations are identified by the `$` prefix in the URL path:
//! - System level: `/$operation`
//! - Type level: `/{type}/$operation`
//! - Instance level: `/{type}/{id}/$operation`
//!
//! Since axum cannot distinguish between dynamic segments based on content,
//! the merged handlers dispatch on the `$` prefix: `/{param}` is either a
//! system operation or a search/create, `/{type}/{param}` either a type
//! operation or a read.

use axum::{
    body::Bytes,
    extract::{Path, RawQuery, State},
    http::Method,
    response::{IntoResponse, Response},
};
use octofhir_api::{ApiError, FhirResponse};

use super::handler::OperationTarget;
use super::params::OperationParams;
use crate::handlers::{self, parse_resource_type};
use crate::server::AppState;

/// Checks if a path segment represents an operation (starts with `$`).
#[inline]
pub fn is_operation(segment: &str) -> bool {
    segment.starts_with('$')
}

/// Decodes a query string into ordered pairs, keeping repeated keys.
pub(crate) fn query_pairs(raw: Option<&str>) -> Vec<(String, String)> {
    raw.map(|q| url::form_urlencoded::parse(q.as_bytes()).into_owned().collect())
        .unwrap_or_default()
}

/// Resolves the binding for `operation` at `target` and invokes it.
async fn dispatch(
    state: &AppState,
    target: OperationTarget,
    operation: &str,
    params: OperationParams,
) -> Result<Response, ApiError> {
    let code = operation.trim_start_matches('$');
    let route = state
        .registry
        .find_operation(target.level(), target.resource_type(), code)
        .ok_or_else(|| {
            ApiError::not_found(format!(
                "Operation ${code} not found at {} level for {target}",
                target.level()
            ))
        })?;
    if route.definition.affects_state && matches!(params, OperationParams::Get(_)) {
        return Err(ApiError::bad_request(format!(
            "Operation ${code} changes server state and must be invoked with POST"
        )));
    }

    let parameters = params.into_parameters();
    tracing::debug!(
        operation = code,
        target = %target,
        provider = route.provider.name(),
        "Invoking operation"
    );
    let result = route
        .provider
        .invoke(code, &target, &parameters)
        .await
        .map_err(|e| {
            tracing::warn!(operation = code, target = %target, error = %e, "Operation failed");
            ApiError::from(e)
        })?;
    Ok(FhirResponse::ok(result).into_response())
}

// =============================================================================
// Merged Handlers
// =============================================================================

/// GET `/{param}`: system operation or resource search.
pub async fn merged_root_get_handler(
    State(state): State<AppState>,
    Path(param): Path<String>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    let query = query_pairs(raw.as_deref());
    if is_operation(&param) {
        dispatch(&state, OperationTarget::System, &param, OperationParams::Get(query)).await
    } else {
        handlers::search_resource(&state, &param, &query).await
    }
}

/// POST `/{param}`: system operation or resource create.
pub async fn merged_root_post_handler(
    State(state): State<AppState>,
    Path(param): Path<String>,
    body: Bytes,
) -> Result<Response, ApiError> {
    if is_operation(&param) {
        let params = OperationParams::from_body(&body).map_err(ApiError::from)?;
        dispatch(&state, OperationTarget::System, &param, params).await
    } else {
        handlers::create_resource(&state, &param, &body).await
    }
}

/// GET `/{resource_type}/{param}`: type operation or resource read.
pub async fn merged_type_get_handler(
    State(state): State<AppState>,
    Path((resource_type, param)): Path<(String, String)>,
    RawQuery(raw): RawQuery,
) -> Result<Response, ApiError> {
    if is_operation(&param) {
        let target = OperationTarget::Type(parse_resource_type(&resource_type)?);
        let params = OperationParams::Get(query_pairs(raw.as_deref()));
        dispatch(&state, target, &param, params).await
    } else {
        handlers::read_resource(&state, &resource_type, &param).await
    }
}

/// POST `/{resource_type}/{param}`: type operation only.
pub async fn merged_type_post_handler(
    State(state): State<AppState>,
    Path((resource_type, param)): Path<(String, String)>,
    body: Bytes,
) -> Result<Response, ApiError> {
    if !is_operation(&param) {
        return Err(ApiError::bad_request(format!(
            "POST to /{resource_type}/{param} is not supported. Use PUT to update a resource."
        )));
    }
    let target = OperationTarget::Type(parse_resource_type(&resource_type)?);
    let params = OperationParams::from_body(&body).map_err(ApiError::from)?;
    dispatch(&state, target, &param, params).await
}

/// GET or POST `/{resource_type}/{id}/{operation}`.
pub async fn instance_operation_handler(
    State(state): State<AppState>,
    Path((resource_type, id, operation)): Path<(String, String, String)>,
    method: Method,
    RawQuery(raw): RawQuery,
    body: Bytes,
) -> Result<Response, ApiError> {
    if !is_operation(&operation) {
        return Err(ApiError::not_found(format!(
            "Invalid operation path: /{resource_type}/{id}/{operation}. Operations must start with '$'"
        )));
    }
    let target = OperationTarget::Instance(parse_resource_type(&resource_type)?, id);
    let params = if method == Method::GET {
        OperationParams::Get(query_pairs(raw.as_deref()))
    } else {
        OperationParams::from_body(&body).map_err(ApiError::from)?
    };
    dispatch(&state, target, &operation, params).await
}
