//! Operation provider trait and error types.
//!
//! A provider groups related operations (all `$apply` flavours for
//! PlanDefinition, the measure operations, ...). The registry indexes the
//! provider's [`OperationDefinition`]s and routes each invocation to
//! [`OperationProvider::invoke`] with the code and the target it was
//! invoked on.

use std::fmt;
use std::sync::Arc;

use async_trait::async_trait;
use octofhir_api::ApiError;
use octofhir_core::ResourceType;
use octofhir_cql_service::CqlError;
use octofhir_storage::StorageError;
use serde_json::Value;

use super::definition::{OperationDefinition, OperationLevel};
use super::params::Parameters;
use crate::providers::ResourceProvider;

/// Where an operation was invoked.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OperationTarget {
    System,
    Type(ResourceType),
    Instance(ResourceType, String),
}

impl OperationTarget {
    pub fn level(&self) -> OperationLevel {
        match self {
            OperationTarget::System => OperationLevel::System,
            OperationTarget::Type(_) => OperationLevel::Type,
            OperationTarget::Instance(..) => OperationLevel::Instance,
        }
    }

    pub fn resource_type(&self) -> Option<ResourceType> {
        match self {
            OperationTarget::System => None,
            OperationTarget::Type(rt) | OperationTarget::Instance(rt, _) => Some(*rt),
        }
    }

    pub fn id(&self) -> Option<&str> {
        match self {
            OperationTarget::Instance(_, id) => Some(id),
            _ => None,
        }
    }
}

impl fmt::Display for OperationTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            OperationTarget::System => f.write_str("/"),
            OperationTarget::Type(rt) => write!(f, "{rt}"),
            OperationTarget::Instance(rt, id) => write!(f, "{rt}/{id}"),
        }
    }
}

/// Error type for FHIR operation failures.
#[derive(Debug, thiserror::Error)]
pub enum OperationError {
    /// Invalid or missing parameters
    #[error("Invalid parameters: {0}")]
    InvalidParameters(String),

    /// Resource not found
    #[error("Resource not found: {0}")]
    NotFound(String),

    /// Operation not supported at this level
    #[error("Operation not supported: {0}")]
    NotSupported(String),

    /// Input was well-formed but could not be processed
    #[error("Unprocessable: {0}")]
    Unprocessable(String),

    /// A remote endpoint failed
    #[error("Upstream failure: {0}")]
    Upstream(String),

    /// CQL evaluation failure
    #[error(transparent)]
    Cql(#[from] CqlError),

    /// Storage failure
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// Internal server error
    #[error("Internal error: {0}")]
    Internal(String),
}

impl OperationError {
    pub fn unsupported(code: &str, target: &OperationTarget) -> Self {
        Self::NotSupported(format!(
            "Operation ${code} is not supported at {} level",
            target.level()
        ))
    }
}

impl From<OperationError> for ApiError {
    fn from(err: OperationError) -> Self {
        match err {
            OperationError::InvalidParameters(msg) => ApiError::bad_request(msg),
            OperationError::NotFound(msg) => ApiError::not_found(msg),
            OperationError::NotSupported(msg) => ApiError::bad_request(msg),
            OperationError::Unprocessable(msg) => ApiError::unprocessable_entity(msg),
            OperationError::Upstream(msg) => ApiError::bad_gateway(msg),
            OperationError::Internal(msg) => ApiError::internal(msg),
            OperationError::Storage(e) => match e {
                StorageError::NotFound { .. } | StorageError::UnsupportedType(_) => {
                    ApiError::not_found(e.to_string())
                }
                StorageError::AlreadyExists { .. } => ApiError::conflict(e.to_string()),
                StorageError::InvalidResource { .. } => ApiError::bad_request(e.to_string()),
                StorageError::Internal { .. } => ApiError::internal(e.to_string()),
            },
            OperationError::Cql(e) => match e {
                CqlError::EngineUnavailable(_) => ApiError::not_implemented(e.to_string()),
                CqlError::LibraryNotFound(_) => ApiError::not_found(e.to_string()),
                CqlError::InvalidParameter(_) => ApiError::bad_request(e.to_string()),
                CqlError::InvalidLibrary(_)
                | CqlError::UnsupportedModel(_)
                | CqlError::TerminologyError(_)
                | CqlError::EvaluationError(_) => ApiError::unprocessable_entity(e.to_string()),
                CqlError::StorageError(inner) => OperationError::Storage(inner).into(),
                CqlError::Timeout(_)
                | CqlError::DataProviderError(_)
                | CqlError::SerializationError(_) => ApiError::internal(e.to_string()),
            },
        }
    }
}

/// Trait for implementing a group of FHIR operations.
///
/// # Implementation Notes
///
/// - `name` must be unique within a registry
/// - `invoke` is only called for a code and target matching one of the
///   definitions returned by `operations`
/// - Providers that also serve CRUD for their type expose it through
///   `resource_provider`
#[async_trait]
pub trait OperationProvider: Send + Sync {
    fn name(&self) -> &'static str;

    /// Resource type the provider is bound to, if any.
    fn resource_type(&self) -> Option<ResourceType> {
        None
    }

    fn operations(&self) -> Vec<OperationDefinition>;

    /// CRUD provider served alongside the operations.
    fn resource_provider(&self) -> Option<Arc<ResourceProvider>> {
        None
    }

    async fn invoke(
        &self,
        code: &str,
        target: &OperationTarget,
        params: &Parameters,
    ) -> Result<Value, OperationError>;
}

/// Type alias for a shared operation provider.
pub type DynOperationProvider = Arc<dyn OperationProvider>;
