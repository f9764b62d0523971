//! Startup errors.
//!
//! Every variant is fatal: the bootstrapper stops at the first failure and
//! nothing already registered is rolled back.

use octofhir_core::ResourceType;
use octofhir_storage::StorageError;
use thiserror::Error;

use crate::operations::OperationLevel;

#[derive(Debug, Error)]
pub enum BootstrapError {
    /// A bean the bootstrapper requires is absent from the application context.
    #[error("required bean '{0}' is not present in the application context")]
    MissingBean(&'static str),

    /// No resource provider is registered for the type.
    #[error("no resource provider registered for {0}")]
    ResourceProviderNotFound(ResourceType),

    /// A provider with the same name, or a second resource provider for one
    /// type, was registered.
    #[error("provider '{0}' is already registered")]
    DuplicateProvider(String),

    /// Two providers bind the same operation at the same level and type.
    #[error("operation ${code} at {level} level{} is already bound by provider '{existing}'", .resource_type.map(|rt| format!(" on {rt}")).unwrap_or_default())]
    DuplicateOperation {
        code: String,
        level: OperationLevel,
        resource_type: Option<ResourceType>,
        existing: String,
    },

    /// A provider that serves CRUD through an attached DAO was registered
    /// before the DAO was attached.
    #[error("provider '{0}' was registered without its DAO")]
    MissingDao(&'static str),

    /// A data-access object could not be obtained from the DAO registry.
    #[error(transparent)]
    Storage(#[from] StorageError),

    /// The outbound HTTP client could not be built.
    #[error("failed to build HTTP client: {0}")]
    HttpClient(#[from] reqwest::Error),
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_duplicate_operation_message() {
        let err = BootstrapError::DuplicateOperation {
            code: "apply".into(),
            level: OperationLevel::Instance,
            resource_type: Some(ResourceType::PlanDefinition),
            existing: "plan-definition-apply".into(),
        };
        assert_eq!(
            err.to_string(),
            "operation $apply at instance level on PlanDefinition is already bound by provider 'plan-definition-apply'"
        );

        let err = BootstrapError::DuplicateOperation {
            code: "cql".into(),
            level: OperationLevel::System,
            resource_type: None,
            existing: "cql-execution".into(),
        };
        assert_eq!(
            err.to_string(),
            "operation $cql at system level is already bound by provider 'cql-execution'"
        );
    }
}
