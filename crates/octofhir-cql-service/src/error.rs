//! Error types for CQL service

use thiserror::Error;

/// Result type for CQL operations
pub type CqlResult<T> = Result<T, CqlError>;

/// Errors that can occur during CQL operations
#[derive(Debug, Error)]
pub enum CqlError {
    /// CQL evaluation error reported by the engine
    #[error("CQL evaluation error: {0}")]
    EvaluationError(String),

    /// No CQL engine is installed
    #[error("CQL engine unavailable: {0}")]
    EngineUnavailable(String),

    /// Library not found
    #[error("Library not found: {0}")]
    LibraryNotFound(String),

    /// Library content missing or undecodable
    #[error("Invalid library content: {0}")]
    InvalidLibrary(String),

    /// Operation timeout
    #[error("Operation timeout: {0}")]
    Timeout(String),

    /// Data provider error
    #[error("Data provider error: {0}")]
    DataProviderError(String),

    /// Terminology provider error
    #[error("Terminology provider error: {0}")]
    TerminologyError(String),

    /// Unsupported data model or model version
    #[error("Unsupported model: {0}")]
    UnsupportedModel(String),

    /// Storage error
    #[error("Storage error: {0}")]
    StorageError(#[from] octofhir_storage::StorageError),

    /// Serialization error
    #[error("Serialization error: {0}")]
    SerializationError(#[from] serde_json::Error),

    /// Invalid parameter
    #[error("Invalid parameter: {0}")]
    InvalidParameter(String),
}
