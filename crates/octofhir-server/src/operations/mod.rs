//! FHIR Operations Framework
//!
//! Infrastructure shared by every operation provider:
//!
//! - **OperationDefinition**: where an operation can be invoked (system,
//!   type and/or instance level)
//! - **OperationProvider**: trait implemented by each provider; the
//!   [`ProviderRegistry`](crate::registry::ProviderRegistry) routes
//!   invocations to it
//! - **Parameters**: the FHIR `Parameters` resource every operation receives
//! - **Router**: axum handlers for operation and CRUD endpoints
//!
//! # Example
//!
//! ```ignore
//! use octofhir_server::operations::{
//!     OperationDefinition, OperationError, OperationProvider, OperationTarget, Parameters,
//! };
//!
//! struct Ping;
//!
//! #[async_trait::async_trait]
//! impl OperationProvider for Ping {
//!     fn name(&self) -> &'static str {
//!         "ping"
//!     }
//!
//!     fn operations(&self) -> Vec<OperationDefinition> {
//!         vec![OperationDefinition::system("ping")]
//!     }
//!
//!     async fn invoke(
//!         &self,
//!         _code: &str,
//!         _target: &OperationTarget,
//!         _params: &Parameters,
//!     ) -> Result<serde_json::Value, OperationError> {
//!         Ok(Parameters::new().with_string("pong", "ok").into_value())
//!     }
//! }
//! ```

pub mod definition;
pub mod handler;
pub mod params;
pub mod router;

pub use definition::{OperationDefinition, OperationKey, OperationLevel};
pub use handler::{DynOperationProvider, OperationError, OperationProvider, OperationTarget};
pub use params::{OperationParams, Parameters, parts_of};
pub use router::{
    instance_operation_handler, is_operation, merged_root_get_handler, merged_root_post_handler,
    merged_type_get_handler, merged_type_post_handler,
};
