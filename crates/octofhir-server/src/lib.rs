pub mod bootstrap;
pub mod config;
pub mod context;
pub mod error;
pub mod handlers;
pub mod middleware;
pub mod observability;
pub mod operations;
pub mod providers;
pub mod registry;
pub mod server;

pub use bootstrap::{bootstrap, bootstrap_into};
pub use config::{AppConfig, FhirSettings, LoggingConfig, ServerConfig, TerminologySettings};
pub use context::{ApplicationContext, DAO_REGISTRY_BEAN, TERMINOLOGY_SERVICE_BEAN};
pub use error::BootstrapError;
pub use observability::init_tracing;
pub use registry::{OperationRoute, ProviderRegistry};
pub use server::{AppState, OctofhirServer, ServerBuilder, build_app};
