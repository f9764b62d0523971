//! Resource and operation providers registered by the bootstrapper.

pub mod activity_definition;
pub mod bundle_apply;
pub mod cache_value_sets;
pub mod claim;
pub mod code_system_update;
pub mod cql_execution;
pub mod hqmf;
pub mod library;
pub mod measure;
pub mod narrative;
pub mod patient;
pub mod plan_definition;
mod resource;

pub use activity_definition::{ActivityDefinitionApplyProvider, ApplyContext};
pub use bundle_apply::BundleApplyProvider;
pub use cache_value_sets::CacheValueSetsProvider;
pub use claim::ClaimProvider;
pub use code_system_update::CodeSystemUpdateProvider;
pub use cql_execution::{CqlExecutionProvider, MeasurementPeriod};
pub use hqmf::HqmfGenerator;
pub use library::{LibraryOperationsProvider, LibraryResolver};
pub use measure::MeasureOperationsProvider;
pub use narrative::NarrativeGenerator;
pub use patient::PatientProvider;
pub use plan_definition::PlanDefinitionApplyProvider;
pub use resource::ResourceProvider;
