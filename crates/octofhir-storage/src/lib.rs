//! # octofhir-storage
//!
//! Data-access layer for the clinical reasoning server.
//!
//! Every resource type the server knows about is served by a
//! [`ResourceDao`]; the [`DaoRegistry`] maps each [`ResourceType`] to its DAO
//! and also exposes the cross-type [`SystemDao`].
//!
//! ## Example
//!
//! ```ignore
//! use octofhir_core::ResourceType;
//! use octofhir_storage::{DaoRegistry, SearchParams};
//!
//! async fn find_library(registry: &DaoRegistry, name: &str) -> octofhir_storage::StorageResult<()> {
//!     let dao = registry.resource_dao(ResourceType::Library)?;
//!     let result = dao.search(&SearchParams::new().with_param("name", name)).await?;
//!     println!("{} matches", result.len());
//!     Ok(())
//! }
//! ```
//!
//! [`ResourceType`]: octofhir_core::ResourceType

mod error;
pub mod memory;
mod registry;
mod traits;
mod types;

pub use error::StorageError;
pub use memory::{InMemoryResourceDao, InMemoryStore, InMemorySystemDao};
pub use registry::DaoRegistry;
pub use traits::{ResourceDao, SystemDao};
pub use types::{SearchParams, SearchResult, StoredResource};

/// Type alias for a storage result.
pub type StorageResult<T> = Result<T, StorageError>;

/// Shared handle to a per-type data-access object.
pub type DynResourceDao = std::sync::Arc<dyn ResourceDao>;

/// Shared handle to the cross-type data-access object.
pub type DynSystemDao = std::sync::Arc<dyn SystemDao>;
