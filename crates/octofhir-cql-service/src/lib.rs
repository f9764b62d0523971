//! CQL (Clinical Quality Language) evaluation plumbing for OctoFHIR
//!
//! This crate wires the server's storage and terminology into an external
//! CQL engine:
//! - [`EvaluationProviderFactory`] hands each evaluation a data provider and
//!   the terminology provider
//! - [`LocalTerminologyProvider`] resolves value sets stored on this server
//! - [`CqlEngine`] is the seam an engine implementation plugs into
//! - Library source decoding and header parsing for `Library` resources

pub mod config;
pub mod data_provider;
pub mod engine;
pub mod error;
pub mod evaluation;
pub mod library;
pub mod library_cache;
pub mod terminology_provider;

pub use config::CqlConfig;
pub use data_provider::FhirDataProvider;
pub use engine::{
    CqlEngine, DynCqlEngine, EvaluationContext, EvaluationRequest, EvaluationResult,
    UnavailableEngine,
};
pub use error::{CqlError, CqlResult};
pub use evaluation::EvaluationProviderFactory;
pub use library::{LibraryHeader, LibraryInclude, LibrarySource};
pub use library_cache::LibrarySourceCache;
pub use terminology_provider::{
    Code, DynTerminologyReadService, LocalTerminologyProvider, StoredTerminologyService,
    TerminologyProvider, TerminologyReadService,
};
