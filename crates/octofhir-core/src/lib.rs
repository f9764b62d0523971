pub mod error;
pub mod fhir;
pub mod fhir_reference;
pub mod id;
pub mod time;

pub use error::{CoreError, Result};
pub use fhir::{FhirVersion, ResourceType};
pub use fhir_reference::{FhirReference, canonical_tail, parse_reference, split_canonical};
pub use id::{IdError, generate_id, validate_id};
pub use time::{FhirDateTime, now_utc};
