use serde::{Deserialize, Deserializer, Serialize, Serializer};
use serde_json::Value;
use std::fmt;
use std::str::FromStr;

use crate::error::CoreError;

/// FHIR version enumeration
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
pub enum FhirVersion {
    #[default]
    R4,
    R4B,
    R5,
}

impl FhirVersion {
    /// Full semantic version string as used in CQL `using FHIR version '...'`.
    pub fn as_str(&self) -> &'static str {
        match self {
            FhirVersion::R4 => "4.0.1",
            FhirVersion::R4B => "4.3.0",
            FhirVersion::R5 => "5.0.0",
        }
    }
}

impl fmt::Display for FhirVersion {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for FhirVersion {
    type Err = CoreError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s.to_ascii_uppercase().as_str() {
            "4.0.1" | "R4" => Ok(FhirVersion::R4),
            "4.3.0" | "R4B" => Ok(FhirVersion::R4B),
            "5.0.0" | "R5" => Ok(FhirVersion::R5),
            _ => Err(CoreError::invalid_resource_type(format!(
                "Unknown FHIR version: {s}"
            ))),
        }
    }
}

impl Serialize for FhirVersion {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for FhirVersion {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

macro_rules! resource_types {
    ($($variant:ident),+ $(,)?) => {
        /// Resource types known to the clinical reasoning server.
        ///
        /// The set is closed: every data-access object, resource provider and
        /// operation binding is keyed by one of these variants.
        #[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
        pub enum ResourceType {
            $($variant),+
        }

        impl ResourceType {
            pub const ALL: &'static [ResourceType] = &[$(ResourceType::$variant),+];

            pub fn as_str(&self) -> &'static str {
                match self {
                    $(ResourceType::$variant => stringify!($variant)),+
                }
            }
        }

        impl FromStr for ResourceType {
            type Err = CoreError;

            fn from_str(s: &str) -> Result<Self, Self::Err> {
                match s {
                    $(stringify!($variant) => Ok(ResourceType::$variant),)+
                    _ => Err(CoreError::invalid_resource_type(s)),
                }
            }
        }
    };
}

resource_types! {
    ActivityDefinition,
    Bundle,
    CarePlan,
    Claim,
    ClaimResponse,
    CodeSystem,
    Communication,
    CommunicationRequest,
    Condition,
    Coverage,
    DiagnosticReport,
    Encounter,
    Endpoint,
    Library,
    Measure,
    MeasureReport,
    MedicationRequest,
    Observation,
    Organization,
    Patient,
    PlanDefinition,
    Practitioner,
    Procedure,
    RequestGroup,
    ServiceRequest,
    SupplyRequest,
    Task,
    ValueSet,
}

impl ResourceType {
    /// Types served by a dedicated resource provider instead of the generic
    /// CRUD provider registered for every configured type.
    pub fn has_dedicated_provider(&self) -> bool {
        matches!(self, ResourceType::Patient | ResourceType::Claim)
    }

    /// Reads the `resourceType` element of a JSON resource.
    pub fn of(resource: &Value) -> Result<Self, CoreError> {
        let name = resource
            .get("resourceType")
            .and_then(Value::as_str)
            .ok_or_else(|| CoreError::invalid_resource("missing resourceType"))?;
        name.parse()
    }
}

impl fmt::Display for ResourceType {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl Serialize for ResourceType {
    fn serialize<S: Serializer>(&self, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(self.as_str())
    }
}

impl<'de> Deserialize<'de> for ResourceType {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_resource_type_round_trip_names() {
        for rt in ResourceType::ALL {
            assert_eq!(rt.as_str().parse::<ResourceType>().unwrap(), *rt);
        }
    }

    #[test]
    fn test_unknown_resource_type() {
        let err = "Unicorn".parse::<ResourceType>().unwrap_err();
        assert!(matches!(err, CoreError::InvalidResourceType(_)));
    }

    #[test]
    fn test_resource_type_of_value() {
        let patient = json!({"resourceType": "Patient", "id": "p1"});
        assert_eq!(ResourceType::of(&patient).unwrap(), ResourceType::Patient);
        assert!(ResourceType::of(&json!({"id": "x"})).is_err());
    }

    #[test]
    fn test_dedicated_providers() {
        assert!(ResourceType::Patient.has_dedicated_provider());
        assert!(ResourceType::Claim.has_dedicated_provider());
        assert!(!ResourceType::Library.has_dedicated_provider());
    }

    #[test]
    fn test_fhir_version_parse() {
        assert_eq!("R4".parse::<FhirVersion>().unwrap(), FhirVersion::R4);
        assert_eq!("4.0.1".parse::<FhirVersion>().unwrap(), FhirVersion::R4);
        assert_eq!(FhirVersion::R5.to_string(), "5.0.0");
        assert!("R2".parse::<FhirVersion>().is_err());
    }

    #[test]
    fn test_resource_type_serde() {
        let v = serde_json::to_value(ResourceType::PlanDefinition).unwrap();
        assert_eq!(v, json!("PlanDefinition"));
        let rt: ResourceType = serde_json::from_value(json!("ValueSet")).unwrap();
        assert_eq!(rt, ResourceType::ValueSet);
    }
}
