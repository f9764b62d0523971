//! Operation bindings.
//!
//! An [`OperationDefinition`] describes where an operation can be invoked:
//! at system level (`/$code`), type level (`/{type}/$code`) and/or instance
//! level (`/{type}/{id}/$code`).

use std::fmt;

use octofhir_core::ResourceType;

/// Invocation level of a FHIR operation.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub enum OperationLevel {
    System,
    Type,
    Instance,
}

impl OperationLevel {
    pub fn as_str(&self) -> &'static str {
        match self {
            OperationLevel::System => "system",
            OperationLevel::Type => "type",
            OperationLevel::Instance => "instance",
        }
    }
}

impl fmt::Display for OperationLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Describes one operation exposed by a provider.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct OperationDefinition {
    /// The code used to invoke this operation, without the `$` prefix
    pub code: String,
    /// The resource type for type and instance invocations
    pub resource_type: Option<ResourceType>,
    pub system: bool,
    pub type_level: bool,
    pub instance: bool,
    /// Whether this operation writes to storage
    pub affects_state: bool,
}

impl OperationDefinition {
    /// A system-level operation.
    pub fn system(code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            resource_type: None,
            system: true,
            type_level: false,
            instance: false,
            affects_state: false,
        }
    }

    /// An operation on `resource_type`; choose levels with
    /// [`at_type`](Self::at_type) and [`at_instance`](Self::at_instance).
    pub fn on(resource_type: ResourceType, code: impl Into<String>) -> Self {
        Self {
            code: code.into(),
            resource_type: Some(resource_type),
            system: false,
            type_level: false,
            instance: false,
            affects_state: false,
        }
    }

    pub fn at_system(mut self) -> Self {
        self.system = true;
        self
    }

    pub fn at_type(mut self) -> Self {
        self.type_level = true;
        self
    }

    pub fn at_instance(mut self) -> Self {
        self.instance = true;
        self
    }

    pub fn affecting_state(mut self) -> Self {
        self.affects_state = true;
        self
    }

    pub fn levels(&self) -> Vec<OperationLevel> {
        let mut levels = Vec::with_capacity(3);
        if self.system {
            levels.push(OperationLevel::System);
        }
        if self.type_level && self.resource_type.is_some() {
            levels.push(OperationLevel::Type);
        }
        if self.instance && self.resource_type.is_some() {
            levels.push(OperationLevel::Instance);
        }
        levels
    }

    /// Keys under which the registry indexes this operation.
    pub fn keys(&self) -> Vec<OperationKey> {
        self.levels()
            .into_iter()
            .map(|level| OperationKey {
                level,
                resource_type: match level {
                    OperationLevel::System => None,
                    _ => self.resource_type,
                },
                code: self.code.clone(),
            })
            .collect()
    }

    /// Canonical URL advertised in the CapabilityStatement.
    pub fn url(&self) -> String {
        match self.resource_type {
            Some(rt) => format!("http://octofhir.io/OperationDefinition/{rt}-{}", self.code),
            None => format!("http://octofhir.io/OperationDefinition/{}", self.code),
        }
    }
}

/// Dispatch key: level, resource type (absent at system level) and code.
#[derive(Debug, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
pub struct OperationKey {
    pub level: OperationLevel,
    pub resource_type: Option<ResourceType>,
    pub code: String,
}

impl OperationKey {
    pub fn new(level: OperationLevel, resource_type: Option<ResourceType>, code: &str) -> Self {
        Self {
            level,
            resource_type: if level == OperationLevel::System {
                None
            } else {
                resource_type
            },
            code: code.trim_start_matches('$').to_string(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_levels_and_keys() {
        let def = OperationDefinition::on(ResourceType::ValueSet, "updateCodeSystems")
            .at_system()
            .at_instance()
            .affecting_state();
        assert_eq!(
            def.levels(),
            vec![OperationLevel::System, OperationLevel::Instance]
        );
        let keys = def.keys();
        assert_eq!(keys[0], OperationKey::new(OperationLevel::System, None, "updateCodeSystems"));
        assert_eq!(
            keys[1],
            OperationKey::new(
                OperationLevel::Instance,
                Some(ResourceType::ValueSet),
                "$updateCodeSystems"
            )
        );
    }

    #[test]
    fn test_system_key_ignores_type() {
        let key = OperationKey::new(OperationLevel::System, Some(ResourceType::Library), "cql");
        assert_eq!(key.resource_type, None);
        assert_eq!(
            OperationDefinition::system("cql").url(),
            "http://octofhir.io/OperationDefinition/cql"
        );
    }
}
