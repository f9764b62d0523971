//! Operation parameter extraction and conversion.
//!
//! Operation input arrives either as a GET query string or as a POST body.
//! Both are normalised to a FHIR `Parameters` resource wrapped in
//! [`Parameters`], which also offers typed accessors and builders for
//! operation output.

use serde_json::{Map, Value, json};

use super::handler::OperationError;

/// Operation parameters extracted from an HTTP request.
#[derive(Debug, Clone)]
pub enum OperationParams {
    /// Parameters from query string (GET request); repeated keys are kept
    Get(Vec<(String, String)>),
    /// Parameters from request body (POST request)
    Post(Value),
}

impl OperationParams {
    /// Parses a POST body; an empty body means no parameters.
    pub fn from_body(body: &[u8]) -> Result<Self, OperationError> {
        if body.iter().all(u8::is_ascii_whitespace) {
            return Ok(Self::Post(Value::Null));
        }
        serde_json::from_slice(body)
            .map(Self::Post)
            .map_err(|e| OperationError::InvalidParameters(format!("Invalid JSON: {e}")))
    }

    /// Converts the operation parameters to a FHIR Parameters resource.
    ///
    /// GET query parameters become `valueString` entries. A POST body that is
    /// already a Parameters resource is used as-is; any other resource is
    /// wrapped as the `resource` parameter.
    pub fn into_parameters(self) -> Parameters {
        match self {
            Self::Get(pairs) => {
                let mut params = Parameters::new();
                for (name, value) in pairs {
                    params = params.with_string(name, value);
                }
                params
            }
            Self::Post(Value::Null) => Parameters::new(),
            Self::Post(value) => Parameters::from_value(value),
        }
    }
}

/// A FHIR `Parameters` resource.
#[derive(Debug, Clone, PartialEq)]
pub struct Parameters(Value);

impl Default for Parameters {
    fn default() -> Self {
        Self::new()
    }
}

impl Parameters {
    pub fn new() -> Self {
        Self(json!({"resourceType": "Parameters", "parameter": []}))
    }

    /// Wraps a JSON document; anything but a Parameters resource becomes the
    /// `resource` parameter.
    pub fn from_value(value: Value) -> Self {
        if value.get("resourceType").and_then(Value::as_str) == Some("Parameters") {
            let mut params = Self(value);
            if params.entries().is_empty() {
                params.0["parameter"] = json!([]);
            }
            params
        } else {
            Self::new().with_resource("resource", value)
        }
    }

    pub fn entries(&self) -> &[Value] {
        self.0
            .get("parameter")
            .and_then(Value::as_array)
            .map(Vec::as_slice)
            .unwrap_or(&[])
    }

    fn named<'a, 'b>(&'a self, name: &'b str) -> impl Iterator<Item = &'a Value> + use<'a, 'b> {
        self.entries()
            .iter()
            .filter(move |p| p.get("name").and_then(Value::as_str) == Some(name))
    }

    /// The whole parameter entry (useful for `part`-based parameters).
    pub fn entry(&self, name: &str) -> Option<&Value> {
        self.named(name).next()
    }

    pub fn entries_named<'a>(&'a self, name: &str) -> Vec<&'a Value> {
        self.named(name).collect()
    }

    /// First `value[x]` or `resource` of the named parameter.
    pub fn get(&self, name: &str) -> Option<&Value> {
        self.named(name).find_map(entry_value)
    }

    pub fn get_all(&self, name: &str) -> Vec<&Value> {
        self.named(name).filter_map(entry_value).collect()
    }

    /// String value of any primitive string type (`valueString`, `valueCode`,
    /// `valueUri`, `valueDate`, ...).
    pub fn string(&self, name: &str) -> Option<String> {
        self.get(name).and_then(Value::as_str).map(String::from)
    }

    /// Every value of a repeating string parameter; comma separated values
    /// are split.
    pub fn strings(&self, name: &str) -> Vec<String> {
        self.get_all(name)
            .into_iter()
            .filter_map(Value::as_str)
            .flat_map(|s| s.split(','))
            .map(str::trim)
            .filter(|s| !s.is_empty())
            .map(String::from)
            .collect()
    }

    pub fn bool(&self, name: &str) -> Option<bool> {
        match self.get(name)? {
            Value::Bool(b) => Some(*b),
            Value::String(s) => s.parse().ok(),
            _ => None,
        }
    }

    pub fn resource(&self, name: &str) -> Option<&Value> {
        self.named(name).find_map(|p| p.get("resource"))
    }

    pub fn required_string(&self, name: &str) -> Result<String, OperationError> {
        self.string(name)
            .ok_or_else(|| OperationError::InvalidParameters(format!("parameter '{name}' is required")))
    }

    pub fn required_resource(&self, name: &str) -> Result<&Value, OperationError> {
        self.resource(name)
            .ok_or_else(|| OperationError::InvalidParameters(format!("parameter '{name}' is required")))
    }

    fn push(&mut self, entry: Value) {
        if let Some(list) = self.0.get_mut("parameter").and_then(Value::as_array_mut) {
            list.push(entry);
        }
    }

    pub fn with_string(mut self, name: impl Into<String>, value: impl Into<String>) -> Self {
        self.push(json!({"name": name.into(), "valueString": value.into()}));
        self
    }

    /// Adds a parameter with an explicit `value[x]` key (e.g. `valueInteger`).
    pub fn with_value(mut self, name: impl Into<String>, key: &str, value: Value) -> Self {
        let mut entry = Map::new();
        entry.insert("name".into(), Value::String(name.into()));
        entry.insert(key.to_string(), value);
        self.push(Value::Object(entry));
        self
    }

    pub fn with_resource(mut self, name: impl Into<String>, resource: Value) -> Self {
        self.push(json!({"name": name.into(), "resource": resource}));
        self
    }

    pub fn with_part(mut self, name: impl Into<String>, parts: Parameters) -> Self {
        let part = parts.entries().to_vec();
        self.push(json!({"name": name.into(), "part": part}));
        self
    }

    pub fn as_value(&self) -> &Value {
        &self.0
    }

    pub fn into_value(self) -> Value {
        self.0
    }
}

/// Parameters nested in a `part` list.
pub fn parts_of(entry: &Value) -> Parameters {
    let part = entry.get("part").cloned().unwrap_or_else(|| json!([]));
    Parameters(json!({"resourceType": "Parameters", "parameter": part}))
}

fn entry_value(entry: &Value) -> Option<&Value> {
    entry.as_object().and_then(|obj| {
        obj.iter()
            .find(|(k, _)| k.starts_with("value") || *k == "resource")
            .map(|(_, v)| v)
    })
}
