//! `$cql`: evaluates a bare CQL expression.
//!
//! The expression is wrapped in a generated library (`define "Expression"`)
//! that includes any libraries named by the `library` parameter, and is
//! evaluated through the shared [`EvaluationProviderFactory`].
//!
//! # Example
//!
//! ```text
//! POST /fhir/$cql
//! {
//!   "resourceType": "Parameters",
//!   "parameter": [
//!     { "name": "code", "valueString": "Count([Encounter])" },
//!     { "name": "patientId", "valueString": "123" },
//!     { "name": "periodStart", "valueDate": "2024-01-01" },
//!     { "name": "periodEnd", "valueDate": "2024-12-31" }
//!   ]
//! }
//! ```
//!
//! The response is a `collection` Bundle with one Parameters entry (`name`,
//! `value`, `resultType`) per evaluated expression.

use std::sync::Arc;

use async_trait::async_trait;
use indexmap::IndexMap;
use octofhir_api::{Bundle, BundleEntry};
use octofhir_core::canonical_tail;
use octofhir_cql_service::library::ADHOC_EXPRESSION;
use octofhir_cql_service::{
    EvaluationContext, EvaluationProviderFactory, EvaluationRequest, LibraryInclude, LibrarySource,
};
use serde_json::{Value, json};
use time::macros::format_description;
use time::{Date, Month, OffsetDateTime};

use super::library::{LibraryOperationsProvider, LibraryResolver};
use crate::operations::{
    OperationDefinition, OperationError, OperationProvider, OperationTarget, Parameters, parts_of,
};

pub const CODE: &str = "cql";
pub const MEASUREMENT_PERIOD: &str = "Measurement Period";

/// Closed evaluation period given as FHIR dates or dateTimes.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct MeasurementPeriod {
    pub start: String,
    pub end: String,
}

impl MeasurementPeriod {
    pub fn parse(start: &str, end: &str) -> Result<Self, OperationError> {
        if instant(start)? > instant(end)? {
            return Err(OperationError::InvalidParameters(format!(
                "period start {start} is after period end {end}"
            )));
        }
        Ok(Self {
            start: start.to_string(),
            end: end.to_string(),
        })
    }

    /// Reads a period from two parameters; both or neither must be present.
    pub fn from_params(
        params: &Parameters,
        start: &str,
        end: &str,
    ) -> Result<Option<Self>, OperationError> {
        match (params.string(start), params.string(end)) {
            (Some(s), Some(e)) => Self::parse(&s, &e).map(Some),
            (None, None) => Ok(None),
            _ => Err(OperationError::InvalidParameters(format!(
                "'{start}' and '{end}' must be given together"
            ))),
        }
    }

    pub fn to_value(&self) -> Value {
        json!({"start": self.start, "end": self.end})
    }
}

/// Start instant of a FHIR `date` (`YYYY`, `YYYY-MM`, `YYYY-MM-DD`) or
/// `dateTime`.
fn instant(value: &str) -> Result<OffsetDateTime, OperationError> {
    let invalid = || OperationError::InvalidParameters(format!("'{value}' is not a valid date"));
    if value.contains('T') {
        return OffsetDateTime::parse(value, &time::format_description::well_known::Rfc3339)
            .map_err(|_| invalid());
    }
    let date = match value.len() {
        4 => {
            let year: i32 = value.parse().map_err(|_| invalid())?;
            Date::from_calendar_date(year, Month::January, 1).map_err(|_| invalid())?
        }
        7 => {
            let (year, month) = value.split_once('-').ok_or_else(invalid)?;
            let year: i32 = year.parse().map_err(|_| invalid())?;
            let month: u8 = month.parse().map_err(|_| invalid())?;
            let month = Month::try_from(month).map_err(|_| invalid())?;
            Date::from_calendar_date(year, month, 1).map_err(|_| invalid())?
        }
        _ => Date::parse(value, format_description!("[year]-[month]-[day]")).map_err(|_| invalid())?,
    };
    Ok(date.midnight().assume_utc())
}

/// One result as a Parameters resource: `name`, `value` and `resultType`.
pub fn result_parameters(name: &str, value: &Value) -> Value {
    let params = Parameters::new().with_string("name", name);
    let (params, result_type) = match value {
        Value::Null => (params, "Null".to_string()),
        Value::Bool(b) => (params.with_value("value", "valueBoolean", json!(b)), "Boolean".into()),
        Value::Number(n) if n.is_i64() || n.is_u64() => (
            params.with_value("value", "valueInteger", value.clone()),
            "Integer".into(),
        ),
        Value::Number(_) => (
            params.with_value("value", "valueDecimal", value.clone()),
            "Decimal".into(),
        ),
        Value::String(s) => (params.with_string("value", s.as_str()), "String".into()),
        Value::Object(obj) => match obj.get("resourceType").and_then(Value::as_str) {
            Some(rt) => (params.with_resource("value", value.clone()), rt.to_string()),
            None => (params.with_string("value", value.to_string()), "Tuple".into()),
        },
        Value::Array(_) => (params.with_string("value", value.to_string()), "List".into()),
    };
    params.with_string("resultType", result_type).into_value()
}

pub struct CqlExecutionProvider {
    libraries: Arc<LibraryOperationsProvider>,
    factory: EvaluationProviderFactory,
}

impl CqlExecutionProvider {
    pub fn new(libraries: Arc<LibraryOperationsProvider>, factory: EvaluationProviderFactory) -> Self {
        Self { libraries, factory }
    }

    pub fn resolver(&self) -> &LibraryResolver {
        self.libraries.resolver()
    }

    pub fn factory(&self) -> &EvaluationProviderFactory {
        &self.factory
    }

    /// Evaluates one expression for an optional patient and returns its
    /// value. `includes` must name libraries stored on this server.
    pub async fn evaluate_in_context(
        &self,
        expression: &str,
        patient_id: Option<&str>,
        includes: &[LibraryInclude],
        parameters: IndexMap<String, Value>,
    ) -> Result<Value, OperationError> {
        let source = LibrarySource::adhoc(
            expression,
            self.factory.fhir_version(),
            patient_id.is_some(),
            includes,
        );
        let dependencies = self
            .resolver()
            .resolve_includes(includes, &source.name)
            .await?;
        let mut request = EvaluationRequest::new(source)
            .with_dependencies(dependencies)
            .with_expressions([ADHOC_EXPRESSION.to_string()])
            .with_context(patient_id.map(EvaluationContext::patient));
        request.parameters = parameters;
        let mut result = self.factory.evaluate(&request).await?;
        Ok(result
            .expressions
            .shift_remove(ADHOC_EXPRESSION)
            .unwrap_or(Value::Null))
    }

    /// Includes named by `library` parameters (parts `url` and/or `name`).
    async fn library_includes(&self, params: &Parameters) -> Result<Vec<LibraryInclude>, OperationError> {
        let mut includes = Vec::new();
        for entry in params.entries_named("library") {
            let parts = parts_of(entry);
            let alias = parts.string("name");
            let include = match (parts.string("url"), alias.as_deref()) {
                (Some(url), _) => {
                    let source = self.resolver().by_canonical(&url).await?;
                    LibraryInclude {
                        name: source.name.clone(),
                        version: source.version.clone(),
                        alias: alias.clone().or_else(|| Some(canonical_tail(&url).to_string())),
                    }
                }
                (None, Some(name)) => {
                    let source = self.resolver().by_name(name, None).await?;
                    LibraryInclude {
                        name: source.name.clone(),
                        version: source.version.clone(),
                        alias: alias.clone(),
                    }
                }
                (None, None) => {
                    return Err(OperationError::InvalidParameters(
                        "'library' needs a 'url' or 'name' part".into(),
                    ));
                }
            };
            includes.push(include);
        }
        Ok(includes)
    }

    async fn execute(&self, params: &Parameters) -> Result<Value, OperationError> {
        let code = params.required_string("code")?;
        let patient_id = params
            .string("patientId")
            .map(|p| p.trim_start_matches("Patient/").to_string());

        let mut parameters = IndexMap::new();
        if let Some(period) = MeasurementPeriod::from_params(params, "periodStart", "periodEnd")? {
            parameters.insert(MEASUREMENT_PERIOD.to_string(), period.to_value());
        }
        if let Some(nested) = params.resource("parameters") {
            let nested = Parameters::from_value(nested.clone());
            for entry in nested.entries() {
                if let Some(name) = entry.get("name").and_then(Value::as_str) {
                    let value = nested.get(name).cloned().unwrap_or(Value::Null);
                    parameters.insert(name.to_string(), value);
                }
            }
        }
        let includes = self.library_includes(params).await?;

        let value = self
            .evaluate_in_context(&code, patient_id.as_deref(), &includes, parameters)
            .await?;
        let entries = vec![BundleEntry::resource(result_parameters(ADHOC_EXPRESSION, &value))];
        Ok(Bundle::collection(entries).to_value())
    }
}

#[async_trait]
impl OperationProvider for CqlExecutionProvider {
    fn name(&self) -> &'static str {
        "cql-execution"
    }

    fn operations(&self) -> Vec<OperationDefinition> {
        vec![OperationDefinition::system(CODE)]
    }

    async fn invoke(
        &self,
        code: &str,
        target: &OperationTarget,
        params: &Parameters,
    ) -> Result<Value, OperationError> {
        match target {
            OperationTarget::System => self.execute(params).await,
            _ => Err(OperationError::unsupported(code, target)),
        }
    }
}
