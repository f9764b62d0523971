//! Measure operations.
//!
//! # Supported operations (all on `Measure/{id}`)
//!
//! - **$evaluate-measure**: evaluates every population criterion of the
//!   measure's primary library for each subject and assembles a
//!   MeasureReport (individual, subject-list or summary)
//! - **$get-narrative**: the generated narrative as a Parameters resource
//! - **$refresh-generated-content**: recomputes `relatedArtifact` and the
//!   narrative and stores the Measure
//! - **$hqmf**: the measure as an HQMF document
//!
//! # Example
//!
//! ```text
//! POST /fhir/Measure/example/$evaluate-measure
//! {
//!   "resourceType": "Parameters",
//!   "parameter": [
//!     { "name": "periodStart", "valueDate": "2024-01-01" },
//!     { "name": "periodEnd", "valueDate": "2024-12-31" },
//!     { "name": "subject", "valueString": "Patient/123" }
//!   ]
//! }
//! ```

use std::collections::BTreeMap;
use std::sync::Arc;

use async_trait::async_trait;
use octofhir_core::{ResourceType, now_utc};
use octofhir_cql_service::{
    EvaluationContext, EvaluationProviderFactory, EvaluationRequest, LibraryHeader,
    LibrarySourceCache,
};
use octofhir_storage::{DaoRegistry, SearchParams};
use serde_json::{Value, json};

use super::ResourceProvider;
use super::cql_execution::{MEASUREMENT_PERIOD, MeasurementPeriod};
use super::hqmf::HqmfGenerator;
use super::library::{LibraryResolver, depends_on, replace_dependencies};
use super::narrative::NarrativeGenerator;
use crate::operations::{
    OperationDefinition, OperationError, OperationProvider, OperationTarget, Parameters,
};

pub const EVALUATE_MEASURE: &str = "evaluate-measure";
pub const GET_NARRATIVE: &str = "get-narrative";
pub const REFRESH_GENERATED_CONTENT: &str = "refresh-generated-content";
pub const HQMF: &str = "hqmf";

/// `reportType` values accepted by `$evaluate-measure`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReportType {
    Individual,
    SubjectList,
    Population,
}

impl ReportType {
    pub fn parse(value: &str) -> Result<Self, OperationError> {
        match value {
            "individual" | "subject" => Ok(Self::Individual),
            "subject-list" => Ok(Self::SubjectList),
            "population" | "summary" => Ok(Self::Population),
            other => Err(OperationError::InvalidParameters(format!(
                "unsupported reportType '{other}'"
            ))),
        }
    }

    /// `MeasureReport.type` for this report.
    pub fn report_code(&self) -> &'static str {
        match self {
            Self::Individual => "individual",
            Self::SubjectList => "subject-list",
            Self::Population => "summary",
        }
    }
}

/// One population of one group, with the subjects that met its criterion.
#[derive(Debug, Clone)]
struct PopulationTally {
    code: Value,
    code_value: String,
    expression: String,
    subjects: Vec<String>,
}

pub struct MeasureOperationsProvider {
    registry: DaoRegistry,
    factory: EvaluationProviderFactory,
    narrative: NarrativeGenerator,
    hqmf: HqmfGenerator,
    libraries: LibraryResolver,
    measures: Arc<ResourceProvider>,
}

impl MeasureOperationsProvider {
    pub fn new(
        registry: DaoRegistry,
        factory: EvaluationProviderFactory,
        narrative: NarrativeGenerator,
        hqmf: HqmfGenerator,
        library_provider: Arc<ResourceProvider>,
        measure_provider: Arc<ResourceProvider>,
    ) -> Self {
        let cache = Arc::new(LibrarySourceCache::new(factory.config().cache_capacity));
        Self {
            registry,
            factory,
            narrative,
            hqmf,
            libraries: LibraryResolver::new(library_provider, cache),
            measures: measure_provider,
        }
    }

    /// Shares a decoded-source cache with other library consumers.
    pub fn with_cache(mut self, cache: Arc<LibrarySourceCache>) -> Self {
        self.libraries = LibraryResolver::new(self.libraries.provider().clone(), cache);
        self
    }

    fn primary_library(measure: &Value) -> Result<&str, OperationError> {
        measure
            .get("library")
            .and_then(Value::as_array)
            .and_then(|libs| libs.first())
            .and_then(Value::as_str)
            .ok_or_else(|| OperationError::Unprocessable("Measure does not reference a library".into()))
    }

    async fn subjects(&self, subject: Option<&str>) -> Result<Vec<String>, OperationError> {
        let patients = self.registry.resource_dao(ResourceType::Patient)?;
        match subject {
            Some(id) => {
                patients.read_required(id).await?;
                Ok(vec![id.to_string()])
            }
            None => Ok(patients
                .search(&SearchParams::new())
                .await?
                .entries
                .into_iter()
                .map(|p| p.id)
                .collect()),
        }
    }

    pub async fn evaluate_measure(&self, id: &str, params: &Parameters) -> Result<Value, OperationError> {
        let measure = self.measures.read(id).await?.resource;
        let period = MeasurementPeriod::from_params(params, "periodStart", "periodEnd")?
            .ok_or_else(|| {
                OperationError::InvalidParameters("'periodStart' and 'periodEnd' are required".into())
            })?;
        let subject = params
            .string("subject")
            .or_else(|| params.string("patient"))
            .map(|s| s.trim_start_matches("Patient/").to_string());
        let report_type = match params.string("reportType") {
            Some(value) => ReportType::parse(&value)?,
            None if subject.is_some() => ReportType::Individual,
            None => ReportType::Population,
        };
        if report_type == ReportType::Individual && subject.is_none() {
            return Err(OperationError::InvalidParameters(
                "an individual report needs a 'subject' or 'patient'".into(),
            ));
        }

        let library = self
            .libraries
            .by_canonical(Self::primary_library(&measure)?)
            .await?;
        let dependencies = self.libraries.dependencies(&library).await?;

        let mut groups: Vec<Vec<PopulationTally>> = measure
            .get("group")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .map(|group| {
                group
                    .get("population")
                    .and_then(Value::as_array)
                    .into_iter()
                    .flatten()
                    .filter_map(|population| {
                        let code = population.get("code")?.clone();
                        let code_value = code.pointer("/coding/0/code")?.as_str()?.to_string();
                        let expression = population
                            .pointer("/criteria/expression")?
                            .as_str()?
                            .to_string();
                        Some(PopulationTally {
                            code,
                            code_value,
                            expression,
                            subjects: Vec::new(),
                        })
                    })
                    .collect()
            })
            .collect();
        let mut expressions: Vec<String> = groups
            .iter()
            .flatten()
            .map(|p| p.expression.clone())
            .collect();
        expressions.sort();
        expressions.dedup();

        let subjects = self.subjects(subject.as_deref()).await?;
        tracing::info!(
            measure = %id,
            library = %library.identifier(),
            subjects = subjects.len(),
            report_type = report_type.report_code(),
            "Evaluating measure"
        );
        for patient in &subjects {
            let request = EvaluationRequest::new(library.as_ref().clone())
                .with_dependencies(dependencies.clone())
                .with_expressions(expressions.clone())
                .with_context(Some(EvaluationContext::patient(patient.clone())))
                .with_parameter(MEASUREMENT_PERIOD, period.to_value());
            let result = self.factory.evaluate(&request).await?;
            for tally in groups.iter_mut().flatten() {
                if result.is_true(&tally.expression) {
                    tally.subjects.push(patient.clone());
                }
            }
        }

        Ok(self.build_report(
            id,
            &measure,
            &period,
            report_type,
            subject.as_deref(),
            &measure_groups(&measure),
            &mut groups,
        ))
    }

    #[allow(clippy::too_many_arguments)]
    fn build_report(
        &self,
        id: &str,
        measure: &Value,
        period: &MeasurementPeriod,
        report_type: ReportType,
        subject: Option<&str>,
        group_ids: &[Option<String>],
        groups: &mut [Vec<PopulationTally>],
    ) -> Value {
        let measure_ref = measure
            .get("url")
            .and_then(Value::as_str)
            .map(String::from)
            .unwrap_or_else(|| format!("Measure/{id}"));
        let mut report = json!({
            "resourceType": "MeasureReport",
            "status": "complete",
            "type": report_type.report_code(),
            "measure": measure_ref,
            "date": now_utc().to_string(),
            "period": period.to_value(),
        });
        if let (ReportType::Individual, Some(s)) = (report_type, subject) {
            report["subject"] = json!({"reference": format!("Patient/{s}")});
        }

        let mut contained = Vec::new();
        let mut report_groups = Vec::new();
        for (g, populations) in groups.iter_mut().enumerate() {
            let mut counts: BTreeMap<&str, usize> = BTreeMap::new();
            let mut report_populations = Vec::new();
            for (p, tally) in populations.iter().enumerate() {
                counts.insert(tally.code_value.as_str(), tally.subjects.len());
                let mut population = json!({"code": tally.code, "count": tally.subjects.len()});
                if report_type == ReportType::SubjectList {
                    let list_id = format!("list-{g}-{p}");
                    contained.push(json!({
                        "resourceType": "List",
                        "id": list_id,
                        "status": "current",
                        "mode": "snapshot",
                        "entry": tally.subjects.iter()
                            .map(|s| json!({"item": {"reference": format!("Patient/{s}")}}))
                            .collect::<Vec<_>>(),
                    }));
                    population["subjectResults"] = json!({"reference": format!("#{list_id}")});
                }
                report_populations.push(population);
            }
            let mut group = json!({"population": report_populations});
            if let Some(Some(group_id)) = group_ids.get(g) {
                group["id"] = json!(group_id);
            }
            if let (Some(numerator), Some(denominator)) =
                (counts.get("numerator"), counts.get("denominator"))
            {
                group["measureScore"] = match proportion(*numerator, *denominator) {
                    Some(score) => json!({"value": score}),
                    None => json!({}),
                };
            }
            report_groups.push(group);
        }
        report["group"] = Value::Array(report_groups);
        if !contained.is_empty() {
            report["contained"] = Value::Array(contained);
        }
        report
    }

    pub async fn refresh_generated_content(&self, id: &str) -> Result<Value, OperationError> {
        let mut measure = self.measures.read(id).await?.resource;
        if let Ok(canonical) = Self::primary_library(&measure) {
            let canonical = canonical.to_string();
            let library = self.libraries.by_canonical(&canonical).await?;
            let mut dependencies = vec![json!({"type": "depends-on", "resource": canonical})];
            dependencies.extend(depends_on(&LibraryHeader::parse(&library.cql).includes));
            replace_dependencies(&mut measure, dependencies);
        }
        let measure = self.narrative.apply(measure);
        Ok(self.measures.update(id, measure).await?.resource)
    }

    pub async fn narrative_of(&self, id: &str) -> Result<Value, OperationError> {
        let measure = self.measures.read(id).await?.resource;
        Ok(Parameters::new()
            .with_string("narrative", self.narrative.render(&measure))
            .into_value())
    }

    pub async fn hqmf_of(&self, id: &str) -> Result<Value, OperationError> {
        let measure = self.measures.read(id).await?.resource;
        Ok(Parameters::new()
            .with_string("hqmf", self.hqmf.generate(&measure)?)
            .into_value())
    }
}

fn measure_groups(measure: &Value) -> Vec<Option<String>> {
    measure
        .get("group")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .map(|g| g.get("id").and_then(Value::as_str).map(String::from))
        .collect()
}

/// `numerator / denominator`, undefined for an empty denominator.
pub fn proportion(numerator: usize, denominator: usize) -> Option<f64> {
    (denominator > 0).then(|| numerator as f64 / denominator as f64)
}

#[async_trait]
impl OperationProvider for MeasureOperationsProvider {
    fn name(&self) -> &'static str {
        "measure-operations"
    }

    fn resource_type(&self) -> Option<ResourceType> {
        Some(ResourceType::Measure)
    }

    fn operations(&self) -> Vec<OperationDefinition> {
        vec![
            OperationDefinition::on(ResourceType::Measure, EVALUATE_MEASURE).at_instance(),
            OperationDefinition::on(ResourceType::Measure, GET_NARRATIVE).at_instance(),
            OperationDefinition::on(ResourceType::Measure, REFRESH_GENERATED_CONTENT)
                .at_instance()
                .affecting_state(),
            OperationDefinition::on(ResourceType::Measure, HQMF).at_instance(),
        ]
    }

    async fn invoke(
        &self,
        code: &str,
        target: &OperationTarget,
        params: &Parameters,
    ) -> Result<Value, OperationError> {
        let OperationTarget::Instance(ResourceType::Measure, id) = target else {
            return Err(OperationError::unsupported(code, target));
        };
        match code {
            EVALUATE_MEASURE => self.evaluate_measure(id, params).await,
            GET_NARRATIVE => self.narrative_of(id).await,
            REFRESH_GENERATED_CONTENT => self.refresh_generated_content(id).await,
            HQMF => self.hqmf_of(id).await,
            _ => Err(OperationError::unsupported(code, target)),
        }
    }
}
