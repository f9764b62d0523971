//! HQMF export for Measure resources.
//!
//! Produces an HL7 v3 `QualityMeasureDocument` carrying the measure's
//! metadata and one population criteria section per group. Criteria are
//! emitted as references to the CQL definitions that compute them.

use serde_json::Value;

use super::narrative::escape_markup;
use crate::operations::OperationError;

const LOINC_OID: &str = "2.16.840.1.113883.6.1";
const MEASURE_DOCUMENT_CODE: &str = "57024-2";
const HQMF_TEMPLATE: &str = "2.16.840.1.113883.10.20.28.1.2";

/// Maps a FHIR measure-population code to its HQMF criteria element.
fn criteria_element(code: &str) -> Option<&'static str> {
    match code {
        "initial-population" => Some("initialPopulationCriteria"),
        "denominator" => Some("denominatorCriteria"),
        "denominator-exclusion" => Some("denominatorExclusionCriteria"),
        "denominator-exception" => Some("denominatorExceptionCriteria"),
        "numerator" => Some("numeratorCriteria"),
        "numerator-exclusion" => Some("numeratorExclusionCriteria"),
        "measure-population" => Some("measurePopulationCriteria"),
        "measure-population-exclusion" => Some("measurePopulationExclusionCriteria"),
        "measure-observation" => Some("measureObservationDefinition"),
        _ => None,
    }
}

#[derive(Debug, Clone, Copy, Default)]
pub struct HqmfGenerator;

impl HqmfGenerator {
    pub fn new() -> Self {
        Self
    }

    pub fn generate(&self, measure: &Value) -> Result<String, OperationError> {
        let id = measure
            .get("id")
            .and_then(Value::as_str)
            .ok_or_else(|| OperationError::Unprocessable("Measure has no id".into()))?;
        let text = |key: &str| measure.get(key).and_then(Value::as_str);
        let title = text("title").or_else(|| text("name")).unwrap_or(id);

        let mut xml = String::from("<?xml version=\"1.0\" encoding=\"UTF-8\"?>\n");
        xml.push_str(
            "<QualityMeasureDocument xmlns=\"urn:hl7-org:v3\" classCode=\"CONTAINER\" moodCode=\"EVN\">\n",
        );
        xml.push_str("  <typeId root=\"2.16.840.1.113883.1.3\" extension=\"POCD_HD000040\"/>\n");
        xml.push_str(&format!(
            "  <templateId><item root=\"{HQMF_TEMPLATE}\" extension=\"2019-05-01\"/></templateId>\n"
        ));
        xml.push_str(&format!("  <id root=\"{}\"/>\n", escape_markup(id)));
        xml.push_str(&format!(
            "  <code code=\"{MEASURE_DOCUMENT_CODE}\" codeSystem=\"{LOINC_OID}\"/>\n"
        ));
        xml.push_str(&format!("  <title value=\"{}\"/>\n", escape_markup(title)));
        if let Some(description) = text("description") {
            xml.push_str(&format!("  <text value=\"{}\"/>\n", escape_markup(description)));
        }
        let status = match text("status") {
            Some("active") => "COMPLETED",
            Some("retired") => "OBSOLETE",
            _ => "ACTIVE",
        };
        xml.push_str(&format!("  <statusCode code=\"{status}\"/>\n"));
        if let Some(url) = text("url") {
            xml.push_str(&format!("  <setId root=\"{}\"/>\n", escape_markup(url)));
        }
        if let Some(version) = text("version") {
            xml.push_str(&format!(
                "  <versionNumber value=\"{}\"/>\n",
                escape_markup(version)
            ));
        }
        if let Some(scoring) = measure
            .pointer("/scoring/coding/0/code")
            .and_then(Value::as_str)
        {
            xml.push_str(&format!(
                "  <subjectOf><measureAttribute><code code=\"MSRSCORE\"/><value code=\"{}\"/></measureAttribute></subjectOf>\n",
                escape_markup(&scoring.to_ascii_uppercase())
            ));
        }
        for library in measure
            .get("library")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter_map(Value::as_str)
        {
            xml.push_str(&format!(
                "  <relatedDocument typeCode=\"COMP\"><expressionDocument><text mediaType=\"text/cql\"><reference value=\"{}\"/></text></expressionDocument></relatedDocument>\n",
                escape_markup(library)
            ));
        }

        for (index, group) in measure
            .get("group")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .enumerate()
        {
            xml.push_str("  <component>\n    <populationCriteriaSection>\n");
            xml.push_str(&format!(
                "      <id root=\"{}\" extension=\"PopulationCriteria{}\"/>\n",
                escape_markup(id),
                index + 1
            ));
            for population in group
                .get("population")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
            {
                let code = population
                    .pointer("/code/coding/0/code")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                let Some(element) = criteria_element(code) else {
                    continue;
                };
                let expression = population
                    .pointer("/criteria/expression")
                    .and_then(Value::as_str)
                    .unwrap_or_default();
                xml.push_str(&format!(
                    "      <component><{element}><precondition><criteriaReference><id extension=\"{}\"/></criteriaReference></precondition></{element}></component>\n",
                    escape_markup(expression)
                ));
            }
            xml.push_str("    </populationCriteriaSection>\n  </component>\n");
        }
        xml.push_str("</QualityMeasureDocument>\n");
        Ok(xml)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_generate_document() {
        let measure = json!({
            "resourceType": "Measure",
            "id": "bcs",
            "url": "http://example.org/Measure/bcs",
            "version": "1.0",
            "title": "Screening & Follow-up",
            "status": "active",
            "library": ["http://example.org/Library/BCS"],
            "scoring": {"coding": [{"code": "proportion"}]},
            "group": [{"population": [
                {"code": {"coding": [{"code": "initial-population"}]}, "criteria": {"expression": "Initial Population"}},
                {"code": {"coding": [{"code": "numerator"}]}, "criteria": {"expression": "Numerator"}},
                {"code": {"coding": [{"code": "unknown"}]}, "criteria": {"expression": "Ignored"}}
            ]}]
        });
        let xml = HqmfGenerator::new().generate(&measure).unwrap();
        assert!(xml.starts_with("<?xml"));
        assert!(xml.contains("<title value=\"Screening &amp; Follow-up\"/>"));
        assert!(xml.contains("<statusCode code=\"COMPLETED\"/>"));
        assert!(xml.contains("<value code=\"PROPORTION\"/>"));
        assert!(xml.contains("<initialPopulationCriteria>"));
        assert!(xml.contains("<id extension=\"Numerator\"/>"));
        assert!(!xml.contains("Ignored"));
    }

    #[test]
    fn test_measure_without_id() {
        let err = HqmfGenerator::new()
            .generate(&json!({"resourceType": "Measure"}))
            .unwrap_err();
        assert!(matches!(err, OperationError::Unprocessable(_)));
    }
}
