//! Generated narrative for knowledge artifacts.
//!
//! Library and Measure resources get an XHTML `text` element summarising
//! their metadata, dependencies and (for measures) population criteria.

use serde_json::{Value, json};

const XHTML_NS: &str = "http://www.w3.org/1999/xhtml";

#[derive(Debug, Clone, Copy, Default)]
pub struct NarrativeGenerator;

impl NarrativeGenerator {
    pub fn new() -> Self {
        Self
    }

    /// Narrative `div` markup for a knowledge artifact.
    pub fn render(&self, resource: &Value) -> String {
        let resource_type = str_of(resource, "resourceType").unwrap_or("Resource");
        let title = str_of(resource, "title")
            .or_else(|| str_of(resource, "name"))
            .or_else(|| str_of(resource, "id"))
            .unwrap_or("Untitled");

        let mut html = format!("<div xmlns=\"{XHTML_NS}\">");
        html.push_str(&format!("<h2>{}: {}</h2>", resource_type, escape_markup(title)));

        let mut rows = Vec::new();
        for (label, key) in [
            ("Name", "name"),
            ("URL", "url"),
            ("Version", "version"),
            ("Status", "status"),
        ] {
            if let Some(value) = str_of(resource, key) {
                rows.push((label, value.to_string()));
            }
        }
        if let Some(scoring) = resource
            .pointer("/scoring/coding/0/code")
            .and_then(Value::as_str)
        {
            rows.push(("Scoring", scoring.to_string()));
        }
        if !rows.is_empty() {
            html.push_str("<table>");
            for (label, value) in rows {
                html.push_str(&format!(
                    "<tr><th>{label}</th><td>{}</td></tr>",
                    escape_markup(&value)
                ));
            }
            html.push_str("</table>");
        }

        if let Some(description) = str_of(resource, "description") {
            html.push_str(&format!("<p>{}</p>", escape_markup(description)));
        }

        let dependencies: Vec<&str> = resource
            .get("relatedArtifact")
            .and_then(Value::as_array)
            .into_iter()
            .flatten()
            .filter(|a| str_of(a, "type") == Some("depends-on"))
            .filter_map(|a| str_of(a, "resource"))
            .collect();
        if !dependencies.is_empty() {
            html.push_str("<h3>Dependencies</h3><ul>");
            for dependency in dependencies {
                html.push_str(&format!("<li>{}</li>", escape_markup(dependency)));
            }
            html.push_str("</ul>");
        }

        let populations = population_criteria(resource);
        if !populations.is_empty() {
            html.push_str("<h3>Population Criteria</h3><ul>");
            for (code, expression) in populations {
                html.push_str(&format!(
                    "<li>{}: {}</li>",
                    escape_markup(&code),
                    escape_markup(&expression)
                ));
            }
            html.push_str("</ul>");
        }

        html.push_str("</div>");
        html
    }

    /// The `text` element for a resource.
    pub fn narrative(&self, resource: &Value) -> Value {
        json!({"status": "generated", "div": self.render(resource)})
    }

    /// Returns the resource with its `text` replaced by a generated narrative.
    pub fn apply(&self, mut resource: Value) -> Value {
        let text = self.narrative(&resource);
        if let Some(obj) = resource.as_object_mut() {
            obj.insert("text".into(), text);
        }
        resource
    }
}

/// `(population code, criteria expression)` for every group of a Measure.
pub(crate) fn population_criteria(measure: &Value) -> Vec<(String, String)> {
    measure
        .get("group")
        .and_then(Value::as_array)
        .into_iter()
        .flatten()
        .flat_map(|group| {
            group
                .get("population")
                .and_then(Value::as_array)
                .into_iter()
                .flatten()
        })
        .filter_map(|population| {
            let code = population
                .pointer("/code/coding/0/code")
                .and_then(Value::as_str)?;
            let expression = population
                .pointer("/criteria/expression")
                .and_then(Value::as_str)?;
            Some((code.to_string(), expression.to_string()))
        })
        .collect()
}

/// Escapes text for XHTML and XML output.
pub(crate) fn escape_markup(text: &str) -> String {
    let mut out = String::with_capacity(text.len());
    for c in text.chars() {
        match c {
            '&' => out.push_str("&amp;"),
            '<' => out.push_str("&lt;"),
            '>' => out.push_str("&gt;"),
            '"' => out.push_str("&quot;"),
            '\'' => out.push_str("&apos;"),
            _ => out.push(c),
        }
    }
    out
}

fn str_of<'a>(value: &'a Value, key: &str) -> Option<&'a str> {
    value.get(key).and_then(Value::as_str)
}
