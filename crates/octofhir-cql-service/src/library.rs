//! CQL library sources.
//!
//! `Library` resources carry their CQL as base64 `content` attachments with
//! content type `text/cql`. This module decodes that content and reads the
//! library header (`library`, `using` and `include` declarations), which is
//! all the server needs to resolve dependencies without an engine.

use base64::Engine as _;
use base64::engine::general_purpose::STANDARD;
use octofhir_core::FhirVersion;
use serde_json::Value;

use crate::error::{CqlError, CqlResult};

pub const CQL_CONTENT_TYPE: &str = "text/cql";

/// Name of the single definition in libraries built around a bare expression.
pub const ADHOC_EXPRESSION: &str = "Expression";

/// Decoded CQL source of one library.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibrarySource {
    pub name: String,
    pub version: Option<String>,
    pub cql: String,
}

impl LibrarySource {
    pub fn new(name: impl Into<String>, version: Option<String>, cql: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            version,
            cql: cql.into(),
        }
    }

    /// `name` or `name|version`.
    pub fn identifier(&self) -> String {
        match &self.version {
            Some(v) => format!("{}|{}", self.name, v),
            None => self.name.clone(),
        }
    }

    /// Decodes the `text/cql` attachment of a Library resource.
    ///
    /// Name and version come from the CQL header when present, falling back
    /// to the resource's `name` and `version` elements.
    pub fn from_library_resource(library: &Value) -> CqlResult<Self> {
        let label = library
            .get("id")
            .and_then(Value::as_str)
            .unwrap_or("<unsaved>");
        let attachment = library
            .get("content")
            .and_then(Value::as_array)
            .and_then(|items| {
                items.iter().find(|a| {
                    a.get("contentType").and_then(Value::as_str) == Some(CQL_CONTENT_TYPE)
                })
            })
            .ok_or_else(|| {
                CqlError::InvalidLibrary(format!("Library/{label} has no {CQL_CONTENT_TYPE} content"))
            })?;
        let data = attachment
            .get("data")
            .and_then(Value::as_str)
            .ok_or_else(|| {
                CqlError::InvalidLibrary(format!("Library/{label} CQL attachment has no data"))
            })?;
        let bytes = STANDARD
            .decode(data.trim())
            .map_err(|e| CqlError::InvalidLibrary(format!("Library/{label}: {e}")))?;
        let cql = String::from_utf8(bytes)
            .map_err(|e| CqlError::InvalidLibrary(format!("Library/{label}: {e}")))?;

        let header = LibraryHeader::parse(&cql);
        let name = header
            .name
            .or_else(|| library.get("name").and_then(Value::as_str).map(String::from))
            .ok_or_else(|| CqlError::InvalidLibrary(format!("Library/{label} has no name")))?;
        let version = header
            .version
            .or_else(|| library.get("version").and_then(Value::as_str).map(String::from));
        Ok(Self { name, version, cql })
    }

    /// Builds a library around a single expression so it can be evaluated
    /// like any other definition.
    pub fn adhoc(
        expression: &str,
        fhir_version: FhirVersion,
        patient_context: bool,
        includes: &[LibraryInclude],
    ) -> Self {
        let mut cql = String::from("library LocalLibrary\n\n");
        cql.push_str(&format!("using FHIR version '{fhir_version}'\n\n"));
        for include in includes {
            cql.push_str(&include.to_cql());
            cql.push('\n');
        }
        if !includes.is_empty() {
            cql.push('\n');
        }
        let context = if patient_context { "Patient" } else { "Unfiltered" };
        cql.push_str(&format!("context {context}\n\n"));
        cql.push_str(&format!("define \"{ADHOC_EXPRESSION}\":\n  {}\n", expression.trim()));
        Self::new("LocalLibrary", None, cql)
    }
}

/// Encodes CQL text as the base64 `data` of a Library attachment.
pub fn encode_cql(cql: &str) -> String {
    STANDARD.encode(cql.as_bytes())
}

/// An `include` declaration.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LibraryInclude {
    pub name: String,
    pub version: Option<String>,
    pub alias: Option<String>,
}

impl LibraryInclude {
    pub fn to_cql(&self) -> String {
        let mut line = format!("include \"{}\"", self.name);
        if let Some(v) = &self.version {
            line.push_str(&format!(" version '{v}'"));
        }
        line.push_str(&format!(" called \"{}\"", self.alias.as_deref().unwrap_or(&self.name)));
        line
    }
}

/// Declarations at the top of a CQL library.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct LibraryHeader {
    pub name: Option<String>,
    pub version: Option<String>,
    /// `(model, version)` from `using` declarations.
    pub using: Vec<(String, Option<String>)>,
    pub includes: Vec<LibraryInclude>,
    /// Names of `define` statements in source order.
    pub definitions: Vec<String>,
}

impl LibraryHeader {
    pub fn parse(cql: &str) -> Self {
        let mut header = Self::default();
        for line in strip_comments(cql).lines() {
            let tokens = tokenize(line);
            match tokens.first().map(String::as_str) {
                Some("library") => {
                    header.name = tokens.get(1).cloned();
                    header.version = keyword_value(&tokens, "version");
                }
                Some("using") => {
                    if let Some(model) = tokens.get(1) {
                        header
                            .using
                            .push((model.clone(), keyword_value(&tokens, "version")));
                    }
                }
                Some("include") => {
                    if let Some(name) = tokens.get(1) {
                        header.includes.push(LibraryInclude {
                            name: name.clone(),
                            version: keyword_value(&tokens, "version"),
                            alias: keyword_value(&tokens, "called"),
                        });
                    }
                }
                Some("define") => {
                    let mut rest = &tokens[1..];
                    if matches!(rest.first().map(String::as_str), Some("public" | "private")) {
                        rest = &rest[1..];
                    }
                    // Function definitions are not expression results
                    if let Some(name) = rest.first().filter(|n| n.as_str() != "function") {
                        header
                            .definitions
                            .push(name.trim_end_matches(':').to_string());
                    }
                }
                _ => {}
            }
        }
        header
    }
}

fn keyword_value(tokens: &[String], keyword: &str) -> Option<String> {
    tokens
        .iter()
        .position(|t| t == keyword)
        .and_then(|i| tokens.get(i + 1))
        .cloned()
}

/// Removes `//` line comments and `/* */` block comments, keeping quoted text intact.
fn strip_comments(cql: &str) -> String {
    let mut out = String::with_capacity(cql.len());
    let mut chars = cql.chars().peekable();
    let mut quote: Option<char> = None;
    while let Some(c) = chars.next() {
        if let Some(q) = quote {
            out.push(c);
            if c == q {
                quote = None;
            }
            continue;
        }
        match (c, chars.peek()) {
            ('\'' | '"', _) => {
                quote = Some(c);
                out.push(c);
            }
            ('/', Some('/')) => {
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                        break;
                    }
                }
            }
            ('/', Some('*')) => {
                chars.next();
                let mut prev = '\0';
                for next in chars.by_ref() {
                    if next == '\n' {
                        out.push('\n');
                    }
                    if prev == '*' && next == '/' {
                        break;
                    }
                    prev = next;
                }
            }
            _ => out.push(c),
        }
    }
    out
}

/// Splits a declaration into words; quoted identifiers and strings become one
/// token without their quotes.
fn tokenize(line: &str) -> Vec<String> {
    let mut tokens = Vec::new();
    let mut chars = line.trim().chars().peekable();
    while let Some(&c) = chars.peek() {
        if c.is_whitespace() {
            chars.next();
        } else if c == '\'' || c == '"' {
            chars.next();
            let token: String = chars.by_ref().take_while(|&ch| ch != c).collect();
            tokens.push(token);
        } else {
            let mut token = String::new();
            while let Some(&ch) = chars.peek() {
                if ch.is_whitespace() || ch == '\'' || ch == '"' {
                    break;
                }
                token.push(ch);
                chars.next();
            }
            tokens.push(token);
        }
    }
    tokens
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    const CQL: &str = r#"
// Screening measure logic
library "BreastCancerScreening" version '1.0.0'

using FHIR version '4.0.1'

include FHIRHelpers version '4.0.1' called FHIRHelpers
include "Common" called C
/* parameters follow */
parameter "Measurement Period" Interval<DateTime>

context Patient

define "Initial Population":
  AgeInYears() >= 50

define public Denominator:
  "Initial Population"

define function "Helper"(x Integer): x
"#;

    #[test]
    fn test_parse_header() {
        let header = LibraryHeader::parse(CQL);
        assert_eq!(header.name.as_deref(), Some("BreastCancerScreening"));
        assert_eq!(header.version.as_deref(), Some("1.0.0"));
        assert_eq!(header.using, vec![("FHIR".to_string(), Some("4.0.1".to_string()))]);
        assert_eq!(
            header.includes,
            vec![
                LibraryInclude {
                    name: "FHIRHelpers".into(),
                    version: Some("4.0.1".into()),
                    alias: Some("FHIRHelpers".into()),
                },
                LibraryInclude {
                    name: "Common".into(),
                    version: None,
                    alias: Some("C".into()),
                },
            ]
        );
        assert_eq!(header.definitions, vec!["Initial Population", "Denominator"]);
    }

    #[test]
    fn test_decode_library_resource() {
        let library = json!({
            "resourceType": "Library",
            "id": "bcs",
            "name": "Ignored",
            "content": [
                {"contentType": "application/elm+json", "data": "e30="},
                {"contentType": "text/cql", "data": encode_cql(CQL)}
            ]
        });
        let source = LibrarySource::from_library_resource(&library).unwrap();
        assert_eq!(source.name, "BreastCancerScreening");
        assert_eq!(source.identifier(), "BreastCancerScreening|1.0.0");
        assert!(source.cql.contains("define \"Initial Population\""));
    }

    #[test]
    fn test_decode_library_without_cql() {
        let library = json!({"resourceType": "Library", "id": "empty", "content": []});
        let err = LibrarySource::from_library_resource(&library).unwrap_err();
        assert!(matches!(err, CqlError::InvalidLibrary(_)));
    }

    #[test]
    fn test_adhoc_library() {
        let include = LibraryInclude {
            name: "Common".into(),
            version: Some("2.0".into()),
            alias: None,
        };
        let source = LibrarySource::adhoc("Count([Encounter])", FhirVersion::R4, true, &[include]);
        let header = LibraryHeader::parse(&source.cql);
        assert_eq!(header.name.as_deref(), Some("LocalLibrary"));
        assert_eq!(header.includes[0].alias.as_deref(), Some("Common"));
        assert_eq!(header.definitions, vec![ADHOC_EXPRESSION]);
        assert!(source.cql.contains("context Patient"));
    }
}
