mod common;

use common::{StubEngine, context, start_server};
use octofhir_cql_service::LibraryHeader;
use octofhir_cql_service::library::encode_cql;
use octofhir_server::{AppConfig, ApplicationContext};
use reqwest::StatusCode;
use serde_json::{Value, json};

struct TestServer {
    base: String,
    client: reqwest::Client,
    shutdown: Option<tokio::sync::oneshot::Sender<()>>,
    handle: Option<tokio::task::JoinHandle<()>>,
}

impl TestServer {
    async fn start(engine: StubEngine) -> Self {
        let config = AppConfig::default();
        let ctx = context(&config, engine);
        Self::with_context(config, ctx).await
    }

    async fn with_context(config: AppConfig, ctx: ApplicationContext) -> Self {
        let (base, shutdown, handle) = start_server(config, ctx).await;
        Self {
            base,
            client: reqwest::Client::new(),
            shutdown: Some(shutdown),
            handle: Some(handle),
        }
    }

    fn url(&self, path: &str) -> String {
        format!("{}/fhir/{}", self.base, path.trim_start_matches('/'))
    }

    async fn get(&self, path: &str) -> (StatusCode, Value) {
        let resp = self.client.get(self.url(path)).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn post(&self, path: &str, body: Value) -> (StatusCode, Value) {
        let resp = self.client.post(self.url(path)).json(&body).send().await.unwrap();
        let status = resp.status();
        (status, resp.json().await.unwrap_or(Value::Null))
    }

    async fn put(&self, path: &str, body: Value) -> Value {
        let resp = self.client.put(self.url(path)).json(&body).send().await.unwrap();
        assert_eq!(resp.status(), StatusCode::OK, "PUT {path}");
        resp.json().await.unwrap()
    }

    async fn stop(mut self) {
        if let Some(tx) = self.shutdown.take() {
            let _ = tx.send(());
        }
        if let Some(handle) = self.handle.take() {
            let _ = handle.await;
        }
    }
}

fn library(id: &str, url: &str, cql: &str) -> Value {
    let header = LibraryHeader::parse(cql);
    let mut library = json!({
        "resourceType": "Library",
        "id": id,
        "url": url,
        "name": header.name,
        "status": "active",
        "content": [{"contentType": "text/cql", "data": encode_cql(cql)}]
    });
    if let Some(version) = header.version {
        library["version"] = json!(version);
    }
    library
}

/// `value[x]` of the named output parameter.
fn output<'a>(params: &'a Value, name: &str) -> Option<&'a Value> {
    params["parameter"]
        .as_array()?
        .iter()
        .find(|p| p["name"] == name)
        .and_then(|p| {
            p.as_object()?
                .iter()
                .find(|(k, _)| k.starts_with("value") || k.as_str() == "resource")
                .map(|(_, v)| v)
        })
}

fn population_count(report: &Value, group: usize, code: &str) -> u64 {
    report["group"][group]["population"]
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["code"]["coding"][0]["code"] == code)
        .and_then(|p| p["count"].as_u64())
        .unwrap_or_else(|| panic!("no {code} population"))
}

#[tokio::test]
async fn root_health_and_metadata() {
    let server = TestServer::start(StubEngine::default()).await;

    let resp = server.client.get(format!("{}/", server.base)).send().await.unwrap();
    assert_eq!(resp.status(), StatusCode::OK);
    assert!(resp.headers().contains_key("x-request-id"));
    let body: Value = resp.json().await.unwrap();
    assert_eq!(body["providers"].as_array().unwrap().len(), 10);

    let resp = server.client.get(format!("{}/healthz", server.base)).send().await.unwrap();
    assert_eq!(resp.json::<Value>().await.unwrap()["status"], "ok");

    let (status, capability) = server.get("metadata").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(capability["resourceType"], "CapabilityStatement");
    assert_eq!(capability["fhirVersion"], "4.0.1");
    let rest = &capability["rest"][0];
    let system_ops: Vec<&str> = rest["operation"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|o| o["name"].as_str())
        .collect();
    assert!(system_ops.contains(&"cql"));
    let measure = rest["resource"]
        .as_array()
        .unwrap()
        .iter()
        .find(|r| r["type"] == "Measure")
        .unwrap();
    assert!(
        measure["operation"]
            .as_array()
            .unwrap()
            .iter()
            .any(|o| o["name"] == "evaluate-measure")
    );

    server.stop().await;
}

#[tokio::test]
async fn crud_and_search() {
    let server = TestServer::start(StubEngine::default()).await;

    let resp = server
        .client
        .post(server.url("Organization"))
        .json(&json!({"resourceType": "Organization", "name": "Acme Health"}))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::CREATED);
    let location = resp.headers()["location"].to_str().unwrap().to_string();
    assert!(location.contains("/fhir/Organization/"));
    let created: Value = resp.json().await.unwrap();
    let id = created["id"].as_str().unwrap().to_string();

    let (status, read) = server.get(&format!("Organization/{id}")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(read["name"], "Acme Health");

    server
        .put(
            "Patient/p1",
            json!({"resourceType": "Patient", "name": [{"family": "Doe"}], "birthDate": "1980-01-01"}),
        )
        .await;
    server
        .put("Patient/p2", json!({"resourceType": "Patient", "name": [{"family": "Roe"}]}))
        .await;

    let (status, bundle) = server.get("Patient?family=Doe").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bundle["type"], "searchset");
    assert_eq!(bundle["total"], 1);
    assert!(
        bundle["entry"][0]["fullUrl"]
            .as_str()
            .unwrap()
            .ends_with("/fhir/Patient/p1")
    );

    let resp = server
        .client
        .delete(server.url("Patient/p2"))
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NO_CONTENT);
    let (status, outcome) = server.get("Patient/p2").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    assert_eq!(outcome["resourceType"], "OperationOutcome");

    let (status, _) = server.get("Spaceship").await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.stop().await;
}

#[tokio::test]
async fn content_negotiation_and_routing_errors() {
    let server = TestServer::start(StubEngine::default()).await;

    let resp = server
        .client
        .get(server.url("metadata"))
        .header("accept", "application/xml")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::NOT_ACCEPTABLE);

    let resp = server
        .client
        .post(server.url("Organization"))
        .header("content-type", "text/plain")
        .body("name=Acme")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.status(), StatusCode::UNSUPPORTED_MEDIA_TYPE);

    let resp = server
        .client
        .get(server.url("metadata"))
        .header("x-request-id", "trace-me")
        .send()
        .await
        .unwrap();
    assert_eq!(resp.headers()["x-request-id"], "trace-me");

    let (status, _) = server.get("$does-not-exist").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    // $evaluate-measure is bound at instance level only
    let (status, _) = server.get("Measure/$evaluate-measure").await;
    assert_eq!(status, StatusCode::NOT_FOUND);
    let (status, _) = server.get("Claim/$submit").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = server.post("Patient/p1", json!({"resourceType": "Patient"})).await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    server.stop().await;
}

#[tokio::test]
async fn cql_expression_evaluation() {
    let server = TestServer::start(StubEngine::default()).await;

    let (status, bundle) = server
        .post(
            "$cql",
            json!({
                "resourceType": "Parameters",
                "parameter": [
                    {"name": "code", "valueString": "true"},
                    {"name": "patientId", "valueString": "Patient/p1"},
                    {"name": "periodStart", "valueDate": "2024-01-01"},
                    {"name": "periodEnd", "valueDate": "2024-12-31"}
                ]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(bundle["type"], "collection");
    let result = &bundle["entry"][0]["resource"];
    assert_eq!(output(result, "name"), Some(&json!("Expression")));
    assert_eq!(output(result, "value"), Some(&json!(true)));
    assert_eq!(output(result, "resultType"), Some(&json!("Boolean")));

    let (status, bundle) = server.get("$cql?code=%27hello%27").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(output(&bundle["entry"][0]["resource"], "value"), Some(&json!("hello")));

    // includes resolve against stored libraries
    server
        .put(
            "Library/common",
            library("common", "http://example.org/Library/Common", "library Common version '1.0'"),
        )
        .await;
    let with_library = |url: &str| {
        json!({
            "resourceType": "Parameters",
            "parameter": [
                {"name": "code", "valueString": "42"},
                {"name": "library", "part": [
                    {"name": "url", "valueUri": url},
                    {"name": "name", "valueString": "C"}
                ]}
            ]
        })
    };
    let (status, bundle) = server
        .post("$cql", with_library("http://example.org/Library/Common"))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(output(&bundle["entry"][0]["resource"], "value"), Some(&json!(42)));
    let (status, _) = server
        .post("$cql", with_library("http://example.org/Library/Missing"))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    let (status, _) = server
        .post("$cql", json!({"resourceType": "Parameters", "parameter": []}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    server.stop().await;
}

#[tokio::test]
async fn cql_without_engine_is_not_implemented() {
    let config = AppConfig::default();
    let ctx = ApplicationContext::in_memory(&config);
    let server = TestServer::with_context(config, ctx).await;

    let (status, outcome) = server.get("$cql?code=1").await;
    assert_eq!(status, StatusCode::NOT_IMPLEMENTED);
    assert_eq!(outcome["resourceType"], "OperationOutcome");

    server.stop().await;
}

#[tokio::test]
async fn update_code_systems_from_value_set() {
    let server = TestServer::start(StubEngine::default()).await;
    server
        .put(
            "ValueSet/vs1",
            json!({
                "resourceType": "ValueSet",
                "id": "vs1",
                "compose": {"include": [
                    {"system": "http://example.org/cs", "concept": [{"code": "a"}, {"code": "b", "display": "Bee"}]},
                    {"valueSet": ["http://example.org/vs/other"]}
                ]}
            }),
        )
        .await;

    let (status, outcome) = server
        .post("ValueSet/vs1/$updateCodeSystems", json!({"resourceType": "Parameters"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(outcome["resourceType"], "OperationOutcome");
    let severities: Vec<&str> = outcome["issue"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|i| i["severity"].as_str())
        .collect();
    assert_eq!(severities, vec!["information", "warning"]);

    let (_, bundle) = server.get("CodeSystem?url=http://example.org/cs").await;
    assert_eq!(bundle["total"], 1);
    let code_system = &bundle["entry"][0]["resource"];
    assert_eq!(code_system["content"], "fragment");
    assert_eq!(code_system["concept"].as_array().unwrap().len(), 2);

    // system level processes every ValueSet; nothing new to add
    let (status, outcome) = server
        .post("$updateCodeSystems", json!({"resourceType": "Parameters"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        outcome["issue"][0]["diagnostics"]
            .as_str()
            .unwrap()
            .contains("already contains")
    );

    server.stop().await;
}

#[tokio::test]
async fn library_generated_content() {
    let server = TestServer::start(StubEngine::default()).await;
    server
        .put(
            "Library/common",
            library("common", "http://example.org/Library/Common", "library Common version '1.0'"),
        )
        .await;
    server
        .put(
            "Library/main",
            library(
                "main",
                "http://example.org/Library/Main",
                "library Main version '2.0'\nusing FHIR version '4.0.1'\ninclude Common version '1.0' called C",
            ),
        )
        .await;

    let (status, refreshed) = server
        .post("Library/main/$refresh-generated-content", json!({"resourceType": "Parameters"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(refreshed["relatedArtifact"][0]["type"], "depends-on");
    assert_eq!(refreshed["relatedArtifact"][0]["resource"], "Library/Common|1.0");
    assert_eq!(refreshed["name"], "Main");
    assert_eq!(refreshed["text"]["status"], "generated");

    let (_, stored) = server.get("Library/main").await;
    assert_eq!(stored["relatedArtifact"], refreshed["relatedArtifact"]);

    let (status, narrative) = server.get("Library/main/$get-narrative").await;
    assert_eq!(status, StatusCode::OK);
    assert!(output(&narrative, "narrative").unwrap().as_str().unwrap().contains("Main"));

    let (status, _) = server
        .post("Library/absent/$refresh-generated-content", json!({"resourceType": "Parameters"}))
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.stop().await;
}

#[tokio::test]
async fn bundle_apply_cql() {
    let server = TestServer::start(StubEngine::default()).await;
    let bundle = json!({
        "resourceType": "Bundle",
        "type": "collection",
        "entry": [{"resource": {
            "resourceType": "Observation",
            "status": "final",
            "subject": {"reference": "Patient/p1"},
            "valueString": "placeholder",
            "_valueString": {"extension": [{
                "url": "http://hl7.org/fhir/StructureDefinition/cqf-expression",
                "valueExpression": {"language": "text/cql", "expression": "'computed'"}
            }]}
        }}]
    });

    let (status, applied) = server.post("Bundle/$apply-cql", bundle).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(applied["entry"][0]["resource"]["valueString"], "computed");

    let (status, _) = server
        .post("Bundle/$apply-cql", json!({"resourceType": "Patient"}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    server.stop().await;
}

async fn seed_measure(server: &TestServer) {
    for id in ["p1", "p2", "p3"] {
        server
            .put(&format!("Patient/{id}"), json!({"resourceType": "Patient"}))
            .await;
    }
    server
        .put(
            "Library/measure-logic",
            library(
                "measure-logic",
                "http://example.org/Library/MeasureLogic",
                "library MeasureLogic version '1.0'\nusing FHIR version '4.0.1'\ninclude Common version '1.0'\ndefine \"Initial Population\": true",
            ),
        )
        .await;
    server
        .put(
            "Library/common",
            library("common", "http://example.org/Library/Common", "library Common version '1.0'"),
        )
        .await;
    let population = |code: &str, expression: &str| {
        json!({
            "code": {"coding": [{"system": "http://terminology.hl7.org/CodeSystem/measure-population", "code": code}]},
            "criteria": {"language": "text/cql", "expression": expression}
        })
    };
    server
        .put(
            "Measure/m1",
            json!({
                "resourceType": "Measure",
                "id": "m1",
                "url": "http://example.org/Measure/m1",
                "title": "Screening Rate",
                "status": "active",
                "scoring": {"coding": [{"code": "proportion"}]},
                "library": ["http://example.org/Library/MeasureLogic"],
                "group": [{
                    "id": "g1",
                    "population": [
                        population("initial-population", "Initial Population"),
                        population("denominator", "Denominator"),
                        population("numerator", "Numerator")
                    ]
                }]
            }),
        )
        .await;
}

fn measure_engine() -> StubEngine {
    StubEngine::default()
        .with_members("Initial Population", &["p1", "p2", "p3"])
        .with_members("Denominator", &["p1", "p2"])
        .with_members("Numerator", &["p1"])
}

#[tokio::test]
async fn evaluate_measure_reports() {
    let server = TestServer::start(measure_engine()).await;
    seed_measure(&server).await;

    let (status, report) = server
        .get("Measure/m1/$evaluate-measure?periodStart=2024-01-01&periodEnd=2024-12-31")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["resourceType"], "MeasureReport");
    assert_eq!(report["type"], "summary");
    assert_eq!(report["measure"], "http://example.org/Measure/m1");
    assert_eq!(report["period"]["start"], "2024-01-01");
    assert_eq!(report["group"][0]["id"], "g1");
    assert_eq!(population_count(&report, 0, "initial-population"), 3);
    assert_eq!(population_count(&report, 0, "denominator"), 2);
    assert_eq!(population_count(&report, 0, "numerator"), 1);
    assert_eq!(report["group"][0]["measureScore"]["value"], 0.5);

    let (status, report) = server
        .get("Measure/m1/$evaluate-measure?periodStart=2024-01-01&periodEnd=2024-12-31&subject=Patient/p2")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["type"], "individual");
    assert_eq!(report["subject"]["reference"], "Patient/p2");
    assert_eq!(population_count(&report, 0, "denominator"), 1);
    assert_eq!(population_count(&report, 0, "numerator"), 0);
    assert_eq!(report["group"][0]["measureScore"]["value"], 0.0);

    let (status, report) = server
        .post(
            "Measure/m1/$evaluate-measure",
            json!({
                "resourceType": "Parameters",
                "parameter": [
                    {"name": "periodStart", "valueDate": "2024-01-01"},
                    {"name": "periodEnd", "valueDate": "2024-12-31"},
                    {"name": "reportType", "valueCode": "subject-list"}
                ]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(report["type"], "subject-list");
    let contained = report["contained"].as_array().unwrap();
    assert_eq!(contained.len(), 3);
    let numerator = report["group"][0]["population"]
        .as_array()
        .unwrap()
        .iter()
        .find(|p| p["code"]["coding"][0]["code"] == "numerator")
        .unwrap();
    let list_ref = numerator["subjectResults"]["reference"].as_str().unwrap();
    let list = contained
        .iter()
        .find(|l| format!("#{}", l["id"].as_str().unwrap()) == list_ref)
        .unwrap();
    assert_eq!(list["entry"][0]["item"]["reference"], "Patient/p1");

    // the period is mandatory
    let (status, _) = server.get("Measure/m1/$evaluate-measure").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = server
        .get("Measure/m1/$evaluate-measure?periodStart=2024-01-01&periodEnd=2024-12-31&reportType=bogus")
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);
    let (status, _) = server
        .get("Measure/m1/$evaluate-measure?periodStart=2024-01-01&periodEnd=2024-12-31&subject=Patient/nobody")
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.stop().await;
}

#[tokio::test]
async fn measure_artifact_operations() {
    let server = TestServer::start(StubEngine::default()).await;
    seed_measure(&server).await;

    let (status, narrative) = server.get("Measure/m1/$get-narrative").await;
    assert_eq!(status, StatusCode::OK);
    assert!(
        output(&narrative, "narrative")
            .unwrap()
            .as_str()
            .unwrap()
            .contains("Screening Rate")
    );

    let (status, refreshed) = server
        .post("Measure/m1/$refresh-generated-content", json!({"resourceType": "Parameters"}))
        .await;
    assert_eq!(status, StatusCode::OK);
    let related: Vec<&str> = refreshed["relatedArtifact"]
        .as_array()
        .unwrap()
        .iter()
        .filter_map(|a| a["resource"].as_str())
        .collect();
    assert_eq!(
        related,
        vec!["http://example.org/Library/MeasureLogic", "Library/Common|1.0"]
    );
    assert_eq!(refreshed["text"]["status"], "generated");

    let (status, hqmf) = server.get("Measure/m1/$hqmf").await;
    assert_eq!(status, StatusCode::OK);
    let document = output(&hqmf, "hqmf").unwrap().as_str().unwrap();
    assert!(document.contains("QualityMeasureDocument"));
    assert!(document.contains("numeratorCriteria"));

    server.stop().await;
}

#[tokio::test]
async fn patient_member_match() {
    let server = TestServer::start(StubEngine::default()).await;
    server
        .put(
            "Patient/p1",
            json!({
                "resourceType": "Patient",
                "identifier": [{"system": "http://payer.example.org/member", "value": "M-100"}],
                "name": [{"family": "Doe", "given": ["Jane"]}],
                "birthDate": "1980-01-01"
            }),
        )
        .await;
    server
        .put(
            "Coverage/c1",
            json!({
                "resourceType": "Coverage",
                "status": "active",
                "subscriberId": "S-1",
                "beneficiary": {"reference": "Patient/p1"},
                "payor": [{"reference": "Organization/payer"}]
            }),
        )
        .await;

    let request = |family: &str| {
        json!({
            "resourceType": "Parameters",
            "parameter": [
                {"name": "MemberPatient", "resource": {
                    "resourceType": "Patient",
                    "name": [{"family": family}],
                    "birthDate": "1980-01-01"
                }},
                {"name": "CoverageToMatch", "resource": {
                    "resourceType": "Coverage",
                    "status": "active",
                    "subscriberId": "S-1"
                }}
            ]
        })
    };

    let (status, result) = server.post("Patient/$member-match", request("doe")).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(output(&result, "MemberPatient").unwrap()["id"], "p1");
    let identifier = output(&result, "MemberIdentifier").unwrap();
    assert_eq!(identifier["type"]["coding"][0]["code"], "MB");
    assert_eq!(identifier["value"], "p1");

    let (status, _) = server.post("Patient/$member-match", request("Smith")).await;
    assert_eq!(status, StatusCode::UNPROCESSABLE_ENTITY);

    let (status, _) = server
        .post("Patient/$member-match", json!({"resourceType": "Parameters", "parameter": []}))
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    server.stop().await;
}

#[tokio::test]
async fn claim_submit() {
    let server = TestServer::start(StubEngine::default()).await;
    let bundle = json!({
        "resourceType": "Bundle",
        "type": "collection",
        "entry": [
            {"resource": {
                "resourceType": "Claim",
                "id": "claim-1",
                "status": "active",
                "use": "preauthorization",
                "type": {"coding": [{"code": "professional"}]},
                "patient": {"reference": "Patient/p1"},
                "insurer": {"reference": "Organization/payer"},
                "provider": {"reference": "Practitioner/dr"}
            }},
            {"resource": {"resourceType": "Patient", "id": "p1"}}
        ]
    });

    let (status, response) = server.post("Claim/$submit", bundle).await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(response["resourceType"], "ClaimResponse");
    assert_eq!(response["outcome"], "queued");
    assert_eq!(response["use"], "preauthorization");
    assert_eq!(response["request"]["reference"], "Claim/claim-1");
    assert_eq!(response["insurer"]["reference"], "Organization/payer");

    let (status, claim) = server.get("Claim/claim-1").await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(claim["status"], "active");
    let (status, _) = server.get("Patient/p1").await;
    assert_eq!(status, StatusCode::OK);
    let (_, responses) = server.get("ClaimResponse?request=Claim/claim-1").await;
    assert_eq!(responses["total"], 1);

    let (status, _) = server
        .post(
            "Claim/$submit",
            json!({"resourceType": "Bundle", "type": "collection", "entry": [
                {"resource": {"resourceType": "Patient", "id": "p9"}}
            ]}),
        )
        .await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    server.stop().await;
}

async fn seed_definitions(server: &TestServer) {
    server
        .put(
            "ActivityDefinition/ad1",
            json!({
                "resourceType": "ActivityDefinition",
                "id": "ad1",
                "url": "http://example.org/ActivityDefinition/ad1",
                "status": "active",
                "kind": "ServiceRequest",
                "intent": "order",
                "code": {"coding": [{"system": "http://loinc.org", "code": "4548-4"}]},
                "dynamicValue": [{
                    "path": "priority",
                    "expression": {"language": "text/cql", "expression": "'urgent'"}
                }]
            }),
        )
        .await;
    let action = |title: &str, applicable: &str| {
        json!({
            "title": title,
            "definitionCanonical": "http://example.org/ActivityDefinition/ad1",
            "condition": [{
                "kind": "applicability",
                "expression": {"language": "text/cql", "expression": applicable}
            }]
        })
    };
    server
        .put(
            "PlanDefinition/pd1",
            json!({
                "resourceType": "PlanDefinition",
                "id": "pd1",
                "url": "http://example.org/PlanDefinition/pd1",
                "title": "Diabetes follow-up",
                "status": "active",
                "action": [action("Order HbA1c", "true"), action("Skipped", "false")]
            }),
        )
        .await;
}

#[tokio::test]
async fn activity_definition_apply() {
    let server = TestServer::start(StubEngine::default()).await;
    seed_definitions(&server).await;

    let (status, request) = server
        .get("ActivityDefinition/ad1/$apply?patient=Patient/p1&encounter=e1&practitioner=dr")
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(request["resourceType"], "ServiceRequest");
    assert_eq!(request["status"], "draft");
    assert_eq!(request["intent"], "order");
    assert_eq!(request["subject"]["reference"], "Patient/p1");
    assert_eq!(request["encounter"]["reference"], "Encounter/e1");
    assert_eq!(request["requester"]["reference"], "Practitioner/dr");
    assert_eq!(request["priority"], "urgent");
    assert_eq!(
        request["instantiatesCanonical"][0],
        "http://example.org/ActivityDefinition/ad1"
    );

    let (status, _) = server.get("ActivityDefinition/ad1/$apply").await;
    assert_eq!(status, StatusCode::BAD_REQUEST);

    server.stop().await;
}

#[tokio::test]
async fn plan_definition_apply() {
    let server = TestServer::start(StubEngine::default()).await;
    seed_definitions(&server).await;

    let (status, care_plan) = server
        .post(
            "PlanDefinition/pd1/$apply",
            json!({
                "resourceType": "Parameters",
                "parameter": [
                    {"name": "patient", "valueString": "p1"},
                    {"name": "organization", "valueString": "Organization/clinic"}
                ]
            }),
        )
        .await;
    assert_eq!(status, StatusCode::OK);
    assert_eq!(care_plan["resourceType"], "CarePlan");
    assert_eq!(care_plan["status"], "draft");
    assert_eq!(care_plan["intent"], "proposal");
    assert_eq!(care_plan["subject"]["reference"], "Patient/p1");
    assert_eq!(care_plan["author"]["reference"], "Organization/clinic");
    assert_eq!(care_plan["title"], "Diabetes follow-up");
    assert_eq!(
        care_plan["instantiatesCanonical"][0],
        "http://example.org/PlanDefinition/pd1"
    );

    let contained = care_plan["contained"].as_array().unwrap();
    assert_eq!(contained.len(), 1);
    assert_eq!(contained[0]["resourceType"], "ServiceRequest");
    let activity = care_plan["activity"].as_array().unwrap();
    assert_eq!(activity.len(), 1);
    assert_eq!(
        activity[0]["reference"]["reference"],
        format!("#{}", contained[0]["id"].as_str().unwrap())
    );
    assert_eq!(activity[0]["reference"]["display"], "Order HbA1c");

    let (status, _) = server
        .post(
            "PlanDefinition/missing/$apply",
            json!({"resourceType": "Parameters", "parameter": [{"name": "patient", "valueString": "p1"}]}),
        )
        .await;
    assert_eq!(status, StatusCode::NOT_FOUND);

    server.stop().await;
}
