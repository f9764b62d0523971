#![allow(dead_code)]

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;
use octofhir_cql_service::library::ADHOC_EXPRESSION;
use octofhir_cql_service::{
    CqlEngine, CqlResult, EvaluationRequest, EvaluationResult, FhirDataProvider,
    TerminologyProvider,
};
use octofhir_server::{AppConfig, ApplicationContext, ServerBuilder};
use serde_json::Value;
use tokio::task::JoinHandle;

/// Engine double: ad-hoc expressions evaluate CQL literals, named
/// expressions are true for the patients listed in `members`.
#[derive(Default)]
pub struct StubEngine {
    pub members: HashMap<String, Vec<String>>,
}

impl StubEngine {
    pub fn with_members(mut self, expression: &str, patients: &[&str]) -> Self {
        self.members.insert(
            expression.to_string(),
            patients.iter().map(|p| p.to_string()).collect(),
        );
        self
    }
}

fn literal(cql: &str) -> Value {
    let body = cql
        .rsplit_once(&format!("define \"{ADHOC_EXPRESSION}\":"))
        .map(|(_, body)| body.trim())
        .unwrap_or_default();
    match body {
        "true" => Value::Bool(true),
        "false" => Value::Bool(false),
        s if s.starts_with('\'') && s.ends_with('\'') && s.len() >= 2 => {
            Value::String(s[1..s.len() - 1].to_string())
        }
        s => s.parse::<i64>().map(Value::from).unwrap_or(Value::Null),
    }
}

#[async_trait]
impl CqlEngine for StubEngine {
    fn name(&self) -> &str {
        "stub"
    }

    async fn evaluate(
        &self,
        request: &EvaluationRequest,
        _data: &FhirDataProvider,
        _terminology: &dyn TerminologyProvider,
    ) -> CqlResult<EvaluationResult> {
        let mut result = EvaluationResult::default();
        let patient = request.context.as_ref().map(|c| c.id.clone());
        for expression in &request.expressions {
            let value = if expression == ADHOC_EXPRESSION {
                literal(&request.library.cql)
            } else {
                let member = match (&patient, self.members.get(expression)) {
                    (Some(p), Some(patients)) => patients.contains(p),
                    _ => false,
                };
                Value::Bool(member)
            };
            result.expressions.insert(expression.clone(), value);
        }
        Ok(result)
    }
}

pub fn context(config: &AppConfig, engine: StubEngine) -> ApplicationContext {
    ApplicationContext::in_memory(config).with_cql_engine(Arc::new(engine))
}

/// Serves the bootstrapped app on an ephemeral port.
pub async fn start_server(
    config: AppConfig,
    context: ApplicationContext,
) -> (String, tokio::sync::oneshot::Sender<()>, JoinHandle<()>) {
    let server = ServerBuilder::new()
        .with_config(config)
        .with_context(context)
        .build()
        .expect("bootstrap");
    let app = server.router();

    let listener = tokio::net::TcpListener::bind((std::net::Ipv4Addr::LOCALHOST, 0))
        .await
        .expect("bind");
    let addr = listener.local_addr().unwrap();
    let (tx, rx) = tokio::sync::oneshot::channel::<()>();

    let handle = tokio::spawn(async move {
        let _ = axum::serve(listener, app)
            .with_graceful_shutdown(async move {
                let _ = rx.await;
            })
            .await;
    });

    (format!("http://{addr}"), tx, handle)
}
