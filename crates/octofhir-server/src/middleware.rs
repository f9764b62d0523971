use axum::{
    body::Body,
    http::{HeaderName, HeaderValue, Method, Request, StatusCode, header},
    middleware::Next,
    response::{IntoResponse, Response},
};
use octofhir_api::{FhirResponse, OperationOutcome};
use uuid::Uuid;

pub const REQUEST_ID_HEADER: &str = "x-request-id";

/// Ensures each request has an `X-Request-Id` and mirrors it on the response.
pub async fn request_id(mut req: Request<Body>, next: Next) -> Response {
    let header_name = HeaderName::from_static(REQUEST_ID_HEADER);

    // Keep a caller-supplied id; otherwise mint one
    let req_id_value = match req.headers().get(&header_name) {
        Some(value) => value.clone(),
        None => match HeaderValue::from_str(&Uuid::new_v4().to_string()) {
            Ok(value) => value,
            Err(_) => return next.run(req).await,
        },
    };

    // Available to the trace span
    req.extensions_mut().insert(req_id_value.clone());

    let mut res = next.run(req).await;
    res.headers_mut().insert(header_name, req_id_value);
    res
}

/// Rejects requests that neither accept nor send JSON.
///
/// A POST without a body (an operation without input) needs no
/// Content-Type.
pub async fn content_negotiation(req: Request<Body>, next: Next) -> Response {
    let accept_ok = req
        .headers()
        .get(header::ACCEPT)
        .and_then(|v| v.to_str().ok())
        .map(|v| {
            let v = v.to_ascii_lowercase();
            v.contains("application/fhir+json")
                || v.contains("application/json")
                || v.contains("*/*")
        })
        .unwrap_or(true);
    if !accept_ok {
        return error_response(
            StatusCode::NOT_ACCEPTABLE,
            "Only JSON is supported (application/fhir+json or application/json) in Accept",
        );
    }

    let method = req.method();
    if method == Method::POST || method == Method::PUT {
        let empty_body = req
            .headers()
            .get(header::CONTENT_LENGTH)
            .and_then(|v| v.to_str().ok())
            .is_some_and(|v| v == "0");
        let content_ok = req
            .headers()
            .get(header::CONTENT_TYPE)
            .and_then(|v| v.to_str().ok())
            .map(|s| s.to_ascii_lowercase())
            .map(|s| s.starts_with("application/fhir+json") || s.starts_with("application/json"));
        match content_ok {
            Some(true) => {}
            None if empty_body => {}
            _ => {
                return error_response(
                    StatusCode::UNSUPPORTED_MEDIA_TYPE,
                    "Content-Type must be application/fhir+json or application/json",
                );
            }
        }
    }

    next.run(req).await
}

fn error_response(status: StatusCode, msg: &str) -> Response {
    let outcome = OperationOutcome::single("error", "not-supported", msg);
    let mut response = FhirResponse::ok(outcome.to_value());
    response.status = status;
    response.into_response()
}
