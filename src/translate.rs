//! Conversion between proxy events and in-process HTTP messages.
//!
//! API Gateway only moves text. Binary payloads cross it base64-encoded, and
//! nothing in the event reliably says which bodies those are, so we go by
//! route: chart uploads arrive encoded and chart downloads leave encoded.
//! That rule lives entirely in [`inbound_body_is_base64`] and
//! [`outbound_body_is_base64`]; swap those out to move to content-type
//! inspection.

use base64::{engine::general_purpose::STANDARD, Engine};
use lambda_http::{
    aws_lambda_events::apigw::{ApiGatewayProxyRequest, ApiGatewayProxyResponse},
    http::{
        header::{HeaderValue, CONTENT_TYPE},
        HeaderMap, Method, Request, StatusCode,
    },
    Body,
};
use lambda_runtime::tracing;
use thiserror::Error;
use url::form_urlencoded;

use crate::dispatch::Captured;

pub const UPLOAD_PATH: &str = "/api/charts";
pub const DOWNLOAD_SEGMENT: &str = "/charts/";

#[derive(Debug, Error)]
pub enum TranslateError {
    #[error("request body is not valid base64: {0}")]
    Base64(#[from] base64::DecodeError),

    #[error("cannot build request: {0}")]
    Request(#[from] lambda_http::http::Error),
}

pub fn inbound_body_is_base64(method: &Method, path: &str) -> bool {
    method == Method::POST && path == UPLOAD_PATH
}

pub fn outbound_body_is_base64(method: &Method, path: &str) -> bool {
    method == Method::GET && path.contains(DOWNLOAD_SEGMENT)
}

/// The event's own path, `/` if it has none.
fn raw_path(event: &ApiGatewayProxyRequest) -> &str {
    event
        .path
        .as_deref()
        .filter(|p| !p.is_empty())
        .unwrap_or("/")
}

/// The path presented to the handler.
///
/// API Gateway's `path` is already relative to the stage, which is what the
/// handler expects by default. Deployments whose handler is mounted under the
/// stage name can turn on `stage_prefix` to get `/{stage}` glued back on.
pub fn effective_path(event: &ApiGatewayProxyRequest, stage_prefix: bool) -> String {
    let path = raw_path(event);

    let stage = event
        .request_context
        .stage
        .as_deref()
        .unwrap_or_default()
        .trim_matches('/');

    if stage_prefix && !stage.is_empty() {
        format!("/{stage}{path}")
    } else {
        path.to_owned()
    }
}

fn query_string(event: &ApiGatewayProxyRequest) -> String {
    let params = if event.multi_value_query_string_parameters.is_empty() {
        &event.query_string_parameters
    } else {
        &event.multi_value_query_string_parameters
    };

    // Stable sort: repeated keys keep their values in order.
    let mut pairs: Vec<_> = params.iter().collect();
    pairs.sort_by_key(|&(key, _)| key);

    let mut ser = form_urlencoded::Serializer::new(String::new());

    for (key, value) in pairs {
        ser.append_pair(key, value);
    }

    ser.finish()
}

/// Build the synthetic request for an event.
pub fn to_request(
    event: &ApiGatewayProxyRequest,
    stage_prefix: bool,
) -> Result<Request<Body>, TranslateError> {
    let raw_body = event.body.as_deref().unwrap_or_default();

    let body = if inbound_body_is_base64(&event.http_method, raw_path(event)) {
        Body::Binary(STANDARD.decode(raw_body.as_bytes())?)
    } else if raw_body.is_empty() {
        Body::Empty
    } else {
        Body::Text(raw_body.to_owned())
    };

    let mut uri = effective_path(event, stage_prefix);
    let query = query_string(event);

    if !query.is_empty() {
        uri.push('?');
        uri.push_str(&query);
    }

    let mut req = Request::builder()
        .method(event.http_method.clone())
        .uri(uri)
        .body(body)?;
    let headers = req.headers_mut();

    for (name, value) in &event.multi_value_headers {
        headers.append(name.clone(), value.clone());
    }

    // The single-value map mostly repeats the last entry of the multi-value
    // one; only add what isn't there yet.
    for (name, value) in &event.headers {
        if !headers.get_all(name).iter().any(|v| v == value) {
            headers.append(name.clone(), value.clone());
        }
    }

    Ok(req)
}

/// Turn a captured handler response into the proxy result for `event`.
pub fn to_response(captured: Captured, event: &ApiGatewayProxyRequest) -> ApiGatewayProxyResponse {
    let mut multi_value_headers = HeaderMap::with_capacity(captured.headers.len());

    for (name, value) in &captured.headers {
        // The result is JSON, so every value has to be a string.
        if std::str::from_utf8(value.as_bytes()).is_ok() {
            multi_value_headers.append(name.clone(), value.clone());
        } else {
            tracing::warn!("dropping non-UTF-8 `{name}` response header");
        }
    }

    let is_base64_encoded = outbound_body_is_base64(&event.http_method, raw_path(event));

    let body = if is_base64_encoded {
        STANDARD.encode(&captured.body)
    } else {
        String::from_utf8_lossy(&captured.body).into_owned()
    };

    ApiGatewayProxyResponse {
        status_code: i64::from(captured.status.as_u16()),
        multi_value_headers,
        body: Some(Body::Text(body)),
        is_base64_encoded,
        ..Default::default()
    }
}

/// An HTTP-shaped failure for requests that never reach the handler, or that
/// blow up inside it.
pub fn error_response(status: StatusCode, message: impl std::fmt::Display) -> ApiGatewayProxyResponse {
    let mut multi_value_headers = HeaderMap::new();
    multi_value_headers.insert(CONTENT_TYPE, HeaderValue::from_static("application/json"));

    ApiGatewayProxyResponse {
        status_code: i64::from(status.as_u16()),
        multi_value_headers,
        body: Some(Body::Text(
            serde_json::json!({ "error": message.to_string() }).to_string(),
        )),
        is_base64_encoded: false,
        ..Default::default()
    }
}
