//! The per-invocation flow: wait for the handler, translate, dispatch,
//! translate back.

use lambda_http::{
    aws_lambda_events::apigw::{ApiGatewayProxyRequest, ApiGatewayProxyResponse},
    http::StatusCode,
};
use lambda_runtime::tracing;
use std::sync::Arc;

use crate::{dispatch, dispatch::DispatchError, gate::ReadinessGate, handler::Handler, translate};

/// The per-invocation entry point shared by both executables.
#[derive(Clone)]
pub struct Adapter {
    gate: Arc<ReadinessGate<Handler>>,
    stage_prefix: bool,
}

impl Adapter {
    pub fn new(stage_prefix: bool) -> Self {
        Adapter {
            gate: Arc::new(ReadinessGate::new()),
            stage_prefix,
        }
    }

    /// The gate that the bootstrap task publishes the handler into.
    pub fn gate(&self) -> &Arc<ReadinessGate<Handler>> {
        &self.gate
    }

    /// Handle one proxy event.
    ///
    /// This never fails: anything that goes wrong becomes an HTTP-shaped
    /// error result, so a single bad request can't take the process down.
    pub async fn handle(&self, event: ApiGatewayProxyRequest) -> ApiGatewayProxyResponse {
        let handler = self.gate.wait().await;

        let method = &event.http_method;
        let path = event.path.as_deref().unwrap_or("/");

        tracing::debug!(
            "{method} {path} (request {})",
            event.request_context.request_id.as_deref().unwrap_or("-")
        );

        let req = match translate::to_request(&event, self.stage_prefix) {
            Ok(r) => r,
            Err(e) => {
                tracing::warn!("rejecting {method} {path}: {e}");
                return translate::error_response(StatusCode::BAD_REQUEST, e);
            }
        };

        let resp = match dispatch::dispatch(handler, req).await {
            Ok(captured) => translate::to_response(captured, &event),

            Err(e @ DispatchError::Panicked(_)) => {
                tracing::error!("{method} {path}: {e}");
                translate::error_response(StatusCode::INTERNAL_SERVER_ERROR, e)
            }

            Err(e) => {
                tracing::error!("{method} {path}: {e}");
                translate::error_response(StatusCode::BAD_GATEWAY, e)
            }
        };

        tracing::debug!("{method} {path} -> {}", resp.status_code);
        resp
    }
}
