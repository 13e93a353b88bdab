//! Drive a synthetic request through the handler and keep what comes back.

use lambda_http::{
    http::{HeaderMap, Request, StatusCode},
    Body, Error,
};
use std::any::Any;
use thiserror::Error;

use crate::handler::Handler;

/// Everything the handler wrote for one request.
#[derive(Debug)]
pub struct Captured {
    pub status: StatusCode,
    pub headers: HeaderMap,
    pub body: Vec<u8>,
}

#[derive(Debug, Error)]
pub enum DispatchError {
    #[error("handler panicked: {0}")]
    Panicked(String),

    #[error("handler failed: {0}")]
    Handler(Error),

    #[error("handler task was cancelled")]
    Cancelled,
}

/// Serve `req` with `handler` and buffer the entire response.
///
/// The handler runs on its own task so that a panic comes back to us as a
/// `JoinError` instead of taking the whole runtime down. There is no timeout
/// here; that is up to the handler.
pub async fn dispatch(handler: &Handler, req: Request<Body>) -> Result<Captured, DispatchError> {
    let handler = handler.clone();

    let resp = match tokio::spawn(async move { handler.serve(req).await }).await {
        Ok(Ok(resp)) => resp,
        Ok(Err(e)) => return Err(DispatchError::Handler(e)),
        Err(e) if e.is_panic() => {
            return Err(DispatchError::Panicked(panic_message(e.into_panic())))
        }
        Err(_) => return Err(DispatchError::Cancelled),
    };

    let (parts, body) = resp.into_parts();

    Ok(Captured {
        status: parts.status,
        headers: parts.headers,
        body: body.as_ref().to_vec(),
    })
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(s) = payload.downcast_ref::<&str>() {
        (*s).to_owned()
    } else if let Some(s) = payload.downcast_ref::<String>() {
        s.clone()
    } else {
        "unknown panic payload".to_owned()
    }
}
