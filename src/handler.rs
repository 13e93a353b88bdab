//! The seam between the adapter and whatever actually serves requests.

use lambda_http::{
    http::{Request, Response},
    Body, Error,
};
use std::{future::Future, pin::Pin, sync::Arc};
use tower::{Service, ServiceExt};

pub type BoxFuture<'a, T> = Pin<Box<dyn Future<Output = T> + Send + 'a>>;

/// A fully configured request handler.
///
/// This is the in-process equivalent of an HTTP server's request entry point:
/// give it a request, get back a response, no socket involved.
pub trait RequestHandler: Send + Sync + 'static {
    fn serve(&self, req: Request<Body>) -> BoxFuture<'static, Result<Response<Body>, Error>>;
}

/// The shared handle that gets published once the handler is built.
pub type Handler = Arc<dyn RequestHandler>;

/// Adapts any cloneable `tower::Service` into a [`RequestHandler`].
///
/// Each call clones the service and drives it with `oneshot`, so the shared
/// copy never needs `&mut` access.
#[derive(Clone, Debug)]
pub struct ServiceHandler<S>(S);

impl<S> ServiceHandler<S> {
    pub fn new(service: S) -> Self {
        ServiceHandler(service)
    }
}

impl<S> RequestHandler for ServiceHandler<S>
where
    S: Service<Request<Body>, Response = Response<Body>, Error = Error>
        + Clone
        + Send
        + Sync
        + 'static,
    S::Future: Send + 'static,
{
    fn serve(&self, req: Request<Body>) -> BoxFuture<'static, Result<Response<Body>, Error>> {
        Box::pin(self.0.clone().oneshot(req))
    }
}

pub fn from_service<S>(service: S) -> Handler
where
    ServiceHandler<S>: RequestHandler,
{
    Arc::new(ServiceHandler::new(service))
}
