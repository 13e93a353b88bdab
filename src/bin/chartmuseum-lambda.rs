//! The Lambda entry point.
//!
//! This executable speaks AWS API Gateway's REST "proxy event" protocol. The
//! chart repository handler is constructed on a background task while the
//! runtime starts taking events; events that beat it wait for it.

use lambda_http::aws_lambda_events::apigw::ApiGatewayProxyRequest;
use lambda_runtime::{run, service_fn, tracing, Error, LambdaEvent};

use chartmuseum_lambda::{
    bootstrap,
    config::{Config, LogConfig},
    init_logging, Adapter,
};

#[tokio::main]
async fn main() -> Result<(), Error> {
    init_logging(&LogConfig::from_env()?);

    let config = Config::from_env().map_err(|e| {
        tracing::error!("fatal: invalid configuration: {e:#}");
        e
    })?;

    let adapter = Adapter::new(config.stage_prefix);
    bootstrap::spawn_bootstrap(adapter.gate().clone(), move || async move {
        bootstrap::build_handler(&config).await
    });

    let ref_adapter = &adapter;

    run(service_fn(|event: LambdaEvent<ApiGatewayProxyRequest>| async move {
        let (event, _context) = event.into_parts();
        Ok::<_, Error>(ref_adapter.handle(event).await)
    }))
    .await?;
    Ok(())
}
