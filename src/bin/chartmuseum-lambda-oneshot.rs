//! "Oneshot" version of the chart repository Lambda.
//!
//! This executable runs one proxy event, given as JSON on the command line,
//! against the configured repository and prints the JSON result.

use lambda_http::aws_lambda_events::apigw::ApiGatewayProxyRequest;
use lambda_runtime::Error;
use std::env;

use chartmuseum_lambda::{bootstrap, config::Config, init_logging, Adapter};

#[tokio::main]
async fn main() -> Result<(), Error> {
    let mut args = env::args();
    args.next(); // skip argv[0]

    let json_text = args
        .next()
        .ok_or_else(|| -> Error { "first argument should be the proxy event JSON".into() })?;
    let event: ApiGatewayProxyRequest = serde_json::from_str(&json_text)?;

    let config = Config::from_env()?;
    init_logging(&config.log);

    let adapter = Adapter::new(config.stage_prefix);
    let handler = bootstrap::build_handler(&config).await?;
    adapter
        .gate()
        .publish(handler)
        .map_err(|_| -> Error { "handler was already published".into() })?;

    let result = adapter.handle(event).await;
    serde_json::to_writer(std::io::stdout().lock(), &result)?;
    Ok(())
}
