//! One-time construction of the request handler.
//!
//! The handler is built on a task of its own so that the Lambda runtime can
//! start polling for events straight away; invocations that arrive first wait
//! at the [`ReadinessGate`] until it is published.

use anyhow::{Context, Result};
use lambda_runtime::tracing;
use std::{future::Future, sync::Arc};
use tokio::task::JoinHandle;

use crate::{
    config::Config, gate::ReadinessGate, handler::Handler, repo::ChartRepo, storage::S3Storage,
};

/// Build the storage-backed chart repository described by `config`.
pub async fn build_handler(config: &Config) -> Result<Handler> {
    let sdk_config = aws_config::load_from_env().await;
    let storage = S3Storage::new(&sdk_config, &config.storage);

    tracing::info!(
        "using S3 storage: bucket={} prefix={:?}",
        config.storage.bucket,
        config.storage.prefix
    );

    // Events come in through the Lambda runtime, never through a socket.
    tracing::debug!(
        "not binding {}:{}; serving Lambda proxy events only",
        config.listen_host,
        config.port
    );

    let repo = ChartRepo::new(storage, config.server.clone())
        .context("cannot construct the chart repository handler")?;

    Ok(Arc::new(repo))
}

/// Run `build` on a new task and publish its result into `gate`.
///
/// A failure here is fatal: it is logged and the process exits, since no
/// invocation could ever succeed without a handler.
pub fn spawn_bootstrap<F, Fut>(gate: Arc<ReadinessGate<Handler>>, build: F) -> JoinHandle<()>
where
    F: FnOnce() -> Fut + Send + 'static,
    Fut: Future<Output = Result<Handler>> + Send + 'static,
{
    tokio::spawn(async move {
        match build().await {
            Ok(handler) => {
                if gate.publish(handler).is_err() {
                    tracing::warn!("a handler was already published; keeping the first one");
                } else {
                    tracing::info!("request handler ready");
                }
            }

            Err(e) => {
                tracing::error!("fatal: cannot start the chart repository: {e:#}");
                std::process::exit(1);
            }
        }
    })
}
