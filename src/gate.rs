//! The readiness gate between handler construction and request dispatch.
//!
//! The handler is built on its own task while the Lambda runtime is already
//! pulling invocations, so the first few events can arrive before there is
//! anything to send them to. Every invocation parks in [`ReadinessGate::wait`]
//! until the bootstrap task publishes the handler. After that the gate is just
//! a lock-free read of a `OnceCell`.

use once_cell::sync::OnceCell;
use tokio::sync::Notify;

#[derive(Debug)]
pub struct ReadinessGate<T> {
    value: OnceCell<T>,
    ready: Notify,
}

impl<T> Default for ReadinessGate<T> {
    fn default() -> Self {
        Self::new()
    }
}

impl<T> ReadinessGate<T> {
    pub fn new() -> Self {
        ReadinessGate {
            value: OnceCell::new(),
            ready: Notify::new(),
        }
    }

    /// Publish the value and wake every waiter.
    ///
    /// The gate is write-once: if a value has already been published, the
    /// new one is handed back and the original stays in place.
    pub fn publish(&self, value: T) -> Result<(), T> {
        self.value.set(value)?;
        self.ready.notify_waiters();
        Ok(())
    }

    pub fn get(&self) -> Option<&T> {
        self.value.get()
    }

    /// Wait until a value has been published.
    ///
    /// No timeout: a handler that never shows up is bounded only by the
    /// Lambda invocation deadline.
    pub async fn wait(&self) -> &T {
        loop {
            // Register interest before checking the cell, otherwise a publish
            // landing between the check and the await would be missed.
            let notified = self.ready.notified();
            tokio::pin!(notified);
            notified.as_mut().enable();

            if let Some(value) = self.value.get() {
                return value;
            }

            notified.await;
        }
    }
}
