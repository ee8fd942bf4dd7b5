//! Explicit lifecycle for the event loop that drives a capture.
//!
//! A capture suspends twice: once waiting for the engine's load-completion
//! notification and once for the post-load delay. Both are driven by a
//! current-thread tokio runtime that is started before the load request is
//! issued and stopped exactly once afterwards, so that sequential captures in
//! one process stay independent.

use crate::{Error, Result};
use log::debug;
use std::future::Future;
use std::time::Duration;
use tokio::runtime::{Builder, Runtime};

/// Grace period given to tasks still parked on the runtime when it stops.
const SHUTDOWN_GRACE: Duration = Duration::from_millis(100);

pub struct EventLoop {
    runtime: Runtime,
}

impl EventLoop {
    /// Start a new single-threaded event loop.
    pub fn start() -> Result<Self> {
        let runtime = Builder::new_current_thread()
            .enable_time()
            .build()
            .map_err(|e| Error::EventLoop(format!("Failed to start runtime: {}", e)))?;

        debug!("event loop started");
        Ok(Self { runtime })
    }

    /// Drive `fut` to completion on this loop.
    pub fn run<F: Future>(&self, fut: F) -> F::Output {
        self.runtime.block_on(fut)
    }

    /// Stop the loop. Consumes it, so a loop can only be stopped once.
    pub fn stop(self) {
        self.runtime.shutdown_timeout(SHUTDOWN_GRACE);
        debug!("event loop stopped");
    }
}
