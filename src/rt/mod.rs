//! An abstraction over the asynchronous runtime.
//!
//! Everything in this crate that spawns background work or waits on a timer
//! goes through [`Runtime`], so tests and embedders can substitute their own
//! scheduling. The default implementation is backed by Tokio.

use std::fmt::Debug;
use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

/// A boxed future with no output, as accepted by [`Runtime::spawn`].
pub type BoxFuture = Pin<Box<dyn Future<Output = ()> + Send + 'static>>;

/// Core scheduling facilities required by the balancers in this crate.
pub trait Runtime: Send + Sync + Debug {
    /// Spawns the given task to run in the background.
    fn spawn(&self, task: BoxFuture) -> Box<dyn TaskHandle>;

    /// Returns a future that completes after the specified duration.
    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>>;
}

/// A future that resolves after a specified duration.
pub trait Sleep: Send + Future<Output = ()> {}

impl Sleep for tokio::time::Sleep {}

/// A handle to a spawned task, used to cancel it.
pub trait TaskHandle: Send + Sync {
    /// Aborts the associated task. The task may still run for a short time
    /// after this returns, but will cease at its next suspension point.
    fn abort(&self);
}

/// The Tokio-backed [`Runtime`].
#[derive(Debug, Default)]
pub struct TokioRuntime;

struct TokioTaskHandle {
    handle: tokio::task::AbortHandle,
}

impl TaskHandle for TokioTaskHandle {
    fn abort(&self) {
        self.handle.abort();
    }
}

impl Runtime for TokioRuntime {
    fn spawn(&self, task: BoxFuture) -> Box<dyn TaskHandle> {
        let handle = tokio::spawn(task).abort_handle();
        Box::new(TokioTaskHandle { handle })
    }

    fn sleep(&self, duration: Duration) -> Pin<Box<dyn Sleep>> {
        Box::pin(tokio::time::sleep(duration))
    }
}

/// Returns the runtime used when none is supplied explicitly.
pub fn default_runtime() -> Arc<dyn Runtime> {
    Arc::new(TokioRuntime)
}
