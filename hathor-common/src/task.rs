use std::{
    fmt,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
};

use tokio::task::{JoinError, JoinHandle};
use tracing::{info_span, Instrument};

/// A thin wrapper around [`tokio::task::JoinHandle`] which
///
/// - adds the `#[must_use]` lint so that all spawned tasks are joined or
///   explicitly annotated that no joining is required, and
/// - attaches a name to the task, which is included in the task's tracing
///   span and returned by [`WalletTask::name`].
#[must_use]
pub struct WalletTask<T> {
    handle: JoinHandle<T>,
    name: &'static str,
}

impl<T> WalletTask<T> {
    pub fn spawn<F>(name: &'static str, future: F) -> WalletTask<F::Output>
    where
        F: Future<Output = T> + Send + 'static,
        F::Output: Send + 'static,
    {
        let span = info_span!("task", %name);
        WalletTask {
            handle: tokio::spawn(future.instrument(span)),
            name,
        }
    }

    pub fn name(&self) -> &'static str {
        self.name
    }

    pub fn abort(&self) {
        self.handle.abort()
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl<T> Future for WalletTask<T> {
    type Output = Result<T, JoinError>;
    fn poll(
        mut self: Pin<&mut Self>,
        cx: &mut Context<'_>,
    ) -> Poll<Self::Output> {
        Pin::new(&mut self.handle).poll(cx)
    }
}

impl<T> fmt::Debug for WalletTask<T> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("WalletTask").field("name", &self.name).finish()
    }
}
