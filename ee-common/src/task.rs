//! Named task handles and structured joins.
//!
//! Spawned tasks are easy to leak: a panic inside a bare
//! [`tokio::spawn`] is silently swallowed until someone joins the handle.
//! [`EeTask`] gives every task a name, propagates panics to whoever polls
//! the handle, and [`join_static_tasks`] turns "one of our service tasks
//! died" into a visible shutdown instead of a half-alive process.

use std::{
    borrow::Cow,
    future::Future,
    pin::Pin,
    task::{Context, Poll},
    time::Duration,
};

use futures::{stream::FuturesUnordered, StreamExt};
use tokio::task::{JoinError, JoinHandle};
use tracing::{error, info, warn};

use crate::shutdown::ShutdownSignal;

/// A [`JoinHandle`] wrapper carrying a task name, propagating panics to the
/// poller instead of surfacing them as [`JoinError`]s.
#[must_use]
pub struct EeTask<T> {
    handle: JoinHandle<T>,
    name: Cow<'static, str>,
}

impl<T: Send + 'static> EeTask<T> {
    /// Spawn a named task onto the current runtime.
    pub fn spawn<F>(name: impl Into<Cow<'static, str>>, future: F) -> Self
    where
        F: Future<Output = T> + Send + 'static,
    {
        Self {
            handle: tokio::spawn(future),
            name: name.into(),
        }
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }

    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Drop the handle, letting the task run detached. Use sparingly; a
    /// detached task's panics are only surfaced through logs.
    pub fn detach(self) {
        drop(self.handle);
    }
}

impl<T> Future for EeTask<T> {
    type Output = Result<T, JoinError>;

    fn poll(mut self: Pin<&mut Self>, cx: &mut Context<'_>) -> Poll<Self::Output> {
        let result = match Pin::new(&mut self.handle).poll(cx) {
            Poll::Ready(result) => result,
            Poll::Pending => return Poll::Pending,
        };
        let result = match result {
            Ok(value) => Ok(value),
            Err(join_err) => match join_err.try_into_panic() {
                Ok(panic_reason) => {
                    error!("task '{}' panicked", self.name);
                    std::panic::resume_unwind(panic_reason)
                }
                Err(join_err) => Err(join_err),
            },
        };
        Poll::Ready(result)
    }
}

/// Drive a set of service tasks until shutdown.
///
/// Each task in `tasks` is expected to run for the life of the process. If
/// any of them finishes early, a shutdown is triggered so the process fails
/// whole rather than limping. After the shutdown signal, remaining tasks get
/// `shutdown_timeout` to wind down before being reported as hung.
pub async fn join_static_tasks(
    tasks: Vec<EeTask<()>>,
    shutdown: ShutdownSignal,
    shutdown_timeout: Duration,
) {
    let mut running: FuturesUnordered<_> = tasks
        .into_iter()
        .map(|task| async move {
            let name = task.name().to_owned();
            let result = task.await;
            (name, result)
        })
        .collect();

    loop {
        tokio::select! {
            biased;
            () = shutdown.recv() => break,
            Some((name, result)) = running.next() => {
                match result {
                    Ok(()) => warn!("task '{name}' finished prematurely"),
                    Err(e) => warn!("task '{name}' failed prematurely: {e:#}"),
                }
                shutdown.send();
                break;
            }
        }
    }

    let drain = async {
        while let Some((name, result)) = running.next().await {
            match result {
                Ok(()) => info!("task '{name}' finished"),
                Err(e) if e.is_cancelled() => info!("task '{name}' cancelled"),
                Err(e) => warn!("task '{name}' errored during shutdown: {e:#}"),
            }
        }
    };
    if tokio::time::timeout(shutdown_timeout, drain).await.is_err() {
        warn!("some tasks did not finish before the shutdown timeout");
    }
}
