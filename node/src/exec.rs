// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.
//
// Copyright (c) the Quill developers. All rights reserved.

//! Execution contexts over the tokio runtime: pooled operations with
//! cooperative stop tokens, serialized strands and cancellable timers.
//! Every long-running loop in the node observes its token at suspension
//! points; nothing here preempts.

use std::future::Future;
use std::pin::Pin;
use std::sync::OnceLock;
use std::time::Duration;

use tokio::sync::mpsc;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

/// Cooperative stop signal handed to every spawned operation.
pub type StopToken = CancellationToken;

#[derive(Debug, thiserror::Error, Clone, PartialEq, Eq)]
pub enum OpError {
    /// The operation was aborted or its stop token fired before completion.
    #[error("operation cancelled")]
    Cancelled,
    /// The operation panicked; the payload is logged, not rethrown.
    #[error("operation panicked")]
    Panicked,
}

/// Handle to a spawned operation: await it, abort it, or request a
/// cooperative stop.
pub struct Operation<T> {
    handle: JoinHandle<T>,
    token: StopToken,
}

impl<T> Operation<T> {
    /// Await the result. Abortion and stop-token cancellation surface as
    /// [`OpError::Cancelled`], never as a silent success.
    pub async fn wait(self) -> Result<T, OpError> {
        match self.handle.await {
            Ok(value) => Ok(value),
            Err(err) if err.is_cancelled() => Err(OpError::Cancelled),
            Err(_) => Err(OpError::Panicked),
        }
    }

    /// Hard-abort the task at its next await point. Idempotent.
    pub fn abort(&self) {
        self.handle.abort();
    }

    /// Signal the task to stop cooperatively; the task observes the token
    /// at its suspension points.
    pub fn request_stop(&self) {
        self.token.cancel();
    }

    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

/// A pool-backed execution context. Cloning shares the same stop-token
/// lineage: cancelling a parent context stops everything spawned below it.
#[derive(Clone)]
pub struct ExecutionContext {
    token: StopToken,
}

impl Default for ExecutionContext {
    fn default() -> Self {
        Self::new()
    }
}

impl ExecutionContext {
    pub fn new() -> Self {
        Self {
            token: CancellationToken::new(),
        }
    }

    /// The process-wide context used for fire-and-forget work and timers.
    pub fn system() -> &'static ExecutionContext {
        static SYSTEM: OnceLock<ExecutionContext> = OnceLock::new();
        SYSTEM.get_or_init(ExecutionContext::new)
    }

    /// A context whose token is cancelled together with this one.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
        }
    }

    pub fn token(&self) -> StopToken {
        self.token.clone()
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    /// Spawn `f` on the pool. The closure receives its own stop token,
    /// a child of the context token.
    pub fn execute<F, Fut, T>(&self, f: F) -> Operation<T>
    where
        F: FnOnce(StopToken) -> Fut,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let token = self.token.child_token();
        let fut = f(token.clone());
        Operation {
            handle: tokio::spawn(fut),
            token,
        }
    }

    /// Schedule `f` to run after `delay`. Cancelling the returned operation
    /// aborts the pending fire.
    pub fn schedule_after<F, Fut, T>(
        &self,
        delay: Duration,
        f: F,
    ) -> Operation<Option<T>>
    where
        F: FnOnce() -> Fut + Send + 'static,
        Fut: Future<Output = T> + Send + 'static,
        T: Send + 'static,
    {
        let token = self.token.child_token();
        let fired = token.clone();
        Operation {
            handle: tokio::spawn(async move {
                tokio::select! {
                    _ = fired.cancelled() => None,
                    _ = tokio::time::sleep(delay) => Some(f().await),
                }
            }),
            token,
        }
    }

    /// Create a strand serializing closures posted to it.
    pub fn strand(&self) -> Strand {
        Strand::new(self.token.child_token())
    }
}

type StrandJob = Pin<Box<dyn Future<Output = ()> + Send>>;

/// Single-writer serialization over the pool: jobs posted to the same
/// strand never overlap and run FIFO.
#[derive(Clone)]
pub struct Strand {
    jobs: mpsc::UnboundedSender<StrandJob>,
}

impl Strand {
    fn new(token: StopToken) -> Self {
        let (jobs, mut rx) = mpsc::unbounded_channel::<StrandJob>();
        tokio::spawn(async move {
            loop {
                tokio::select! {
                    _ = token.cancelled() => break,
                    job = rx.recv() => match job {
                        Some(job) => job.await,
                        None => break,
                    },
                }
            }
        });
        Self { jobs }
    }

    /// Post a job. Returns false if the strand has shut down.
    pub fn post<Fut>(&self, fut: Fut) -> bool
    where
        Fut: Future<Output = ()> + Send + 'static,
    {
        self.jobs.send(Box::pin(fut)).is_ok()
    }
}

#[cfg(test)]
mod tests {
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::sync::Arc;

    use super::*;

    #[tokio::test]
    async fn execute_and_wait() {
        let ctx = ExecutionContext::new();
        let op = ctx.execute(|_| async { 21 * 2 });
        assert_eq!(op.wait().await.unwrap(), 42);
    }

    #[tokio::test]
    async fn abort_surfaces_cancelled() {
        let ctx = ExecutionContext::new();
        let op = ctx.execute(|_| async {
            tokio::time::sleep(Duration::from_secs(600)).await;
        });
        op.abort();
        assert_eq!(op.wait().await.unwrap_err(), OpError::Cancelled);
    }

    #[tokio::test]
    async fn stop_token_is_cooperative() {
        let ctx = ExecutionContext::new();
        let op = ctx.execute(|token| async move {
            token.cancelled().await;
            "drained"
        });
        op.request_stop();
        assert_eq!(op.wait().await.unwrap(), "drained");
    }

    #[tokio::test]
    async fn cancelling_parent_stops_children() {
        let ctx = ExecutionContext::new();
        let child = ctx.child();
        let op = child.execute(|token| async move {
            token.cancelled().await;
            true
        });
        ctx.cancel();
        assert!(op.wait().await.unwrap());
    }

    #[tokio::test]
    async fn timer_abort_suppresses_fire() {
        let ctx = ExecutionContext::new();
        let fired = Arc::new(AtomicU32::new(0));
        let observer = fired.clone();
        let op = ctx.schedule_after(Duration::from_millis(50), move || {
            let observer = observer.clone();
            async move {
                observer.fetch_add(1, Ordering::SeqCst);
            }
        });
        op.request_stop();
        assert_eq!(op.wait().await.unwrap(), None);
        assert_eq!(fired.load(Ordering::SeqCst), 0);
    }

    #[tokio::test]
    async fn strand_serializes_fifo() {
        let ctx = ExecutionContext::new();
        let strand = ctx.strand();
        let seen = Arc::new(parking_lot::Mutex::new(Vec::new()));

        for i in 0..16u32 {
            let seen = seen.clone();
            strand.post(async move {
                // Yield mid-job; a non-serialized pool would interleave.
                tokio::task::yield_now().await;
                seen.lock().push(i);
            });
        }

        tokio::time::sleep(Duration::from_millis(100)).await;
        assert_eq!(*seen.lock(), (0..16).collect::<Vec<_>>());
    }
}
