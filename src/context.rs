//! Per-operation cancellation and timeout context.
//!
//! Every blockset, block store and metadata operation receives an [`OpContext`].
//! Delegated calls that may block (block store and metadata I/O) are wrapped in
//! [`OpContext::run`], which resolves early when the context is cancelled or
//! the per-call timeout elapses.

use std::future::Future;
use std::time::Duration;
use thiserror::Error;
use tokio_util::sync::CancellationToken;

/// Why a guarded call did not complete
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq)]
pub enum Interrupted {
    #[error("operation cancelled")]
    Cancelled,

    #[error("operation timed out after {0:?}")]
    TimedOut(Duration),
}

/// Cancellation signal plus an optional timeout applied to each delegated call
#[derive(Debug, Clone, Default)]
pub struct OpContext {
    token: CancellationToken,
    timeout: Option<Duration>,
}

impl OpContext {
    /// A context that is never cancelled and has no timeout
    pub fn background() -> Self {
        Self::default()
    }

    /// Create a context driven by an existing cancellation token
    pub fn with_token(token: CancellationToken) -> Self {
        Self {
            token,
            timeout: None,
        }
    }

    /// Set the timeout applied to every delegated call
    pub fn with_timeout(mut self, timeout: Duration) -> Self {
        self.timeout = Some(timeout);
        self
    }

    /// Derive a context that is cancelled together with this one but can also
    /// be cancelled on its own.
    pub fn child(&self) -> Self {
        Self {
            token: self.token.child_token(),
            timeout: self.timeout,
        }
    }

    pub fn cancel(&self) {
        self.token.cancel();
    }

    pub fn is_cancelled(&self) -> bool {
        self.token.is_cancelled()
    }

    pub fn timeout(&self) -> Option<Duration> {
        self.timeout
    }

    pub fn token(&self) -> &CancellationToken {
        &self.token
    }

    /// Fail fast if the context is already cancelled
    pub fn check(&self) -> Result<(), Interrupted> {
        if self.token.is_cancelled() {
            Err(Interrupted::Cancelled)
        } else {
            Ok(())
        }
    }

    /// Drive `fut` to completion unless the context is cancelled or the
    /// timeout elapses first.
    pub async fn run<F, T>(&self, fut: F) -> Result<T, Interrupted>
    where
        F: Future<Output = T>,
    {
        self.check()?;

        let guarded = async {
            tokio::select! {
                biased;
                _ = self.token.cancelled() => Err(Interrupted::Cancelled),
                out = fut => Ok(out),
            }
        };

        match self.timeout {
            Some(limit) => tokio::time::timeout(limit, guarded)
                .await
                .unwrap_or(Err(Interrupted::TimedOut(limit))),
            None => guarded.await,
        }
    }
}
