use std::future::Future;
use std::time::Duration;

use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

use crate::error::{Interrupted, LoginResult};

/// Cancellation and deadline carried through every suspension point of a login
#[derive(Debug, Clone, Default)]
pub struct LoginContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

impl LoginContext {
    pub fn new() -> Self {
        Self::default()
    }

    /// Context that expires `timeout` from now
    pub fn with_timeout(timeout: Duration) -> Self {
        Self::new().deadline(Instant::now() + timeout)
    }

    /// Bind the context to an existing cancellation token
    pub fn with_cancellation(cancel: CancellationToken) -> Self {
        Self {
            cancel,
            deadline: None,
        }
    }

    /// Set an absolute deadline. An earlier deadline already present is kept.
    pub fn deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(match self.deadline {
            Some(existing) if existing < deadline => existing,
            _ => deadline,
        });
        self
    }

    pub fn cancellation_token(&self) -> CancellationToken {
        self.cancel.clone()
    }

    pub fn cancel(&self) {
        self.cancel.cancel();
    }

    /// Returns why the context is done, if it is
    pub fn err(&self) -> Option<Interrupted> {
        if self.cancel.is_cancelled() {
            return Some(Interrupted::Cancelled);
        }
        match self.deadline {
            Some(deadline) if Instant::now() >= deadline => Some(Interrupted::DeadlineExceeded),
            _ => None,
        }
    }

    /// Time left before the deadline, if one is set
    pub fn remaining(&self) -> Option<Duration> {
        self.deadline
            .map(|deadline| deadline.saturating_duration_since(Instant::now()))
    }

    /// Drive `fut` until it finishes or the context is cancelled or expires.
    ///
    /// The future is dropped on interruption, which aborts any in-flight I/O
    /// it owns.
    pub async fn run<F>(&self, fut: F) -> LoginResult<F::Output>
    where
        F: Future,
    {
        if let Some(cause) = self.err() {
            return Err(cause.into());
        }

        let deadline = self.deadline;
        let expired = async move {
            match deadline {
                Some(deadline) => tokio::time::sleep_until(deadline).await,
                None => std::future::pending::<()>().await,
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(Interrupted::Cancelled.into()),
            _ = expired => Err(Interrupted::DeadlineExceeded.into()),
            output = fut => Ok(output),
        }
    }
}
