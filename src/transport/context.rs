//! NR-011: Cancellation and deadline context passed to every runner call.

use crate::error::RunError;
use std::time::Duration;
use tokio::sync::watch;
use tokio::time::Instant;

/// Carries cancellation and an optional deadline. Cheap to clone.
#[derive(Debug, Clone, Default)]
pub struct Context {
    cancel: Option<watch::Receiver<bool>>,
    deadline: Option<Instant>,
}

/// Cancels every [`Context`] derived from the one it was created with.
#[derive(Debug)]
pub struct CancelHandle(watch::Sender<bool>);

impl CancelHandle {
    pub fn cancel(&self) {
        let _ = self.0.send(true);
    }
}

impl Context {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    /// A cancellable context and the handle that cancels it.
    pub fn with_cancel() -> (Self, CancelHandle) {
        let (tx, rx) = watch::channel(false);
        (
            Self {
                cancel: Some(rx),
                deadline: None,
            },
            CancelHandle(tx),
        )
    }

    /// Derive a context whose deadline is at most `timeout` from now.
    pub fn with_timeout(&self, timeout: Duration) -> Self {
        let candidate = Instant::now() + timeout;
        let deadline = match self.deadline {
            Some(existing) if existing < candidate => existing,
            _ => candidate,
        };
        Self {
            cancel: self.cancel.clone(),
            deadline: Some(deadline),
        }
    }

    /// A context that ignores the parent's cancellation and deadline.
    /// Used for unwinding after the parent gave up.
    pub fn detached(&self, timeout: Duration) -> Self {
        Self::background().with_timeout(timeout)
    }

    /// Non-blocking check. `Some` once cancelled or past the deadline.
    pub fn err(&self) -> Option<RunError> {
        if let Some(rx) = &self.cancel {
            if *rx.borrow() {
                return Some(RunError::Cancelled);
            }
        }
        match self.deadline {
            Some(d) if Instant::now() >= d => Some(RunError::DeadlineExceeded),
            _ => None,
        }
    }

    /// Resolves when the context is cancelled or its deadline passes.
    pub async fn done(&self) -> RunError {
        let cancelled = async {
            match self.cancel.clone() {
                Some(mut rx) => loop {
                    if *rx.borrow_and_update() {
                        return;
                    }
                    if rx.changed().await.is_err() {
                        // Handle dropped without cancelling.
                        std::future::pending::<()>().await;
                    }
                },
                None => std::future::pending::<()>().await,
            }
        };
        let expired = async {
            match self.deadline {
                Some(d) => tokio::time::sleep_until(d).await,
                None => std::future::pending::<()>().await,
            }
        };
        tokio::select! {
            _ = cancelled => RunError::Cancelled,
            _ = expired => RunError::DeadlineExceeded,
        }
    }
}
