use crate::core::RemoteError;
use std::future::Future;
use std::time::Duration;
use tokio::time::Instant;
use tokio_util::sync::CancellationToken;

/// Cancellation and deadline scope threaded through every remote call.
#[derive(Debug, Clone, Default)]
pub struct CallContext {
    cancel: CancellationToken,
    deadline: Option<Instant>,
}

/// Why a guarded remote call did not produce a value.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) enum CallFailure {
    Remote(RemoteError),
    /// `in_flight` is set when the call had already been issued.
    Cancelled { in_flight: bool },
}

impl CallContext {
    /// A context that is never cancelled and has no deadline.
    pub fn background() -> Self {
        Self::default()
    }

    pub fn with_timeout(self, timeout: Duration) -> Self {
        self.with_deadline(Instant::now() + timeout)
    }

    pub fn with_deadline(mut self, deadline: Instant) -> Self {
        self.deadline = Some(deadline);
        self
    }

    pub fn with_cancellation(mut self, token: CancellationToken) -> Self {
        self.cancel = token;
        self
    }

    pub fn cancellation_token(&self) -> &CancellationToken {
        &self.cancel
    }

    pub fn is_cancelled(&self) -> bool {
        self.cancel.is_cancelled()
    }

    pub fn deadline(&self) -> Option<Instant> {
        self.deadline
    }

    /// Earlier of the context deadline and `now + rpc_timeout`.
    pub fn effective_deadline(&self, rpc_timeout: Option<Duration>) -> Option<Instant> {
        let per_call = rpc_timeout.map(|timeout| Instant::now() + timeout);
        match (self.deadline, per_call) {
            (Some(a), Some(b)) => Some(a.min(b)),
            (a, b) => a.or(b),
        }
    }

    /// Runs `call`, racing it against cancellation and the effective deadline.
    pub(crate) async fn guard<T, F>(
        &self,
        rpc_timeout: Option<Duration>,
        call: F,
    ) -> std::result::Result<T, CallFailure>
    where
        F: Future<Output = std::result::Result<T, RemoteError>>,
    {
        if self.is_cancelled() {
            return Err(CallFailure::Cancelled { in_flight: false });
        }
        let deadline = self.effective_deadline(rpc_timeout);
        let started = Instant::now();
        let bounded = async {
            match deadline {
                Some(deadline) => match tokio::time::timeout_at(deadline, call).await {
                    Ok(result) => result.map_err(CallFailure::Remote),
                    Err(_) => Err(CallFailure::Remote(RemoteError::DeadlineExceeded(
                        started.elapsed(),
                    ))),
                },
                None => call.await.map_err(CallFailure::Remote),
            }
        };

        tokio::select! {
            biased;
            _ = self.cancel.cancelled() => Err(CallFailure::Cancelled { in_flight: true }),
            outcome = bounded => outcome,
        }
    }
}
