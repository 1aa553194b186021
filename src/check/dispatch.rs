//! Asynchronous dispatch of check calls with exactly-once completion.
//!
//! Each call runs on its own task and reports through a single-shot
//! channel. The owning state machine holds the [`PendingCheck`]; completion
//! is therefore always delivered on a later poll, never inside the call
//! that started it.
//!
//! Cancellation closes the receiver before signalling the task, so a result
//! that races with `cancel` is dropped on the floor.

use std::sync::Arc;

use tokio::sync::oneshot;
use tokio_util::sync::CancellationToken;
use tracing::{Instrument, Span, field, info_span, trace};

use super::{CheckClient, CheckError, CheckRequest, CheckResponse, CheckStatus};

/// Completion value of a dispatched check.
pub type CheckResult = Result<CheckResponse, CheckError>;

/// Handle to one in-flight check call.
///
/// Dropping the handle cancels the call.
#[derive(Debug)]
pub struct PendingCheck {
    receiver: oneshot::Receiver<CheckResult>,
    cancel: CancellationToken,
    cancelled: bool,
}

impl PendingCheck {
    /// Wait for the call to finish.
    ///
    /// Returns [`CheckError::Cancelled`] if the handle was cancelled or the
    /// task went away without reporting.
    pub async fn outcome(&mut self) -> CheckResult {
        if self.cancelled {
            return Err(CheckError::Cancelled);
        }
        match (&mut self.receiver).await {
            Ok(result) => result,
            Err(_) => Err(CheckError::Cancelled),
        }
    }

    /// Non-blocking poll for a finished call.
    #[cfg(test)]
    fn try_outcome(&mut self) -> Option<CheckResult> {
        if self.cancelled {
            return None;
        }
        self.receiver.try_recv().ok()
    }

    /// Cancel the call. Idempotent; no result is observable afterwards.
    pub fn cancel(&mut self) {
        if self.cancelled {
            return;
        }
        self.cancelled = true;
        self.receiver.close();
        self.cancel.cancel();
    }

    #[cfg(test)]
    fn is_cancelled(&self) -> bool {
        self.cancelled
    }
}

impl Drop for PendingCheck {
    fn drop(&mut self) {
        self.cancel();
    }
}

/// Issue one check call on a background task.
///
/// The call runs inside an `authz_check` span parented to `parent`; the
/// span's `status` field ends up as `ok`, `unauthorized` or `error`.
///
/// Must be called from within a Tokio runtime.
pub fn dispatch(
    client: Arc<dyn CheckClient>,
    request: CheckRequest,
    parent: &Span,
) -> PendingCheck {
    let (sender, receiver) = oneshot::channel();
    let cancel = CancellationToken::new();
    let token = cancel.clone();
    let span = info_span!(
        parent: parent,
        "authz_check",
        direction = request.direction.as_str(),
        status = field::Empty
    );

    tokio::spawn(
        async move {
            tokio::select! {
                biased;
                () = token.cancelled() => {
                    trace!("check call cancelled");
                }
                result = client.check(request) => {
                    let status = match &result {
                        Ok(response) if response.status == CheckStatus::Ok => "ok",
                        Ok(response) if response.status == CheckStatus::Denied => "unauthorized",
                        _ => "error",
                    };
                    Span::current().record("status", status);
                    // Receiver is closed if the check was cancelled meanwhile.
                    let _ = sender.send(result);
                }
            }
        }
        .instrument(span),
    );

    PendingCheck {
        receiver,
        cancel,
        cancelled: false,
    }
}
