//! Bounded, non-blocking error reporting channel.
//!
//! One surfaced error is sufficient to initiate shutdown, so the channel has
//! capacity 1 and producers drop on full instead of blocking.

use tokio::sync::mpsc;
use tracing::debug;

use crate::error::ChetlError;

/// Sending half of the pipeline error channel.
#[derive(Debug, Clone)]
pub struct ErrorTx(mpsc::Sender<ChetlError>);

impl ErrorTx {
    /// Reports an error without blocking; drops it when one is already
    /// pending.
    pub fn send(&self, error: ChetlError) {
        if self.0.try_send(error).is_err() {
            debug!("error channel full, dropping error");
        }
    }
}

/// Receiving half of the pipeline error channel.
pub type ErrorRx = mpsc::Receiver<ChetlError>;

/// Creates the bounded pipeline error channel.
pub fn error_channel() -> (ErrorTx, ErrorRx) {
    let (tx, rx) = mpsc::channel(1);
    (ErrorTx(tx), rx)
}
