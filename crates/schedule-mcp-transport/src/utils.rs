use std::sync::Arc;
use tokio::sync::watch;
use tokio::time::{timeout, Duration};

use crate::error::{TransportError, TransportResult};

/// Awaits `operation` for at most `timeout_duration`, mapping expiry to
/// [`TransportError::RequestTimeout`].
pub async fn await_timeout<F, T, E>(operation: F, timeout_duration: Duration) -> TransportResult<T>
where
    F: std::future::Future<Output = Result<T, E>>,
    E: Into<TransportError>,
{
    match timeout(timeout_duration, operation).await {
        Ok(result) => result.map_err(|err| err.into()),
        Err(_) => Err(TransportError::RequestTimeout(
            timeout_duration.as_millis(),
        )),
    }
}

#[derive(Debug, thiserror::Error)]
pub enum CancellationError {
    #[error("Cancellation channel closed")]
    ChannelClosed,
}

/// Token used by tasks to check or await cancellation.
///
/// Holds a receiver for a watch channel; cloneable so multiple tasks can
/// share the same token.
#[derive(Clone)]
pub struct CancellationToken {
    receiver: watch::Receiver<bool>,
}

/// Source that controls cancellation for its associated tokens.
pub struct CancellationTokenSource {
    sender: Arc<watch::Sender<bool>>,
}

impl CancellationTokenSource {
    pub fn new() -> (Self, CancellationToken) {
        let (sender, receiver) = watch::channel(false);
        (
            CancellationTokenSource {
                sender: Arc::new(sender),
            },
            CancellationToken { receiver },
        )
    }

    pub fn cancel(&self) -> Result<(), CancellationError> {
        self.sender
            .send(true)
            .map_err(|_| CancellationError::ChannelClosed)
    }

    pub fn token(&self) -> CancellationToken {
        CancellationToken {
            receiver: self.sender.subscribe(),
        }
    }
}

impl CancellationToken {
    pub fn is_cancelled(&self) -> bool {
        *self.receiver.borrow()
    }

    /// Completes once cancellation is signalled, or errs if the source is
    /// dropped without signalling.
    pub async fn cancelled(&self) -> Result<(), CancellationError> {
        let mut receiver = self.receiver.clone();
        loop {
            if *receiver.borrow() {
                return Ok(());
            }
            receiver
                .changed()
                .await
                .map_err(|_| CancellationError::ChannelClosed)?;
        }
    }
}
