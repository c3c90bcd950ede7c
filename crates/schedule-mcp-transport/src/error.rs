use crate::message::RpcError;
use crate::utils::CancellationError;
use core::fmt;
use std::any::Any;
use std::io::Error as IoError;
use thiserror::Error;
use tokio::sync::mpsc;

/// A wrapper around an mpsc send error. Boxing the underlying error into a
/// type-erased form keeps `TransportError` independent of the channel's
/// message type.
#[derive(Debug)]
pub struct GenericSendError {
    inner: Box<dyn Any + Send>,
}

impl GenericSendError {
    pub fn new<T: Send + 'static>(error: mpsc::error::SendError<T>) -> Self {
        Self {
            inner: Box::new(error),
        }
    }
}

impl fmt::Display for GenericSendError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "SendError: failed to send a message.")
    }
}

impl std::error::Error for GenericSendError {}

pub type TransportResult<T> = core::result::Result<T, TransportError>;

#[derive(Debug, Error)]
pub enum TransportError {
    #[error("I/O error: {0}")]
    Io(#[from] IoError),

    #[error("Request timed out after {0} ms")]
    RequestTimeout(u128),

    #[error("Channel closed: {0}")]
    ChannelClosed(#[from] tokio::sync::oneshot::error::RecvError),

    #[error("Operation cancelled: {0}")]
    Cancelled(#[from] CancellationError),

    #[error("{0}")]
    SendError(#[from] GenericSendError),

    #[error("{0}")]
    JsonrpcError(#[from] RpcError),

    #[error("Process error: {0}")]
    ProcessError(String),

    #[error("Internal error: {0}")]
    Internal(String),
}

impl TransportError {
    /// True when the error is the expiry of an outbound request's deadline.
    pub fn is_timeout(&self) -> bool {
        matches!(self, TransportError::RequestTimeout(_))
    }
}
