use std::sync::Arc;
use std::time::Duration;

use tokio::sync::Mutex;

use crate::error::TransportResult;
use crate::message::RpcMessage;
use crate::message_dispatcher::MessageDispatcher;
use crate::rpc_stream::RpcStream;
use crate::utils::CancellationTokenSource;

/// Default timeout in milliseconds for outbound requests.
const DEFAULT_TIMEOUT_MSEC: u64 = 60_000;

/// Configuration for the transport layer.
#[derive(Debug, Clone)]
pub struct TransportOptions {
    /// Maximum amount of time to wait for a response to an outbound request
    /// before considering it timed out.
    pub timeout: Duration,
}

impl Default for TransportOptions {
    fn default() -> Self {
        Self {
            timeout: Duration::from_millis(DEFAULT_TIMEOUT_MSEC),
        }
    }
}

/// Standard I/O transport for MCP communication.
///
/// Serves the current process's stdin/stdout as one newline-delimited
/// JSON-RPC duplex stream. Both directions share the stream: inbound tool
/// calls arrive on stdin, responses and server-initiated requests leave on
/// stdout. Diagnostics must go to stderr, which this transport never touches.
pub struct StdioTransport {
    options: TransportOptions,
    shutdown_source: tokio::sync::RwLock<Option<CancellationTokenSource>>,
    is_shut_down: Mutex<bool>,
}

impl StdioTransport {
    pub fn new(options: TransportOptions) -> TransportResult<Self> {
        Ok(Self {
            options,
            shutdown_source: tokio::sync::RwLock::new(None),
            is_shut_down: Mutex::new(false),
        })
    }

    /// Starts the transport over the current process's stdio streams.
    ///
    /// # Returns
    /// A stream of inbound messages and a dispatcher for the outbound
    /// direction. Response frames matching a pending outbound request are
    /// consumed by the dispatcher's registry and never appear on the stream.
    pub async fn start(
        &self,
    ) -> TransportResult<(
        tokio_stream::wrappers::ReceiverStream<RpcMessage>,
        Arc<MessageDispatcher>,
    )> {
        let (source, token) = CancellationTokenSource::new();
        let mut lock = self.shutdown_source.write().await;
        *lock = Some(source);

        let (stream, sender) = RpcStream::create(
            Box::pin(tokio::io::stdin()),
            Mutex::new(Box::pin(tokio::io::stdout())),
            self.options.timeout,
            token,
        );

        Ok((stream, Arc::new(sender)))
    }

    pub async fn is_shut_down(&self) -> bool {
        let result = self.is_shut_down.lock().await;
        *result
    }

    /// Shuts down the transport, stopping the reader task.
    pub async fn shut_down(&self) -> TransportResult<()> {
        let lock = self.shutdown_source.read().await;
        if let Some(source) = lock.as_ref() {
            source.cancel()?;
            let mut lock = self.is_shut_down.lock().await;
            *lock = true;
        }
        Ok(())
    }
}
