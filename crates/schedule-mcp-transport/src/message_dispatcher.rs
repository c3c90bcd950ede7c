use std::collections::HashMap;
use std::pin::Pin;
use std::sync::atomic::{AtomicI64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::Value;
use tokio::io::AsyncWriteExt;
use tokio::sync::oneshot;
use tokio::sync::Mutex;

use crate::error::{TransportError, TransportResult};
use crate::message::{
    JsonrpcError, JsonrpcNotification, JsonrpcRequest, JsonrpcResponse, RequestId, RpcError,
    RpcMessage,
};
use crate::utils::await_timeout;

pub(crate) type PendingRequests = Arc<Mutex<HashMap<RequestId, oneshot::Sender<RpcMessage>>>>;

/// Sends frames over the transport and tracks outbound requests.
///
/// Outbound requests are assigned ids from an atomic counter and parked in a
/// pending-request registry; the reader side completes them when a response
/// or error frame with a matching id arrives. Callers block on the matching
/// response under a configurable timeout.
pub struct MessageDispatcher {
    pending_requests: PendingRequests,
    writable: Mutex<Pin<Box<dyn tokio::io::AsyncWrite + Send + Sync>>>,
    message_id_counter: AtomicI64,
    request_timeout: Duration,
}

impl MessageDispatcher {
    pub(crate) fn new(
        pending_requests: PendingRequests,
        writable: Mutex<Pin<Box<dyn tokio::io::AsyncWrite + Send + Sync>>>,
        request_timeout: Duration,
    ) -> Self {
        Self {
            pending_requests,
            writable,
            message_id_counter: AtomicI64::new(0),
            request_timeout,
        }
    }

    fn next_request_id(&self) -> RequestId {
        RequestId::Integer(self.message_id_counter.fetch_add(1, Ordering::Relaxed))
    }

    async fn store_pending_request(&self, request_id: RequestId) -> oneshot::Receiver<RpcMessage> {
        let (tx_response, rx_response) = oneshot::channel::<RpcMessage>();
        let mut pending_requests = self.pending_requests.lock().await;
        pending_requests.insert(request_id, tx_response);
        rx_response
    }

    async fn remove_pending_request(&self, request_id: &RequestId) {
        let mut pending_requests = self.pending_requests.lock().await;
        pending_requests.remove(request_id);
    }

    /// Sends a request to the peer and awaits the matching response.
    ///
    /// Returns the response `result` payload, or an error if the peer
    /// replied with an error frame, the connection closed, or the timeout
    /// elapsed. On timeout the pending entry is dropped so a late response
    /// cannot leak.
    pub async fn send_request(
        &self,
        method: &str,
        params: Option<Value>,
        request_timeout: Option<Duration>,
    ) -> TransportResult<Value> {
        let request_id = self.next_request_id();
        let rx_response = self.store_pending_request(request_id.clone()).await;

        let request = JsonrpcRequest::new(request_id.clone(), method, params);
        let payload = serde_json::to_string(&request)
            .map_err(|_| TransportError::JsonrpcError(RpcError::parse_error()))?;

        if let Err(error) = self.write_str(payload.as_str()).await {
            self.remove_pending_request(&request_id).await;
            return Err(error);
        }

        let timeout = request_timeout.unwrap_or(self.request_timeout);
        match await_timeout(rx_response, timeout).await {
            Ok(RpcMessage::Response(response)) => Ok(response.result),
            Ok(RpcMessage::Error(frame)) => Err(TransportError::JsonrpcError(frame.error)),
            Ok(_) => Err(TransportError::Internal(
                "non-response frame routed to a pending request".to_string(),
            )),
            Err(error) => {
                self.remove_pending_request(&request_id).await;
                Err(error)
            }
        }
    }

    /// Sends a successful response for an inbound request.
    pub async fn send_response(&self, id: RequestId, result: Value) -> TransportResult<()> {
        let response = JsonrpcResponse::new(id, result);
        let payload = serde_json::to_string(&response)
            .map_err(|_| TransportError::JsonrpcError(RpcError::parse_error()))?;
        self.write_str(payload.as_str()).await
    }

    /// Sends an error frame for an inbound request that could not be served.
    pub async fn send_error(&self, id: RequestId, error: RpcError) -> TransportResult<()> {
        let frame = JsonrpcError::new(error, id);
        let payload = serde_json::to_string(&frame)
            .map_err(|_| TransportError::JsonrpcError(RpcError::parse_error()))?;
        self.write_str(payload.as_str()).await
    }

    pub async fn send_notification(
        &self,
        method: &str,
        params: Option<Value>,
    ) -> TransportResult<()> {
        let notification = JsonrpcNotification::new(method, params);
        let payload = serde_json::to_string(&notification)
            .map_err(|_| TransportError::JsonrpcError(RpcError::parse_error()))?;
        self.write_str(payload.as_str()).await
    }

    /// Writes one frame to the writable stream, newline-terminated, and
    /// flushes.
    async fn write_str(&self, payload: &str) -> TransportResult<()> {
        let mut writable = self.writable.lock().await;
        writable.write_all(payload.as_bytes()).await?;
        writable.write_all(b"\n").await?;
        writable.flush().await?;
        Ok(())
    }
}
