use std::collections::HashMap;
use std::pin::Pin;
use std::sync::Arc;
use std::time::Duration;

use tokio::io::{AsyncBufReadExt, BufReader};
use tokio::sync::Mutex;
use tokio::task::JoinHandle;
use tracing::warn;

use crate::error::{GenericSendError, TransportError};
use crate::message::RpcMessage;
use crate::message_dispatcher::{MessageDispatcher, PendingRequests};
use crate::utils::CancellationToken;

const CHANNEL_CAPACITY: usize = 36;

/// Couples a readable and a writable byte stream into an inbound message
/// stream plus a [`MessageDispatcher`] for the outbound direction.
pub struct RpcStream {}

impl RpcStream {
    /// Wires up the duplex channel.
    ///
    /// Spawns a reader task over `readable`; frames that complete a pending
    /// outbound request are routed to the dispatcher's registry, everything
    /// else is yielded on the returned stream. The dispatcher writes to
    /// `writable`.
    pub fn create(
        readable: Pin<Box<dyn tokio::io::AsyncRead + Send + Sync>>,
        writable: Mutex<Pin<Box<dyn tokio::io::AsyncWrite + Send + Sync>>>,
        request_timeout: Duration,
        cancellation_token: CancellationToken,
    ) -> (
        tokio_stream::wrappers::ReceiverStream<RpcMessage>,
        MessageDispatcher,
    ) {
        let pending_requests: PendingRequests = Arc::new(Mutex::new(HashMap::new()));

        let (tx, rx) = tokio::sync::mpsc::channel::<RpcMessage>(CHANNEL_CAPACITY);
        let stream = tokio_stream::wrappers::ReceiverStream::new(rx);

        #[allow(clippy::let_underscore_future)]
        let _ = Self::spawn_reader(
            readable,
            tx,
            Arc::clone(&pending_requests),
            cancellation_token,
        );

        let sender = MessageDispatcher::new(pending_requests, writable, request_timeout);

        (stream, sender)
    }

    /// Continuously reads newline-delimited frames from the readable stream.
    ///
    /// Malformed lines are skipped. Response and error frames whose id
    /// matches a pending outbound request resolve that request instead of
    /// reaching the inbound stream. Ends on EOF or cancellation.
    fn spawn_reader(
        readable: Pin<Box<dyn tokio::io::AsyncRead + Send + Sync>>,
        tx: tokio::sync::mpsc::Sender<RpcMessage>,
        pending_requests: PendingRequests,
        cancellation_token: CancellationToken,
    ) -> JoinHandle<Result<(), TransportError>> {
        tokio::spawn(async move {
            let mut lines_stream = BufReader::new(readable).lines();

            loop {
                tokio::select! {
                    _ = cancellation_token.cancelled() => {
                        break;
                    },

                    line = lines_stream.next_line() => {
                        match line {
                            Ok(Some(line)) => {
                                let message: RpcMessage = match serde_json::from_str(&line) {
                                    Ok(rpc_message) => rpc_message,
                                    Err(_) => {
                                        // skip malformed messages
                                        continue;
                                    }
                                };

                                if let Some(message) =
                                    Self::route_to_pending(message, &pending_requests).await
                                {
                                    tx.send(message).await.map_err(GenericSendError::new)?;
                                }
                            }
                            Ok(None) => {
                                // EOF reached, exit loop
                                break;
                            }
                            Err(e) => {
                                return Err(TransportError::ProcessError(format!(
                                    "Error reading from the transport stream: {e}"
                                )));
                            }
                        }
                    }
                }
            }
            Ok::<(), TransportError>(())
        })
    }

    /// Hands a response/error frame to the pending request awaiting it.
    /// Returns the message back when no pending request claims it.
    async fn route_to_pending(
        message: RpcMessage,
        pending_requests: &PendingRequests,
    ) -> Option<RpcMessage> {
        let request_id = match &message {
            RpcMessage::Response(response) => response.id.clone(),
            RpcMessage::Error(frame) => frame.id.clone(),
            _ => return Some(message),
        };

        let tx_response = {
            let mut pending_requests = pending_requests.lock().await;
            pending_requests.remove(&request_id)
        };

        match tx_response {
            Some(tx_response) => {
                if tx_response.send(message).is_err() {
                    // the requester gave up (timeout); nothing left to notify
                    warn!("pending request {request_id} was dropped before its response arrived");
                }
                None
            }
            None => Some(message),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::message::{JsonrpcError, JsonrpcResponse, RequestId, RpcError};
    use futures::StreamExt;
    use crate::utils::CancellationTokenSource;
    use serde_json::json;
    use tokio::io::{duplex, split, AsyncBufReadExt, AsyncWriteExt, BufReader};

    fn wire() -> (
        tokio_stream::wrappers::ReceiverStream<RpcMessage>,
        MessageDispatcher,
        tokio::io::WriteHalf<tokio::io::DuplexStream>,
        tokio::io::ReadHalf<tokio::io::DuplexStream>,
        CancellationTokenSource,
    ) {
        let (near, far) = duplex(4096);
        let (near_read, near_write) = split(near);
        let (far_read, far_write) = split(far);
        let (source, token) = CancellationTokenSource::new();
        let (stream, dispatcher) = RpcStream::create(
            Box::pin(near_read),
            Mutex::new(Box::pin(near_write)),
            Duration::from_millis(200),
            token,
        );
        (stream, dispatcher, far_write, far_read, source)
    }

    #[tokio::test]
    async fn inbound_request_reaches_stream() {
        let (mut stream, _dispatcher, mut peer_write, _peer_read, _source) = wire();

        peer_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"id\":3,\"method\":\"ping\"}\n")
            .await
            .unwrap();

        let message = stream.next().await.expect("stream closed");
        assert!(message.is_request());
        assert_eq!(message.request_id(), Some(&RequestId::Integer(3)));
    }

    #[tokio::test]
    async fn malformed_lines_are_skipped() {
        let (mut stream, _dispatcher, mut peer_write, _peer_read, _source) = wire();

        peer_write.write_all(b"this is not json\n").await.unwrap();
        peer_write
            .write_all(b"{\"jsonrpc\":\"2.0\",\"method\":\"notifications/initialized\"}\n")
            .await
            .unwrap();

        let message = stream.next().await.expect("stream closed");
        assert!(matches!(message, RpcMessage::Notification(_)));
    }

    #[tokio::test]
    async fn outbound_request_resolves_on_matching_response() {
        let (_stream, dispatcher, mut peer_write, peer_read, _source) = wire();

        let request_task = tokio::spawn(async move {
            dispatcher
                .send_request("sampling/createMessage", Some(json!({})), None)
                .await
        });

        let mut lines = BufReader::new(peer_read).lines();
        let line = lines.next_line().await.unwrap().expect("no request written");
        let written: RpcMessage = serde_json::from_str(&line).unwrap();
        let id = written.request_id().cloned().expect("request without id");

        let response = JsonrpcResponse::new(id, json!({"model": "m"}));
        let payload = serde_json::to_string(&response).unwrap();
        peer_write.write_all(payload.as_bytes()).await.unwrap();
        peer_write.write_all(b"\n").await.unwrap();

        let result = request_task.await.unwrap().expect("request failed");
        assert_eq!(result, json!({"model": "m"}));
    }

    #[tokio::test]
    async fn outbound_request_surfaces_error_frame() {
        let (_stream, dispatcher, mut peer_write, peer_read, _source) = wire();

        let request_task = tokio::spawn(async move {
            dispatcher.send_request("sampling/createMessage", None, None).await
        });

        let mut lines = BufReader::new(peer_read).lines();
        let line = lines.next_line().await.unwrap().expect("no request written");
        let written: RpcMessage = serde_json::from_str(&line).unwrap();
        let id = written.request_id().cloned().unwrap();

        let frame = JsonrpcError::new(RpcError::internal_error().with_message("nope"), id);
        let payload = serde_json::to_string(&frame).unwrap();
        peer_write.write_all(payload.as_bytes()).await.unwrap();
        peer_write.write_all(b"\n").await.unwrap();

        match request_task.await.unwrap() {
            Err(TransportError::JsonrpcError(error)) => assert_eq!(error.message, "nope"),
            other => panic!("expected jsonrpc error, got {other:?}"),
        }
    }

    #[tokio::test]
    async fn outbound_request_times_out_without_response() {
        let (_stream, dispatcher, _peer_write, _peer_read, _source) = wire();

        let result = dispatcher
            .send_request("ping", None, Some(Duration::from_millis(30)))
            .await;
        assert!(matches!(result, Err(TransportError::RequestTimeout(30))));
    }
}
