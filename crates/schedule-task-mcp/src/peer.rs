use std::sync::Arc;
use std::time::Duration;

use async_trait::async_trait;
use schedule_mcp_transport::error::TransportError;
use schedule_mcp_transport::schema::{
    methods, CreateMessageRequestParams, CreateMessageResult,
};
use schedule_mcp_transport::MessageDispatcher;

use crate::error::{SchedulerError, SchedulerResult};

/// The reverse-RPC channel a fire uses to ask the peer for generated text.
///
/// Implemented by the live transport dispatcher once a client with the
/// sampling capability has completed the handshake; tests substitute stubs.
#[async_trait]
pub trait SamplingPeer: Send + Sync {
    async fn create_message(
        &self,
        params: CreateMessageRequestParams,
        timeout: Duration,
    ) -> SchedulerResult<CreateMessageResult>;
}

/// Sampling peer backed by the transport's message dispatcher.
pub struct DispatcherSamplingPeer {
    dispatcher: Arc<MessageDispatcher>,
}

impl DispatcherSamplingPeer {
    pub fn new(dispatcher: Arc<MessageDispatcher>) -> Self {
        Self { dispatcher }
    }
}

#[async_trait]
impl SamplingPeer for DispatcherSamplingPeer {
    async fn create_message(
        &self,
        params: CreateMessageRequestParams,
        timeout: Duration,
    ) -> SchedulerResult<CreateMessageResult> {
        let params = serde_json::to_value(&params)?;
        let result = self
            .dispatcher
            .send_request(methods::SAMPLING_CREATE_MESSAGE, Some(params), Some(timeout))
            .await
            .map_err(|error| match error {
                TransportError::RequestTimeout(ms) => {
                    SchedulerError::SamplingTimeout(round_to_seconds(ms))
                }
                other => SchedulerError::Transport(other),
            })?;

        serde_json::from_value(result)
            .map_err(|e| SchedulerError::Execution(format!("malformed sampling response: {e}")))
    }
}

pub(crate) fn round_to_seconds(ms: u128) -> u64 {
    ((ms as f64) / 1000.0).round() as u64
}
