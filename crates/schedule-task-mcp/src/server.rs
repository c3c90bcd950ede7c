//! Runtime loop: serves inbound requests over stdio and wires the reverse
//! sampling channel to the scheduler once a capable client completes the
//! handshake.

use std::sync::{Arc, RwLock};

use futures::StreamExt;
use schedule_mcp_transport::schema::{
    methods, CallToolRequestParams, Implementation, InitializeRequestParams, InitializeResult,
    ListToolsResult, ServerCapabilities, ServerCapabilitiesSampling, ServerCapabilitiesTools,
    LATEST_PROTOCOL_VERSION, SUPPORTED_PROTOCOL_VERSIONS,
};
use schedule_mcp_transport::{MessageDispatcher, RpcError, RpcMessage, StdioTransport};
use serde_json::{json, Value};
use tracing::{debug, info, warn};

use crate::error::SchedulerResult;
use crate::handler::ToolDispatcher;
use crate::peer::DispatcherSamplingPeer;
use crate::scheduler::TaskScheduler;
use crate::tools;

pub struct ScheduleTaskServer {
    scheduler: Arc<TaskScheduler>,
    tool_dispatcher: ToolDispatcher,
    server_details: InitializeResult,
    client_details: RwLock<Option<InitializeRequestParams>>,
}

impl ScheduleTaskServer {
    pub fn new(scheduler: Arc<TaskScheduler>) -> Self {
        let server_details = InitializeResult {
            protocol_version: LATEST_PROTOCOL_VERSION.to_string(),
            capabilities: ServerCapabilities {
                tools: Some(ServerCapabilitiesTools::default()),
                sampling: Some(ServerCapabilitiesSampling::default()),
            },
            server_info: Implementation {
                name: "schedule-task-mcp".to_string(),
                version: env!("CARGO_PKG_VERSION").to_string(),
            },
            instructions: Some(
                "Manage durable scheduled tasks: create_task registers interval, cron or \
                 one-shot jobs; tasks with an agent_prompt fire sampling requests back to \
                 the client."
                    .to_string(),
            ),
        };

        Self {
            tool_dispatcher: ToolDispatcher::new(Arc::clone(&scheduler)),
            scheduler,
            server_details,
            client_details: RwLock::new(None),
        }
    }

    fn client_info(&self) -> Option<InitializeRequestParams> {
        match self.client_details.read() {
            Ok(details) => details.clone(),
            Err(_) => None,
        }
    }

    pub fn client_supports_sampling(&self) -> Option<bool> {
        self.client_info()
            .map(|details| details.capabilities.sampling.is_some())
    }

    /// Main runtime loop. Returns once the peer closes the stream; timers
    /// are unarmed before returning.
    ///
    /// Each inbound request is served on its own task so a slow tool call
    /// (a manual fire awaiting its sampling round-trip) cannot stall other
    /// callers or the stream.
    pub async fn start(self: Arc<Self>, transport: &StdioTransport) -> SchedulerResult<()> {
        let (mut stream, dispatcher) = transport.start().await?;

        info!("schedule-task-mcp serving on stdio");

        while let Some(message) = stream.next().await {
            match message {
                RpcMessage::Request(request) => {
                    let server = Arc::clone(&self);
                    let dispatcher = Arc::clone(&dispatcher);
                    tokio::spawn(async move {
                        let result = server
                            .handle_request(&request.method, request.params, &dispatcher)
                            .await;
                        let send_result = match result {
                            Ok(value) => dispatcher.send_response(request.id, value).await,
                            Err(error) => dispatcher.send_error(request.id, error).await,
                        };
                        if let Err(error) = send_result {
                            warn!("failed to send response for {}: {error}", request.method);
                        }
                    });
                }
                RpcMessage::Notification(notification) => {
                    if notification.method == methods::NOTIFICATION_INITIALIZED {
                        info!("client completed initialization");
                    } else {
                        debug!("ignoring notification {}", notification.method);
                    }
                }
                RpcMessage::Error(frame) => {
                    warn!(
                        "peer reported error for request {}: {}",
                        frame.id, frame.error
                    );
                }
                // responses to our requests are resolved inside the
                // transport; anything surfacing here is unmatched
                RpcMessage::Response(response) => {
                    debug!("dropping unmatched response {}", response.id);
                }
            }
        }

        info!("input stream closed; shutting down");
        self.scheduler.shutdown().await;
        Ok(())
    }

    async fn handle_request(
        &self,
        method: &str,
        params: Option<Value>,
        dispatcher: &Arc<MessageDispatcher>,
    ) -> Result<Value, RpcError> {
        match method {
            methods::INITIALIZE => {
                let params: InitializeRequestParams = parse_params(params)?;
                self.handle_initialize(params, dispatcher).await
            }
            methods::PING => Ok(json!({})),
            methods::TOOLS_LIST => {
                let result = ListToolsResult {
                    tools: tools::catalogue(),
                };
                serde_json::to_value(result)
                    .map_err(|e| RpcError::internal_error().with_message(e.to_string()))
            }
            methods::TOOLS_CALL => {
                let params: CallToolRequestParams = parse_params(params)?;
                let result = self
                    .tool_dispatcher
                    .call(&params.name, params.arguments)
                    .await;
                serde_json::to_value(result)
                    .map_err(|e| RpcError::internal_error().with_message(e.to_string()))
            }
            other => Err(RpcError::method_not_found()
                .with_message(format!("No handler is implemented for '{other}'."))),
        }
    }

    async fn handle_initialize(
        &self,
        params: InitializeRequestParams,
        dispatcher: &Arc<MessageDispatcher>,
    ) -> Result<Value, RpcError> {
        let mut server_details = self.server_details.clone();
        if SUPPORTED_PROTOCOL_VERSIONS.contains(&params.protocol_version.as_str()) {
            server_details.protocol_version = params.protocol_version.clone();
        }

        info!(
            "client {} v{} connected (protocol {})",
            params.client_info.name, params.client_info.version, params.protocol_version
        );

        match self.client_details.write() {
            Ok(mut details) => *details = Some(params),
            Err(_) => {
                return Err(RpcError::internal_error()
                    .with_message("Internal Error: Failed to acquire write lock.".to_string()))
            }
        }

        if self.client_supports_sampling().unwrap_or(false) {
            self.scheduler
                .set_sampling_peer(Arc::new(DispatcherSamplingPeer::new(Arc::clone(
                    dispatcher,
                ))))
                .await;
        } else {
            warn!("client lacks the sampling capability; prompt-bearing fires will no-op");
        }

        serde_json::to_value(server_details)
            .map_err(|e| RpcError::internal_error().with_message(e.to_string()))
    }
}

fn parse_params<T: serde::de::DeserializeOwned>(params: Option<Value>) -> Result<T, RpcError> {
    let params = params.unwrap_or(Value::Null);
    serde_json::from_value(params)
        .map_err(|e| RpcError::invalid_params().with_message(format!("Invalid params: {e}")))
}
