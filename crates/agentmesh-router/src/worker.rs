use std::sync::Arc;
use std::time::Duration;

use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio_tungstenite::tungstenite::Message as WsMessage;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, warn};

use agentmesh_capabilities::CapabilityRegistry;
use agentmesh_core::config::AgentConfig;
use agentmesh_core::protocol::{MessageEnvelope, MessageType, Registration, TaskAssignment, TaskReport};
use agentmesh_core::types::{CapabilityContext, CapabilityResponse};

/// An agent process: connects to the router, advertises its capabilities,
/// and executes the steps the router assigns to it.
pub struct AgentWorker {
    config: AgentConfig,
    registry: Arc<CapabilityRegistry>,
}

impl AgentWorker {
    pub fn new(config: AgentConfig, registry: CapabilityRegistry) -> Self {
        Self {
            config,
            registry: Arc::new(registry),
        }
    }

    /// Worker serving the built-ins named in `config.capabilities`.
    pub fn from_config(config: AgentConfig) -> Self {
        let registry = CapabilityRegistry::with_builtins(&config.capabilities);
        Self::new(config, registry)
    }

    pub fn agent_id(&self) -> &str {
        &self.config.agent_id
    }

    /// Router URL with this agent's id in the query string.
    pub fn connect_url(&self) -> String {
        let sep = if self.config.router_url.contains('?') { '&' } else { '?' };
        format!(
            "{}{}agent_id={}",
            self.config.router_url,
            sep,
            urlencoding::encode(&self.config.agent_id)
        )
    }

    fn registration(&self) -> MessageEnvelope {
        let registration = Registration {
            capabilities: self.registry.list().into_iter().map(String::from).collect(),
        };
        MessageEnvelope::new(MessageType::Register, &self.config.agent_id)
            .with_payload(json!(registration))
    }

    /// Stay connected until `shutdown` fires, reconnecting after a delay
    /// whenever the connection drops.
    pub async fn run(&self, shutdown: CancellationToken) -> anyhow::Result<()> {
        let delay = Duration::from_secs(self.config.reconnect_delay_secs);
        loop {
            match self.run_once(&shutdown).await {
                Ok(()) => info!(agent_id = %self.config.agent_id, "Disconnected from router"),
                Err(e) => error!(agent_id = %self.config.agent_id, error = %e, "Router connection failed"),
            }
            if shutdown.is_cancelled() {
                break;
            }
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(delay) => {}
            }
        }
        info!(agent_id = %self.config.agent_id, "Agent worker stopped");
        Ok(())
    }

    async fn run_once(&self, shutdown: &CancellationToken) -> anyhow::Result<()> {
        let (ws_stream, _) = tokio_tungstenite::connect_async(self.connect_url()).await?;
        info!(agent_id = %self.config.agent_id, url = %self.config.router_url, "Connected to router");
        let (mut ws_tx, mut ws_rx) = ws_stream.split();

        ws_tx
            .send(WsMessage::Text(self.registration().to_json()?.into()))
            .await?;

        // Replies from assignments running in their own tasks
        let (reply_tx, mut reply_rx) = mpsc::channel::<MessageEnvelope>(64);

        loop {
            tokio::select! {
                _ = shutdown.cancelled() => {
                    let _ = ws_tx.send(WsMessage::Close(None)).await;
                    return Ok(());
                }
                Some(reply) = reply_rx.recv() => {
                    ws_tx.send(WsMessage::Text(reply.to_json()?.into())).await?;
                }
                msg = ws_rx.next() => {
                    let msg = match msg {
                        Some(Ok(m)) => m,
                        Some(Err(e)) => return Err(e.into()),
                        None => return Ok(()),
                    };
                    let text = match msg {
                        WsMessage::Text(t) => t.to_string(),
                        WsMessage::Ping(data) => {
                            let _ = ws_tx.send(WsMessage::Pong(data)).await;
                            continue;
                        }
                        WsMessage::Close(_) => return Ok(()),
                        _ => continue,
                    };
                    let envelope = match MessageEnvelope::from_json(&text) {
                        Ok(envelope) => envelope,
                        Err(e) => {
                            debug!(error = %e, "Invalid message from router");
                            continue;
                        }
                    };

                    if envelope.message_type == MessageType::TaskAssign {
                        let registry = self.registry.clone();
                        let agent_id = self.config.agent_id.clone();
                        let reply_tx = reply_tx.clone();
                        tokio::spawn(async move {
                            let reply = execute_assignment(&registry, &agent_id, &envelope).await;
                            let _ = reply_tx.send(reply).await;
                        });
                    } else if let Some(reply) = self.handle_envelope(&envelope).await {
                        ws_tx.send(WsMessage::Text(reply.to_json()?.into())).await?;
                    }
                }
            }
        }
    }

    /// Handle one message from the router; returns the reply to send, if any.
    pub async fn handle_envelope(&self, envelope: &MessageEnvelope) -> Option<MessageEnvelope> {
        match envelope.message_type {
            MessageType::TaskAssign => {
                Some(execute_assignment(&self.registry, &self.config.agent_id, envelope).await)
            }
            MessageType::Ping => Some(MessageEnvelope::reply_to(
                envelope,
                MessageType::Pong,
                &self.config.agent_id,
            )),
            MessageType::DiscoveryResponse => {
                debug!(payload = %envelope.payload, "Discovery response");
                None
            }
            MessageType::Error => {
                warn!(payload = %envelope.payload, "Router reported an error");
                None
            }
            other => {
                debug!(message_type = ?other, "Ignoring message");
                None
            }
        }
    }
}

/// Run one TASK_ASSIGN against the local registry and build the report.
async fn execute_assignment(
    registry: &CapabilityRegistry,
    agent_id: &str,
    envelope: &MessageEnvelope,
) -> MessageEnvelope {
    let assignment: TaskAssignment = match serde_json::from_value(envelope.payload.clone()) {
        Ok(a) => a,
        Err(e) => {
            warn!(error = %e, "Malformed TASK_ASSIGN");
            return MessageEnvelope::reply_to(envelope, MessageType::Error, agent_id)
                .with_payload(json!({ "error": format!("invalid TASK_ASSIGN payload: {}", e) }));
        }
    };

    let ctx = CapabilityContext::new(&assignment.workflow_id, &assignment.step_id);
    debug!(
        workflow_id = %assignment.workflow_id,
        step_id = %assignment.step_id,
        capability = %assignment.capability,
        "Executing assigned step"
    );
    let response = match registry
        .execute(&assignment.capability, assignment.inputs, ctx)
        .await
    {
        Ok(response) => response,
        Err(e) => CapabilityResponse::failed(e.to_string()),
    };

    let report = TaskReport {
        workflow_id: assignment.workflow_id,
        step_id: assignment.step_id,
        response,
    };
    report.into_envelope(envelope, agent_id).unwrap_or_else(|e| {
        MessageEnvelope::reply_to(envelope, MessageType::Error, agent_id)
            .with_payload(json!({ "error": e.to_string() }))
    })
}
