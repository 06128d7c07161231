use std::sync::Arc;

use axum::extract::ws::{Message, WebSocket};
use futures::{SinkExt, StreamExt};
use serde_json::json;
use tokio::sync::mpsc;
use tokio::sync::mpsc::error::TrySendError;
use tokio_util::sync::CancellationToken;
use tracing::{debug, warn};

use agentmesh_core::error::{MeshError, Result};
use agentmesh_core::protocol::{MessageEnvelope, MessageType};
use agentmesh_core::traits::ChannelHandle;

use crate::service::RouterService;

/// Handle to one agent's WebSocket: an outbound queue drained by the
/// connection's writer task, plus a token that tears the socket down.
#[derive(Clone)]
pub struct AgentConnection {
    agent_id: String,
    tx: mpsc::Sender<MessageEnvelope>,
    cancel: CancellationToken,
}

impl AgentConnection {
    pub fn new(agent_id: impl Into<String>, buffer: usize) -> (Self, mpsc::Receiver<MessageEnvelope>) {
        let (tx, rx) = mpsc::channel(buffer.max(1));
        let conn = Self {
            agent_id: agent_id.into(),
            tx,
            cancel: CancellationToken::new(),
        };
        (conn, rx)
    }

    pub fn token(&self) -> CancellationToken {
        self.cancel.clone()
    }
}

impl ChannelHandle for AgentConnection {
    fn send(&self, envelope: MessageEnvelope) -> Result<()> {
        self.tx.try_send(envelope).map_err(|e| MeshError::Channel {
            agent_id: self.agent_id.clone(),
            message: match e {
                TrySendError::Full(_) => "outbound queue full".to_string(),
                TrySendError::Closed(_) => "connection closed".to_string(),
            },
        })
    }

    fn close(&self) {
        self.cancel.cancel();
    }
}

/// Serve one agent's WebSocket until either side closes it or the
/// connection is replaced by a newer one for the same agent id.
pub async fn handle_socket(
    ws: WebSocket,
    agent_id: String,
    service: Arc<RouterService>,
    buffer: usize,
) {
    let (mut ws_tx, mut ws_rx) = ws.split();
    let (handle, mut outbound) = AgentConnection::new(agent_id.clone(), buffer);
    let cancel = handle.token();
    let session = service.connect(&agent_id, handle.clone()).await;

    let writer_cancel = cancel.clone();
    let writer_agent = agent_id.clone();
    let writer = tokio::spawn(async move {
        loop {
            let envelope = tokio::select! {
                _ = writer_cancel.cancelled() => break,
                envelope = outbound.recv() => match envelope {
                    Some(envelope) => envelope,
                    None => break,
                },
            };
            let text = match envelope.to_json() {
                Ok(text) => text,
                Err(e) => {
                    warn!(agent_id = %writer_agent, error = %e, "Failed to encode message");
                    continue;
                }
            };
            if ws_tx.send(Message::Text(text.into())).await.is_err() {
                break;
            }
        }
        let _ = ws_tx.send(Message::Close(None)).await;
    });

    loop {
        let msg = tokio::select! {
            _ = cancel.cancelled() => break,
            msg = ws_rx.next() => msg,
        };
        let msg = match msg {
            Some(Ok(m)) => m,
            Some(Err(e)) => {
                debug!(agent_id = %agent_id, error = %e, "WebSocket read error");
                break;
            }
            None => break,
        };

        match msg {
            Message::Text(text) => match MessageEnvelope::from_json(text.as_str()) {
                Ok(envelope) => service.handle_message(&agent_id, envelope).await,
                Err(e) => {
                    warn!(agent_id = %agent_id, error = %e, "Unparseable message from agent");
                    let reply = MessageEnvelope::new(MessageType::Error, service.router_id())
                        .with_payload(json!({ "error": format!("Parse error: {}", e) }));
                    let _ = handle.send(reply);
                }
            },
            Message::Close(_) => break,
            _ => {}
        }
    }

    service.disconnect(&agent_id, session).await;
    cancel.cancel();
    let _ = writer.await;
    debug!(agent_id = %agent_id, "Connection closed");
}
