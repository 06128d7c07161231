use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::error::{MeshError, Result};
use crate::types::{CapabilityResponse, Inputs};

/// Kind of message exchanged between the router and agents.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "SCREAMING_SNAKE_CASE")]
pub enum MessageType {
    /// Agent → router: announce the capabilities this agent serves.
    Register,
    /// Router → agent: execute one step.
    TaskAssign,
    /// Agent → router: a step finished.
    TaskComplete,
    /// Agent → router: a step failed.
    TaskFail,
    DiscoveryRequest,
    DiscoveryResponse,
    Ping,
    Pong,
    Error,
    #[serde(other)]
    Unknown,
}

/// A frame on the message channel: header fields plus a JSON payload.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct MessageEnvelope {
    pub message_type: MessageType,
    pub sender_id: String,
    pub correlation_id: String,
    #[serde(default)]
    pub payload: serde_json::Value,
    #[serde(default = "Utc::now")]
    pub timestamp: DateTime<Utc>,
}

impl MessageEnvelope {
    /// Create a message with a fresh correlation id.
    pub fn new(message_type: MessageType, sender_id: impl Into<String>) -> Self {
        Self {
            message_type,
            sender_id: sender_id.into(),
            correlation_id: Uuid::new_v4().to_string(),
            payload: serde_json::Value::Null,
            timestamp: Utc::now(),
        }
    }

    /// Create a reply that carries the correlation id of `request`.
    pub fn reply_to(
        request: &MessageEnvelope,
        message_type: MessageType,
        sender_id: impl Into<String>,
    ) -> Self {
        Self {
            correlation_id: request.correlation_id.clone(),
            ..Self::new(message_type, sender_id)
        }
    }

    pub fn with_payload(mut self, payload: serde_json::Value) -> Self {
        self.payload = payload;
        self
    }

    pub fn to_json(&self) -> Result<String> {
        Ok(serde_json::to_string(self)?)
    }

    pub fn from_json(text: &str) -> Result<Self> {
        Ok(serde_json::from_str(text)?)
    }
}

/// Payload of `REGISTER`.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct Registration {
    #[serde(default)]
    pub capabilities: Vec<String>,
}

/// Payload of `TASK_ASSIGN`.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TaskAssignment {
    pub workflow_id: String,
    pub step_id: String,
    pub capability: String,
    #[serde(default)]
    pub inputs: Inputs,
}

/// Payload of `TASK_COMPLETE` / `TASK_FAIL`, after normalization.
#[derive(Debug, Clone)]
pub struct TaskReport {
    pub workflow_id: String,
    pub step_id: String,
    pub response: CapabilityResponse,
}

impl TaskReport {
    /// Build the envelope an agent sends back for a finished assignment.
    pub fn into_envelope(self, request: &MessageEnvelope, sender_id: &str) -> Result<MessageEnvelope> {
        let message_type = if self.response.is_completed() {
            MessageType::TaskComplete
        } else {
            MessageType::TaskFail
        };
        let mut payload = serde_json::to_value(&self.response)?;
        if let Some(obj) = payload.as_object_mut() {
            obj.insert("workflow_id".into(), self.workflow_id.into());
            obj.insert("step_id".into(), self.step_id.into());
        }
        Ok(MessageEnvelope::reply_to(request, message_type, sender_id).with_payload(payload))
    }

    /// Extract the report from a `TASK_COMPLETE` / `TASK_FAIL` envelope.
    ///
    /// A `TASK_FAIL` whose payload carries no usable status is still treated
    /// as a failure, using whatever `error` text it has.
    pub fn from_envelope(envelope: &MessageEnvelope) -> Result<Self> {
        let field = |name: &str| -> Result<String> {
            envelope
                .payload
                .get(name)
                .and_then(|v| v.as_str())
                .map(str::to_string)
                .ok_or_else(|| MeshError::MalformedResponse(format!("missing {}", name)))
        };
        let workflow_id = field("workflow_id")?;
        let step_id = field("step_id")?;

        let response = match CapabilityResponse::from_envelope(envelope.payload.clone()) {
            Ok(resp) => resp,
            Err(e) if envelope.message_type == MessageType::TaskFail => {
                let error = envelope
                    .payload
                    .get("error")
                    .and_then(|v| v.as_str())
                    .map(str::to_string)
                    .unwrap_or_else(|| e.to_string());
                CapabilityResponse::failed(error)
            }
            Err(e) => return Err(e),
        };

        Ok(Self {
            workflow_id,
            step_id,
            response,
        })
    }
}

/// One entry of a `DISCOVERY_RESPONSE`.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct AgentInfo {
    pub agent_id: String,
    pub capabilities: Vec<String>,
    pub status: String,
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn message_type_wire_names() {
        let json = serde_json::to_value(MessageType::TaskAssign).unwrap();
        assert_eq!(json, json!("TASK_ASSIGN"));
        let parsed: MessageType = serde_json::from_value(json!("DISCOVERY_RESPONSE")).unwrap();
        assert_eq!(parsed, MessageType::DiscoveryResponse);
        let parsed: MessageType = serde_json::from_value(json!("SOMETHING_NEW")).unwrap();
        assert_eq!(parsed, MessageType::Unknown);
    }

    #[test]
    fn reply_keeps_correlation_id() {
        let req = MessageEnvelope::new(MessageType::Ping, "router");
        let reply = MessageEnvelope::reply_to(&req, MessageType::Pong, "agent-1");
        assert_eq!(reply.correlation_id, req.correlation_id);
        assert_eq!(reply.sender_id, "agent-1");
    }

    #[test]
    fn envelope_parses_without_timestamp() {
        let env = MessageEnvelope::from_json(
            r#"{"message_type":"PONG","sender_id":"a","correlation_id":"c"}"#,
        )
        .unwrap();
        assert_eq!(env.message_type, MessageType::Pong);
        assert!(env.payload.is_null());
    }

    #[test]
    fn task_report_roundtrip_through_envelope() {
        let req = MessageEnvelope::new(MessageType::TaskAssign, "router");
        let report = TaskReport {
            workflow_id: "wf".into(),
            step_id: "s1".into(),
            response: CapabilityResponse::completed(json!({"ok": true})),
        };
        let env = report.into_envelope(&req, "agent-1").unwrap();
        assert_eq!(env.message_type, MessageType::TaskComplete);

        let parsed = TaskReport::from_envelope(&env).unwrap();
        assert_eq!(parsed.workflow_id, "wf");
        assert_eq!(parsed.step_id, "s1");
        assert_eq!(parsed.response, CapabilityResponse::completed(json!({"ok": true})));
    }

    #[test]
    fn task_fail_without_status_is_failure() {
        let env = MessageEnvelope::new(MessageType::TaskFail, "agent-1").with_payload(json!({
            "workflow_id": "wf",
            "step_id": "s1",
            "error": "scanner offline"
        }));
        let report = TaskReport::from_envelope(&env).unwrap();
        assert_eq!(report.response, CapabilityResponse::failed("scanner offline"));
    }

    #[test]
    fn task_report_requires_ids() {
        let env = MessageEnvelope::new(MessageType::TaskComplete, "agent-1")
            .with_payload(json!({"status": "COMPLETED", "result": 1}));
        assert!(TaskReport::from_envelope(&env).is_err());
    }
}
