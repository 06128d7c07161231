use thiserror::Error;

#[derive(Debug, Error)]
pub enum MeshError {
    // Capability errors
    #[error("no agent for capability {0}")]
    CapabilityNotFound(String),

    #[error("Capability execution failed: {capability}: {message}")]
    CapabilityExecution { capability: String, message: String },

    #[error("Malformed capability response: {0}")]
    MalformedResponse(String),

    #[error("Capability timed out after {timeout_secs}s: {capability}")]
    CapabilityTimeout { capability: String, timeout_secs: u64 },

    // Plan errors
    #[error("Invalid plan: {0}")]
    InvalidPlan(String),

    // Config errors
    #[error("Config error: {0}")]
    Config(String),

    #[error("Config file not found: {0}")]
    ConfigNotFound(String),

    // Channel errors
    #[error("Channel error: {agent_id}: {message}")]
    Channel { agent_id: String, message: String },

    #[error("Agent not connected: {0}")]
    AgentNotConnected(String),

    #[error("Dispatch error: {0}")]
    Dispatch(String),

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),

    // JSON errors
    #[error("JSON error: {0}")]
    Json(#[from] serde_json::Error),
}

pub type Result<T> = std::result::Result<T, MeshError>;
