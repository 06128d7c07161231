use std::path::Path;

use serde::{Deserialize, Serialize};

use crate::error::{MeshError, Result};

/// Top-level agentmesh configuration.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AppConfig {
    #[serde(default)]
    pub router: RouterConfig,
    #[serde(default)]
    pub agent: AgentConfig,
    #[serde(default)]
    pub capabilities: CapabilitiesConfig,
    #[serde(default)]
    pub gates: Vec<GateConfig>,
}

/// Router service configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct RouterConfig {
    #[serde(default = "default_bind")]
    pub bind: String,
    /// Sender id the router stamps on outgoing messages.
    #[serde(default = "default_router_id")]
    pub router_id: String,
    /// How long a remote step may run before it is failed. 0 = wait forever.
    #[serde(default = "default_dispatch_timeout")]
    pub dispatch_timeout_secs: u64,
    /// Per-connection outbound queue size.
    #[serde(default = "default_outbound_buffer")]
    pub outbound_buffer: usize,
}

impl Default for RouterConfig {
    fn default() -> Self {
        Self {
            bind: default_bind(),
            router_id: default_router_id(),
            dispatch_timeout_secs: default_dispatch_timeout(),
            outbound_buffer: default_outbound_buffer(),
        }
    }
}

fn default_bind() -> String { "127.0.0.1:7420".to_string() }
fn default_router_id() -> String { "router".to_string() }
fn default_dispatch_timeout() -> u64 { 300 }
fn default_outbound_buffer() -> usize { 64 }

/// Worker (agent process) configuration.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AgentConfig {
    #[serde(default = "default_agent_id")]
    pub agent_id: String,
    #[serde(default = "default_router_url")]
    pub router_url: String,
    /// Built-in capabilities this worker serves.
    #[serde(default)]
    pub capabilities: Vec<String>,
    #[serde(default = "default_reconnect_delay")]
    pub reconnect_delay_secs: u64,
}

impl Default for AgentConfig {
    fn default() -> Self {
        Self {
            agent_id: default_agent_id(),
            router_url: default_router_url(),
            capabilities: vec![],
            reconnect_delay_secs: default_reconnect_delay(),
        }
    }
}

fn default_agent_id() -> String { "agent".to_string() }
fn default_router_url() -> String { "ws://127.0.0.1:7420/agents/ws".to_string() }
fn default_reconnect_delay() -> u64 { 5 }

/// Built-in capabilities loaded into the local registry.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct CapabilitiesConfig {
    #[serde(default = "default_enabled_capabilities")]
    pub enabled: Vec<String>,
}

impl Default for CapabilitiesConfig {
    fn default() -> Self {
        Self {
            enabled: default_enabled_capabilities(),
        }
    }
}

fn default_enabled_capabilities() -> Vec<String> {
    ["echo", "merge", "select", "wait"]
        .into_iter()
        .map(String::from)
        .collect()
}

/// A gate attached to one step id.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct GateConfig {
    pub step_id: String,
    #[serde(flatten)]
    pub kind: GateKind,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(tag = "kind", rename_all = "snake_case")]
pub enum GateKind {
    /// Reject the step when `field` in its result is below `threshold`.
    Confidence {
        threshold: f64,
        #[serde(default = "default_confidence_field")]
        field: String,
    },
}

fn default_confidence_field() -> String { "confidence".to_string() }

impl AppConfig {
    /// Load config from a TOML file, with env var expansion.
    pub fn load(path: &Path) -> Result<Self> {
        let content = std::fs::read_to_string(path)
            .map_err(|_| MeshError::ConfigNotFound(path.display().to_string()))?;

        let expanded = expand_env_vars(&content);

        toml::from_str(&expanded).map_err(|e| MeshError::Config(e.to_string()))
    }

    /// Load from `path` if it exists, otherwise fall back to defaults.
    pub fn load_or_default(path: &Path) -> Result<Self> {
        if path.exists() {
            Self::load(path)
        } else {
            Ok(Self::default())
        }
    }
}

/// Expand `${ENV_VAR}` patterns in a string.
fn expand_env_vars(input: &str) -> String {
    let mut result = String::with_capacity(input.len());
    let mut chars = input.chars().peekable();

    while let Some(c) = chars.next() {
        if c == '$' && chars.peek() == Some(&'{') {
            chars.next();
            let mut var_name = String::new();
            for c in chars.by_ref() {
                if c == '}' {
                    break;
                }
                var_name.push(c);
            }
            match std::env::var(&var_name) {
                Ok(val) => result.push_str(&val),
                // Unset variables stay as written
                Err(_) => result.push_str(&format!("${{{}}}", var_name)),
            }
        } else {
            result.push(c);
        }
    }
    result
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_expand_env_vars() {
        std::env::set_var("TEST_AGENTMESH_VAR", "hello");
        let result = expand_env_vars("key = \"${TEST_AGENTMESH_VAR}\"");
        assert_eq!(result, "key = \"hello\"");
        std::env::remove_var("TEST_AGENTMESH_VAR");
    }

    #[test]
    fn test_expand_env_vars_missing() {
        let result = expand_env_vars("key = \"${NONEXISTENT_AGENTMESH_VAR}\"");
        assert_eq!(result, "key = \"${NONEXISTENT_AGENTMESH_VAR}\"");
    }

    #[test]
    fn test_defaults_from_empty_toml() {
        let config: AppConfig = toml::from_str("").unwrap();
        assert_eq!(config.router.bind, "127.0.0.1:7420");
        assert_eq!(config.router.dispatch_timeout_secs, 300);
        assert_eq!(config.agent.reconnect_delay_secs, 5);
        assert_eq!(config.capabilities.enabled.len(), 4);
        assert!(config.gates.is_empty());
    }

    #[test]
    fn test_confidence_gate_section() {
        let toml_str = r#"
[[gates]]
step_id = "identify_product"
kind = "confidence"
threshold = 0.7
"#;
        let config: AppConfig = toml::from_str(toml_str).unwrap();
        assert_eq!(config.gates.len(), 1);
        assert_eq!(config.gates[0].step_id, "identify_product");
        match &config.gates[0].kind {
            GateKind::Confidence { threshold, field } => {
                assert_eq!(*threshold, 0.7);
                assert_eq!(field, "confidence");
            }
        }
    }
}
