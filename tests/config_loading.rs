use std::io::Write;

use agentmesh_core::config::{AppConfig, GateKind};
use agentmesh_engine::GateSet;

#[test]
fn test_load_full_config_from_file() {
    let toml_content = r#"
[router]
bind = "0.0.0.0:9999"
router_id = "hub"
dispatch_timeout_secs = 30

[agent]
agent_id = "field-cam"
router_url = "ws://hub:9999/agents/ws"
capabilities = ["echo", "select"]

[capabilities]
enabled = ["echo", "merge"]

[[gates]]
step_id = "identify"
kind = "confidence"
threshold = 0.7

[[gates]]
step_id = "classify"
kind = "confidence"
threshold = 0.5
field = "match.score"
"#;

    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(toml_content.as_bytes()).expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");

    assert_eq!(config.router.bind, "0.0.0.0:9999");
    assert_eq!(config.router.router_id, "hub");
    assert_eq!(config.router.dispatch_timeout_secs, 30);
    assert_eq!(config.router.outbound_buffer, 64);
    assert_eq!(config.agent.agent_id, "field-cam");
    assert_eq!(config.agent.capabilities, vec!["echo", "select"]);
    assert_eq!(config.agent.reconnect_delay_secs, 5);
    assert_eq!(config.capabilities.enabled, vec!["echo", "merge"]);

    assert_eq!(config.gates.len(), 2);
    match &config.gates[1].kind {
        GateKind::Confidence { threshold, field } => {
            assert_eq!(*threshold, 0.5);
            assert_eq!(field, "match.score");
        }
    }
    assert_eq!(GateSet::from_config(&config.gates).len(), 2);
}

#[test]
fn test_env_var_expansion_in_file() {
    std::env::set_var("AGENTMESH_TEST_ROUTER_ID", "from-env");
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[router]\nrouter_id = \"${AGENTMESH_TEST_ROUTER_ID}\"\n")
        .expect("write toml");

    let config = AppConfig::load(tmp.path()).expect("load config");
    assert_eq!(config.router.router_id, "from-env");
    std::env::remove_var("AGENTMESH_TEST_ROUTER_ID");
}

#[test]
fn test_missing_file_is_an_error_but_defaults_are_available() {
    let path = std::path::Path::new("/nonexistent/agentmesh.toml");
    let err = AppConfig::load(path).unwrap_err();
    assert!(err.to_string().contains("Config file not found"));

    let config = AppConfig::load_or_default(path).expect("defaults");
    assert_eq!(config.router.bind, "127.0.0.1:7420");
}

#[test]
fn test_invalid_toml_is_a_config_error() {
    let mut tmp = tempfile::NamedTempFile::new().expect("create temp file");
    tmp.write_all(b"[router\nbind = ").expect("write toml");
    let err = AppConfig::load(tmp.path()).unwrap_err();
    assert!(err.to_string().starts_with("Config error"));
}

#[test]
fn test_config_round_trips_through_toml() {
    let config = AppConfig::default();
    let text = toml::to_string_pretty(&config).expect("serialize");
    let parsed: AppConfig = toml::from_str(&text).expect("parse");
    assert_eq!(parsed.router.bind, config.router.bind);
    assert_eq!(parsed.capabilities.enabled, config.capabilities.enabled);
}
