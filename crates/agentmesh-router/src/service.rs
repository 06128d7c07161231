use std::collections::{BTreeSet, HashMap};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;
use std::time::Duration;

use serde_json::{json, Value};
use tokio::sync::{oneshot, Mutex};
use tracing::{debug, info, warn};
use uuid::Uuid;

use agentmesh_capabilities::CapabilityRegistry;
use agentmesh_core::config::RouterConfig;
use agentmesh_core::error::{MeshError, Result};
use agentmesh_core::event::EventBus;
use agentmesh_core::protocol::{
    AgentInfo, MessageEnvelope, MessageType, Registration, TaskAssignment, TaskReport,
};
use agentmesh_core::traits::ChannelHandle;
use agentmesh_core::types::{CapabilityContext, CapabilityResponse, Inputs, Plan};
use agentmesh_engine::{ExecutionResult, GateSet, PlanExecutor};

use crate::connection::AgentConnection;
use crate::registry::{ConnectionRegistry, WorkflowRegistry};
use crate::remote::RemoteCapability;

/// A step forwarded to an agent, waiting for its TASK_COMPLETE / TASK_FAIL.
struct PendingStep {
    agent_id: String,
    tx: oneshot::Sender<CapabilityResponse>,
}

/// Router-side context of one in-flight workflow.
pub struct WorkflowContext {
    pub plan_id: String,
    pending: HashMap<String, PendingStep>,
}

impl WorkflowContext {
    pub fn new(plan_id: impl Into<String>) -> Self {
        Self {
            plan_id: plan_id.into(),
            pending: HashMap::new(),
        }
    }

    /// Step ids currently waiting on an agent, sorted.
    pub fn pending_steps(&self) -> Vec<String> {
        let mut steps: Vec<String> = self.pending.keys().cloned().collect();
        steps.sort();
        steps
    }
}

struct AgentTable<H> {
    connections: ConnectionRegistry<H>,
    /// Session number of the live connection per agent id.
    sessions: HashMap<String, u64>,
    /// Capabilities each agent advertised with REGISTER.
    capabilities: HashMap<String, Vec<String>>,
}

/// Owns the connection and workflow registries and routes messages
/// between running plans and connected agents.
pub struct RouterService<H = AgentConnection> {
    router_id: String,
    agents: Mutex<AgentTable<H>>,
    workflows: Mutex<WorkflowRegistry<WorkflowContext>>,
    local: CapabilityRegistry,
    gates: GateSet,
    event_bus: Arc<EventBus>,
    dispatch_timeout: Option<Duration>,
    next_session: AtomicU64,
}

impl<H: ChannelHandle> RouterService<H> {
    pub fn new(config: &RouterConfig, local: CapabilityRegistry) -> Self {
        let dispatch_timeout = match config.dispatch_timeout_secs {
            0 => None,
            secs => Some(Duration::from_secs(secs)),
        };
        Self {
            router_id: config.router_id.clone(),
            agents: Mutex::new(AgentTable {
                connections: ConnectionRegistry::new(),
                sessions: HashMap::new(),
                capabilities: HashMap::new(),
            }),
            workflows: Mutex::new(WorkflowRegistry::new()),
            local,
            gates: GateSet::new(),
            event_bus: Arc::new(EventBus::default()),
            dispatch_timeout,
            next_session: AtomicU64::new(0),
        }
    }

    pub fn with_gates(mut self, gates: GateSet) -> Self {
        self.gates = gates;
        self
    }

    pub fn with_event_bus(mut self, event_bus: Arc<EventBus>) -> Self {
        self.event_bus = event_bus;
        self
    }

    pub fn with_dispatch_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.dispatch_timeout = timeout;
        self
    }

    pub fn router_id(&self) -> &str {
        &self.router_id
    }

    // ── Connections ─────────────────────────────────────────────

    /// Register a new connection for `agent_id` and return its session number.
    /// A previous connection under the same id is closed, and the steps
    /// assigned over it are failed.
    pub async fn connect(&self, agent_id: &str, handle: H) -> u64 {
        let session = self.next_session.fetch_add(1, Ordering::SeqCst) + 1;
        let fresh = {
            let mut agents = self.agents.lock().await;
            let fresh = agents.connections.add(agent_id, handle);
            agents.sessions.insert(agent_id.to_string(), session);
            if !fresh {
                // the new connection registers again
                agents.capabilities.remove(agent_id);
            }
            fresh
        };
        info!(agent_id, session, reconnect = !fresh, "Agent connected");

        if !fresh {
            let failed = self
                .fail_pending_for(agent_id, &format!("agent {} reconnected", agent_id))
                .await;
            if failed > 0 {
                warn!(agent_id, failed_steps = failed, "Failed steps assigned over the replaced connection");
            }
        }
        session
    }

    /// Drop the connection opened as `session`. Steps pending on the agent
    /// are failed. A stale session (already replaced) is ignored.
    pub async fn disconnect(&self, agent_id: &str, session: u64) -> bool {
        {
            let mut agents = self.agents.lock().await;
            if agents.sessions.get(agent_id) != Some(&session) {
                debug!(agent_id, session, "Ignoring disconnect of replaced connection");
                return false;
            }
            agents.sessions.remove(agent_id);
            agents.capabilities.remove(agent_id);
            agents.connections.remove(agent_id);
        }

        let failed = self
            .fail_pending_for(agent_id, &format!("agent {} disconnected", agent_id))
            .await;
        info!(agent_id, failed_steps = failed, "Agent disconnected");
        true
    }

    pub async fn is_connected(&self, agent_id: &str) -> bool {
        self.agents.lock().await.connections.contains(agent_id)
    }

    /// Queue a message for one agent.
    pub async fn send_to(&self, agent_id: &str, envelope: MessageEnvelope) -> Result<()> {
        let agents = self.agents.lock().await;
        let handle = agents
            .connections
            .get(agent_id)
            .ok_or_else(|| MeshError::AgentNotConnected(agent_id.to_string()))?;
        handle.send(envelope)
    }

    async fn reply(&self, agent_id: &str, envelope: MessageEnvelope) {
        if let Err(e) = self.send_to(agent_id, envelope).await {
            warn!(agent_id, error = %e, "Failed to reply to agent");
        }
    }

    async fn reply_error(&self, agent_id: &str, request: &MessageEnvelope, message: String) {
        warn!(agent_id, error = %message, "Rejecting agent message");
        let reply = MessageEnvelope::reply_to(request, MessageType::Error, &self.router_id)
            .with_payload(json!({ "error": message }));
        self.reply(agent_id, reply).await;
    }

    /// Close every connection and fail every pending remote step.
    pub async fn shutdown(&self) {
        {
            let mut agents = self.agents.lock().await;
            agents.connections.close_all();
            agents.sessions.clear();
            agents.capabilities.clear();
        }
        let mut workflows = self.workflows.lock().await;
        for (workflow_id, ctx) in workflows.iter_mut() {
            for (step_id, pending) in ctx.pending.drain() {
                debug!(workflow_id = %workflow_id, step_id = %step_id, "Failing step on shutdown");
                let _ = pending.tx.send(CapabilityResponse::failed("router shutting down"));
            }
        }
    }

    // ── Discovery ───────────────────────────────────────────────

    async fn register_capabilities(&self, agent_id: &str, capabilities: Vec<String>) {
        let mut agents = self.agents.lock().await;
        if !agents.connections.contains(agent_id) {
            warn!(agent_id, "REGISTER from unknown connection");
            return;
        }
        let capabilities: Vec<String> = capabilities
            .into_iter()
            .collect::<BTreeSet<_>>()
            .into_iter()
            .collect();
        info!(agent_id, capabilities = ?capabilities, "Agent registered");
        agents.capabilities.insert(agent_id.to_string(), capabilities);
    }

    /// Connected agents, sorted by id, optionally only those serving `capability`.
    pub async fn discover(&self, capability: Option<&str>) -> Vec<AgentInfo> {
        let agents = self.agents.lock().await;
        let mut infos: Vec<AgentInfo> = agents
            .connections
            .get_all()
            .keys()
            .map(|agent_id| {
                let advertised = agents.capabilities.get(agent_id);
                AgentInfo {
                    agent_id: agent_id.clone(),
                    capabilities: advertised.cloned().unwrap_or_default(),
                    status: if advertised.is_some() { "registered" } else { "connected" }.to_string(),
                }
            })
            .filter(|info| capability.map_or(true, |c| info.capabilities.iter().any(|x| x == c)))
            .collect();
        infos.sort_by(|a, b| a.agent_id.cmp(&b.agent_id));
        infos
    }

    /// The agent that will receive work for `capability`: the lowest agent id
    /// among those advertising it.
    pub async fn agent_for(&self, capability: &str) -> Option<String> {
        let agents = self.agents.lock().await;
        agents
            .capabilities
            .iter()
            .filter(|(agent_id, caps)| {
                agents.connections.contains(agent_id) && caps.iter().any(|c| c == capability)
            })
            .map(|(agent_id, _)| agent_id.clone())
            .min()
    }

    async fn remote_capabilities(&self) -> BTreeSet<String> {
        let agents = self.agents.lock().await;
        agents.capabilities.values().flatten().cloned().collect()
    }

    // ── Remote dispatch ─────────────────────────────────────────

    /// Send a step to the agent serving `capability` and return a receiver
    /// for its completion. The workflow must be registered.
    pub async fn dispatch(
        &self,
        capability: &str,
        ctx: &CapabilityContext,
        inputs: Inputs,
    ) -> Result<oneshot::Receiver<CapabilityResponse>> {
        let agent_id = self
            .agent_for(capability)
            .await
            .ok_or_else(|| MeshError::CapabilityNotFound(capability.to_string()))?;

        let assignment = TaskAssignment {
            workflow_id: ctx.workflow_id.clone(),
            step_id: ctx.step_id.clone(),
            capability: capability.to_string(),
            inputs,
        };
        let envelope = MessageEnvelope::new(MessageType::TaskAssign, &self.router_id)
            .with_payload(serde_json::to_value(&assignment)?);

        let (tx, rx) = oneshot::channel();
        {
            let mut workflows = self.workflows.lock().await;
            let workflow = workflows.get_mut(&ctx.workflow_id).ok_or_else(|| {
                MeshError::Dispatch(format!("unknown workflow {}", ctx.workflow_id))
            })?;
            workflow.pending.insert(
                ctx.step_id.clone(),
                PendingStep {
                    agent_id: agent_id.clone(),
                    tx,
                },
            );
        }

        if let Err(e) = self.send_to(&agent_id, envelope).await {
            self.abandon(ctx).await;
            return Err(e);
        }
        debug!(
            workflow_id = %ctx.workflow_id,
            step_id = %ctx.step_id,
            agent_id = %agent_id,
            capability,
            "Dispatched step to agent"
        );
        Ok(rx)
    }

    /// Forget a pending step. Returns whether it was still pending.
    pub async fn abandon(&self, ctx: &CapabilityContext) -> bool {
        let mut workflows = self.workflows.lock().await;
        workflows
            .get_mut(&ctx.workflow_id)
            .and_then(|w| w.pending.remove(&ctx.step_id))
            .is_some()
    }

    /// Deliver an agent's report to the step waiting for it. Only the agent
    /// the step was assigned to can complete it.
    pub async fn complete_step(&self, agent_id: &str, report: TaskReport) -> bool {
        let mut workflows = self.workflows.lock().await;
        let Some(workflow) = workflows.get_mut(&report.workflow_id) else {
            warn!(agent_id, workflow_id = %report.workflow_id, "Report for unknown workflow");
            return false;
        };
        match workflow.pending.get(&report.step_id) {
            None => {
                warn!(
                    agent_id,
                    workflow_id = %report.workflow_id,
                    step_id = %report.step_id,
                    "Report for step that is not pending"
                );
                return false;
            }
            Some(pending) if pending.agent_id != agent_id => {
                warn!(
                    workflow_id = %report.workflow_id,
                    step_id = %report.step_id,
                    assigned = %pending.agent_id,
                    reported_by = agent_id,
                    "Rejecting report from an agent the step was not assigned to"
                );
                return false;
            }
            Some(_) => {}
        }
        let Some(pending) = workflow.pending.remove(&report.step_id) else {
            return false;
        };
        if pending.tx.send(report.response).is_err() {
            debug!(step_id = %report.step_id, "Step stopped waiting before its report arrived");
        }
        true
    }

    async fn fail_pending_for(&self, agent_id: &str, reason: &str) -> usize {
        let mut workflows = self.workflows.lock().await;
        let mut failed = 0;
        for (workflow_id, ctx) in workflows.iter_mut() {
            let steps: Vec<String> = ctx
                .pending
                .iter()
                .filter(|(_, p)| p.agent_id == agent_id)
                .map(|(step_id, _)| step_id.clone())
                .collect();
            for step_id in steps {
                if let Some(pending) = ctx.pending.remove(&step_id) {
                    debug!(workflow_id = %workflow_id, step_id = %step_id, agent_id, "Failing pending step");
                    let _ = pending.tx.send(CapabilityResponse::failed(reason));
                    failed += 1;
                }
            }
        }
        failed
    }

    /// Pending step ids of one workflow, if it is registered.
    pub async fn pending_steps(&self, workflow_id: &str) -> Option<Vec<String>> {
        self.workflows
            .lock()
            .await
            .get(workflow_id)
            .map(WorkflowContext::pending_steps)
    }

    pub async fn active_workflows(&self) -> Vec<String> {
        self.workflows.lock().await.ids()
    }

    // ── Inbound messages ────────────────────────────────────────

    /// Handle one message received from `agent_id`.
    pub async fn handle_message(&self, agent_id: &str, envelope: MessageEnvelope) {
        match envelope.message_type {
            MessageType::Register => {
                match serde_json::from_value::<Registration>(envelope.payload.clone()) {
                    Ok(registration) => {
                        self.register_capabilities(agent_id, registration.capabilities)
                            .await
                    }
                    Err(e) => {
                        self.reply_error(agent_id, &envelope, format!("invalid REGISTER payload: {}", e))
                            .await
                    }
                }
            }
            MessageType::TaskComplete | MessageType::TaskFail => {
                match TaskReport::from_envelope(&envelope) {
                    Ok(report) => {
                        self.complete_step(agent_id, report).await;
                    }
                    Err(e) => self.reply_error(agent_id, &envelope, e.to_string()).await,
                }
            }
            MessageType::DiscoveryRequest => {
                let filter = envelope.payload.get("capability").and_then(Value::as_str);
                let agents = self.discover(filter).await;
                let reply = MessageEnvelope::reply_to(
                    &envelope,
                    MessageType::DiscoveryResponse,
                    &self.router_id,
                )
                .with_payload(json!({ "agents": agents }));
                self.reply(agent_id, reply).await;
            }
            MessageType::Ping => {
                let reply = MessageEnvelope::reply_to(&envelope, MessageType::Pong, &self.router_id);
                self.reply(agent_id, reply).await;
            }
            MessageType::Pong | MessageType::DiscoveryResponse => {
                debug!(agent_id, message_type = ?envelope.message_type, "Ignoring reply");
            }
            MessageType::Error => {
                warn!(agent_id, payload = %envelope.payload, "Agent reported an error");
            }
            MessageType::TaskAssign | MessageType::Unknown => {
                let message = format!("unexpected message type {:?}", envelope.message_type);
                self.reply_error(agent_id, &envelope, message).await;
            }
        }
    }

    // ── Plan execution ──────────────────────────────────────────

    /// Capabilities for one plan: local handlers, with every capability a
    /// connected agent advertises routed to that agent instead.
    async fn registry_for(self: &Arc<Self>, plan: &Plan) -> CapabilityRegistry {
        let remote = self.remote_capabilities().await;
        let mut registry = self.local.clone();
        let required: BTreeSet<&str> = plan
            .steps
            .iter()
            .map(|s| s.agent_capability_required.as_str())
            .collect();
        for name in required.into_iter().filter(|n| remote.contains(*n)) {
            registry.register(RemoteCapability::new(name, Arc::clone(self), self.dispatch_timeout));
        }
        registry
    }

    /// Run a plan against local and remote capabilities.
    pub async fn execute_plan(self: &Arc<Self>, plan: Plan) -> ExecutionResult {
        let workflow_id = Uuid::new_v4().to_string();
        self.workflows
            .lock()
            .await
            .add(workflow_id.clone(), WorkflowContext::new(&plan.plan_id));

        let registry = self.registry_for(&plan).await;
        let executor = PlanExecutor::new(Arc::new(registry))
            .with_gates(self.gates.clone())
            .with_event_bus(self.event_bus.clone());
        let result = executor.execute_plan_with_id(workflow_id.clone(), plan).await;

        let mut workflows = self.workflows.lock().await;
        if let Some(ctx) = workflows.remove(&workflow_id) {
            if !ctx.pending.is_empty() {
                debug!(
                    workflow_id = %workflow_id,
                    pending = ?ctx.pending_steps(),
                    "Discarding steps still pending after the run finished"
                );
            }
        }
        result
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use agentmesh_core::types::{Step, WorkflowStatus};
    use agentmesh_test_utils::{MockHandle, StaticCapability};

    fn service() -> Arc<RouterService<MockHandle>> {
        Arc::new(RouterService::new(&RouterConfig::default(), CapabilityRegistry::new()))
    }

    fn register(capabilities: &[&str]) -> MessageEnvelope {
        MessageEnvelope::new(MessageType::Register, "agent").with_payload(json!({
            "capabilities": capabilities,
        }))
    }

    async fn wait_for_assignment(handle: &MockHandle) -> MessageEnvelope {
        for _ in 0..200 {
            if let Some(envelope) = handle
                .sent()
                .into_iter()
                .find(|e| e.message_type == MessageType::TaskAssign)
            {
                return envelope;
            }
            tokio::time::sleep(Duration::from_millis(5)).await;
        }
        panic!("no TASK_ASSIGN sent");
    }

    #[tokio::test]
    async fn register_then_discover() {
        let service = service();
        service.connect("ocr-1", MockHandle::new("ocr-1")).await;
        service.connect("idle", MockHandle::new("idle")).await;
        service.handle_message("ocr-1", register(&["ocr", "ocr", "translate"])).await;

        let all = service.discover(None).await;
        assert_eq!(all.len(), 2);
        assert_eq!(all[0].agent_id, "idle");
        assert_eq!(all[0].status, "connected");
        assert_eq!(all[1].capabilities, vec!["ocr", "translate"]);
        assert_eq!(all[1].status, "registered");

        let ocr = service.discover(Some("ocr")).await;
        assert_eq!(ocr.len(), 1);
        assert_eq!(service.agent_for("translate").await.as_deref(), Some("ocr-1"));
        assert!(service.agent_for("missing").await.is_none());
    }

    #[tokio::test]
    async fn discovery_request_gets_response() {
        let service = service();
        let handle = MockHandle::new("a");
        service.connect("a", handle.clone()).await;
        service.handle_message("a", register(&["echo"])).await;

        let request = MessageEnvelope::new(MessageType::DiscoveryRequest, "a");
        service.handle_message("a", request.clone()).await;

        let sent = handle.sent();
        let reply = sent.last().unwrap();
        assert_eq!(reply.message_type, MessageType::DiscoveryResponse);
        assert_eq!(reply.correlation_id, request.correlation_id);
        assert_eq!(reply.payload["agents"][0]["agent_id"], json!("a"));
    }

    #[tokio::test]
    async fn ping_gets_pong_and_unknown_gets_error() {
        let service = service();
        let handle = MockHandle::new("a");
        service.connect("a", handle.clone()).await;

        service.handle_message("a", MessageEnvelope::new(MessageType::Ping, "a")).await;
        service.handle_message("a", MessageEnvelope::new(MessageType::TaskAssign, "a")).await;

        let sent = handle.sent();
        assert_eq!(sent[0].message_type, MessageType::Pong);
        assert_eq!(sent[1].message_type, MessageType::Error);
    }

    #[tokio::test]
    async fn reconnect_replaces_connection_and_ignores_stale_disconnect() {
        let service = service();
        let old = MockHandle::new("old");
        let new = MockHandle::new("new");
        let first = service.connect("a", old.clone()).await;
        let second = service.connect("a", new.clone()).await;

        assert!(old.is_closed());
        assert!(!service.disconnect("a", first).await);
        assert!(service.is_connected("a").await);
        assert!(service.disconnect("a", second).await);
        assert!(!service.is_connected("a").await);
    }

    #[tokio::test]
    async fn reconnect_fails_steps_assigned_over_replaced_connection() {
        let service = service();
        let old = MockHandle::new("old");
        let first = service.connect("a", old.clone()).await;
        service.handle_message("a", register(&["ocr"])).await;
        service
            .workflows
            .lock()
            .await
            .add("wf-1", WorkflowContext::new("p"));

        let ctx = CapabilityContext::new("wf-1", "read");
        let rx = service.dispatch("ocr", &ctx, Inputs::new()).await.unwrap();

        service.connect("a", MockHandle::new("new")).await;
        assert!(!service.disconnect("a", first).await);
        assert_eq!(service.pending_steps("wf-1").await, Some(vec![]));

        let response = tokio::time::timeout(Duration::from_millis(300), rx)
            .await
            .expect("step resolved after reconnect")
            .unwrap();
        match response {
            CapabilityResponse::Failed { error } => assert_eq!(error, "agent a reconnected"),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn report_from_unassigned_agent_is_rejected() {
        let service = service();
        service.connect("a", MockHandle::new("a")).await;
        service.connect("b", MockHandle::new("b")).await;
        service.handle_message("a", register(&["ocr"])).await;
        service
            .workflows
            .lock()
            .await
            .add("wf-1", WorkflowContext::new("p"));

        let ctx = CapabilityContext::new("wf-1", "read");
        let mut rx = service.dispatch("ocr", &ctx, Inputs::new()).await.unwrap();
        let report = |text: &str| TaskReport {
            workflow_id: "wf-1".into(),
            step_id: "read".into(),
            response: CapabilityResponse::completed(json!({ "text": text })),
        };

        assert!(!service.complete_step("b", report("forged")).await);
        assert_eq!(service.pending_steps("wf-1").await, Some(vec!["read".to_string()]));
        assert!(rx.try_recv().is_err());

        assert!(service.complete_step("a", report("real")).await);
        assert_eq!(rx.await.unwrap(), CapabilityResponse::completed(json!({"text": "real"})));
    }

    #[tokio::test]
    async fn dispatch_and_complete() {
        let service = service();
        let handle = MockHandle::new("a");
        service.connect("a", handle.clone()).await;
        service.handle_message("a", register(&["ocr"])).await;
        service
            .workflows
            .lock()
            .await
            .add("wf-1", WorkflowContext::new("p"));

        let ctx = CapabilityContext::new("wf-1", "read");
        let mut inputs = Inputs::new();
        inputs.insert("page".into(), json!(1));
        let rx = service.dispatch("ocr", &ctx, inputs).await.unwrap();
        assert_eq!(service.pending_steps("wf-1").await, Some(vec!["read".to_string()]));

        let assign = handle.sent().pop().unwrap();
        assert_eq!(assign.message_type, MessageType::TaskAssign);
        assert_eq!(assign.payload["inputs"]["page"], json!(1));

        let report = TaskReport {
            workflow_id: "wf-1".into(),
            step_id: "read".into(),
            response: CapabilityResponse::completed(json!({"text": "hello"})),
        };
        let reply = report.into_envelope(&assign, "a").unwrap();
        service.handle_message("a", reply).await;

        assert_eq!(rx.await.unwrap(), CapabilityResponse::completed(json!({"text": "hello"})));
        assert_eq!(service.pending_steps("wf-1").await, Some(vec![]));
    }

    #[tokio::test]
    async fn dispatch_without_agent_fails() {
        let service = service();
        service
            .workflows
            .lock()
            .await
            .add("wf-1", WorkflowContext::new("p"));
        let ctx = CapabilityContext::new("wf-1", "read");
        let err = service.dispatch("ocr", &ctx, Inputs::new()).await.unwrap_err();
        assert!(err.to_string().contains("no agent for capability ocr"));
    }

    #[tokio::test]
    async fn disconnect_fails_pending_steps() {
        let service = service();
        let session = service.connect("a", MockHandle::new("a")).await;
        service.handle_message("a", register(&["ocr"])).await;
        service
            .workflows
            .lock()
            .await
            .add("wf-1", WorkflowContext::new("p"));

        let ctx = CapabilityContext::new("wf-1", "read");
        let rx = service.dispatch("ocr", &ctx, Inputs::new()).await.unwrap();
        service.disconnect("a", session).await;

        match rx.await.unwrap() {
            CapabilityResponse::Failed { error } => assert!(error.contains("disconnected")),
            other => panic!("expected failure, got {:?}", other),
        }
    }

    #[tokio::test]
    async fn report_for_unknown_step_is_ignored() {
        let service = service();
        let report = TaskReport {
            workflow_id: "nope".into(),
            step_id: "x".into(),
            response: CapabilityResponse::completed(json!(1)),
        };
        assert!(!service.complete_step("a", report).await);
    }

    #[tokio::test]
    async fn execute_plan_routes_to_remote_agent() {
        let mut local = CapabilityRegistry::new();
        local.register(StaticCapability::new("summarize", json!({"local": true})));
        let service = Arc::new(RouterService::<MockHandle>::new(&RouterConfig::default(), local));
        let handle = MockHandle::new("a");
        service.connect("a", handle.clone()).await;
        service.handle_message("a", register(&["ocr"])).await;

        let plan = Plan::new(
            "p",
            "read then summarize",
            vec![
                Step::new("read", "ocr"),
                Step::new("sum", "summarize")
                    .with_input("text", json!("{{read.text}}"))
                    .depends_on(["read"]),
            ],
        );

        let runner = Arc::clone(&service);
        let run = tokio::spawn(async move { runner.execute_plan(plan).await });

        let assign = wait_for_assignment(&handle).await;
        let payload = &assign.payload;
        let reply = TaskReport {
            workflow_id: payload["workflow_id"].as_str().unwrap().to_string(),
            step_id: payload["step_id"].as_str().unwrap().to_string(),
            response: CapabilityResponse::completed(json!({"text": "scanned"})),
        }
        .into_envelope(&assign, "a")
        .unwrap();
        service.handle_message("a", reply).await;

        let result = run.await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Completed);
        assert_eq!(result.final_result, Some(json!({"local": true})));
        assert!(service.active_workflows().await.is_empty());
    }

    #[tokio::test]
    async fn remote_failure_fails_run() {
        let service = service();
        let handle = MockHandle::new("a");
        service.connect("a", handle.clone()).await;
        service.handle_message("a", register(&["ocr"])).await;
        let plan = Plan::new("p", "", vec![Step::new("read", "ocr")]);

        let runner = Arc::clone(&service);
        let run = tokio::spawn(async move { runner.execute_plan(plan).await });

        let assign = wait_for_assignment(&handle).await;
        let mut payload = json!({"status": "FAILED", "error": "blurry scan"});
        payload["workflow_id"] = assign.payload["workflow_id"].clone();
        payload["step_id"] = assign.payload["step_id"].clone();
        let reply = MessageEnvelope::reply_to(&assign, MessageType::TaskFail, "a").with_payload(payload);
        service.handle_message("a", reply).await;

        let result = run.await.unwrap();
        assert_eq!(result.status, WorkflowStatus::Failed);
        assert!(result.error.unwrap().contains("blurry scan"));
    }

    #[tokio::test]
    async fn shutdown_closes_connections() {
        let service = service();
        let handle = MockHandle::new("a");
        service.connect("a", handle.clone()).await;
        service.shutdown().await;
        assert!(handle.is_closed());
        assert!(service.discover(None).await.is_empty());
    }
}
