//! Mock capabilities, channel handles, and plan fixtures shared by the
//! agentmesh test suites.

use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use futures::future::BoxFuture;
use serde_json::{json, Value};

use agentmesh_core::error::{MeshError, Result};
use agentmesh_core::protocol::MessageEnvelope;
use agentmesh_core::traits::{Capability, ChannelHandle};
use agentmesh_core::types::{CapabilityContext, CapabilityResponse, Inputs, Plan, Step};

/// Completes immediately with a fixed result.
pub struct StaticCapability {
    name: String,
    result: Value,
}

impl StaticCapability {
    pub fn new(name: impl Into<String>, result: Value) -> Self {
        Self {
            name: name.into(),
            result,
        }
    }
}

impl Capability for StaticCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _inputs: Inputs, _ctx: CapabilityContext) -> BoxFuture<'_, Result<CapabilityResponse>> {
        let result = self.result.clone();
        Box::pin(async move { Ok(CapabilityResponse::completed(result)) })
    }
}

/// Completes with a raw envelope, parsed the way a remote payload would be.
/// Useful for the legacy `{"status":"COMPLETED","data":...}` shape.
pub struct EnvelopeCapability {
    name: String,
    envelope: Value,
}

impl EnvelopeCapability {
    pub fn new(name: impl Into<String>, envelope: Value) -> Self {
        Self {
            name: name.into(),
            envelope,
        }
    }

    pub fn legacy_data(name: impl Into<String>, data: Value) -> Self {
        Self::new(name, json!({"status": "COMPLETED", "data": data}))
    }
}

impl Capability for EnvelopeCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _inputs: Inputs, _ctx: CapabilityContext) -> BoxFuture<'_, Result<CapabilityResponse>> {
        let envelope = self.envelope.clone();
        Box::pin(async move { CapabilityResponse::from_envelope(envelope) })
    }
}

/// Returns a failure envelope.
pub struct FailingCapability {
    name: String,
    error: String,
}

impl FailingCapability {
    pub fn new(name: impl Into<String>, error: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            error: error.into(),
        }
    }
}

impl Capability for FailingCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _inputs: Inputs, _ctx: CapabilityContext) -> BoxFuture<'_, Result<CapabilityResponse>> {
        let error = self.error.clone();
        Box::pin(async move { Ok(CapabilityResponse::failed(error)) })
    }
}

/// Faults (returns `Err`) instead of producing an envelope.
pub struct FaultingCapability {
    name: String,
    message: String,
}

impl FaultingCapability {
    pub fn new(name: impl Into<String>, message: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            message: message.into(),
        }
    }
}

impl Capability for FaultingCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, _inputs: Inputs, _ctx: CapabilityContext) -> BoxFuture<'_, Result<CapabilityResponse>> {
        let err = MeshError::CapabilityExecution {
            capability: self.name.clone(),
            message: self.message.clone(),
        };
        Box::pin(async move { Err(err) })
    }
}

/// Records every invocation's resolved inputs and returns them as the result,
/// optionally after a delay.
#[derive(Clone)]
pub struct RecordingCapability {
    name: String,
    delay: Duration,
    calls: Arc<Mutex<Vec<(CapabilityContext, Inputs)>>>,
    in_flight: Arc<AtomicUsize>,
    max_in_flight: Arc<AtomicUsize>,
}

impl RecordingCapability {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            delay: Duration::ZERO,
            calls: Arc::new(Mutex::new(Vec::new())),
            in_flight: Arc::new(AtomicUsize::new(0)),
            max_in_flight: Arc::new(AtomicUsize::new(0)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Recorded `(context, inputs)` pairs in invocation order.
    pub fn calls(&self) -> Vec<(CapabilityContext, Inputs)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    /// Step ids in invocation order.
    pub fn invoked_steps(&self) -> Vec<String> {
        self.calls().into_iter().map(|(ctx, _)| ctx.step_id).collect()
    }

    /// Highest number of simultaneously running invocations observed.
    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

impl Capability for RecordingCapability {
    fn name(&self) -> &str {
        &self.name
    }

    fn execute(&self, inputs: Inputs, ctx: CapabilityContext) -> BoxFuture<'_, Result<CapabilityResponse>> {
        Box::pin(async move {
            self.calls.lock().unwrap().push((ctx, inputs.clone()));
            let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
            self.max_in_flight.fetch_max(now, Ordering::SeqCst);
            if !self.delay.is_zero() {
                tokio::time::sleep(self.delay).await;
            }
            self.in_flight.fetch_sub(1, Ordering::SeqCst);
            Ok(CapabilityResponse::completed(Value::Object(inputs)))
        })
    }
}

/// Channel handle that records sent messages and whether it was closed.
#[derive(Clone, Default)]
pub struct MockHandle {
    label: String,
    sent: Arc<Mutex<Vec<MessageEnvelope>>>,
    closed: Arc<AtomicBool>,
}

impl MockHandle {
    pub fn new(label: impl Into<String>) -> Self {
        Self {
            label: label.into(),
            ..Default::default()
        }
    }

    pub fn label(&self) -> &str {
        &self.label
    }

    pub fn is_closed(&self) -> bool {
        self.closed.load(Ordering::SeqCst)
    }

    pub fn sent(&self) -> Vec<MessageEnvelope> {
        self.sent.lock().unwrap().clone()
    }
}

impl ChannelHandle for MockHandle {
    fn send(&self, envelope: MessageEnvelope) -> Result<()> {
        if self.is_closed() {
            return Err(MeshError::Channel {
                agent_id: self.label.clone(),
                message: "closed".into(),
            });
        }
        self.sent.lock().unwrap().push(envelope);
        Ok(())
    }

    fn close(&self) {
        self.closed.store(true, Ordering::SeqCst);
    }
}

/// Fan-in plan: `s1`, `s2`, `s3` independent, `s4` depends on all three.
pub fn fan_in_plan(capability: &str) -> Plan {
    Plan::new(
        "fan-in",
        "combine three independent lookups",
        vec![
            Step::new("s1", capability).with_input("n", json!(1)),
            Step::new("s2", capability).with_input("n", json!(2)),
            Step::new("s3", capability).with_input("n", json!(3)),
            Step::new("s4", capability)
                .with_input("first", json!("{{s1.n}}"))
                .with_input("second", json!("{{s2.result.n}}"))
                .with_input("third", json!("{{s3.n}}"))
                .depends_on(["s1", "s2", "s3"]),
        ],
    )
}

/// Linear chain `c0 → c1 → … → c{n-1}`.
pub fn chain_plan(capability: &str, n: usize) -> Plan {
    let steps = (0..n)
        .map(|i| {
            let step = Step::new(format!("c{}", i), capability).with_input("index", json!(i));
            if i == 0 {
                step
            } else {
                step.depends_on([format!("c{}", i - 1)])
            }
        })
        .collect();
    Plan::new("chain", "linear chain", steps)
}
