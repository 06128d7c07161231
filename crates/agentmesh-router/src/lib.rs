//! Router service and agent worker: the message-channel side of agentmesh.
//!
//! The router accepts agent WebSocket connections, keeps the connection and
//! workflow registries, and runs submitted plans with steps forwarded to the
//! agents that advertise their capabilities. The worker is the agent end.

mod connection;
mod registry;
mod remote;
mod routes;
mod server;
mod service;
mod state;
mod worker;

pub use connection::AgentConnection;
pub use registry::{ConnectionRegistry, WorkflowRegistry};
pub use remote::RemoteCapability;
pub use server::RouterServer;
pub use service::{RouterService, WorkflowContext};
pub use worker::AgentWorker;
