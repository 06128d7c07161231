use std::collections::HashMap;

use tracing::debug;

use agentmesh_core::traits::ChannelHandle;

/// Live agent connections keyed by agent id, at most one per id.
///
/// Not synchronized; the owner wraps it in a lock.
pub struct ConnectionRegistry<H> {
    connections: HashMap<String, H>,
}

impl<H: ChannelHandle> ConnectionRegistry<H> {
    pub fn new() -> Self {
        Self {
            connections: HashMap::new(),
        }
    }

    /// Register a connection. A previous connection under the same id is
    /// closed and replaced.
    ///
    /// Returns true if the id was not registered before.
    pub fn add(&mut self, agent_id: impl Into<String>, handle: H) -> bool {
        let agent_id = agent_id.into();
        match self.connections.insert(agent_id.clone(), handle) {
            Some(previous) => {
                debug!(agent_id = %agent_id, "Replacing existing connection");
                previous.close();
                false
            }
            None => true,
        }
    }

    /// Returns whether a connection was removed. The handle is not closed.
    pub fn remove(&mut self, agent_id: &str) -> bool {
        let removed = self.connections.remove(agent_id).is_some();
        if !removed {
            debug!(agent_id, "Remove for unknown connection");
        }
        removed
    }

    pub fn get(&self, agent_id: &str) -> Option<&H> {
        let handle = self.connections.get(agent_id);
        if handle.is_none() {
            debug!(agent_id, "Lookup for unknown connection");
        }
        handle
    }

    pub fn get_all(&self) -> &HashMap<String, H> {
        &self.connections
    }

    pub fn contains(&self, agent_id: &str) -> bool {
        self.connections.contains_key(agent_id)
    }

    pub fn len(&self) -> usize {
        self.connections.len()
    }

    pub fn is_empty(&self) -> bool {
        self.connections.is_empty()
    }

    /// Close and drop every connection.
    pub fn close_all(&mut self) {
        for (agent_id, handle) in self.connections.drain() {
            debug!(agent_id = %agent_id, "Closing connection");
            handle.close();
        }
    }
}

impl<H: ChannelHandle> Default for ConnectionRegistry<H> {
    fn default() -> Self {
        Self::new()
    }
}

/// In-flight workflow contexts keyed by workflow id.
pub struct WorkflowRegistry<S> {
    workflows: HashMap<String, S>,
}

impl<S> WorkflowRegistry<S> {
    pub fn new() -> Self {
        Self {
            workflows: HashMap::new(),
        }
    }

    /// Insert a context. An existing entry under the same id is replaced.
    pub fn add(&mut self, workflow_id: impl Into<String>, state: S) {
        let workflow_id = workflow_id.into();
        if self.workflows.insert(workflow_id.clone(), state).is_some() {
            debug!(workflow_id = %workflow_id, "Replaced existing workflow context");
        }
    }

    /// Replace the whole context of a known workflow. Unknown ids are ignored.
    pub fn update(&mut self, workflow_id: &str, state: S) -> bool {
        match self.workflows.get_mut(workflow_id) {
            Some(slot) => {
                *slot = state;
                true
            }
            None => {
                debug!(workflow_id, "Update for unknown workflow");
                false
            }
        }
    }

    pub fn get(&self, workflow_id: &str) -> Option<&S> {
        let state = self.workflows.get(workflow_id);
        if state.is_none() {
            debug!(workflow_id, "Lookup for unknown workflow");
        }
        state
    }

    pub fn get_mut(&mut self, workflow_id: &str) -> Option<&mut S> {
        let state = self.workflows.get_mut(workflow_id);
        if state.is_none() {
            debug!(workflow_id, "Lookup for unknown workflow");
        }
        state
    }

    pub fn remove(&mut self, workflow_id: &str) -> Option<S> {
        let removed = self.workflows.remove(workflow_id);
        if removed.is_none() {
            debug!(workflow_id, "Remove for unknown workflow");
        }
        removed
    }

    pub fn ids(&self) -> Vec<String> {
        let mut ids: Vec<String> = self.workflows.keys().cloned().collect();
        ids.sort();
        ids
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = (&String, &mut S)> {
        self.workflows.iter_mut()
    }

    pub fn len(&self) -> usize {
        self.workflows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.workflows.is_empty()
    }
}

impl<S> Default for WorkflowRegistry<S> {
    fn default() -> Self {
        Self::new()
    }
}
