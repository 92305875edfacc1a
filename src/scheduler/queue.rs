use std::collections::BTreeMap;

use crate::agent::AgentId;
use crate::error::{JobdError, Result};

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Queue {
    pub name: String,
    pub description: Option<String>,
    /// Host whose agent services this queue.
    pub node: Option<String>,
    /// Maximum jobs running at once. 0 means unlimited.
    pub job_limit: u32,
    pub priority: i64,
    /// Accepts new submissions.
    pub open: bool,
    /// Dispatches pending jobs to its agent.
    pub started: bool,
    /// Agent currently logged in for `node`, if any.
    pub agent: Option<AgentId>,
    pub revision: u64,
}

impl Queue {
    pub fn new(name: impl Into<String>) -> Self {
        Self {
            name: name.into(),
            description: None,
            node: None,
            job_limit: 0,
            priority: 0,
            open: true,
            started: true,
            agent: None,
            revision: 1,
        }
    }

    pub fn with_node(mut self, node: impl Into<String>) -> Self {
        self.node = Some(node.into());
        self
    }
}

pub fn validate_queue_name(name: &str) -> Result<()> {
    let valid = !name.is_empty()
        && name.len() <= 64
        && name
            .chars()
            .all(|c| c.is_ascii_alphanumeric() || matches!(c, '_' | '-' | '.'));
    if valid {
        Ok(())
    } else {
        Err(JobdError::invalid(format!("Invalid queue name '{}'", name)))
    }
}

/// Queues by name, plus the runtime default queue.
#[derive(Debug, Default)]
pub struct QueueTable {
    queues: BTreeMap<String, Queue>,
    default: Option<String>,
}

impl QueueTable {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn insert(&mut self, queue: Queue) -> Result<()> {
        validate_queue_name(&queue.name)?;
        if self.queues.contains_key(&queue.name) {
            return Err(JobdError::AlreadyExists(queue.name));
        }
        self.queues.insert(queue.name.clone(), queue);
        Ok(())
    }

    pub fn get(&self, name: &str) -> Option<&Queue> {
        self.queues.get(name)
    }

    pub fn get_mut(&mut self, name: &str) -> Option<&mut Queue> {
        self.queues.get_mut(name)
    }

    pub fn remove(&mut self, name: &str) -> Option<Queue> {
        if self.default.as_deref() == Some(name) {
            self.default = None;
        }
        self.queues.remove(name)
    }

    pub fn iter(&self) -> impl Iterator<Item = &Queue> {
        self.queues.values()
    }

    pub fn iter_mut(&mut self) -> impl Iterator<Item = &mut Queue> {
        self.queues.values_mut()
    }

    pub fn len(&self) -> usize {
        self.queues.len()
    }

    pub fn is_empty(&self) -> bool {
        self.queues.is_empty()
    }

    pub fn set_default(&mut self, name: &str) -> Result<()> {
        if !self.queues.contains_key(name) {
            return Err(JobdError::QueueNotFound(name.to_string()));
        }
        self.default = Some(name.to_string());
        Ok(())
    }

    pub fn clear_default(&mut self, name: &str) {
        if self.default.as_deref() == Some(name) {
            self.default = None;
        }
    }

    pub fn default_name(&self) -> Option<&str> {
        self.default.as_deref()
    }

    /// Point every queue serviced by `host` at `agent`.
    pub fn bind_agent(&mut self, host: &str, agent: AgentId) -> usize {
        let mut bound = 0;
        for queue in self.queues.values_mut() {
            if queue.node.as_deref() == Some(host) {
                queue.agent = Some(agent);
                bound += 1;
            }
        }
        bound
    }

    pub fn unbind_agent(&mut self, agent: AgentId) {
        for queue in self.queues.values_mut() {
            if queue.agent == Some(agent) {
                queue.agent = None;
            }
        }
    }
}
