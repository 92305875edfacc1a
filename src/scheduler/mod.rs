pub mod assigner;
pub mod job;
pub mod lifecycle;
pub mod query;
pub mod queue;
pub mod resource;
pub mod table;
pub mod tags;

use std::collections::BTreeSet;

pub use job::{BoundResource, Job, JobId, JobState};
pub use lifecycle::{JobChanges, NewJob, Submitter};
pub use query::JobFilter;
pub use queue::{Queue, QueueTable};
pub use resource::{Resource, ResourceCatalog};
pub use table::JobTable;
pub use tags::{Tag, TagList};

use crate::config::PriorityRange;
use crate::error::{JobdError, Result};

/// Lifetime counters. Per-state counts are computed from the job table.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct Stats {
    pub submitted: u64,
    pub started: u64,
    pub completed: u64,
    pub exited: u64,
    pub deleted: u64,
}

/// All scheduling state: jobs, queues and resources.
#[derive(Debug)]
pub struct Scheduler {
    pub jobs: JobTable,
    pub queues: QueueTable,
    pub resources: ResourceCatalog,
    pub stats: Stats,
    pub priority: PriorityRange,
    /// Configured fallback when no queue is flagged default at runtime.
    configured_default: Option<String>,
    /// Jobs whose persisted fields changed since the last dispatch pass.
    dirty: BTreeSet<JobId>,
}

impl Scheduler {
    pub fn new(max_jobs: usize, priority: PriorityRange, default_queue: Option<String>) -> Self {
        Self {
            jobs: JobTable::with_capacity(max_jobs),
            queues: QueueTable::new(),
            resources: ResourceCatalog::new(),
            stats: Stats::default(),
            priority,
            configured_default: default_queue,
            dirty: BTreeSet::new(),
        }
    }

    /// Resolve a submission's queue: the named one, else the runtime default,
    /// else the configured default.
    pub fn resolve_queue(&self, name: Option<&str>) -> Result<&Queue> {
        let name = match name {
            Some(name) => name,
            None => self
                .queues
                .default_name()
                .or(self.configured_default.as_deref())
                .ok_or_else(|| JobdError::QueueNotFound("<default>".to_string()))?,
        };

        self.queues
            .get(name)
            .ok_or_else(|| JobdError::QueueNotFound(name.to_string()))
    }

    pub fn check_priority(&self, priority: i64) -> Result<()> {
        if self.priority.contains(priority) {
            Ok(())
        } else {
            Err(JobdError::invalid(format!(
                "Priority {} outside allowed range {}..={}",
                priority, self.priority.min, self.priority.max
            )))
        }
    }

    pub fn mark_dirty(&mut self, id: JobId) {
        self.dirty.insert(id);
    }

    /// Drain the set of jobs changed since the last call.
    pub fn take_dirty(&mut self) -> BTreeSet<JobId> {
        std::mem::take(&mut self.dirty)
    }

    /// Units of `resource` held by running jobs.
    pub fn resource_in_use(&self, resource: &str) -> u64 {
        self.jobs
            .iter_live()
            .filter(|j| j.state == JobState::Running)
            .flat_map(|j| j.resources.iter())
            .filter(|r| r.name == resource)
            .map(|r| u64::from(r.needed))
            .sum()
    }

    /// Whether any live job still binds `resource`.
    pub fn resource_bound(&self, resource: &str) -> bool {
        self.jobs
            .iter_live()
            .any(|j| j.resources.iter().any(|r| r.name == resource))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn scheduler() -> Scheduler {
        let mut s = Scheduler::new(10, PriorityRange::default(), Some("batch".into()));
        s.queues.insert(Queue::new("batch")).unwrap();
        s.queues.insert(Queue::new("fast")).unwrap();
        s
    }

    #[test]
    fn resolve_queue_prefers_explicit_then_runtime_default() {
        let mut s = scheduler();
        assert_eq!(s.resolve_queue(Some("fast")).unwrap().name, "fast");
        assert_eq!(s.resolve_queue(None).unwrap().name, "batch");

        s.queues.set_default("fast").unwrap();
        assert_eq!(s.resolve_queue(None).unwrap().name, "fast");
    }

    #[test]
    fn resolve_unknown_queue_fails() {
        let s = scheduler();
        assert!(matches!(
            s.resolve_queue(Some("nope")),
            Err(JobdError::QueueNotFound(_))
        ));
    }

    #[test]
    fn take_dirty_drains() {
        let mut s = scheduler();
        s.mark_dirty(JobId(3));
        s.mark_dirty(JobId(1));
        let dirty: Vec<_> = s.take_dirty().into_iter().collect();
        assert_eq!(dirty, vec![JobId(1), JobId(3)]);
        assert!(s.take_dirty().is_empty());
    }
}
