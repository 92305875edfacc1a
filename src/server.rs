//! The synchronous server core: registry, state, permission cache and
//! journal behind one `&mut self`. The event loop in [`crate::node`] owns
//! the only instance, so every command runs serially.

use bytes::Bytes;
use tokio::sync::mpsc;

use crate::agent::AgentId;
use crate::auth::{PermissionCache, UserDirectory};
use crate::commands::agent::start_job_request;
use crate::commands::job::release_request;
use crate::commands::{Caller, CommandRegistry, State};
use crate::config::ServerConfig;
use crate::error::Result;
use crate::journal::JournalStore;
use crate::protocol::{Envelope, Response};
use crate::scheduler::Scheduler;

/// Source of the server clock in unix seconds.
pub type Clock = fn() -> i64;

fn wall_clock() -> i64 {
    chrono::Utc::now().timestamp()
}

pub struct Server {
    registry: CommandRegistry,
    state: State,
    auth: PermissionCache,
    journal: Box<dyn JournalStore>,
    clock: Clock,
}

impl Server {
    pub fn new(
        config: &ServerConfig,
        users: Box<dyn UserDirectory>,
        journal: Box<dyn JournalStore>,
    ) -> Self {
        let scheduler = Scheduler::new(config.max_jobs, config.priority, config.default_queue.clone());
        Self {
            registry: CommandRegistry::new(config.readonly),
            state: State::new(scheduler, users).with_agent_secret(config.agent_secret.clone()),
            auth: PermissionCache::new(config.permissions.clone()),
            journal,
            clock: wall_clock,
        }
    }

    pub fn with_clock(mut self, clock: Clock) -> Self {
        self.clock = clock;
        self
    }

    pub fn state(&self) -> &State {
        &self.state
    }

    pub fn scheduler(&self) -> &Scheduler {
        &self.state.scheduler
    }

    /// Rebuild state from the journal. Must run before any traffic is
    /// accepted; an error here means the journal cannot be trusted.
    pub fn recover(&mut self) -> Result<usize> {
        let records = self.journal.load()?;
        for (index, record) in records.iter().enumerate() {
            self.registry.replay(&mut self.state, index, record)?;
        }
        // Replay pins the clock; live commands use the real one again.
        self.state.now = (self.clock)();

        tracing::info!(
            records = records.len(),
            jobs = self.state.scheduler.jobs.len(),
            queues = self.state.scheduler.queues.len(),
            next_job_id = %self.state.scheduler.jobs.peek_next_id(),
            "Journal replayed"
        );
        Ok(records.len())
    }

    /// One frame from a local client.
    pub fn handle_client(&mut self, uid: u32, frame: Bytes) -> Option<Response> {
        self.handle(Caller::Client { uid }, frame)
    }

    /// One frame from an agent connection.
    pub fn handle_agent_frame(&mut self, agent: AgentId, frame: Bytes) -> Option<Response> {
        self.handle(Caller::Agent(agent), frame)
    }

    fn handle(&mut self, caller: Caller, frame: Bytes) -> Option<Response> {
        let envelope = match Envelope::decode(frame) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(?caller, error = %e, "Undecodable frame dropped");
                return None;
            }
        };

        self.state.now = (self.clock)();
        self.registry.dispatch(
            &mut self.state,
            &mut self.auth,
            self.journal.as_mut(),
            caller,
            &envelope,
        )
    }

    pub fn respond_to_agent(&self, agent: AgentId, response: &Response) {
        self.state.agents.respond(agent, response);
    }

    pub fn agent_connected(&mut self, peer: String, outbound: mpsc::UnboundedSender<Bytes>) -> AgentId {
        self.state.agents.connect(peer, outbound)
    }

    /// Forget the agent and leave its queues without an agent until one
    /// logs in for the same host.
    pub fn agent_disconnected(&mut self, agent: AgentId) {
        self.state.scheduler.queues.unbind_agent(agent);
        self.state.agents.disconnect(agent);
    }

    /// Release due deferred jobs and hand pending jobs to their queue's
    /// agent. Returns the number of START_JOB messages sent.
    ///
    /// Releases run as journaled JOB_RELEASE commands; assignment is
    /// runtime-only and redone after a restart.
    pub fn schedule_tick(&mut self) -> usize {
        let now = (self.clock)();
        self.state.now = now;

        // Read-only servers journal nothing, so deferred jobs wait.
        let due = if self.registry.is_readonly() {
            Vec::new()
        } else {
            self.state.scheduler.due_deferred(now)
        };
        for id in due {
            let release = Envelope::from_request(release_request(id));
            let response = self.registry.dispatch(
                &mut self.state,
                &mut self.auth,
                self.journal.as_mut(),
                Caller::Internal,
                &release,
            );
            if let Some(category) = response.as_ref().and_then(|r| r.error_category()) {
                tracing::warn!(job_id = %id, category, "Deferred release refused");
            }
        }

        let scheduler = &mut self.state.scheduler;

        let mut sent = 0;
        for assignment in scheduler.assign_pending() {
            let request = match scheduler.jobs.live(assignment.job) {
                Ok(job) => start_job_request(job),
                Err(_) => continue,
            };
            if self.state.agents.deliver(assignment.agent, &request) {
                sent += 1;
            } else {
                scheduler.unassign(assignment.job);
            }
        }

        let changed = scheduler.take_dirty();
        if !changed.is_empty() || sent > 0 {
            tracing::debug!(changed = changed.len(), started = sent, "Schedule pass");
        }
        sent
    }

    pub fn flush(&mut self) -> Result<()> {
        self.journal.flush()
    }
}
