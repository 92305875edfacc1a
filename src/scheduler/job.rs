use serde::{Deserialize, Serialize};

use crate::scheduler::tags::TagList;

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Hash, Serialize, Deserialize)]
pub struct JobId(pub u64);

impl std::fmt::Display for JobId {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum JobState {
    Deferred,
    Holding,
    Pending,
    Running,
    Completed,
    Exited,
}

impl JobState {
    pub const ALL: [JobState; 6] = [
        JobState::Deferred,
        JobState::Holding,
        JobState::Pending,
        JobState::Running,
        JobState::Completed,
        JobState::Exited,
    ];

    /// Bit used for this state in wire state filters.
    pub fn mask(self) -> u32 {
        match self {
            JobState::Deferred => 0x01,
            JobState::Holding => 0x02,
            JobState::Pending => 0x04,
            JobState::Running => 0x08,
            JobState::Completed => 0x10,
            JobState::Exited => 0x20,
        }
    }

    pub fn from_mask(mask: u32) -> Option<Self> {
        Self::ALL.into_iter().find(|s| s.mask() == mask)
    }

    /// The state a job waiting to run settles in. Used on submit and on every
    /// modification; RUNNING and the finished states only come from agents.
    pub fn derive(defer_time: Option<i64>, hold: bool) -> Self {
        if defer_time.is_some() {
            JobState::Deferred
        } else if hold {
            JobState::Holding
        } else {
            JobState::Pending
        }
    }

    pub fn is_finished(self) -> bool {
        matches!(self, JobState::Completed | JobState::Exited)
    }
}

impl std::fmt::Display for JobState {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            JobState::Deferred => write!(f, "deferred"),
            JobState::Holding => write!(f, "holding"),
            JobState::Pending => write!(f, "pending"),
            JobState::Running => write!(f, "running"),
            JobState::Completed => write!(f, "completed"),
            JobState::Exited => write!(f, "exited"),
        }
    }
}

/// A resource requirement resolved against the resource catalog.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct BoundResource {
    pub name: String,
    pub needed: u32,
}

#[derive(Debug, Clone, PartialEq)]
pub struct Job {
    pub id: JobId,
    pub name: String,
    pub queue: String,
    pub uid: u32,
    pub priority: i64,
    pub nice: i64,
    pub state: JobState,
    /// Tombstone. Deleted jobs stay in the table but are invisible.
    pub deleted: bool,
    /// A START_JOB has been sent and not yet resolved by the agent.
    pub started: bool,
    pub submit_time: i64,
    pub defer_time: Option<i64>,
    pub start_time: Option<i64>,
    pub finish_time: Option<i64>,
    pub shell: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub pre_cmd: Option<String>,
    pub post_cmd: Option<String>,
    pub wrapper: Option<String>,
    pub args: Vec<String>,
    pub envs: Vec<String>,
    pub resources: Vec<BoundResource>,
    pub tags: TagList,
    pub exit_code: i32,
    pub signal: i32,
    /// Process id reported by the agent while the job runs.
    pub pid: Option<u32>,
    pub revision: u64,
}

impl Job {
    pub fn new(id: JobId, name: impl Into<String>, queue: impl Into<String>, uid: u32) -> Self {
        Self {
            id,
            name: name.into(),
            queue: queue.into(),
            uid,
            priority: 0,
            nice: 0,
            state: JobState::Pending,
            deleted: false,
            started: false,
            submit_time: 0,
            defer_time: None,
            start_time: None,
            finish_time: None,
            shell: None,
            stdout: None,
            stderr: None,
            pre_cmd: None,
            post_cmd: None,
            wrapper: None,
            args: Vec::new(),
            envs: Vec::new(),
            resources: Vec::new(),
            tags: TagList::default(),
            exit_code: 0,
            signal: 0,
            pid: None,
            revision: 0,
        }
    }

    pub fn is_running(&self) -> bool {
        self.state == JobState::Running || self.started
    }

    pub fn is_holding(&self) -> bool {
        self.state == JobState::Holding
    }

    pub fn bump_revision(&mut self) -> u64 {
        self.revision += 1;
        self.revision
    }
}
