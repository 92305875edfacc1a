//! Job state transitions: submit, modify, delete, signal, tag changes and the
//! lifecycle events reported by agents.
//!
//! Every transition validates completely before it touches the job, so a
//! failed command leaves the tables exactly as they were.

use crate::auth::{Permissions, UserDirectory};
use crate::error::{JobdError, Result};
use crate::scheduler::job::{Job, JobId, JobState};
use crate::scheduler::tags::TagList;
use crate::scheduler::Scheduler;

/// Who is submitting or changing a job.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Submitter {
    pub uid: u32,
    pub permissions: Permissions,
    /// Re-applying a journaled command. Checks that depend on the live
    /// environment (setuid permission, account lookup) are skipped.
    pub replaying: bool,
}

impl Submitter {
    pub fn client(uid: u32, permissions: Permissions) -> Self {
        Self {
            uid,
            permissions,
            replaying: false,
        }
    }

    pub fn replay(uid: u32) -> Self {
        Self {
            uid,
            permissions: Permissions::ALL,
            replaying: true,
        }
    }
}

/// A job submission.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct NewJob {
    pub name: String,
    pub queue: Option<String>,
    /// Run as this uid instead of the submitter's.
    pub uid: Option<u32>,
    pub priority: Option<i64>,
    pub nice: Option<i64>,
    pub hold: bool,
    pub defer_time: Option<i64>,
    pub shell: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub pre_cmd: Option<String>,
    pub post_cmd: Option<String>,
    pub wrapper: Option<String>,
    pub args: Vec<String>,
    pub envs: Vec<String>,
    pub resources: Vec<String>,
    pub tags: Vec<(String, String)>,
}

/// A partial update. `None` leaves the field alone; collections replace the
/// job's list wholesale.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobChanges {
    pub name: Option<String>,
    pub queue: Option<String>,
    pub priority: Option<i64>,
    pub nice: Option<i64>,
    pub hold: Option<bool>,
    /// `Some(0)` clears a defer time.
    pub defer_time: Option<i64>,
    pub restart: bool,
    pub shell: Option<String>,
    pub stdout: Option<String>,
    pub stderr: Option<String>,
    pub pre_cmd: Option<String>,
    pub post_cmd: Option<String>,
    pub wrapper: Option<String>,
    pub args: Option<Vec<String>>,
    pub envs: Option<Vec<String>>,
    pub resources: Option<Vec<String>>,
    pub tags: Option<Vec<(String, String)>>,
}

/// What a JOB_SIG turned into.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum SignalAction {
    /// Signal 0: whether a process is bound to the job.
    Liveness { alive: bool },
    /// Forward the signal to the agent servicing `queue`.
    Deliver { queue: String, signal: i32 },
}

fn positive(time: Option<i64>) -> Option<i64> {
    time.filter(|t| *t > 0)
}

impl Scheduler {
    pub fn add_job(
        &mut self,
        request: NewJob,
        submitter: Submitter,
        users: &dyn UserDirectory,
        now: i64,
    ) -> Result<JobId> {
        let queue = self.resolve_queue(request.queue.as_deref())?;
        if !queue.open {
            return Err(JobdError::invalid(format!(
                "Queue '{}' is not accepting jobs",
                queue.name
            )));
        }
        let queue = queue.name.clone();

        let uid = request.uid.unwrap_or(submitter.uid);
        if uid == 0 {
            return Err(JobdError::invalid("Jobs not allowed to run as root"));
        }

        if !submitter.replaying {
            if uid != submitter.uid && !submitter.permissions.contains(Permissions::SETUID) {
                return Err(JobdError::PermissionDenied);
            }
            if users.lookup(uid).is_none() {
                return Err(JobdError::invalid(format!("User {} not valid", uid)));
            }
        }

        let priority = request.priority.unwrap_or(self.priority.default);
        self.check_priority(priority)?;

        let resources = self.resources.bind(&request.resources)?;

        if self.jobs.is_full() {
            return Err(JobdError::JobTableFull(self.jobs.max_jobs()));
        }

        let id = self.jobs.allocate_id();
        let defer_time = positive(request.defer_time);

        let mut job = Job::new(id, request.name, queue, uid);
        job.priority = priority;
        job.nice = request.nice.unwrap_or(0);
        job.state = JobState::derive(defer_time, request.hold);
        job.submit_time = now;
        job.defer_time = defer_time;
        job.shell = request.shell;
        job.stdout = request.stdout;
        job.stderr = request.stderr;
        job.pre_cmd = request.pre_cmd;
        job.post_cmd = request.post_cmd;
        job.wrapper = request.wrapper;
        job.args = request.args;
        job.envs = request.envs;
        job.resources = resources;
        job.tags = TagList::from_pairs(request.tags);
        job.revision = 1;

        tracing::debug!(job_id = %id, uid, state = %job.state, "Job submitted");
        self.jobs.insert(job)?;
        self.stats.submitted += 1;
        self.mark_dirty(id);
        Ok(id)
    }

    /// Apply a partial update. Returns the job's revision afterwards.
    pub fn modify_job(&mut self, id: JobId, changes: JobChanges) -> Result<u64> {
        let current = self.jobs.live(id)?;

        if current.is_running() {
            return Err(JobdError::JobRunning(id));
        }
        let finished = current.state.is_finished();
        if finished && !changes.restart {
            return Err(JobdError::JobFinished(id));
        }

        if let Some(priority) = changes.priority {
            self.check_priority(priority)?;
        }
        if let Some(queue) = &changes.queue {
            if self.queues.get(queue).is_none() {
                return Err(JobdError::QueueNotFound(queue.clone()));
            }
        }
        let resources = match &changes.resources {
            Some(specs) => Some(self.resources.bind(specs)?),
            None => None,
        };

        let job = self.jobs.live_mut(id)?;
        let mut dirty = false;
        let mut hold = job.is_holding();

        macro_rules! overwrite {
            ($field:ident) => {
                if let Some(value) = changes.$field {
                    job.$field = value;
                    dirty = true;
                }
            };
            ($field:ident, optional) => {
                if let Some(value) = changes.$field {
                    job.$field = Some(value);
                    dirty = true;
                }
            };
        }

        overwrite!(name);
        overwrite!(queue);
        overwrite!(priority);
        overwrite!(nice);
        overwrite!(args);
        overwrite!(envs);
        overwrite!(shell, optional);
        overwrite!(stdout, optional);
        overwrite!(stderr, optional);
        overwrite!(pre_cmd, optional);
        overwrite!(post_cmd, optional);
        overwrite!(wrapper, optional);

        if let Some(defer_time) = changes.defer_time {
            job.defer_time = positive(Some(defer_time));
            dirty = true;
        }
        if let Some(requested) = changes.hold {
            hold = requested;
            dirty = true;
        }
        if let Some(resources) = resources {
            job.resources = resources;
            dirty = true;
        }
        if let Some(tags) = changes.tags {
            job.tags = TagList::from_pairs(tags);
            dirty = true;
        }

        if finished {
            job.exit_code = 0;
            job.signal = 0;
            job.start_time = None;
            job.finish_time = None;
            dirty = true;
        }

        job.state = JobState::derive(job.defer_time, hold);

        let revision = if dirty {
            job.bump_revision()
        } else {
            job.revision
        };
        if dirty {
            tracing::debug!(job_id = %id, state = %job.state, revision, "Job modified");
            self.mark_dirty(id);
        }
        Ok(revision)
    }

    /// Tombstone a job. Its state is left as it was.
    pub fn delete_job(&mut self, id: JobId) -> Result<u64> {
        let job = self.jobs.tombstone(id)?;
        let revision = job.bump_revision();

        self.stats.deleted += 1;
        self.mark_dirty(id);
        tracing::debug!(job_id = %id, "Job deleted");
        Ok(revision)
    }

    pub fn signal_job(&self, id: JobId, signal: i32) -> Result<SignalAction> {
        let job = self.jobs.live(id)?;
        if signal == 0 {
            return Ok(SignalAction::Liveness {
                alive: job.pid.is_some(),
            });
        }
        Ok(SignalAction::Deliver {
            queue: job.queue.clone(),
            signal,
        })
    }

    pub fn set_tag(&mut self, id: JobId, key: &str, value: &str) -> Result<u64> {
        if key.is_empty() {
            return Err(JobdError::invalid("Tag key must not be empty"));
        }
        let job = self.jobs.live_mut(id)?;
        job.tags.set(key, value);
        let revision = job.bump_revision();
        self.mark_dirty(id);
        Ok(revision)
    }

    pub fn delete_tag(&mut self, id: JobId, key: &str) -> Result<u64> {
        if key.is_empty() {
            return Err(JobdError::invalid("Tag key must not be empty"));
        }
        let job = self.jobs.live_mut(id)?;
        job.tags.remove(key)?;
        let revision = job.bump_revision();
        self.mark_dirty(id);
        Ok(revision)
    }

    /// The agent launched the job. Applies to tombstoned jobs too, since a
    /// deleted job may already have been handed to an agent.
    pub fn job_started(&mut self, id: JobId, pid: u32, now: i64) -> Result<u64> {
        let job = self.jobs.get_mut(id).ok_or(JobdError::JobNotFound(id))?;
        job.state = JobState::Running;
        job.started = true;
        job.pid = Some(pid);
        job.start_time = Some(now);
        let revision = job.bump_revision();

        self.stats.started += 1;
        self.mark_dirty(id);
        tracing::info!(job_id = %id, pid, "Job started");
        Ok(revision)
    }

    pub fn job_completed(&mut self, id: JobId, exit_code: i32, signal: i32, now: i64) -> Result<u64> {
        let job = self.jobs.get_mut(id).ok_or(JobdError::JobNotFound(id))?;
        job.state = if exit_code == 0 && signal == 0 {
            JobState::Completed
        } else {
            JobState::Exited
        };
        job.started = false;
        job.pid = None;
        job.exit_code = exit_code;
        job.signal = signal;
        job.finish_time = Some(now);
        let state = job.state;
        let revision = job.bump_revision();

        match state {
            JobState::Completed => self.stats.completed += 1,
            _ => self.stats.exited += 1,
        }
        self.mark_dirty(id);
        tracing::info!(job_id = %id, exit_code, signal, "Job finished");
        Ok(revision)
    }
}
