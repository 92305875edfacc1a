use std::collections::HashMap;

use crate::agent::AgentId;
use crate::error::{JobdError, Result};
use crate::scheduler::job::{JobId, JobState};
use crate::scheduler::Scheduler;

/// Outcome of an agent's RECON report.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Reconciliation {
    /// Reported running but not yet recorded as started, with their pids.
    pub unrecorded: Vec<(JobId, u32)>,
    /// Undelivered starts made eligible for dispatch again.
    pub cleared: usize,
}

/// A pending job picked for launch on a queue's agent.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Assignment {
    pub job: JobId,
    pub queue: String,
    pub agent: AgentId,
}

impl Scheduler {
    /// Deferred jobs whose defer time has passed, in id order.
    pub fn due_deferred(&self, now: i64) -> Vec<JobId> {
        self.jobs
            .iter_live()
            .filter(|j| j.state == JobState::Deferred)
            .filter(|j| j.defer_time.map_or(true, |t| t <= now))
            .map(|j| j.id)
            .collect()
    }

    /// Move a due deferred job to PENDING and clear its defer time.
    pub fn release_job(&mut self, id: JobId, now: i64) -> Result<u64> {
        let job = self.jobs.live_mut(id)?;
        if job.state != JobState::Deferred || job.defer_time.is_some_and(|t| t > now) {
            return Err(JobdError::invalid(format!("Job {} is not due for release", id)));
        }
        job.defer_time = None;
        job.state = JobState::Pending;
        let revision = job.bump_revision();

        self.mark_dirty(id);
        tracing::debug!(job_id = %id, "Deferred job released");
        Ok(revision)
    }

    /// Pick pending jobs to launch, highest priority first then oldest, up to
    /// each started queue's job limit. Picked jobs are flagged `started`.
    pub fn assign_pending(&mut self) -> Vec<Assignment> {
        let mut slots: HashMap<String, (AgentId, Option<usize>)> = HashMap::new();
        for queue in self.queues.iter() {
            let Some(agent) = queue.agent.filter(|_| queue.started) else {
                continue;
            };
            let free = match queue.job_limit {
                0 => None,
                limit => {
                    let busy = self
                        .jobs
                        .iter_live()
                        .filter(|j| j.queue == queue.name && j.is_running())
                        .count();
                    Some((limit as usize).saturating_sub(busy))
                }
            };
            slots.insert(queue.name.clone(), (agent, free));
        }

        let mut candidates: Vec<(i64, JobId)> = self
            .jobs
            .iter_live()
            .filter(|j| j.state == JobState::Pending && !j.started)
            .filter(|j| slots.contains_key(&j.queue))
            .map(|j| (j.priority, j.id))
            .collect();
        candidates.sort_by(|a, b| b.0.cmp(&a.0).then(a.1.cmp(&b.1)));

        let mut assignments = Vec::new();
        for (_, id) in candidates {
            let Ok(job) = self.jobs.live_mut(id) else {
                continue;
            };
            let Some((agent, free)) = slots.get_mut(&job.queue) else {
                continue;
            };
            if let Some(free) = free {
                if *free == 0 {
                    continue;
                }
                *free -= 1;
            }

            job.started = true;
            tracing::info!(job_id = %id, queue = %job.queue, agent = %agent, "Job assigned");
            assignments.push(Assignment {
                job: id,
                queue: job.queue.clone(),
                agent: *agent,
            });
        }
        assignments
    }

    /// Align job flags with what a reconnecting agent reports running.
    ///
    /// Only reports for jobs in queues the agent serves are considered.
    /// Reported jobs that are not RUNNING yet are returned with their pid;
    /// the caller records their start. Jobs in the agent's queues that were
    /// sent a START_JOB but are neither running nor reported never reached
    /// the agent and become eligible for dispatch again.
    pub fn reconcile(&mut self, agent: AgentId, reported: &[(JobId, u32)]) -> Reconciliation {
        let served: Vec<String> = self
            .queues
            .iter()
            .filter(|q| q.agent == Some(agent))
            .map(|q| q.name.clone())
            .collect();

        let mut result = Reconciliation::default();
        for &(id, pid) in reported {
            let Some(job) = self.jobs.get_mut(id) else {
                tracing::warn!(job_id = %id, agent = %agent, "Agent reported unknown job");
                continue;
            };
            if !served.contains(&job.queue) {
                tracing::warn!(job_id = %id, agent = %agent, queue = %job.queue, "Agent reported job outside its queues");
                continue;
            }
            if job.state.is_finished() {
                continue;
            }
            job.started = true;
            if job.state != JobState::Running {
                result.unrecorded.push((id, pid));
            }
        }

        for job in self.jobs.iter_live_mut() {
            let lost = job.started
                && job.state != JobState::Running
                && served.contains(&job.queue)
                && !reported.iter().any(|(id, _)| *id == job.id);
            if lost {
                job.started = false;
                result.cleared += 1;
            }
        }
        result
    }

    /// Undo an assignment whose START_JOB could not be delivered.
    pub fn unassign(&mut self, id: JobId) {
        if let Ok(job) = self.jobs.live_mut(id) {
            if job.state != JobState::Running {
                job.started = false;
            }
        }
    }
}
