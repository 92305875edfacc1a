use std::collections::BTreeMap;

use crate::error::{JobdError, Result};
use crate::scheduler::job::{Job, JobId, JobState};

const DEFAULT_MAX_JOBS: usize = 100_000;

/// Every job the server knows about, keyed and iterated by id.
///
/// Deleted jobs stay in the table as tombstones; the `live*` accessors hide
/// them. Capacity is measured in live jobs. Tombstone through
/// [`JobTable::tombstone`] so the live count stays exact.
#[derive(Debug)]
pub struct JobTable {
    jobs: BTreeMap<JobId, Job>,
    next_id: u64,
    max_jobs: usize,
    live: usize,
}

impl Default for JobTable {
    fn default() -> Self {
        Self::new()
    }
}

impl JobTable {
    pub fn new() -> Self {
        Self::with_capacity(DEFAULT_MAX_JOBS)
    }

    pub fn with_capacity(max_jobs: usize) -> Self {
        Self {
            jobs: BTreeMap::new(),
            next_id: 1,
            max_jobs,
            live: 0,
        }
    }

    /// Hand out the next job id. Only call once the job is certain to be
    /// inserted; ids are never reused or skipped by a failed submission.
    pub fn allocate_id(&mut self) -> JobId {
        let id = JobId(self.next_id);
        self.next_id += 1;
        id
    }

    /// Id the next successful submission will receive.
    pub fn peek_next_id(&self) -> JobId {
        JobId(self.next_id)
    }

    pub fn insert(&mut self, job: Job) -> Result<()> {
        if self.is_full() {
            return Err(JobdError::JobTableFull(self.max_jobs));
        }
        if job.id.0 >= self.next_id {
            self.next_id = job.id.0 + 1;
        }
        let live = !job.deleted;
        if let Some(replaced) = self.jobs.insert(job.id, job) {
            if !replaced.deleted {
                self.live -= 1;
            }
        }
        if live {
            self.live += 1;
        }
        Ok(())
    }

    /// Mark a live job deleted.
    pub fn tombstone(&mut self, id: JobId) -> Result<&mut Job> {
        let job = self
            .jobs
            .get_mut(&id)
            .filter(|j| !j.deleted)
            .ok_or(JobdError::JobNotFound(id))?;
        job.deleted = true;
        self.live -= 1;
        Ok(job)
    }

    /// Any job, tombstoned or not.
    pub fn get(&self, id: JobId) -> Option<&Job> {
        self.jobs.get(&id)
    }

    pub fn get_mut(&mut self, id: JobId) -> Option<&mut Job> {
        self.jobs.get_mut(&id)
    }

    pub fn live(&self, id: JobId) -> Result<&Job> {
        self.jobs
            .get(&id)
            .filter(|j| !j.deleted)
            .ok_or(JobdError::JobNotFound(id))
    }

    pub fn live_mut(&mut self, id: JobId) -> Result<&mut Job> {
        self.jobs
            .get_mut(&id)
            .filter(|j| !j.deleted)
            .ok_or(JobdError::JobNotFound(id))
    }

    /// Live jobs in id order.
    pub fn iter_live(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values().filter(|j| !j.deleted)
    }

    pub fn iter_live_mut(&mut self) -> impl Iterator<Item = &mut Job> {
        self.jobs.values_mut().filter(|j| !j.deleted)
    }

    pub fn iter_all(&self) -> impl Iterator<Item = &Job> {
        self.jobs.values()
    }

    /// Live jobs in `queue` that have not finished.
    pub fn active_in_queue<'a>(&'a self, queue: &'a str) -> impl Iterator<Item = &'a Job> + 'a {
        self.iter_live()
            .filter(move |j| j.queue == queue && !j.state.is_finished())
    }

    pub fn count_in_state(&self, state: JobState) -> usize {
        self.iter_live().filter(|j| j.state == state).count()
    }

    /// Number of live jobs.
    pub fn len(&self) -> usize {
        self.live
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    pub fn is_full(&self) -> bool {
        self.len() >= self.max_jobs
    }

    pub fn max_jobs(&self) -> usize {
        self.max_jobs
    }
}
