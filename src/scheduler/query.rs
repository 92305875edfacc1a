//! Job lookup, filtering and field-masked serialization.

use glob::Pattern;

use crate::error::{JobdError, Result};
use crate::protocol::{Field, FieldNumber, Item, KeyValue};
use crate::scheduler::job::{Job, JobId};
use crate::scheduler::resource::to_specs;
use crate::scheduler::Scheduler;

/// Criteria for JOB_GET. Every present criterion must hold.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct JobFilter {
    /// Exact lookup. When set, every other criterion is ignored.
    pub jobid: Option<JobId>,
    /// Bitmask of accepted states. 0 accepts every state.
    pub states: u32,
    pub queue: Option<String>,
    pub uid: Option<u32>,
    pub name: Option<String>,
    /// Each (key, value pattern) pair must be matched by one of the job's tags.
    pub tags: Vec<(String, String)>,
}

pub fn has_glob_chars(text: &str) -> bool {
    text.contains(['*', '?', '['])
}

pub fn compile(pattern: &str) -> Result<Pattern> {
    Pattern::new(pattern)
        .map_err(|e| JobdError::invalid(format!("Invalid pattern '{}': {}", pattern, e.msg)))
}

enum QueueMatch {
    Any,
    Exact(String),
    Glob(Pattern),
}

struct CompiledFilter {
    states: u32,
    queue: QueueMatch,
    uid: Option<u32>,
    name: Option<Pattern>,
    tags: Vec<(String, Pattern)>,
}

impl CompiledFilter {
    fn matches(&self, job: &Job) -> bool {
        if self.states != 0 && self.states & job.state.mask() == 0 {
            return false;
        }

        let queue_ok = match &self.queue {
            QueueMatch::Any => true,
            QueueMatch::Exact(name) => job.queue == *name,
            QueueMatch::Glob(pattern) => pattern.matches(&job.queue),
        };
        if !queue_ok {
            return false;
        }

        if self.uid.is_some_and(|uid| uid != job.uid) {
            return false;
        }

        if self
            .name
            .as_ref()
            .is_some_and(|pattern| !pattern.matches(&job.name))
        {
            return false;
        }

        self.tags.iter().all(|(key, pattern)| {
            job.tags
                .iter()
                .any(|tag| tag.key == *key && pattern.matches(&tag.value))
        })
    }
}

impl Scheduler {
    /// A single live job.
    pub fn get_job(&self, id: JobId) -> Result<&Job> {
        self.jobs.live(id)
    }

    /// Live jobs matching `filter`, in id order.
    pub fn query_jobs(&self, filter: &JobFilter) -> Result<Vec<&Job>> {
        if let Some(id) = filter.jobid {
            return Ok(vec![self.get_job(id)?]);
        }

        let queue = match &filter.queue {
            None => QueueMatch::Any,
            Some(name) if has_glob_chars(name) => QueueMatch::Glob(compile(name)?),
            Some(name) => {
                let queue = self
                    .queues
                    .get(name)
                    .ok_or_else(|| JobdError::QueueNotFound(name.clone()))?;
                QueueMatch::Exact(queue.name.clone())
            }
        };

        let compiled = CompiledFilter {
            states: filter.states,
            queue,
            uid: filter.uid,
            name: filter.name.as_deref().map(compile).transpose()?,
            tags: filter
                .tags
                .iter()
                .map(|(key, value)| Ok((key.clone(), compile(value)?)))
                .collect::<Result<_>>()?,
        };

        Ok(self
            .jobs
            .iter_live()
            .filter(|job| compiled.matches(job))
            .collect())
    }
}

/// Bit selecting `field` in a return-field mask.
pub const fn return_bit(field: FieldNumber) -> u64 {
    1 << (field as u32)
}

/// Serialize a job, keeping only the fields selected by `mask` (0 selects
/// all). Unset optional fields are left out. Exit code and signal are always
/// present.
pub fn serialize_job(job: &Job, mask: u64) -> Item {
    let wanted = |field: FieldNumber| mask == 0 || mask & return_bit(field) != 0;
    let mut item = Item::new();

    if wanted(FieldNumber::JobId) {
        item.push(Field::int(FieldNumber::JobId, job.id.0 as i64));
    }
    if wanted(FieldNumber::JobName) {
        item.push(Field::string(FieldNumber::JobName, &job.name));
    }
    if wanted(FieldNumber::QueueName) {
        item.push(Field::string(FieldNumber::QueueName, &job.queue));
    }
    if wanted(FieldNumber::State) {
        item.push(Field::int(FieldNumber::State, i64::from(job.state.mask())));
    }
    if wanted(FieldNumber::Uid) {
        item.push(Field::int(FieldNumber::Uid, i64::from(job.uid)));
    }
    if wanted(FieldNumber::Priority) {
        item.push(Field::int(FieldNumber::Priority, job.priority));
    }
    if wanted(FieldNumber::SubmitTime) {
        item.push(Field::int(FieldNumber::SubmitTime, job.submit_time));
    }
    if wanted(FieldNumber::Nice) {
        item.push(Field::int(FieldNumber::Nice, job.nice));
    }
    if wanted(FieldNumber::Args) {
        item.push(Field::string_array(FieldNumber::Args, job.args.clone()));
    }

    let optional_strings = [
        (FieldNumber::Stdout, &job.stdout),
        (FieldNumber::Stderr, &job.stderr),
    ];
    for (number, value) in optional_strings {
        if let Some(value) = value.as_ref().filter(|_| wanted(number)) {
            item.push(Field::string(number, value));
        }
    }

    let times = [
        (FieldNumber::DeferTime, job.defer_time),
        (FieldNumber::StartTime, job.start_time),
        (FieldNumber::FinishTime, job.finish_time),
    ];
    for (number, value) in times {
        if let Some(value) = value.filter(|_| wanted(number)) {
            item.push(Field::int(number, value));
        }
    }

    if !job.tags.is_empty() && wanted(FieldNumber::Tags) {
        let entries = job
            .tags
            .iter()
            .map(|t| KeyValue::new(&t.key, &t.value))
            .collect();
        item.push(Field::string_map(FieldNumber::Tags, entries));
    }

    let commands = [
        (FieldNumber::Shell, &job.shell),
        (FieldNumber::PreCmd, &job.pre_cmd),
        (FieldNumber::PostCmd, &job.post_cmd),
    ];
    for (number, value) in commands {
        if let Some(value) = value.as_ref().filter(|_| wanted(number)) {
            item.push(Field::string(number, value));
        }
    }

    if !job.resources.is_empty() && wanted(FieldNumber::Resources) {
        item.push(Field::string_array(
            FieldNumber::Resources,
            to_specs(&job.resources),
        ));
    }

    item.push(Field::int(FieldNumber::ExitCode, i64::from(job.exit_code)));
    item.push(Field::int(FieldNumber::Signal, i64::from(job.signal)));
    item
}
