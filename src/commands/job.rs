use crate::auth::Permissions;
use crate::commands::{job_id_from, Command, Context, Origin, Reply};
use crate::error::Result;
use crate::protocol::{first_item, verbs, visit_fields, Field, FieldNumber, Item, KeyValue, Request, Response};
use crate::scheduler::lifecycle::SignalAction;
use crate::scheduler::query::serialize_job;
use crate::scheduler::{JobChanges, JobFilter, JobId, NewJob};

fn pairs(entries: Vec<KeyValue>) -> Vec<(String, String)> {
    entries.into_iter().map(|kv| (kv.key, kv.value)).collect()
}

/// JOB_ADD: submit a job.
#[derive(Debug)]
pub struct AddJob(pub NewJob);

impl Command for AddJob {
    const VERB: &'static str = verbs::JOB_ADD;
    const PERMISSION: Permissions = Permissions::WRITE;
    const REPLAY: bool = true;
    const ORIGIN: Origin = Origin::Client;

    fn decode(request: &Request) -> Result<Self> {
        let mut job = NewJob::default();
        visit_fields(Self::VERB, first_item(request), |number, field| {
            match number {
                FieldNumber::JobName => job.name = field.as_string()?,
                FieldNumber::QueueName => job.queue = Some(field.as_string()?),
                FieldNumber::Uid => job.uid = Some(field.as_u32()?),
                FieldNumber::Priority => job.priority = Some(field.as_int()?),
                FieldNumber::Nice => job.nice = Some(field.as_int()?),
                FieldNumber::Hold => job.hold = field.as_bool()?,
                FieldNumber::DeferTime => job.defer_time = Some(field.as_int()?),
                FieldNumber::Shell => job.shell = Some(field.as_string()?),
                FieldNumber::Stdout => job.stdout = Some(field.as_string()?),
                FieldNumber::Stderr => job.stderr = Some(field.as_string()?),
                FieldNumber::PreCmd => job.pre_cmd = Some(field.as_string()?),
                FieldNumber::PostCmd => job.post_cmd = Some(field.as_string()?),
                FieldNumber::Wrapper => job.wrapper = Some(field.as_string()?),
                FieldNumber::Args => job.args = field.as_string_array()?,
                FieldNumber::Envs => job.envs = field.as_string_array()?,
                FieldNumber::Resources => job.resources = field.as_string_array()?,
                FieldNumber::Tags => job.tags = pairs(field.as_string_map()?),
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(AddJob(job))
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let submitter = ctx.submitter();
        let state = &mut *ctx.state;
        let id = state
            .scheduler
            .add_job(self.0, submitter, state.users.as_ref(), state.now)?;
        let revision = state.scheduler.jobs.live(id)?.revision;

        let item = Item::new().with(Field::int(FieldNumber::JobId, id.0 as i64));
        Ok(Reply::respond(Response::map(item)).for_job(id, revision))
    }
}

/// JOB_GET: look up one job or filter the job table.
#[derive(Debug)]
pub struct GetJob {
    pub filter: JobFilter,
    pub return_fields: u64,
}

impl Command for GetJob {
    const VERB: &'static str = verbs::JOB_GET;
    const PERMISSION: Permissions = Permissions::READ;
    const REPLAY: bool = false;
    const ORIGIN: Origin = Origin::Client;

    fn decode(request: &Request) -> Result<Self> {
        let mut filter = JobFilter::default();
        let mut return_fields = 0;
        visit_fields(Self::VERB, first_item(request), |number, field| {
            match number {
                FieldNumber::JobId => {
                    let id = field.as_u64()?;
                    filter.jobid = (id != 0).then_some(JobId(id));
                }
                FieldNumber::JobName => filter.name = Some(field.as_string()?),
                FieldNumber::QueueName => filter.queue = Some(field.as_string()?),
                FieldNumber::State => filter.states = field.as_u32()?,
                FieldNumber::Uid => filter.uid = Some(field.as_u32()?),
                FieldNumber::Tags => filter.tags = pairs(field.as_string_map()?),
                FieldNumber::ReturnFields => return_fields = field.as_u64()?,
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        if filter.jobid.is_none() && request.jobid != 0 {
            filter.jobid = Some(JobId(request.jobid));
        }
        Ok(GetJob {
            filter,
            return_fields,
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let jobs = ctx.state.scheduler.query_jobs(&self.filter)?;
        let items = jobs
            .into_iter()
            .map(|job| serialize_job(job, self.return_fields))
            .collect();
        Ok(Reply::respond(Response::array(items)))
    }
}

/// JOB_MOD: partial update of a waiting or finished job.
#[derive(Debug)]
pub struct ModifyJob {
    pub id: JobId,
    pub changes: JobChanges,
}

impl Command for ModifyJob {
    const VERB: &'static str = verbs::JOB_MOD;
    const PERMISSION: Permissions = Permissions::WRITE;
    const REPLAY: bool = true;
    const ORIGIN: Origin = Origin::Client;

    fn decode(request: &Request) -> Result<Self> {
        let mut id = None;
        let mut changes = JobChanges::default();
        visit_fields(Self::VERB, first_item(request), |number, field| {
            match number {
                FieldNumber::JobId => id = Some(field.as_u64()?),
                FieldNumber::JobName => changes.name = Some(field.as_string()?),
                FieldNumber::QueueName => changes.queue = Some(field.as_string()?),
                FieldNumber::Priority => changes.priority = Some(field.as_int()?),
                FieldNumber::Nice => changes.nice = Some(field.as_int()?),
                FieldNumber::Hold => changes.hold = Some(field.as_bool()?),
                FieldNumber::DeferTime => changes.defer_time = Some(field.as_int()?),
                FieldNumber::Restart => changes.restart = field.as_bool()?,
                FieldNumber::Shell => changes.shell = Some(field.as_string()?),
                FieldNumber::Stdout => changes.stdout = Some(field.as_string()?),
                FieldNumber::Stderr => changes.stderr = Some(field.as_string()?),
                FieldNumber::PreCmd => changes.pre_cmd = Some(field.as_string()?),
                FieldNumber::PostCmd => changes.post_cmd = Some(field.as_string()?),
                FieldNumber::Wrapper => changes.wrapper = Some(field.as_string()?),
                FieldNumber::Args => changes.args = Some(field.as_string_array()?),
                FieldNumber::Envs => changes.envs = Some(field.as_string_array()?),
                FieldNumber::Resources => changes.resources = Some(field.as_string_array()?),
                FieldNumber::Tags => changes.tags = Some(pairs(field.as_string_map()?)),
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(ModifyJob {
            id: job_id_from(request, id),
            changes,
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let revision = ctx.state.scheduler.modify_job(self.id, self.changes)?;
        Ok(Reply::ok().for_job(self.id, revision))
    }
}

/// JOB_DEL: tombstone a job.
#[derive(Debug)]
pub struct DeleteJob {
    pub id: JobId,
}

impl Command for DeleteJob {
    const VERB: &'static str = verbs::JOB_DEL;
    const PERMISSION: Permissions = Permissions::WRITE;
    const REPLAY: bool = true;
    const ORIGIN: Origin = Origin::Client;

    fn decode(request: &Request) -> Result<Self> {
        let mut id = None;
        visit_fields(Self::VERB, first_item(request), |number, field| {
            if number != FieldNumber::JobId {
                return Ok(false);
            }
            id = Some(field.as_u64()?);
            Ok(true)
        })?;
        Ok(DeleteJob {
            id: job_id_from(request, id),
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let revision = ctx.state.scheduler.delete_job(self.id)?;
        Ok(Reply::ok().for_job(self.id, revision))
    }
}

/// JOB_SIG: check a job is alive (signal 0) or have its agent signal it.
#[derive(Debug)]
pub struct SignalJob {
    pub id: JobId,
    pub signal: i32,
}

impl Command for SignalJob {
    const VERB: &'static str = verbs::JOB_SIG;
    const PERMISSION: Permissions = Permissions::WRITE;
    const REPLAY: bool = false;
    const ORIGIN: Origin = Origin::Client;

    fn decode(request: &Request) -> Result<Self> {
        let mut id = None;
        let mut signal = 0;
        visit_fields(Self::VERB, first_item(request), |number, field| {
            match number {
                FieldNumber::JobId => id = Some(field.as_u64()?),
                FieldNumber::Signal => signal = field.as_i32()?,
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(SignalJob {
            id: job_id_from(request, id),
            signal,
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let state = &mut *ctx.state;
        match state.scheduler.signal_job(self.id, self.signal)? {
            SignalAction::Liveness { alive } => {
                Ok(Reply::respond(Response::simple(if alive { "0" } else { "1" })))
            }
            SignalAction::Deliver { queue, signal } => {
                let item = Item::new()
                    .with(Field::int(FieldNumber::JobId, self.id.0 as i64))
                    .with(Field::int(FieldNumber::Signal, i64::from(signal)));
                let message = Request::with_item(verbs::SIG_JOB, item);
                state
                    .agents
                    .deliver_to_queue(&state.scheduler.queues, &queue, &message);
                tracing::info!(job_id = %self.id, signal, queue = %queue, "Signal forwarded");
                Ok(Reply::ok())
            }
        }
    }
}

/// The JOB_RELEASE the scheduler issues for a deferred job that is due.
pub fn release_request(id: JobId) -> Request {
    let mut request = Request::with_item(
        verbs::JOB_RELEASE,
        Item::new().with(Field::int(FieldNumber::JobId, id.0 as i64)),
    );
    request.jobid = id.0;
    request
}

/// JOB_RELEASE: a deferred job's time has come. Issued by the schedule tick
/// and journaled so replay sees the same transition.
#[derive(Debug)]
pub struct ReleaseJob {
    pub id: JobId,
}

impl Command for ReleaseJob {
    const VERB: &'static str = verbs::JOB_RELEASE;
    const PERMISSION: Permissions = Permissions::NONE;
    const REPLAY: bool = true;
    const ORIGIN: Origin = Origin::Internal;

    fn decode(request: &Request) -> Result<Self> {
        let mut id = None;
        visit_fields(Self::VERB, first_item(request), |number, field| {
            if number != FieldNumber::JobId {
                return Ok(false);
            }
            id = Some(field.as_u64()?);
            Ok(true)
        })?;
        Ok(ReleaseJob {
            id: job_id_from(request, id),
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let now = ctx.state.now;
        let revision = ctx.state.scheduler.release_job(self.id, now)?;
        Ok(Reply::none().for_job(self.id, revision))
    }
}
