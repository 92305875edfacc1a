use crate::auth::Permissions;
use crate::commands::{Command, Context, Origin, Reply};
use crate::error::{JobdError, Result};
use crate::protocol::{first_item, verbs, visit_fields, Field, FieldNumber, Item, Request, Response};
use crate::scheduler::query::compile;
use crate::scheduler::Queue;

/// Bits of the QUEUESTATE field.
pub const QUEUE_OPEN: u32 = 0x01;
pub const QUEUE_STARTED: u32 = 0x02;

#[derive(Debug, Default)]
struct QueueFields {
    name: Option<String>,
    description: Option<String>,
    node: Option<String>,
    job_limit: Option<u32>,
    priority: Option<i64>,
    state: Option<u32>,
    default: Option<bool>,
}

impl QueueFields {
    fn decode(verb: &str, request: &Request) -> Result<Self> {
        let mut q = QueueFields::default();
        visit_fields(verb, first_item(request), |number, field| {
            match number {
                FieldNumber::QueueName => q.name = Some(field.as_string()?),
                FieldNumber::Description => q.description = Some(field.as_string()?),
                FieldNumber::Node => q.node = Some(field.as_string()?),
                FieldNumber::JobLimit => q.job_limit = Some(field.as_u32()?),
                FieldNumber::Priority => q.priority = Some(field.as_int()?),
                FieldNumber::QueueState => q.state = Some(field.as_u32()?),
                FieldNumber::Default => q.default = Some(field.as_bool()?),
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(q)
    }

    fn require_name(verb: &str, name: Option<String>) -> Result<String> {
        name.ok_or_else(|| JobdError::Decode(format!("{} without a queue name", verb)))
    }
}

fn apply_state(queue: &mut Queue, state: u32) {
    queue.open = state & QUEUE_OPEN != 0;
    queue.started = state & QUEUE_STARTED != 0;
}

/// QUEUE_ADD
#[derive(Debug)]
pub struct AddQueue {
    queue: Queue,
    default: bool,
}

impl Command for AddQueue {
    const VERB: &'static str = verbs::QUEUE_ADD;
    const PERMISSION: Permissions = Permissions::WRITE.union(Permissions::QUEUE);
    const REPLAY: bool = true;
    const ORIGIN: Origin = Origin::Client;

    fn decode(request: &Request) -> Result<Self> {
        let fields = QueueFields::decode(Self::VERB, request)?;
        let mut queue = Queue::new(QueueFields::require_name(Self::VERB, fields.name)?);
        queue.description = fields.description;
        queue.node = fields.node;
        queue.job_limit = fields.job_limit.unwrap_or(0);
        queue.priority = fields.priority.unwrap_or(0);
        if let Some(state) = fields.state {
            apply_state(&mut queue, state);
        }
        Ok(AddQueue {
            queue,
            default: fields.default.unwrap_or(false),
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let state = &mut *ctx.state;
        let mut queue = self.queue;
        queue.agent = queue
            .node
            .as_deref()
            .and_then(|host| state.agents.find_host(host));

        let name = queue.name.clone();
        state.scheduler.queues.insert(queue)?;
        if self.default {
            state.scheduler.queues.set_default(&name)?;
        }
        tracing::info!(queue = %name, "Queue added");
        Ok(Reply::ok())
    }
}

/// QUEUE_GET: queues whose name matches an optional glob.
#[derive(Debug)]
pub struct GetQueue {
    pattern: Option<String>,
}

impl Command for GetQueue {
    const VERB: &'static str = verbs::QUEUE_GET;
    const PERMISSION: Permissions = Permissions::READ;
    const REPLAY: bool = false;
    const ORIGIN: Origin = Origin::Client;

    fn decode(request: &Request) -> Result<Self> {
        let fields = QueueFields::decode(Self::VERB, request)?;
        Ok(GetQueue {
            pattern: fields.name,
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let pattern = self.pattern.as_deref().map(compile).transpose()?;
        let queues = &ctx.state.scheduler.queues;
        let default = queues.default_name();

        let items = queues
            .iter()
            .filter(|q| pattern.as_ref().map_or(true, |p| p.matches(&q.name)))
            .map(|q| {
                let mut state = 0;
                if q.open {
                    state |= QUEUE_OPEN;
                }
                if q.started {
                    state |= QUEUE_STARTED;
                }

                let mut item = Item::new()
                    .with(Field::string(FieldNumber::QueueName, &q.name))
                    .with(Field::int(FieldNumber::JobLimit, i64::from(q.job_limit)))
                    .with(Field::int(FieldNumber::Priority, q.priority))
                    .with(Field::int(FieldNumber::QueueState, i64::from(state)))
                    .with(Field::boolean(FieldNumber::Default, default == Some(q.name.as_str())))
                    .with(Field::boolean(FieldNumber::Connected, q.agent.is_some()));
                if let Some(desc) = &q.description {
                    item.push(Field::string(FieldNumber::Description, desc));
                }
                if let Some(node) = &q.node {
                    item.push(Field::string(FieldNumber::Node, node));
                }
                item
            })
            .collect();

        Ok(Reply::respond(Response::array(items)))
    }
}

/// QUEUE_MOD
#[derive(Debug)]
pub struct ModifyQueue {
    name: String,
    fields: QueueFields,
}

impl Command for ModifyQueue {
    const VERB: &'static str = verbs::QUEUE_MOD;
    const PERMISSION: Permissions = Permissions::WRITE.union(Permissions::QUEUE);
    const REPLAY: bool = true;
    const ORIGIN: Origin = Origin::Client;

    fn decode(request: &Request) -> Result<Self> {
        let mut fields = QueueFields::decode(Self::VERB, request)?;
        let name = QueueFields::require_name(Self::VERB, fields.name.take())?;
        Ok(ModifyQueue { name, fields })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let state = &mut *ctx.state;
        let fields = self.fields;
        let agent = fields
            .node
            .as_deref()
            .and_then(|host| state.agents.find_host(host));

        let queue = state
            .scheduler
            .queues
            .get_mut(&self.name)
            .ok_or_else(|| JobdError::QueueNotFound(self.name.clone()))?;

        if let Some(description) = fields.description {
            queue.description = Some(description);
        }
        if let Some(node) = fields.node {
            queue.node = Some(node);
            queue.agent = agent;
        }
        if let Some(limit) = fields.job_limit {
            queue.job_limit = limit;
        }
        if let Some(priority) = fields.priority {
            queue.priority = priority;
        }
        if let Some(bits) = fields.state {
            apply_state(queue, bits);
        }
        queue.revision += 1;
        let revision = queue.revision;

        match fields.default {
            Some(true) => state.scheduler.queues.set_default(&self.name)?,
            Some(false) => state.scheduler.queues.clear_default(&self.name),
            None => {}
        }

        tracing::info!(queue = %self.name, revision, "Queue modified");
        Ok(Reply::ok())
    }
}

/// QUEUE_DEL: only queues no live job refers to.
#[derive(Debug)]
pub struct DeleteQueue {
    name: String,
}

impl Command for DeleteQueue {
    const VERB: &'static str = verbs::QUEUE_DEL;
    const PERMISSION: Permissions = Permissions::WRITE.union(Permissions::QUEUE);
    const REPLAY: bool = true;
    const ORIGIN: Origin = Origin::Client;

    fn decode(request: &Request) -> Result<Self> {
        let fields = QueueFields::decode(Self::VERB, request)?;
        Ok(DeleteQueue {
            name: QueueFields::require_name(Self::VERB, fields.name)?,
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let scheduler = &mut ctx.state.scheduler;
        if scheduler.queues.get(&self.name).is_none() {
            return Err(JobdError::QueueNotFound(self.name));
        }
        if scheduler.jobs.iter_live().any(|j| j.queue == self.name) {
            return Err(JobdError::invalid(format!(
                "Queue '{}' still has jobs",
                self.name
            )));
        }

        scheduler.queues.remove(&self.name);
        tracing::info!(queue = %self.name, "Queue deleted");
        Ok(Reply::ok())
    }
}
