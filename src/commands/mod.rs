//! Verb handlers and the registry that dispatches to them.
//!
//! Each verb is a [`Command`]: a typed request decoded from the wire fields,
//! executed against the server [`State`] through a [`Context`] that knows who
//! is asking. The request value is owned by the dispatch call and dropped on
//! its single exit path.

pub mod agent;
pub mod job;
pub mod queue;
mod registry;
pub mod resource;
pub mod stats;
pub mod tag;

use bytes::Bytes;

pub use registry::{CommandRegistry, CommandSpec};

use crate::agent::{AgentId, AgentRelay};
use crate::auth::{Permissions, UserDirectory};
use crate::error::{JobdError, Result};
use crate::protocol::{Request, Response};
use crate::scheduler::{JobId, Scheduler, Submitter};

/// Everything commands read and mutate. Owned by a single task.
pub struct State {
    pub scheduler: Scheduler,
    pub agents: AgentRelay,
    pub users: Box<dyn UserDirectory>,
    pub agent_secret: Option<String>,
    /// Server clock for the command being run, in unix seconds. Pinned to
    /// the record's timestamp during replay.
    pub now: i64,
}

impl State {
    pub fn new(scheduler: Scheduler, users: Box<dyn UserDirectory>) -> Self {
        Self {
            scheduler,
            agents: AgentRelay::new(),
            users,
            agent_secret: None,
            now: 0,
        }
    }

    pub fn with_agent_secret(mut self, secret: Option<String>) -> Self {
        self.agent_secret = secret;
        self
    }
}

/// The connection a command arrived on.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Caller {
    /// A local client (or one tunneled through an agent), by uid.
    Client { uid: u32 },
    Agent(AgentId),
    /// The server itself, for transitions it decides on its own.
    Internal,
}

/// Which kind of connection may issue a verb.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Origin {
    Client,
    Agent,
    Internal,
}

impl Caller {
    pub fn origin(&self) -> Origin {
        match self {
            Caller::Client { .. } => Origin::Client,
            Caller::Agent(_) => Origin::Agent,
            Caller::Internal => Origin::Internal,
        }
    }

    /// Uid recorded in the journal for this caller.
    pub fn uid(&self) -> u32 {
        match self {
            Caller::Client { uid } => *uid,
            Caller::Agent(_) | Caller::Internal => 0,
        }
    }
}

pub struct Context<'a> {
    pub state: &'a mut State,
    /// `None` while replaying the journal.
    pub caller: Option<Caller>,
    pub uid: u32,
    pub permissions: Permissions,
}

impl Context<'_> {
    pub fn is_replay(&self) -> bool {
        self.caller.is_none()
    }

    pub fn submitter(&self) -> Submitter {
        if self.is_replay() {
            Submitter::replay(self.uid)
        } else {
            Submitter::client(self.uid, self.permissions)
        }
    }

    /// The agent connection this command came from.
    pub fn agent(&self) -> Result<AgentId> {
        match self.caller {
            Some(Caller::Agent(id)) => Ok(id),
            _ => Err(JobdError::invalid("Command requires an agent connection")),
        }
    }
}

/// A client request tunneled through an agent, to be dispatched as that
/// client with the response routed back through the agent.
#[derive(Debug, Clone)]
pub struct Tunnel {
    pub agent: AgentId,
    pub pid: u32,
    pub uid: u32,
    pub payload: Bytes,
}

/// Result of a successful command.
#[derive(Debug, Default)]
pub struct Reply {
    pub response: Option<Response>,
    /// Job the command touched, recorded in the journal.
    pub job: Option<JobId>,
    pub revision: u64,
    pub tunnel: Option<Tunnel>,
    /// Requests dispatched after this one, from the same caller.
    pub follow_up: Vec<Request>,
}

impl Reply {
    /// No response is sent back.
    pub fn none() -> Self {
        Self::default()
    }

    pub fn respond(response: Response) -> Self {
        Self {
            response: Some(response),
            ..Default::default()
        }
    }

    /// The bare success reply.
    pub fn ok() -> Self {
        Self::respond(Response::simple("0"))
    }

    pub fn for_job(mut self, id: JobId, revision: u64) -> Self {
        self.job = Some(id);
        self.revision = revision;
        self
    }
}

/// A typed verb handler.
pub trait Command: Sized {
    const VERB: &'static str;
    const PERMISSION: Permissions;
    /// Journal on success and re-apply at startup.
    const REPLAY: bool;
    const ORIGIN: Origin;
    /// Accepted on an agent connection that has not logged in yet.
    const BEFORE_LOGIN: bool = false;

    fn decode(request: &Request) -> Result<Self>;

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply>;
}

/// Job id from the item's JOBID field, falling back to the envelope.
pub(crate) fn job_id_from(request: &Request, field: Option<u64>) -> JobId {
    JobId(field.unwrap_or(request.jobid))
}
