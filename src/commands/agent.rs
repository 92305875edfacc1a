//! Agent listing, agent lifecycle events, login and proxy sessions.

use bytes::Bytes;
use uuid::Uuid;

use crate::agent::AgentId;
use crate::auth::Permissions;
use crate::commands::{job_id_from, Command, Context, Origin, Reply, State, Tunnel};
use crate::error::{JobdError, Result};
use crate::protocol::{first_item, verbs, visit_fields, Field, FieldNumber, Item, Request, Response};
use crate::scheduler::query::{compile, serialize_job};
use crate::scheduler::{Job, JobId};

/// The START_JOB directive for a job: every job field plus what the agent
/// needs to launch it.
pub fn start_job_request(job: &Job) -> Request {
    let mut item = serialize_job(job, 0);
    if !job.envs.is_empty() {
        item.push(Field::string_array(FieldNumber::Envs, job.envs.clone()));
    }
    if let Some(wrapper) = &job.wrapper {
        item.push(Field::string(FieldNumber::Wrapper, wrapper));
    }
    let mut request = Request::with_item(verbs::START_JOB, item);
    request.jobid = job.id.0;
    request
}

/// AGENT_GET: agents whose host matches an optional glob.
#[derive(Debug)]
pub struct GetAgent {
    pattern: Option<String>,
}

impl Command for GetAgent {
    const VERB: &'static str = verbs::AGENT_GET;
    const PERMISSION: Permissions = Permissions::READ;
    const REPLAY: bool = false;
    const ORIGIN: Origin = Origin::Client;

    fn decode(request: &Request) -> Result<Self> {
        let mut pattern = None;
        visit_fields(Self::VERB, first_item(request), |number, field| {
            if number != FieldNumber::Node {
                return Ok(false);
            }
            pattern = Some(field.as_string()?);
            Ok(true)
        })?;
        Ok(GetAgent { pattern })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let pattern = self.pattern.as_deref().map(compile).transpose()?;
        let items = ctx
            .state
            .agents
            .iter()
            .filter_map(|agent| {
                let host = agent.host.as_deref().unwrap_or(&agent.peer);
                if pattern.as_ref().is_some_and(|p| !p.matches(host)) {
                    return None;
                }
                Some(
                    Item::new()
                        .with(Field::string(FieldNumber::Node, host))
                        .with(Field::boolean(
                            FieldNumber::Connected,
                            agent.logged_in && agent.is_connected(),
                        )),
                )
            })
            .collect();
        Ok(Reply::respond(Response::array(items)))
    }
}

/// JOB_STARTED: an agent launched a job.
#[derive(Debug)]
pub struct JobStarted {
    id: JobId,
    pid: u32,
}

impl Command for JobStarted {
    const VERB: &'static str = verbs::JOB_STARTED;
    const PERMISSION: Permissions = Permissions::NONE;
    const REPLAY: bool = true;
    const ORIGIN: Origin = Origin::Agent;

    fn decode(request: &Request) -> Result<Self> {
        let mut id = None;
        let mut pid = None;
        visit_fields(Self::VERB, first_item(request), |number, field| {
            match number {
                FieldNumber::JobId => id = Some(field.as_u64()?),
                FieldNumber::Pid => pid = Some(field.as_u32()?),
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(JobStarted {
            id: job_id_from(request, id),
            pid: pid.ok_or_else(|| JobdError::Decode("JOB_STARTED without a pid".into()))?,
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        if !ctx.is_replay() {
            check_serves(ctx.state, ctx.agent()?, self.id)?;
        }
        let now = ctx.state.now;
        let revision = ctx.state.scheduler.job_started(self.id, self.pid, now)?;
        Ok(Reply::none().for_job(self.id, revision))
    }
}

/// JOB_COMPLETED: a job's process ended.
#[derive(Debug)]
pub struct JobCompleted {
    id: JobId,
    exit_code: i32,
    signal: i32,
}

impl Command for JobCompleted {
    const VERB: &'static str = verbs::JOB_COMPLETED;
    const PERMISSION: Permissions = Permissions::NONE;
    const REPLAY: bool = true;
    const ORIGIN: Origin = Origin::Agent;

    fn decode(request: &Request) -> Result<Self> {
        let mut id = None;
        let mut exit_code = 0;
        let mut signal = 0;
        visit_fields(Self::VERB, first_item(request), |number, field| {
            match number {
                FieldNumber::JobId => id = Some(field.as_u64()?),
                FieldNumber::ExitCode => exit_code = field.as_i32()?,
                FieldNumber::Signal => signal = field.as_i32()?,
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(JobCompleted {
            id: job_id_from(request, id),
            exit_code,
            signal,
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        if !ctx.is_replay() {
            check_serves(ctx.state, ctx.agent()?, self.id)?;
        }
        let now = ctx.state.now;
        let revision = ctx
            .state
            .scheduler
            .job_completed(self.id, self.exit_code, self.signal, now)?;
        Ok(Reply::none().for_job(self.id, revision))
    }
}

/// Refuse job events from an agent that does not serve the job's queue.
fn check_serves(state: &State, agent: AgentId, id: JobId) -> Result<()> {
    let job = state
        .scheduler
        .jobs
        .get(id)
        .ok_or(JobdError::JobNotFound(id))?;
    let served = state
        .scheduler
        .queues
        .get(&job.queue)
        .is_some_and(|q| q.agent == Some(agent));
    if !served {
        tracing::warn!(agent = %agent, job_id = %id, queue = %job.queue, "Job event from an agent not serving its queue");
        return Err(JobdError::PermissionDenied);
    }
    Ok(())
}

/// JOB_STARTED for a job found running during reconciliation.
fn started_request(id: JobId, pid: u32) -> Request {
    let item = Item::new()
        .with(Field::int(FieldNumber::JobId, id.0 as i64))
        .with(Field::int(FieldNumber::Pid, i64::from(pid)));
    let mut request = Request::with_item(verbs::JOB_STARTED, item);
    request.jobid = id.0;
    request
}

fn host_field(verb: &str, request: &Request) -> Result<String> {
    let mut host = None;
    visit_fields(verb, first_item(request), |number, field| {
        if number != FieldNumber::Node {
            return Ok(false);
        }
        host = Some(field.as_string()?);
        Ok(true)
    })?;
    host.ok_or_else(|| JobdError::Decode(format!("{} without a node name", verb)))
}

/// Mark an agent logged in, hand it its queues and ask what it is running.
fn complete_login(state: &mut State, id: AgentId) -> Result<()> {
    let agent = state
        .agents
        .get_mut(id)
        .ok_or_else(|| JobdError::invalid("Unknown agent"))?;
    let host = agent
        .host
        .clone()
        .ok_or_else(|| JobdError::invalid("Agent has not identified itself"))?;
    agent.logged_in = true;
    agent.auth_nonce = None;

    let queues = state.scheduler.queues.bind_agent(&host, id);
    tracing::info!(agent = %id, host = %host, queues, "Agent logged in");

    state.agents.deliver(id, &Request::new(verbs::RECON_REQ));
    Ok(())
}

/// AGENT_LOGIN: first message on an agent connection.
#[derive(Debug)]
pub struct AgentLogin {
    host: String,
}

impl Command for AgentLogin {
    const VERB: &'static str = verbs::AGENT_LOGIN;
    const PERMISSION: Permissions = Permissions::NONE;
    const REPLAY: bool = false;
    const ORIGIN: Origin = Origin::Agent;
    const BEFORE_LOGIN: bool = true;

    fn decode(request: &Request) -> Result<Self> {
        Ok(AgentLogin {
            host: host_field(Self::VERB, request)?,
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let id = ctx.agent()?;
        let state = &mut *ctx.state;
        let challenge = state.agent_secret.is_some().then(|| Uuid::new_v4().to_string());

        let agent = state
            .agents
            .get_mut(id)
            .ok_or_else(|| JobdError::invalid("Unknown agent"))?;
        agent.host = Some(self.host);
        agent.auth_nonce = challenge.clone();

        match challenge {
            Some(nonce) => {
                let item = Item::new().with(Field::string(FieldNumber::Nonce, nonce));
                state
                    .agents
                    .deliver(id, &Request::with_item(verbs::AUTH_CHALLENGE, item));
            }
            None => complete_login(state, id)?,
        }
        Ok(Reply::none())
    }
}

/// AUTH: answer to an AUTH_CHALLENGE.
#[derive(Debug)]
pub struct Auth {
    nonce: String,
    token: String,
}

impl Command for Auth {
    const VERB: &'static str = verbs::AUTH;
    const PERMISSION: Permissions = Permissions::NONE;
    const REPLAY: bool = false;
    const ORIGIN: Origin = Origin::Agent;
    const BEFORE_LOGIN: bool = true;

    fn decode(request: &Request) -> Result<Self> {
        let mut nonce = String::new();
        let mut token = String::new();
        visit_fields(Self::VERB, first_item(request), |number, field| {
            match number {
                FieldNumber::Nonce => nonce = field.as_string()?,
                FieldNumber::AuthToken => token = field.as_string()?,
                _ => return Ok(false),
            }
            Ok(true)
        })?;
        Ok(Auth { nonce, token })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let id = ctx.agent()?;
        let state = &mut *ctx.state;
        let agent = state
            .agents
            .get(id)
            .ok_or_else(|| JobdError::invalid("Unknown agent"))?;

        let nonce_ok = agent.auth_nonce.as_deref() == Some(self.nonce.as_str());
        let token_ok = state.agent_secret.as_deref() == Some(self.token.as_str());
        if !(nonce_ok && token_ok) {
            tracing::warn!(agent = %id, "Agent failed authentication");
            return Err(JobdError::PermissionDenied);
        }

        complete_login(state, id)?;
        Ok(Reply::none())
    }
}

/// RECON: the jobs a logging-in agent currently runs, one item per job.
#[derive(Debug)]
pub struct Recon {
    running: Vec<(JobId, u32)>,
}

impl Command for Recon {
    const VERB: &'static str = verbs::RECON;
    const PERMISSION: Permissions = Permissions::NONE;
    const REPLAY: bool = false;
    const ORIGIN: Origin = Origin::Agent;

    fn decode(request: &Request) -> Result<Self> {
        let mut running = Vec::with_capacity(request.items.len());
        for item in &request.items {
            let mut id = None;
            let mut pid = 0;
            visit_fields(Self::VERB, item, |number, field| {
                match number {
                    FieldNumber::JobId => id = Some(JobId(field.as_u64()?)),
                    FieldNumber::Pid => pid = field.as_u32()?,
                    _ => return Ok(false),
                }
                Ok(true)
            })?;
            let id = id.ok_or_else(|| JobdError::Decode("RECON entry without a job id".into()))?;
            running.push((id, pid));
        }
        Ok(Recon { running })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let id = ctx.agent()?;
        let state = &mut *ctx.state;
        let result = state.scheduler.reconcile(id, &self.running);
        tracing::info!(
            agent = %id,
            running = self.running.len(),
            unrecorded = result.unrecorded.len(),
            cleared = result.cleared,
            "Agent reconciled"
        );
        state.agents.deliver(id, &Request::new(verbs::RECON_COMPLETE));

        // Starts the journal never saw go through JOB_STARTED.
        Ok(Reply {
            follow_up: result
                .unrecorded
                .into_iter()
                .map(|(job, pid)| started_request(job, pid))
                .collect(),
            ..Reply::none()
        })
    }
}

fn pid_field(verb: &str, item: &Item) -> Result<(u32, Option<u32>, Option<Vec<u8>>)> {
    let mut pid = None;
    let mut uid = None;
    let mut data = None;
    visit_fields(verb, item, |number, field| {
        match number {
            FieldNumber::Pid => pid = Some(field.as_u32()?),
            FieldNumber::Uid => uid = Some(field.as_u32()?),
            FieldNumber::ProxyData => data = Some(field.as_blob()?),
            _ => return Ok(false),
        }
        Ok(true)
    })?;
    let pid = pid.ok_or_else(|| JobdError::Decode(format!("{} without a pid", verb)))?;
    Ok((pid, uid, data))
}

/// PROXY_CONN: an agent opens a tunnel for a local client.
#[derive(Debug)]
pub struct ProxyConnect {
    pid: u32,
    uid: u32,
}

impl Command for ProxyConnect {
    const VERB: &'static str = verbs::PROXY_CONN;
    const PERMISSION: Permissions = Permissions::NONE;
    const REPLAY: bool = false;
    const ORIGIN: Origin = Origin::Agent;

    fn decode(request: &Request) -> Result<Self> {
        let (pid, uid, _) = pid_field(Self::VERB, first_item(request))?;
        let uid = uid.ok_or_else(|| JobdError::Decode("PROXY_CONN without a uid".into()))?;
        Ok(ProxyConnect { pid, uid })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let id = ctx.agent()?;
        ctx.state.agents.open_proxy(id, self.pid, self.uid);
        Ok(Reply::none())
    }
}

/// PROXY_DATA: a request from a tunneled client.
#[derive(Debug)]
pub struct ProxyData {
    pid: u32,
    payload: Bytes,
}

impl Command for ProxyData {
    const VERB: &'static str = verbs::PROXY_DATA;
    const PERMISSION: Permissions = Permissions::NONE;
    const REPLAY: bool = false;
    const ORIGIN: Origin = Origin::Agent;

    fn decode(request: &Request) -> Result<Self> {
        let (pid, _, data) = pid_field(Self::VERB, first_item(request))?;
        let payload = data.ok_or_else(|| JobdError::Decode("PROXY_DATA without data".into()))?;
        Ok(ProxyData {
            pid,
            payload: Bytes::from(payload),
        })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let agent = ctx.agent()?;
        let session = ctx.state.agents.proxy(agent, self.pid).ok_or_else(|| {
            JobdError::invalid(format!("No proxy session for pid {}", self.pid))
        })?;

        Ok(Reply {
            tunnel: Some(Tunnel {
                agent,
                pid: self.pid,
                uid: session.uid,
                payload: self.payload,
            }),
            ..Reply::none()
        })
    }
}

/// PROXY_CLOSE: the tunneled client went away.
#[derive(Debug)]
pub struct ProxyClose {
    pid: u32,
}

impl Command for ProxyClose {
    const VERB: &'static str = verbs::PROXY_CLOSE;
    const PERMISSION: Permissions = Permissions::NONE;
    const REPLAY: bool = false;
    const ORIGIN: Origin = Origin::Agent;

    fn decode(request: &Request) -> Result<Self> {
        let (pid, _, _) = pid_field(Self::VERB, first_item(request))?;
        Ok(ProxyClose { pid })
    }

    fn execute(self, ctx: &mut Context<'_>) -> Result<Reply> {
        let id = ctx.agent()?;
        if !ctx.state.agents.close_proxy(id, self.pid) {
            tracing::debug!(agent = %id, pid = self.pid, "Close for unknown proxy session");
        }
        Ok(Reply::none())
    }
}
