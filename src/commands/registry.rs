use std::collections::HashMap;
use std::time::Instant;

use crate::auth::{PermissionCache, Permissions};
use crate::commands::{agent, job, queue, resource, stats, tag};
use crate::commands::{Caller, Command, Context, Origin, Reply, State, Tunnel};
use crate::error::{JobdError, Result};
use crate::journal::{JournalRecord, JournalStore};
use crate::protocol::{verbs, Envelope, Request, Response};

enum Outcome {
    Undecodable(JobdError),
    Executed(Result<Reply>),
}

type Runner = fn(&Request, &mut Context<'_>) -> Outcome;

fn run<C: Command>(request: &Request, ctx: &mut Context<'_>) -> Outcome {
    match C::decode(request) {
        Ok(command) => Outcome::Executed(command.execute(ctx)),
        Err(e) => Outcome::Undecodable(e),
    }
}

/// Static description of one verb.
#[derive(Clone, Copy)]
pub struct CommandSpec {
    pub verb: &'static str,
    pub permission: Permissions,
    pub replay: bool,
    pub origin: Origin,
    pub before_login: bool,
    run: Runner,
}

impl CommandSpec {
    fn of<C: Command>() -> Self {
        Self {
            verb: C::VERB,
            permission: C::PERMISSION,
            replay: C::REPLAY,
            origin: C::ORIGIN,
            before_login: C::BEFORE_LOGIN,
            run: run::<C>,
        }
    }
}

impl std::fmt::Debug for CommandSpec {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("CommandSpec")
            .field("verb", &self.verb)
            .field("permission", &self.permission)
            .field("replay", &self.replay)
            .field("origin", &self.origin)
            .field("before_login", &self.before_login)
            .finish()
    }
}

/// Verb table plus the dispatch pipeline every command goes through.
#[derive(Debug)]
pub struct CommandRegistry {
    commands: HashMap<&'static str, CommandSpec>,
    readonly: bool,
}

impl CommandRegistry {
    pub fn new(readonly: bool) -> Self {
        let specs = [
            CommandSpec::of::<job::AddJob>(),
            CommandSpec::of::<job::GetJob>(),
            CommandSpec::of::<job::ModifyJob>(),
            CommandSpec::of::<job::DeleteJob>(),
            CommandSpec::of::<job::SignalJob>(),
            CommandSpec::of::<job::ReleaseJob>(),
            CommandSpec::of::<queue::AddQueue>(),
            CommandSpec::of::<queue::GetQueue>(),
            CommandSpec::of::<queue::ModifyQueue>(),
            CommandSpec::of::<queue::DeleteQueue>(),
            CommandSpec::of::<resource::AddResource>(),
            CommandSpec::of::<resource::GetResource>(),
            CommandSpec::of::<resource::ModifyResource>(),
            CommandSpec::of::<resource::DeleteResource>(),
            CommandSpec::of::<tag::SetTag>(),
            CommandSpec::of::<tag::DeleteTag>(),
            CommandSpec::of::<stats::GetStats>(),
            CommandSpec::of::<agent::GetAgent>(),
            CommandSpec::of::<agent::JobStarted>(),
            CommandSpec::of::<agent::JobCompleted>(),
            CommandSpec::of::<agent::AgentLogin>(),
            CommandSpec::of::<agent::Auth>(),
            CommandSpec::of::<agent::Recon>(),
            CommandSpec::of::<agent::ProxyConnect>(),
            CommandSpec::of::<agent::ProxyData>(),
            CommandSpec::of::<agent::ProxyClose>(),
        ];

        Self {
            commands: specs.into_iter().map(|spec| (spec.verb, spec)).collect(),
            readonly,
        }
    }

    pub fn get(&self, verb: &str) -> Option<&CommandSpec> {
        self.commands.get(verb)
    }

    pub fn is_readonly(&self) -> bool {
        self.readonly
    }

    /// Run one live command. `None` means no response is sent: the verb was
    /// unknown or the request could not be decoded.
    pub fn dispatch(
        &self,
        state: &mut State,
        auth: &mut PermissionCache,
        journal: &mut dyn JournalStore,
        caller: Caller,
        envelope: &Envelope,
    ) -> Option<Response> {
        let started = Instant::now();
        let request = &envelope.request;
        let verb = envelope.verb();

        if request.version == 0 {
            return simple_command(verb);
        }

        let Some(spec) = self.commands.get(verb) else {
            tracing::warn!(verb, ?caller, "Unknown command, ignoring");
            return None;
        };

        if spec.origin != caller.origin() {
            tracing::warn!(verb, ?caller, "Command not allowed on this connection");
            return Some(Response::error(&JobdError::PermissionDenied));
        }

        let permissions = match caller {
            Caller::Client { uid } => {
                match auth.authorize(uid, spec.permission, state.users.as_ref()) {
                    Ok(held) => held,
                    Err(e) => return Some(Response::error(&e)),
                }
            }
            Caller::Agent(agent) => {
                let logged_in = state.agents.get(agent).is_some_and(|a| a.logged_in);
                if !logged_in && !spec.before_login {
                    tracing::warn!(verb, %agent, "Agent command before login refused");
                    return Some(Response::error(&JobdError::PermissionDenied));
                }
                Permissions::NONE
            }
            Caller::Internal => Permissions::ALL,
        };

        if spec.replay && self.readonly {
            return Some(Response::error(&JobdError::ReadOnly));
        }

        let uid = caller.uid();
        let mut ctx = Context {
            state: &mut *state,
            caller: Some(caller),
            uid,
            permissions,
        };

        let reply = match (spec.run)(request, &mut ctx) {
            Outcome::Undecodable(e) => {
                tracing::warn!(verb, uid, error = %e, "Failed to decode request");
                return None;
            }
            Outcome::Executed(Err(e)) => {
                tracing::debug!(verb, uid, error = %e, "Command failed");
                Some(Response::error(&e))
            }
            Outcome::Executed(Ok(reply)) => {
                if spec.replay {
                    let record = JournalRecord {
                        uid,
                        command: verb.to_string(),
                        request: envelope.raw.clone(),
                        jobid: reply.job.map(|id| id.0).unwrap_or(0),
                        revision: reply.revision,
                        timestamp: state.now,
                    };
                    if let Err(e) = journal.append(&record) {
                        tracing::error!(verb, error = %e, "Failed to append journal record");
                    }
                }

                if let Some(tunnel) = reply.tunnel {
                    self.dispatch_tunneled(state, auth, journal, tunnel);
                }

                for request in reply.follow_up {
                    let follow_up = Envelope::from_request(request);
                    if let Some(response) = self.dispatch(state, auth, journal, caller, &follow_up) {
                        if let Some(category) = response.error_category() {
                            tracing::warn!(verb = follow_up.verb(), category, "Follow-up command failed");
                        }
                    }
                }

                let revision = reply.revision;
                reply.response.map(|r| r.with_revision(revision))
            }
        };

        tracing::debug!(
            verb,
            uid,
            elapsed_us = started.elapsed().as_micros() as u64,
            "Command processed"
        );
        reply
    }

    fn dispatch_tunneled(
        &self,
        state: &mut State,
        auth: &mut PermissionCache,
        journal: &mut dyn JournalStore,
        tunnel: Tunnel,
    ) {
        let envelope = match Envelope::decode(tunnel.payload) {
            Ok(envelope) => envelope,
            Err(e) => {
                tracing::warn!(agent = %tunnel.agent, pid = tunnel.pid, error = %e, "Bad proxied request");
                return;
            }
        };

        let caller = Caller::Client { uid: tunnel.uid };
        if let Some(response) = self.dispatch(state, auth, journal, caller, &envelope) {
            state
                .agents
                .forward_response(tunnel.agent, tunnel.pid, &response);
        }
    }

    /// Re-apply one journal record with no live caller. Any failure means the
    /// journal and the handlers disagree, and is fatal.
    pub fn replay(&self, state: &mut State, index: usize, record: &JournalRecord) -> Result<()> {
        let fail = |reason: String| JobdError::Replay {
            index,
            verb: record.command.clone(),
            reason,
        };

        let envelope = Envelope::decode(record.request.clone()).map_err(|e| fail(e.to_string()))?;
        if envelope.verb() != record.command {
            return Err(fail(format!("request carries verb {}", envelope.verb())));
        }

        let spec = self
            .commands
            .get(record.command.as_str())
            .ok_or_else(|| fail("unknown verb".into()))?;
        if !spec.replay {
            return Err(fail("verb is not replayable".into()));
        }

        state.now = record.timestamp;
        let mut ctx = Context {
            state,
            caller: None,
            uid: record.uid,
            permissions: Permissions::ALL,
        };

        match (spec.run)(&envelope.request, &mut ctx) {
            Outcome::Undecodable(e) => Err(fail(format!("decode: {}", e))),
            Outcome::Executed(Err(e)) => Err(fail(e.to_string())),
            Outcome::Executed(Ok(reply)) => {
                if reply.revision != record.revision {
                    tracing::warn!(
                        index,
                        verb = %record.command,
                        expected = record.revision,
                        actual = reply.revision,
                        "Replayed revision differs from journal"
                    );
                }
                Ok(())
            }
        }
    }
}

fn simple_command(verb: &str) -> Option<Response> {
    match verb {
        verbs::PING => Some(Response::simple("PONG")),
        _ => {
            tracing::warn!(verb, "Unknown simple command, ignoring");
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::auth::StaticUsers;
    use crate::config::{PermissionConfig, PriorityRange};
    use crate::journal::MemoryJournal;
    use crate::protocol::{Field, FieldNumber, Item};
    use crate::scheduler::{Queue, Scheduler};

    const WRITERS: u32 = 200;
    const READERS: u32 = 100;

    struct Harness {
        registry: CommandRegistry,
        state: State,
        auth: PermissionCache,
        journal: MemoryJournal,
    }

    impl Harness {
        fn new(readonly: bool) -> Self {
            let mut scheduler = Scheduler::new(100, PriorityRange::default(), Some("batch".into()));
            scheduler.queues.insert(Queue::new("batch")).unwrap();
            let users = StaticUsers::new()
                .with_user(1000, "alice", vec![READERS, WRITERS])
                .with_user(1001, "bob", vec![READERS]);
            let auth = PermissionCache::new(PermissionConfig {
                read_groups: vec![READERS],
                write_groups: vec![WRITERS],
                ..Default::default()
            });
            Self {
                registry: CommandRegistry::new(readonly),
                state: State::new(scheduler, Box::new(users)),
                auth,
                journal: MemoryJournal::new(),
            }
        }

        fn send(&mut self, uid: u32, request: Request) -> Option<Response> {
            let envelope = Envelope::from_request(request);
            self.registry.dispatch(
                &mut self.state,
                &mut self.auth,
                &mut self.journal,
                Caller::Client { uid },
                &envelope,
            )
        }
    }

    fn add_job(name: &str) -> Request {
        Request::with_item(
            verbs::JOB_ADD,
            Item::new().with(Field::string(FieldNumber::JobName, name)),
        )
    }

    #[test]
    fn every_client_and_agent_verb_is_registered() {
        let registry = CommandRegistry::new(false);
        for verb in [
            verbs::JOB_ADD,
            verbs::JOB_GET,
            verbs::JOB_MOD,
            verbs::JOB_DEL,
            verbs::JOB_SIG,
            verbs::QUEUE_ADD,
            verbs::QUEUE_GET,
            verbs::QUEUE_MOD,
            verbs::QUEUE_DEL,
            verbs::RESOURCE_ADD,
            verbs::RESOURCE_GET,
            verbs::RESOURCE_MOD,
            verbs::RESOURCE_DEL,
            verbs::TAG_SET,
            verbs::TAG_DEL,
            verbs::STATS,
            verbs::AGENT_GET,
            verbs::JOB_STARTED,
            verbs::JOB_COMPLETED,
            verbs::AGENT_LOGIN,
            verbs::RECON,
            verbs::AUTH,
            verbs::PROXY_CONN,
            verbs::PROXY_DATA,
            verbs::PROXY_CLOSE,
        ] {
            assert!(registry.get(verb).is_some(), "{} missing", verb);
        }
        assert!(!registry.get(verbs::JOB_SIG).unwrap().replay);
        assert!(registry.get(verbs::JOB_STARTED).unwrap().replay);
        let release = registry.get(verbs::JOB_RELEASE).unwrap();
        assert!(release.replay);
        assert_eq!(release.origin, Origin::Internal);
        assert!(registry.get(verbs::AUTH).unwrap().before_login);
        assert!(!registry.get(verbs::PROXY_CONN).unwrap().before_login);
        assert_eq!(
            registry.get(verbs::QUEUE_ADD).unwrap().permission,
            Permissions::WRITE | Permissions::QUEUE
        );
    }

    #[test]
    fn unknown_verb_gets_no_response() {
        let mut h = Harness::new(false);
        assert!(h.send(1000, Request::new("BOGUS")).is_none());
        assert!(h.journal.records().is_empty());
    }

    #[test]
    fn ping_is_answered_as_simple_command() {
        let mut h = Harness::new(false);
        let mut ping = Request::new(verbs::PING);
        ping.version = 0;
        assert_eq!(h.send(1001, ping).unwrap().as_simple(), Some("PONG"));
    }

    #[test]
    fn unauthorized_caller_is_refused_without_running_handler() {
        let mut h = Harness::new(false);
        let response = h.send(1001, add_job("x")).unwrap();
        assert_eq!(response.error_category(), Some("NOPERM"));
        assert!(h.state.scheduler.jobs.is_empty());
        assert!(h.journal.records().is_empty());
    }

    #[test]
    fn readonly_rejects_mutations_but_allows_reads() {
        let mut h = Harness::new(true);
        let response = h.send(1000, add_job("x")).unwrap();
        assert_eq!(response.error_category(), Some("READONLY"));
        assert!(h.state.scheduler.jobs.is_empty());

        let response = h.send(1000, Request::new(verbs::JOB_GET)).unwrap();
        assert!(!response.is_error());
    }

    #[test]
    fn success_of_replay_verb_is_journaled() {
        let mut h = Harness::new(false);
        h.state.now = 1234;
        let request = add_job("build");
        let raw = Envelope::from_request(request.clone()).raw;
        let response = h.send(1000, request).unwrap();
        assert!(!response.is_error());

        let records = h.journal.records();
        assert_eq!(records.len(), 1);
        assert_eq!(records[0].command, verbs::JOB_ADD);
        assert_eq!(records[0].uid, 1000);
        assert_eq!(records[0].jobid, 1);
        assert_eq!(records[0].revision, 1);
        assert_eq!(records[0].timestamp, 1234);
        assert_eq!(records[0].request, raw);
    }

    #[test]
    fn failures_and_reads_are_not_journaled() {
        let mut h = Harness::new(false);
        let mut bad = add_job("x");
        bad.items[0].push(Field::int(FieldNumber::Priority, 99_999));
        assert_eq!(h.send(1000, bad).unwrap().error_category(), Some("INVARG"));
        h.send(1000, Request::new(verbs::JOB_GET)).unwrap();
        h.send(1000, Request::new(verbs::STATS)).unwrap();
        assert!(h.journal.records().is_empty());
    }

    #[test]
    fn undecodable_request_gets_no_response() {
        let mut h = Harness::new(false);
        let request = Request::with_item(
            verbs::JOB_ADD,
            Item::new().with(Field::int(FieldNumber::JobName, 5)),
        );
        assert!(h.send(1000, request).is_none());
        assert!(h.state.scheduler.jobs.is_empty());
    }

    #[test]
    fn agent_verbs_refused_from_clients() {
        let mut h = Harness::new(false);
        let request = Request::with_item(
            verbs::JOB_STARTED,
            Item::new().with(Field::int(FieldNumber::JobId, 1)),
        );
        assert_eq!(h.send(0, request).unwrap().error_category(), Some("NOPERM"));
    }

    #[test]
    fn replay_rebuilds_state_and_fails_loudly() {
        let mut h = Harness::new(false);
        h.send(1000, add_job("a")).unwrap();
        h.send(1000, add_job("b")).unwrap();

        let mut fresh = Harness::new(false);
        for (i, record) in h.journal.records().iter().enumerate() {
            fresh.registry.replay(&mut fresh.state, i, record).unwrap();
        }
        assert_eq!(fresh.state.scheduler.jobs.len(), 2);
        assert!(fresh.journal.records().is_empty());

        // Applying the same add twice cannot fail, but deleting twice must.
        let del = Envelope::from_request(Request::with_item(
            verbs::JOB_DEL,
            Item::new().with(Field::int(FieldNumber::JobId, 1)),
        ));
        let record = JournalRecord {
            uid: 1000,
            command: verbs::JOB_DEL.into(),
            request: del.raw.clone(),
            jobid: 1,
            revision: 2,
            timestamp: 0,
        };
        fresh.registry.replay(&mut fresh.state, 2, &record).unwrap();
        let err = fresh.registry.replay(&mut fresh.state, 3, &record).unwrap_err();
        assert!(matches!(err, JobdError::Replay { index: 3, .. }));
    }
}
