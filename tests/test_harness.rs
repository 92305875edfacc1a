//! Test harness for driving a server through its command pipeline.
//!
//! Provides an in-process server with a memory journal, canned users and
//! request builders, plus a helper for running a full node on scratch
//! sockets.

#![allow(dead_code)]

use std::future::Future;
use std::path::{Path, PathBuf};
use std::time::Duration;

use bytes::Bytes;
use prost::Message;
use tokio::net::TcpListener;
use tokio::sync::mpsc::UnboundedReceiver;
use tokio::task::JoinHandle;
use tokio_util::sync::CancellationToken;

use jobd::agent::AgentId;
use jobd::auth::StaticUsers;
use jobd::config::{PermissionConfig, ServerConfig};
use jobd::journal::{JournalRecord, MemoryJournal};
use jobd::node::Node;
use jobd::protocol::{verbs, Field, FieldNumber, Item, KeyValue, Request, Response};
use jobd::scheduler::{Job, JobId};
use jobd::server::Server;

pub const READERS: u32 = 100;
pub const WRITERS: u32 = 200;
pub const QUEUE_ADMINS: u32 = 300;

/// Reads, writes and manages queues.
pub const ALICE: u32 = 1000;
/// Reads only.
pub const BOB: u32 = 1001;
/// Known account with no permissions.
pub const CAROL: u32 = 1002;

pub const NOW: i64 = 1_700_000_000;

/// Host serving the default `batch` queue.
pub const NODE: &str = "node1";

pub fn fixed_clock() -> i64 {
    NOW
}

pub fn users() -> StaticUsers {
    StaticUsers::new()
        .with_user(ALICE, "alice", vec![READERS, WRITERS, QUEUE_ADMINS])
        .with_user(BOB, "bob", vec![READERS])
        .with_user(CAROL, "carol", vec![])
}

pub fn permissions() -> PermissionConfig {
    PermissionConfig {
        read_groups: vec![READERS],
        write_groups: vec![WRITERS],
        queue_groups: vec![QUEUE_ADMINS],
        ..PermissionConfig::default()
    }
}

pub fn test_config() -> ServerConfig {
    let mut config = ServerConfig::new(PathBuf::from("unused.sock"), PathBuf::from("unused.journal"))
        .with_default_queue("batch")
        .with_max_jobs(1000);
    config.permissions = permissions();
    config
}

pub fn frame(request: &Request) -> Bytes {
    Bytes::from(request.encode_to_vec())
}

/// A server on a memory journal with the clock pinned to [`NOW`].
pub struct TestServer {
    pub server: Server,
    pub journal: MemoryJournal,
}

impl TestServer {
    /// Fresh server with queue `batch` already created, served from
    /// [`NODE`].
    pub fn new() -> Self {
        let mut ts = Self::empty(MemoryJournal::new());
        ts.ok(0, queue_on("batch", NODE));
        ts
    }

    /// Server on `journal` with nothing run yet.
    pub fn empty(journal: MemoryJournal) -> Self {
        let server = Server::new(&test_config(), Box::new(users()), Box::new(journal.clone()))
            .with_clock(fixed_clock);
        Self { server, journal }
    }

    /// Fresh server that replays `records` before returning.
    pub fn replayed(records: Vec<JournalRecord>) -> Self {
        let mut ts = Self::empty(MemoryJournal::with_records(records));
        ts.server.recover().expect("journal replays");
        ts
    }

    pub fn send(&mut self, uid: u32, request: Request) -> Option<Response> {
        self.server.handle_client(uid, frame(&request))
    }

    /// Send and require a non-error response.
    pub fn ok(&mut self, uid: u32, request: Request) -> Response {
        let verb = request.command.clone();
        let response = self.send(uid, request).expect("a response");
        assert!(
            !response.is_error(),
            "{} failed: {:?}",
            verb,
            response.error_category()
        );
        response
    }

    /// Send and return the error category.
    pub fn err(&mut self, uid: u32, request: Request) -> String {
        let verb = request.command.clone();
        let response = self.send(uid, request).expect("a response");
        response
            .error_category()
            .unwrap_or_else(|| panic!("{} unexpectedly succeeded", verb))
            .to_string()
    }

    pub fn add_job(&mut self, uid: u32, item: Item) -> JobId {
        let response = self.ok(uid, Request::with_item(verbs::JOB_ADD, item));
        let id = response
            .as_map()
            .and_then(|m| m.get(FieldNumber::JobId))
            .expect("JOBID in response");
        JobId(id.as_u64().unwrap())
    }

    /// Connect an agent and log it in for `host`. The receiver carries
    /// everything the server sends it.
    pub fn login_agent(&mut self, host: &str) -> (AgentId, UnboundedReceiver<Bytes>) {
        let (tx, rx) = tokio::sync::mpsc::unbounded_channel();
        let agent = self.server.agent_connected(format!("{}:7001", host), tx);
        let login = Request::with_item(
            verbs::AGENT_LOGIN,
            Item::new().with(Field::string(FieldNumber::Node, host)),
        );
        assert!(self.server.handle_agent_frame(agent, frame(&login)).is_none());
        (agent, rx)
    }

    /// Send an agent event and require that it drew no error.
    pub fn agent_ok(&mut self, agent: AgentId, request: Request) {
        let verb = request.command.clone();
        if let Some(response) = self.server.handle_agent_frame(agent, frame(&request)) {
            panic!("{} failed: {:?}", verb, response.error_category());
        }
    }

    pub fn job(&self, id: JobId) -> &Job {
        self.server.scheduler().jobs.live(id).expect("live job")
    }

    /// Every job, tombstones included, in id order.
    pub fn snapshot(&self) -> Vec<Job> {
        self.server.scheduler().jobs.iter_all().cloned().collect()
    }

    pub fn records(&self) -> Vec<JournalRecord> {
        self.journal.records()
    }
}

pub fn job_item(name: &str) -> Item {
    Item::new().with(Field::string(FieldNumber::JobName, name))
}

pub fn job_id_item(id: JobId) -> Item {
    Item::new().with(Field::int(FieldNumber::JobId, id.0 as i64))
}

pub fn queue_add(name: &str) -> Request {
    Request::with_item(
        verbs::QUEUE_ADD,
        Item::new().with(Field::string(FieldNumber::QueueName, name)),
    )
}

pub fn queue_on(name: &str, host: &str) -> Request {
    Request::with_item(
        verbs::QUEUE_ADD,
        Item::new()
            .with(Field::string(FieldNumber::QueueName, name))
            .with(Field::string(FieldNumber::Node, host)),
    )
}

pub fn resource_add(name: &str, count: i64) -> Request {
    Request::with_item(
        verbs::RESOURCE_ADD,
        Item::new()
            .with(Field::string(FieldNumber::ResName, name))
            .with(Field::int(FieldNumber::ResCount, count)),
    )
}

pub fn job_get(item: Item) -> Request {
    Request::with_item(verbs::JOB_GET, item)
}

pub fn job_mod(id: JobId, fields: Vec<Field>) -> Request {
    let mut item = job_id_item(id);
    for field in fields {
        item.push(field);
    }
    Request::with_item(verbs::JOB_MOD, item)
}

pub fn job_del(id: JobId) -> Request {
    Request::with_item(verbs::JOB_DEL, job_id_item(id))
}

pub fn tag_set(id: JobId, key: &str, value: &str) -> Request {
    Request::with_item(
        verbs::TAG_SET,
        job_id_item(id)
            .with(Field::string(FieldNumber::TagKey, key))
            .with(Field::string(FieldNumber::TagValue, value)),
    )
}

pub fn tag_del(id: JobId, key: &str) -> Request {
    Request::with_item(
        verbs::TAG_DEL,
        job_id_item(id).with(Field::string(FieldNumber::TagKey, key)),
    )
}

pub fn tags(pairs: &[(&str, &str)]) -> Field {
    Field::string_map(
        FieldNumber::Tags,
        pairs.iter().map(|(k, v)| KeyValue::new(*k, *v)).collect(),
    )
}

pub fn ids(response: &Response) -> Vec<u64> {
    response
        .as_array()
        .expect("array response")
        .iter()
        .map(|item| item.get(FieldNumber::JobId).unwrap().as_u64().unwrap())
        .collect()
}

/// Uid the test process runs as, read from a file it just created.
pub fn current_uid(dir: &Path) -> u32 {
    use std::os::unix::fs::MetadataExt;
    let marker = dir.join("uid-marker");
    std::fs::write(&marker, b"").unwrap();
    std::fs::metadata(&marker).unwrap().uid()
}

/// A node serving on a scratch Unix socket and an ephemeral TCP port.
pub struct TestNode {
    pub socket: PathBuf,
    pub agent_addr: std::net::SocketAddr,
    pub shutdown: CancellationToken,
    handle: JoinHandle<jobd::error::Result<()>>,
}

impl TestNode {
    pub async fn start(dir: &Path, server: Server, schedule_interval_ms: u64) -> Self {
        let socket = dir.join("jobd.sock");
        let mut config = test_config();
        config.client_socket = socket.clone();
        config.schedule_interval_ms = schedule_interval_ms;

        let clients = jobd::transport::bind_client_socket(&socket).unwrap();
        let agents = TcpListener::bind("127.0.0.1:0").await.unwrap();
        let agent_addr = agents.local_addr().unwrap();

        let shutdown = CancellationToken::new();
        let node = Node::new(config, server);
        let handle = tokio::spawn(node.serve(clients, agents, shutdown.clone()));

        Self {
            socket,
            agent_addr,
            shutdown,
            handle,
        }
    }

    pub async fn stop(self) {
        self.shutdown.cancel();
        let result = tokio::time::timeout(Duration::from_secs(5), self.handle)
            .await
            .expect("node stops in time")
            .expect("node task joins");
        result.expect("node exits cleanly");
    }
}

/// Poll a condition until it returns true or the timeout expires.
pub async fn wait_for<F, Fut>(condition: F, timeout_duration: Duration, poll_interval: Duration) -> bool
where
    F: Fn() -> Fut,
    Fut: Future<Output = bool>,
{
    let deadline = tokio::time::Instant::now() + timeout_duration;
    while tokio::time::Instant::now() < deadline {
        if condition().await {
            return true;
        }
        tokio::time::sleep(poll_interval).await;
    }
    false
}
