//! End-to-end: a node on a scratch Unix socket and TCP port, driven by the
//! client library and a hand-rolled agent.

mod test_harness;

use std::time::Duration;

use bytes::Bytes;
use futures::{SinkExt, StreamExt};
use prost::Message;
use tokio::net::TcpStream;
use tokio_util::codec::{Framed, LengthDelimitedCodec};

use jobd::client::Client;
use jobd::error::JobdError;
use jobd::journal::MemoryJournal;
use jobd::protocol::{verbs, Field, FieldNumber, Item, Request, Response};
use jobd::scheduler::JobState;
use jobd::server::Server;
use test_harness::*;

type AgentConn = Framed<TcpStream, LengthDelimitedCodec>;

fn server_for(uid: u32) -> Server {
    let users = users().with_user(uid, "tester", vec![READERS, WRITERS, QUEUE_ADMINS]);
    Server::new(&test_config(), Box::new(users), Box::new(MemoryJournal::new()))
}

/// A job owned by the test user, or by alice when the tests run as root.
fn job_for(uid: u32, name: &str) -> Item {
    let owner = if uid == 0 { ALICE } else { uid };
    job_item(name).with(Field::int(FieldNumber::Uid, i64::from(owner)))
}

async fn connect_agent(node: &TestNode) -> AgentConn {
    let stream = TcpStream::connect(node.agent_addr).await.unwrap();
    Framed::new(stream, jobd::transport::codec())
}

async fn send_agent(conn: &mut AgentConn, request: Request) {
    conn.send(Bytes::from(request.encode_to_vec())).await.unwrap();
}

/// Read agent frames until one carries `verb`, skipping others.
async fn expect_verb(conn: &mut AgentConn, verb: &str) -> Request {
    let read = async {
        loop {
            let frame = conn.next().await.expect("connection open").unwrap();
            let request = Request::decode(frame.freeze()).unwrap();
            if request.command == verb {
                return request;
            }
        }
    };
    tokio::time::timeout(Duration::from_secs(5), read)
        .await
        .unwrap_or_else(|_| panic!("no {} within timeout", verb))
}

fn login(host: &str) -> Request {
    Request::with_item(
        verbs::AGENT_LOGIN,
        Item::new().with(Field::string(FieldNumber::Node, host)),
    )
}

fn state_of(response: &Response) -> i64 {
    let items = response.as_array().expect("array");
    items[0].get(FieldNumber::State).unwrap().as_int().unwrap()
}

#[tokio::test]
async fn test_client_round_trip() {
    let dir = tempfile::tempdir().unwrap();
    let uid = current_uid(dir.path());
    let node = TestNode::start(dir.path(), server_for(uid), 50).await;

    let mut client = Client::connect(&node.socket).await.unwrap();

    let mut ping = Request::new(verbs::PING);
    ping.version = 0;
    let pong = client.call(ping).await.unwrap();
    assert_eq!(pong.as_simple(), Some("PONG"));

    client.call_ok(queue_add("batch")).await.unwrap();
    let added = client
        .call_ok(Request::with_item(verbs::JOB_ADD, job_for(uid, "hello")))
        .await
        .unwrap();
    let id = added
        .as_map()
        .unwrap()
        .get(FieldNumber::JobId)
        .unwrap()
        .as_u64()
        .unwrap();
    assert_eq!(id, 1);

    let listed = client.call_ok(job_get(Item::new())).await.unwrap();
    assert_eq!(ids(&listed), vec![1]);

    let err = client
        .call_ok(job_del(jobd::scheduler::JobId(42)))
        .await
        .unwrap_err();
    match err {
        JobdError::Remote { category, .. } => assert_eq!(category, "NOJOB"),
        other => panic!("unexpected error: {:?}", other),
    }

    node.stop().await;
    assert!(!dir.path().join("jobd.sock").exists());
}

#[tokio::test]
async fn test_agent_receives_and_reports_jobs() {
    let dir = tempfile::tempdir().unwrap();
    let uid = current_uid(dir.path());
    let node = TestNode::start(dir.path(), server_for(uid), 20).await;

    let mut client = Client::connect(&node.socket).await.unwrap();
    client.call_ok(queue_on("batch", "worker1")).await.unwrap();
    client
        .call_ok(Request::with_item(
            verbs::JOB_ADD,
            job_for(uid, "build").with(Field::string_array(FieldNumber::Envs, vec!["A=1".into()])),
        ))
        .await
        .unwrap();

    let mut agent = connect_agent(&node).await;
    send_agent(&mut agent, login("worker1")).await;
    expect_verb(&mut agent, verbs::RECON_REQ).await;
    send_agent(&mut agent, Request::new(verbs::RECON)).await;

    // RECON_COMPLETE and the first START_JOB race each other.
    let mut start = None;
    let mut reconciled = false;
    while start.is_none() || !reconciled {
        let next = tokio::time::timeout(Duration::from_secs(5), agent.next())
            .await
            .expect("agent message within timeout")
            .expect("connection open")
            .unwrap();
        let request = Request::decode(next.freeze()).unwrap();
        match request.command.as_str() {
            verbs::RECON_COMPLETE => reconciled = true,
            verbs::START_JOB => start = Some(request),
            _ => {}
        }
    }
    let start = start.unwrap();
    assert_eq!(start.jobid, 1);
    let envs = start.items[0].get(FieldNumber::Envs).unwrap().as_string_array().unwrap();
    assert_eq!(envs, vec!["A=1".to_string()]);

    send_agent(
        &mut agent,
        Request::with_item(
            verbs::JOB_STARTED,
            job_id_item(jobd::scheduler::JobId(1)).with(Field::int(FieldNumber::Pid, 5150)),
        ),
    )
    .await;

    let running = i64::from(JobState::Running.mask());
    let socket = node.socket.clone();
    let reached = wait_for(
        || {
            let socket = socket.clone();
            async move {
                let mut client = Client::connect(&socket).await.unwrap();
                let response = client.call_ok(job_get(Item::new())).await.unwrap();
                state_of(&response) == running
            }
        },
        Duration::from_secs(5),
        Duration::from_millis(20),
    )
    .await;
    assert!(reached, "job never reported running");

    let agents = client
        .call_ok(Request::new(verbs::AGENT_GET))
        .await
        .unwrap();
    let listed = agents.as_array().unwrap();
    assert_eq!(listed.len(), 1);
    assert_eq!(
        listed[0].get(FieldNumber::Node).unwrap().as_string().unwrap(),
        "worker1"
    );
    assert!(listed[0].get(FieldNumber::Connected).unwrap().as_bool().unwrap());

    drop(agent);
    node.stop().await;
}

#[tokio::test]
async fn test_proxied_client_request() {
    let dir = tempfile::tempdir().unwrap();
    let uid = current_uid(dir.path());
    let node = TestNode::start(dir.path(), server_for(uid), 50).await;

    let mut client = Client::connect(&node.socket).await.unwrap();
    client.call_ok(queue_on("batch", "worker1")).await.unwrap();
    client
        .call_ok(Request::with_item(verbs::JOB_ADD, job_for(uid, "remote")))
        .await
        .unwrap();

    let mut agent = connect_agent(&node).await;
    send_agent(&mut agent, login("worker1")).await;
    expect_verb(&mut agent, verbs::RECON_REQ).await;

    send_agent(
        &mut agent,
        Request::with_item(
            verbs::PROXY_CONN,
            Item::new()
                .with(Field::int(FieldNumber::Pid, 77))
                .with(Field::int(FieldNumber::Uid, i64::from(uid))),
        ),
    )
    .await;

    let inner = job_get(Item::new()).encode_to_vec();
    send_agent(
        &mut agent,
        Request::with_item(
            verbs::PROXY_DATA,
            Item::new()
                .with(Field::int(FieldNumber::Pid, 77))
                .with(Field::blob(FieldNumber::ProxyData, inner)),
        ),
    )
    .await;

    let wrapped = expect_verb(&mut agent, verbs::PROXY_DATA).await;
    let item = &wrapped.items[0];
    assert_eq!(item.get(FieldNumber::Pid).unwrap().as_int().unwrap(), 77);
    let payload = item.get(FieldNumber::ProxyData).unwrap().as_blob().unwrap();
    let response = Response::decode(payload.as_slice()).unwrap();
    assert_eq!(ids(&response), vec![1]);

    drop(agent);
    node.stop().await;
}

#[tokio::test]
async fn test_client_cannot_send_agent_events() {
    let dir = tempfile::tempdir().unwrap();
    let uid = current_uid(dir.path());
    let node = TestNode::start(dir.path(), server_for(uid), 50).await;

    let mut client = Client::connect(&node.socket).await.unwrap();
    let response = client.call(login("sneaky")).await.unwrap();
    assert_eq!(response.error_category(), Some("NOPERM"));

    node.stop().await;
}
