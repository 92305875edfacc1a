//! Journal replay: a fresh server fed the journal must end up in the state
//! the live server reached.

mod test_harness;

use std::io::Write;
use std::sync::atomic::{AtomicI64, Ordering};

use jobd::config::JournalConfig;
use jobd::journal::{FileJournal, JournalStore, MemoryJournal};
use jobd::protocol::{verbs, Field, FieldNumber, Item, Request};
use jobd::scheduler::{JobId, JobState};
use jobd::server::Server;
use test_harness::*;

/// A mixed workload touching every journaled job verb plus queue and
/// resource administration, agent events and a schedule tick.
fn run_workload(ts: &mut TestServer) {
    ts.ok(0, queue_on("gpu", "gpu1"));
    ts.ok(0, resource_add("gpu", 8));
    ts.ok(0, resource_add("license", 2));

    let a = ts.add_job(
        ALICE,
        job_item("train")
            .with(Field::string(FieldNumber::QueueName, "gpu"))
            .with(Field::string_array(FieldNumber::Resources, vec!["gpu:2".into(), "license".into()]))
            .with(Field::string_array(FieldNumber::Envs, vec!["EPOCHS=10".into()]))
            .with(tags(&[("env", "prod"), ("team", "ml")])),
    );
    let b = ts.add_job(
        ALICE,
        job_item("nightly")
            .with(Field::int(FieldNumber::DeferTime, NOW + 3600))
            .with(Field::int(FieldNumber::Priority, 900)),
    );
    let c = ts.add_job(0, job_item("cleanup").with(Field::int(FieldNumber::Uid, i64::from(BOB))));
    let due = ts.add_job(ALICE, job_item("backfill").with(Field::int(FieldNumber::DeferTime, NOW - 60)));

    ts.ok(ALICE, job_mod(b, vec![Field::boolean(FieldNumber::Hold, true), Field::int(FieldNumber::DeferTime, 0)]));
    ts.ok(ALICE, tag_set(a, "env", "staging"));
    ts.ok(ALICE, tag_set(c, "owner", "bob"));
    ts.ok(ALICE, tag_del(a, "team"));
    ts.ok(ALICE, job_del(c));

    let (agent, _rx) = ts.login_agent("gpu1");

    // Releases `due`, then the hold has to stick after a restart.
    ts.server.schedule_tick();
    assert_eq!(ts.job(due).state, JobState::Pending);
    ts.ok(ALICE, job_mod(due, vec![Field::boolean(FieldNumber::Hold, true)]));

    ts.agent_ok(
        agent,
        Request::with_item(verbs::JOB_STARTED, job_id_item(a).with(Field::int(FieldNumber::Pid, 4100))),
    );
    ts.agent_ok(
        agent,
        Request::with_item(
            verbs::JOB_COMPLETED,
            job_id_item(a)
                .with(Field::int(FieldNumber::ExitCode, 1))
                .with(Field::int(FieldNumber::Signal, 0)),
        ),
    );

    // A job the agent runs but the server never heard start, next to one
    // from a queue the agent does not serve.
    let e = ts.add_job(ALICE, job_item("orphan").with(Field::string(FieldNumber::QueueName, "gpu")));
    let mut recon = Request::new(verbs::RECON);
    recon.items.push(job_id_item(e).with(Field::int(FieldNumber::Pid, 4200)));
    recon.items.push(job_id_item(b).with(Field::int(FieldNumber::Pid, 4300)));
    ts.agent_ok(agent, recon);
    assert_eq!(ts.job(e).state, JobState::Running);
    assert_eq!(ts.job(b).state, JobState::Holding);

    ts.ok(
        ALICE,
        job_mod(
            a,
            vec![
                Field::boolean(FieldNumber::Restart, true),
                Field::string_array(FieldNumber::Resources, vec!["gpu:4".into()]),
            ],
        ),
    );

    // Failures and reads are not journaled.
    ts.err(ALICE, job_del(c));
    ts.ok(BOB, job_get(Item::new()));

    ts.server.agent_disconnected(agent);
}

#[test]
fn test_replay_reproduces_live_state() {
    let mut live = TestServer::new();
    run_workload(&mut live);
    let records = live.records();

    let mut replayed = TestServer::replayed(records.clone());
    assert_eq!(replayed.snapshot(), live.snapshot());
    assert_eq!(replayed.server.scheduler().stats, live.server.scheduler().stats);
    assert_eq!(
        replayed.server.scheduler().jobs.peek_next_id(),
        live.server.scheduler().jobs.peek_next_id()
    );

    let queues: Vec<_> = replayed.server.scheduler().queues.iter().map(|q| q.name.clone()).collect();
    assert_eq!(queues, vec!["batch".to_string(), "gpu".to_string()]);
    assert_eq!(replayed.server.scheduler().resources.len(), 2);

    // A tick on either side must not pull them apart.
    live.server.schedule_tick();
    replayed.server.schedule_tick();
    assert_eq!(replayed.snapshot(), live.snapshot());
    assert_eq!(replayed.records().len(), records.len());
}

#[test]
fn test_only_successful_mutations_are_journaled() {
    let mut ts = TestServer::new();
    run_workload(&mut ts);

    let verbs_seen: Vec<String> = ts.records().iter().map(|r| r.command.clone()).collect();
    assert!(!verbs_seen.iter().any(|v| v == verbs::JOB_GET));
    assert!(!verbs_seen.iter().any(|v| v == verbs::RECON));
    assert_eq!(verbs_seen.iter().filter(|v| *v == verbs::JOB_DEL).count(), 1);
    assert_eq!(verbs_seen.iter().filter(|v| *v == verbs::JOB_STARTED).count(), 2);
    assert_eq!(verbs_seen.iter().filter(|v| *v == verbs::JOB_RELEASE).count(), 1);

    let add = ts
        .records()
        .into_iter()
        .find(|r| r.command == verbs::JOB_ADD)
        .unwrap();
    assert_eq!(add.uid, ALICE);
    assert_eq!(add.jobid, 1);
    assert_eq!(add.revision, 1);
    assert_eq!(add.timestamp, NOW);
}

#[test]
fn test_hold_after_deferred_release_survives_replay() {
    static CLOCK: AtomicI64 = AtomicI64::new(1_000);
    fn clock() -> i64 {
        CLOCK.load(Ordering::SeqCst)
    }

    let journal = MemoryJournal::new();
    let mut server = Server::new(&test_config(), Box::new(users()), Box::new(journal.clone()))
        .with_clock(clock);
    server.handle_client(0, frame(&queue_add("batch"))).unwrap();
    let add = Request::with_item(
        verbs::JOB_ADD,
        job_item("later").with(Field::int(FieldNumber::DeferTime, 1_500)),
    );
    server.handle_client(ALICE, frame(&add)).unwrap();
    let id = JobId(1);
    let state = |server: &Server| server.scheduler().jobs.live(id).unwrap().state;

    server.schedule_tick();
    assert_eq!(state(&server), JobState::Deferred);

    CLOCK.store(2_000, Ordering::SeqCst);
    server.schedule_tick();
    assert_eq!(state(&server), JobState::Pending);

    let hold = job_mod(id, vec![Field::boolean(FieldNumber::Hold, true)]);
    server.handle_client(ALICE, frame(&hold)).unwrap();
    assert_eq!(state(&server), JobState::Holding);

    let mut replayed = TestServer::replayed(journal.records());
    replayed.server.schedule_tick();
    assert_eq!(replayed.job(id).state, JobState::Holding);
    assert_eq!(replayed.job(id).defer_time, None);
    let live: Vec<_> = server.scheduler().jobs.iter_all().cloned().collect();
    assert_eq!(replayed.snapshot(), live);
}

#[test]
fn test_refused_agent_events_leave_no_trace() {
    let mut ts = TestServer::new();
    let id = ts.add_job(ALICE, job_item("x"));
    let before = ts.records().len();

    let (tx, _rx) = tokio::sync::mpsc::unbounded_channel();
    let stranger = ts.server.agent_connected("10.9.9.9:7001".into(), tx);
    let started = Request::with_item(verbs::JOB_STARTED, job_id_item(id).with(Field::int(FieldNumber::Pid, 1)));
    let response = ts.server.handle_agent_frame(stranger, frame(&started)).unwrap();
    assert_eq!(response.error_category(), Some("NOPERM"));

    let (elsewhere, _rx2) = ts.login_agent("node2");
    let response = ts.server.handle_agent_frame(elsewhere, frame(&started)).unwrap();
    assert_eq!(response.error_category(), Some("NOPERM"));

    assert_eq!(ts.job(id).state, JobState::Pending);
    assert_eq!(ts.records().len(), before);
}

#[test]
fn test_file_journal_survives_restart() {
    let dir = tempfile::tempdir().unwrap();
    let config = JournalConfig {
        path: dir.path().join("state").join("journal"),
        fsync: true,
    };

    let snapshot = {
        let journal = FileJournal::open(&config).unwrap();
        let mut server = Server::new(&test_config(), Box::new(users()), Box::new(journal))
            .with_clock(fixed_clock);
        server.handle_client(0, frame(&queue_add("batch"))).unwrap();
        let add = Request::with_item(verbs::JOB_ADD, job_item("persisted"));
        server.handle_client(ALICE, frame(&add)).unwrap();
        let tag = tag_set(JobId(1), "k", "v");
        server.handle_client(ALICE, frame(&tag)).unwrap();
        server.flush().unwrap();
        server.scheduler().jobs.iter_all().cloned().collect::<Vec<_>>()
    };

    let journal = FileJournal::open(&config).unwrap();
    let mut server = Server::new(&test_config(), Box::new(users()), Box::new(journal))
        .with_clock(fixed_clock);
    assert_eq!(server.recover().unwrap(), 3);
    let restored: Vec<_> = server.scheduler().jobs.iter_all().cloned().collect();
    assert_eq!(restored, snapshot);

    // New ids continue after the replayed ones.
    let add = Request::with_item(verbs::JOB_ADD, job_item("after"));
    let response = server.handle_client(ALICE, frame(&add)).unwrap();
    let id = response.as_map().unwrap().get(FieldNumber::JobId).unwrap();
    assert_eq!(id.as_u64().unwrap(), 2);
}

#[test]
fn test_truncated_journal_is_fatal() {
    let dir = tempfile::tempdir().unwrap();
    let config = JournalConfig {
        path: dir.path().join("journal"),
        fsync: false,
    };

    {
        let journal = FileJournal::open(&config).unwrap();
        let mut server = Server::new(&test_config(), Box::new(users()), Box::new(journal));
        server.handle_client(0, frame(&queue_add("batch"))).unwrap();
        server.flush().unwrap();
    }
    let mut file = std::fs::OpenOptions::new()
        .append(true)
        .open(&config.path)
        .unwrap();
    // A length prefix promising more bytes than follow.
    file.write_all(&[0x40, 0x01, 0x02]).unwrap();
    drop(file);

    let journal = FileJournal::open(&config).unwrap();
    let mut server = Server::new(&test_config(), Box::new(users()), Box::new(journal));
    assert!(server.recover().is_err());
}

#[test]
fn test_record_that_fails_to_apply_is_fatal() {
    let mut live = TestServer::new();
    let id = live.add_job(ALICE, job_item("x"));
    live.ok(ALICE, job_del(id));

    // Drop the QUEUE_ADD: the JOB_ADD can no longer resolve its queue.
    let records: Vec<_> = live.records().into_iter().skip(1).collect();
    let mut ts = TestServer::empty(MemoryJournal::with_records(records));
    let err = ts.server.recover().unwrap_err();
    assert!(matches!(err, jobd::error::JobdError::Replay { index: 0, .. }));
}

#[test]
fn test_replay_skips_live_only_checks() {
    // Root submitted a job for bob; the replaying server does not know bob.
    let mut live = TestServer::new();
    live.add_job(0, job_item("legacy").with(Field::int(FieldNumber::Uid, i64::from(BOB))));

    let journal = MemoryJournal::with_records(live.records());
    let mut server = Server::new(
        &test_config(),
        Box::new(jobd::auth::StaticUsers::new()),
        Box::new(journal.clone()),
    );
    assert_eq!(server.recover().unwrap(), 2);
    assert_eq!(server.scheduler().jobs.len(), 1);
    // Replay itself appends nothing.
    assert_eq!(journal.records().len(), 2);
}

#[test]
fn test_journal_record_append_order_matches_memory() {
    let mut journal = MemoryJournal::new();
    let mut ts = TestServer::empty(journal.clone());
    ts.ok(0, queue_add("batch"));
    ts.add_job(ALICE, job_item("one"));
    ts.add_job(ALICE, job_item("two"));

    let jobids: Vec<u64> = journal.load().unwrap().iter().map(|r| r.jobid).collect();
    assert_eq!(jobids, vec![0, 1, 2]);
}
