//!
//! protocol_tests.rs
//! End-to-end exercises over real loopback TCP sockets: the happy
//! path, a participant abort, the primary coordinator going silent or
//! being unreachable, and a garbled vote.
//!
use std::net::TcpListener;
use std::net::TcpStream;
use std::sync::atomic::AtomicBool;
use std::sync::Arc;
use std::thread;
use std::time::Duration;

use two_phase_commit::coordinator::{self, Coordinator};
use two_phase_commit::failsafe::FailSafe;
use two_phase_commit::oplog::OpLog;
use two_phase_commit::participant::{self, ParticipantOpts};
use two_phase_commit::protocol::{self, Token};
use two_phase_commit::resource_manager::InMemoryResourceManager;

fn oplog_in(dir: &std::path::Path, name: &str) -> OpLog {
    OpLog::new(dir.join(name)).unwrap()
}

fn always_running() -> Arc<AtomicBool> {
    Arc::new(AtomicBool::new(true))
}

fn spawn_failsafe(participants: u32, dir: &std::path::Path) -> (u16, thread::JoinHandle<()>) {
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let failsafe = std::sync::Arc::new(FailSafe::new(participants, None, oplog_in(dir, "failsafe.log")).unwrap());
    let handle = thread::spawn(move || {
        let _ = failsafe.run(listener, always_running());
    });
    (port, handle)
}

fn spawn_coordinator(
    participants: u32,
    failsafe_port: u16,
    dir: &std::path::Path,
    protocol_delay: Duration,
) -> (u16, thread::JoinHandle<()>) {
    let failsafe_stream = Coordinator::connect_to_failsafe("127.0.0.1", failsafe_port, 0).unwrap();
    let transaction = coordinator::render_transaction_sql("Ada", "1000");
    let coordinator = std::sync::Arc::new(Coordinator::new(
        participants,
        failsafe_stream,
        transaction,
        oplog_in(dir, "coordinator.log"),
        protocol_delay,
    ));
    let listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let port = listener.local_addr().unwrap().port();
    let handle = thread::spawn(move || {
        let _ = coordinator.run(listener, always_running());
    });
    (port, handle)
}

#[test]
fn both_participants_commit_on_unanimous_vote() {
    let dir = tempfile::tempdir().unwrap();
    let (fc_port, _fc) = spawn_failsafe(2, dir.path());
    let (pc_port, _pc) = spawn_coordinator(2, fc_port, dir.path(), Duration::from_millis(5));
    thread::sleep(Duration::from_millis(50));

    let mut handles = Vec::new();
    for i in 0..2 {
        let dir = dir.path().to_path_buf();
        handles.push(thread::spawn(move || {
            let mut db = InMemoryResourceManager::new();
            let mut log = oplog_in(&dir, &format!("participant_{}.log", i));
            let opts = ParticipantOpts {
                coordinator_host: "127.0.0.1".to_string(),
                coordinator_port: pc_port,
                failsafe_host: "127.0.0.1".to_string(),
                failsafe_port: fc_port,
                timeout: Duration::from_secs(5),
            };
            participant::run(&opts, &mut db, &mut log).unwrap();
            db.committed_rows().to_vec()
        }));
    }
    for h in handles {
        let rows = h.join().unwrap();
        assert_eq!(rows, vec![("Ada".to_string(), 1000.0)]);
    }
}

#[test]
fn both_participants_roll_back_on_a_single_abort_vote() {
    let dir = tempfile::tempdir().unwrap();
    let (fc_port, _fc) = spawn_failsafe(2, dir.path());
    let (pc_port, _pc) = spawn_coordinator(2, fc_port, dir.path(), Duration::from_millis(5));
    thread::sleep(Duration::from_millis(50));

    let mut handles = Vec::new();
    for (i, force_abort) in [(0, false), (1, true)] {
        let dir = dir.path().to_path_buf();
        handles.push(thread::spawn(move || {
            let mut db = InMemoryResourceManager::new();
            if force_abort {
                db = db.with_forced_abort();
            }
            let mut log = oplog_in(&dir, &format!("participant_{}.log", i));
            let opts = ParticipantOpts {
                coordinator_host: "127.0.0.1".to_string(),
                coordinator_port: pc_port,
                failsafe_host: "127.0.0.1".to_string(),
                failsafe_port: fc_port,
                timeout: Duration::from_secs(5),
            };
            participant::run(&opts, &mut db, &mut log).unwrap();
            db.committed_rows().to_vec()
        }));
    }
    for h in handles {
        let rows = h.join().unwrap();
        assert!(rows.is_empty(), "every participant must roll back when any peer aborts");
    }
}

#[test]
fn participant_falls_back_to_abort_when_coordinator_goes_silent() {
    let dir = tempfile::tempdir().unwrap();
    let (fc_port, _fc) = spawn_failsafe(1, dir.path());

    // A bare listener stands in for a coordinator that accepts the
    // connection and then never speaks again.
    let pc_listener = TcpListener::bind("127.0.0.1:0").unwrap();
    let pc_port = pc_listener.local_addr().unwrap().port();
    thread::spawn(move || {
        if let Ok((stream, _)) = pc_listener.accept() {
            thread::sleep(Duration::from_secs(5));
            drop(stream);
        }
    });

    let mut db = InMemoryResourceManager::new();
    let mut log = oplog_in(dir.path(), "participant.log");
    let opts = ParticipantOpts {
        coordinator_host: "127.0.0.1".to_string(),
        coordinator_port: pc_port,
        failsafe_host: "127.0.0.1".to_string(),
        failsafe_port: fc_port,
        timeout: Duration::from_millis(200),
    };
    participant::run(&opts, &mut db, &mut log).unwrap();
    assert!(db.committed_rows().is_empty(), "fail-safe coordinator's default decision is abort");
}

#[test]
fn participant_falls_back_to_abort_when_coordinator_is_unreachable() {
    let dir = tempfile::tempdir().unwrap();
    let (fc_port, _fc) = spawn_failsafe(1, dir.path());

    // Bind then immediately drop: the port is known but nothing listens,
    // so a connection attempt refuses right away.
    let throwaway = TcpListener::bind("127.0.0.1:0").unwrap();
    let dead_port = throwaway.local_addr().unwrap().port();
    drop(throwaway);

    let mut db = InMemoryResourceManager::new();
    let mut log = oplog_in(dir.path(), "participant.log");
    let opts = ParticipantOpts {
        coordinator_host: "127.0.0.1".to_string(),
        coordinator_port: dead_port,
        failsafe_host: "127.0.0.1".to_string(),
        failsafe_port: fc_port,
        timeout: Duration::from_secs(5),
    };
    participant::run(&opts, &mut db, &mut log).unwrap();
    assert!(db.committed_rows().is_empty());
}

#[test]
fn garbled_vote_closes_the_connection_without_a_global_decision() {
    let dir = tempfile::tempdir().unwrap();
    let (fc_port, _fc) = spawn_failsafe(1, dir.path());
    let (pc_port, _pc) = spawn_coordinator(1, fc_port, dir.path(), Duration::from_millis(5));
    thread::sleep(Duration::from_millis(50));

    let mut stream = TcpStream::connect(("127.0.0.1", pc_port)).unwrap();
    stream.set_read_timeout(Some(Duration::from_secs(2))).unwrap();

    let prepare = protocol::read_token(&mut stream).unwrap();
    assert_eq!(prepare, Token::Prepare);
    let _transaction = protocol::read_message(&mut stream).unwrap();

    protocol::write_message(&mut stream, b"not a real vote token").unwrap();

    // The coordinator closes the connection on a garbled vote rather
    // than deciding a global outcome; the next read observes EOF, not
    // GLOBAL_COMMIT or GLOBAL_ABORT.
    let result = protocol::read_token(&mut stream);
    assert!(result.is_err());
}
