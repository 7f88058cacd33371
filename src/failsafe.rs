//!
//! failsafe.rs
//! The fail-safe coordinator: purely reactive, it never initiates a
//! connection. It records the primary coordinator's commit decision
//! and, once every expected participant has connected, delivers that
//! decision to them.
//!
use std::fs;
use std::io;
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use crate::oplog::OpLog;
use crate::protocol::{self, Token, COORDINATOR_MARKER, PARTICIPANT_MARKER};

/// How often the accept loop wakes from a non-blocking poll to check
/// whether it's been asked to shut down.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

struct FailSafeState {
    clients: Vec<(SocketAddr, TcpStream)>,
    connected_clients: u32,
}

pub struct FailSafe {
    max_conn: u32,
    state: Mutex<FailSafeState>,
    barrier: Condvar,
    /// Written once by the server-handler, read many times by
    /// participant-handlers; a plain mutex-guarded bool is enough since
    /// there's no hot path here worth an atomic.
    commit: Mutex<bool>,
    decision_file: Option<PathBuf>,
    log: Mutex<OpLog>,
}

fn persist_decision(path: &Path, committed: bool) -> io::Result<()> {
    use std::io::Write as _;
    let mut file = fs::File::create(path)?;
    file.write_all(if committed { b"COMMIT\n" } else { b"ABORT\n" })?;
    file.sync_all()
}

/// load_decision()
/// Reloads a previously fsynced decision on startup, when
/// `--decision-file` is configured, so a fail-safe restart between
/// recording a commit and a late participant fallback doesn't lose the
/// decision.
fn load_decision(path: &Path) -> io::Result<Option<bool>> {
    match fs::read_to_string(path) {
        Ok(contents) => Ok(Some(contents.trim() == "COMMIT")),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e),
    }
}

impl FailSafe {
    pub fn new(max_conn: u32, decision_file: Option<PathBuf>, log: OpLog) -> io::Result<FailSafe> {
        let initial_commit = match &decision_file {
            Some(path) => load_decision(path)?.unwrap_or(false),
            None => false,
        };
        Ok(FailSafe {
            max_conn,
            state: Mutex::new(FailSafeState {
                clients: Vec::new(),
                connected_clients: 0,
            }),
            barrier: Condvar::new(),
            commit: Mutex::new(initial_commit),
            decision_file,
            log: Mutex::new(log),
        })
    }

    /// run()
    /// Accepts connections on `listener`, spawning one handler thread
    /// per connection, until `running` clears. The listener is polled
    /// non-blocking so an operator interrupt is noticed within one
    /// poll interval instead of leaving the loop parked in a blocking
    /// `accept()` forever.
    pub fn run(self: Arc<Self>, listener: TcpListener, running: Arc<AtomicBool>) -> io::Result<()> {
        listener.set_nonblocking(true)?;
        while running.load(Ordering::SeqCst) {
            let (stream, addr) = match listener.accept() {
                Ok(pair) => pair,
                Err(e) if e.kind() == io::ErrorKind::WouldBlock => {
                    thread::sleep(ACCEPT_POLL_INTERVAL);
                    continue;
                }
                Err(e) => {
                    error!("failsafe: failed to accept connection: {}", e);
                    continue;
                }
            };
            stream.set_nonblocking(false)?;
            let failsafe = Arc::clone(&self);
            thread::spawn(move || {
                if let Err(e) = failsafe.handle_connection(stream, addr) {
                    error!("failsafe: unknown error handling {}: {}", addr, e);
                }
            });
        }
        info!("failsafe: interrupted, accept loop shutting down");
        Ok(())
    }

    fn log_event(&self, peer: Option<&str>, token: Option<Token>, note: &str) {
        if let Ok(mut log) = self.log.lock() {
            let _ = log.append(peer, token, note);
        }
    }

    /// handle_connection()
    /// Classifies the peer by its first frame: the primary coordinator
    /// identifies itself with `COORDINATOR_MARKER`, a participant with
    /// `PARTICIPANT_MARKER`.
    fn handle_connection(&self, mut stream: TcpStream, addr: SocketAddr) -> io::Result<()> {
        let first = protocol::read_message(&mut stream)?;
        if protocol::contains_marker(&first, COORDINATOR_MARKER) {
            info!("failsafe: connected to primary coordinator at {}", addr);
            self.handle_server(stream, addr)
        } else if protocol::contains_marker(&first, PARTICIPANT_MARKER) {
            info!("failsafe: connected to participant at {}", addr);
            self.handle_participant(stream, addr)
        } else {
            warn!("failsafe: unrecognized first contact from {}", addr);
            let _ = stream.shutdown(Shutdown::Both);
            Ok(())
        }
    }

    fn handle_server(&self, mut stream: TcpStream, addr: SocketAddr) -> io::Result<()> {
        let token = protocol::read_token(&mut stream)?;
        self.log_event(Some(&addr.to_string()), Some(token), "received from primary coordinator");
        if token == Token::DecidedToCommit {
            {
                let mut commit = self.commit.lock().unwrap();
                *commit = true;
            }
            if let Some(path) = &self.decision_file {
                persist_decision(path, true)?;
            }
            protocol::write_token(&mut stream, Token::RecordedCommit)?;
            self.log_event(Some(&addr.to_string()), Some(Token::RecordedCommit), "sent to primary coordinator");
        } else {
            warn!("failsafe: primary coordinator sent unexpected token {}", token);
        }
        let _ = stream.shutdown(Shutdown::Both);
        Ok(())
    }

    fn deregister(&self, addr: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        state.clients.retain(|(a, _)| *a != addr);
    }

    /// handle_participant()
    /// Waits on the N-barrier, then delivers whichever decision the
    /// `commit` flag records at that moment, and reads the
    /// participant's terminal ack.
    fn handle_participant(&self, mut stream: TcpStream, addr: SocketAddr) -> io::Result<()> {
        {
            let write_handle = stream.try_clone()?;
            let mut state = self.state.lock().unwrap();
            state.clients.push((addr, write_handle));
            state.connected_clients += 1;
            self.barrier.notify_all();
        }

        {
            let mut state = self.state.lock().unwrap();
            while state.connected_clients < self.max_conn {
                state = self.barrier.wait(state).unwrap();
            }
        }

        let decision = if *self.commit.lock().unwrap() {
            Token::GlobalCommit
        } else {
            Token::GlobalAbort
        };
        protocol::write_token(&mut stream, decision)?;
        self.log_event(Some(&addr.to_string()), Some(decision), "sent");

        match protocol::read_token(&mut stream) {
            Ok(ack @ Token::SuccessfulCommit) | Ok(ack @ Token::SuccessfulAbort) => {
                self.log_event(Some(&addr.to_string()), Some(ack), "received terminal ack");
            }
            Ok(other) => warn!("failsafe: unexpected terminal token {} from {}", other, addr),
            Err(e) => warn!("failsafe: error reading terminal ack from {}: {}", addr, e),
        }
        self.deregister(addr);
        let _ = stream.shutdown(Shutdown::Both);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn decision_file_round_trips() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("decision");
        persist_decision(&path, true).unwrap();
        assert_eq!(load_decision(&path).unwrap(), Some(true));
        persist_decision(&path, false).unwrap();
        assert_eq!(load_decision(&path).unwrap(), Some(false));
    }

    #[test]
    fn missing_decision_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("missing");
        assert_eq!(load_decision(&path).unwrap(), None);
    }
}
