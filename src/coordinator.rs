//!
//! coordinator.rs
//! The primary coordinator: accepts all participant connections,
//! drives the PREPARE / VOTE / GLOBAL_* round, and forwards the
//! commit decision to the fail-safe coordinator.
//!
use std::io::{self, Write};
use std::net::{Shutdown, SocketAddr, TcpListener, TcpStream};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Condvar, Mutex};
use std::thread;
use std::time::Duration;

use log::{error, info, warn};

use crate::net;
use crate::oplog::OpLog;
use crate::protocol::{self, Token, COORDINATOR_MARKER};

/// How often the accept loop wakes from a non-blocking poll to check
/// whether it's been asked to shut down.
const ACCEPT_POLL_INTERVAL: Duration = Duration::from_millis(200);

/// Mutable state shared across every per-participant handler thread,
/// bundled into one mutex-guarded struct rather than a scatter of bare
/// counters.
struct CoordinatorState {
    /// Insertion-ordered so broadcasts iterate clients in the order
    /// they joined.
    clients: Vec<(SocketAddr, TcpStream)>,
    connected_clients: u32,
    commit_votes: u32,
    /// Set the moment any participant votes abort. Guards against a
    /// commit vote arriving after the abort decision re-triggering a
    /// commit (`connected_clients` alone isn't a safe divisor here,
    /// since it shrinks as aborting peers deregister).
    aborted: bool,
}

pub struct Coordinator {
    max_connections: u32,
    state: Mutex<CoordinatorState>,
    barrier: Condvar,
    failsafe_stream: Mutex<TcpStream>,
    transaction: Vec<u8>,
    log: Mutex<OpLog>,
    protocol_delay: Duration,
    /// Optional overall per-connection deadline, applied as the
    /// connection's read/write timeout at accept time. `None` keeps the
    /// default of relying on TCP close for liveness.
    round_deadline: Option<Duration>,
}

/// prompt_transaction_sql()
/// Reads the employee name and salary from the operator exactly once
/// and renders them into an insert statement.
pub fn prompt_transaction_sql() -> io::Result<Vec<u8>> {
    let name = prompt_line("Enter employee_name : ")?;
    let salary = prompt_line(&format!("Enter salary of {} : ", name))?;
    Ok(render_transaction_sql(&name, &salary))
}

fn prompt_line(prompt: &str) -> io::Result<String> {
    print!("{}", prompt);
    io::stdout().flush()?;
    let mut line = String::new();
    io::stdin().read_line(&mut line)?;
    Ok(line.trim().to_string())
}

pub fn render_transaction_sql(name: &str, salary: &str) -> Vec<u8> {
    format!(
        "INSERT INTO transaction_table (name, salary) VALUES ('{}', {})",
        name, salary
    )
    .into_bytes()
}

impl Coordinator {
    /// connect_to_failsafe()
    /// Dials the fail-safe coordinator from a stable local port, and
    /// sends the `Main Coordinator` handshake marker so the fail-safe's
    /// role classifier recognizes it. Connection refusal here is fatal
    /// at startup: the coordinator has nowhere to hand its commit
    /// decision without the fail-safe reachable.
    pub fn connect_to_failsafe(failsafe_host: &str, failsafe_port: u16, local_port: u16) -> io::Result<TcpStream> {
        use std::net::ToSocketAddrs;
        let local = SocketAddr::from(([127, 0, 0, 1], local_port));
        let remote: SocketAddr = format!("{}:{}", failsafe_host, failsafe_port)
            .to_socket_addrs()?
            .next()
            .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, "could not resolve fail-safe address"))?;
        let mut stream = net::connect_from(local, remote)?;
        protocol::write_message(&mut stream, COORDINATOR_MARKER)?;
        Ok(stream)
    }

    pub fn new(
        max_connections: u32,
        failsafe_stream: TcpStream,
        transaction: Vec<u8>,
        log: OpLog,
        protocol_delay: Duration,
    ) -> Coordinator {
        Self::with_round_deadline(max_connections, failsafe_stream, transaction, log, protocol_delay, None)
    }

    pub fn with_round_deadline(
        max_connections: u32,
        failsafe_stream: TcpStream,
        transaction: Vec<u8>,
        log: OpLog,
        protocol_delay: Duration,
        round_deadline: Option<Duration>,
    ) -> Coordinator {
        Coordinator {
            max_connections,
            state: Mutex::new(CoordinatorState {
                clients: Vec::new(),
                connected_clients: 0,
                commit_votes: 0,
                aborted: false,
            }),
            barrier: Condvar::new(),
            failsafe_stream: Mutex::new(failsafe_stream),
            transaction,
            log: Mutex::new(log),
            protocol_delay,
            round_deadline,
        }
    }

    /// run()
    /// Accepts connections on `listener`, spawning one handler thread
    /// per connection, until `running` clears. The listener is polled
    /// non-blocking so an operator interrupt (which flips `running` to
    /// `false`) is noticed within one poll interval instead of leaving
    /// the loop parked in a blocking `accept()` forever.
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
                    error!("coordinator: failed to accept connection: {}", e);
                    continue;
                }
            };
            stream.set_nonblocking(false)?;
            let coordinator = Arc::clone(&self);
            thread::spawn(move || {
                if let Err(e) = coordinator.handle_participant(stream, addr) {
                    error!("coordinator: unknown error handling {}: {}", addr, e);
                }
            });
        }
        info!("coordinator: interrupted, accept loop shutting down");
        Ok(())
    }

    fn log_event(&self, peer: Option<&str>, token: Option<Token>, note: &str) {
        if let Ok(mut log) = self.log.lock() {
            let _ = log.append(peer, token, note);
        }
    }

    fn deregister(&self, addr: SocketAddr) {
        let mut state = self.state.lock().unwrap();
        state.clients.retain(|(a, _)| *a != addr);
        state.connected_clients = state.connected_clients.saturating_sub(1);
    }

    /// broadcast()
    /// Sends `token` to every currently registered participant, in
    /// insertion order.
    fn broadcast(&self, token: Token) {
        let mut state = self.state.lock().unwrap();
        for (addr, stream) in state.clients.iter_mut() {
            if let Err(e) = protocol::write_token(stream, token) {
                warn!("coordinator: failed to broadcast {} to {}: {}", token, addr, e);
            } else {
                info!("coordinator: sent {} to {}", token, addr);
            }
        }
    }

    /// notify_failsafe_committed()
    /// The round-trip to the fail-safe coordinator: DECIDED_TO_COMMIT
    /// out, RECORDED_COMMIT expected back.
    fn notify_failsafe_committed(&self) -> io::Result<()> {
        let mut fc = self.failsafe_stream.lock().unwrap();
        protocol::write_token(&mut *fc, Token::DecidedToCommit)?;
        match protocol::read_token(&mut *fc)? {
            Token::RecordedCommit => Ok(()),
            other => Err(io::Error::new(
                io::ErrorKind::InvalidData,
                format!("fail-safe coordinator replied {} instead of RECORDED_COMMIT", other),
            )),
        }
    }

    /// handle_participant()
    /// Registers the connection, runs the per-connection state machine,
    /// then always deregisters and closes the stream -- regardless of
    /// whether the round finished cleanly or a protocol error cut it
    /// short. A garbled vote must not leave a dead entry able to wedge
    /// a later broadcast.
    fn handle_participant(&self, mut stream: TcpStream, addr: SocketAddr) -> io::Result<()> {
        net::set_optional_timeout(&stream, self.round_deadline)?;
        let write_handle = stream.try_clone()?;
        {
            let mut state = self.state.lock().unwrap();
            state.clients.push((addr, write_handle));
            state.connected_clients += 1;
            self.barrier.notify_all();
        }
        self.log_event(Some(&addr.to_string()), None, "connected");
        info!("coordinator: connected to participant at {}", addr);

        let result = self.run_round(&mut stream, addr);
        self.deregister(addr);
        let _ = stream.shutdown(Shutdown::Both);
        result
    }

    /// run_round()
    /// The per-connection state machine: barrier, PREPARE, vote
    /// collection, fail-safe round-trip, GLOBAL_* broadcast, terminal
    /// ack. Assumes the caller has already registered `addr` and will
    /// deregister it afterward regardless of outcome.
    fn run_round(&self, stream: &mut TcpStream, addr: SocketAddr) -> io::Result<()> {
        // Barrier: don't proceed until every expected participant has joined.
        {
            let mut state = self.state.lock().unwrap();
            while state.connected_clients < self.max_connections {
                state = self.barrier.wait(state).unwrap();
            }
        }

        thread::sleep(self.protocol_delay);
        protocol::write_token(stream, Token::Prepare)?;
        self.log_event(Some(&addr.to_string()), Some(Token::Prepare), "sent");

        thread::sleep(self.protocol_delay);
        protocol::write_message(stream, &self.transaction)?;

        let vote = protocol::read_token(stream)?;
        self.log_event(Some(&addr.to_string()), Some(vote), "received vote");

        match vote {
            Token::VoteAbort => {
                let should_broadcast = {
                    let mut state = self.state.lock().unwrap();
                    let already = state.aborted;
                    state.aborted = true;
                    !already
                };
                if should_broadcast {
                    info!("coordinator: {} voted abort, broadcasting GLOBAL_ABORT", addr);
                    self.broadcast(Token::GlobalAbort);
                }
                // Fall through to the completion phase below rather than
                // closing this connection immediately: the aborting
                // participant still owes its own SUCCESSFUL_ABORT, and
                // severing the socket right after the broadcast races
                // that write against this handler's own shutdown.
            }
            Token::VoteCommit => {
                let already_aborted = self.state.lock().unwrap().aborted;
                if already_aborted {
                    // The round already decided abort (another peer voted
                    // first); GLOBAL_ABORT was already broadcast to every
                    // participant registered at that point, this one
                    // included. Nothing left to do for this vote.
                } else {
                    let should_decide = {
                        let mut state = self.state.lock().unwrap();
                        state.commit_votes += 1;
                        state.commit_votes == self.max_connections
                    };
                    if should_decide {
                        match self.notify_failsafe_committed() {
                            Ok(()) => {
                                self.log_event(None, Some(Token::RecordedCommit), "fail-safe recorded commit");
                                self.broadcast(Token::GlobalCommit);
                                // Dead by construction: no second transaction is ever
                                // started in this process's lifetime. Kept so a future
                                // multi-transaction extension doesn't have to rediscover
                                // this spot.
                                let mut state = self.state.lock().unwrap();
                                state.commit_votes = 0;
                            }
                            Err(e) => {
                                error!("coordinator: fail-safe round-trip failed: {}", e);
                                return Ok(());
                            }
                        }
                    }
                }
            }
            other => {
                warn!("coordinator: unrecognized vote {} from {}", other, addr);
                return Ok(());
            }
        }

        // Completion phase: the participant's terminal ack.
        match protocol::read_token(stream) {
            Ok(ack @ Token::SuccessfulCommit) | Ok(ack @ Token::SuccessfulAbort) => {
                self.log_event(Some(&addr.to_string()), Some(ack), "received terminal ack");
            }
            Ok(other) => {
                warn!("coordinator: unexpected terminal token {} from {}", other, addr);
            }
            Err(e) => {
                warn!("coordinator: error reading terminal ack from {}: {}", addr, e);
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn render_transaction_sql_embeds_name_and_salary() {
        let sql = render_transaction_sql("Ada", "1000");
        let text = String::from_utf8(sql).unwrap();
        assert!(text.contains("Ada"));
        assert!(text.contains("1000"));
    }
}
