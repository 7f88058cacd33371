//!
//! participant.rs
//! The participant: runs the DB half of the protocol against the
//! primary coordinator, and falls back to the fail-safe coordinator on
//! timeout or refusal.
//!
use std::io;
use std::net::{Shutdown, TcpStream, ToSocketAddrs};
use std::time::Duration;

use log::{error, info, warn};

use crate::error::ProtocolError;
use crate::oplog::OpLog;
use crate::protocol::{self, Token, PARTICIPANT_MARKER};
use crate::resource_manager::ResourceManager;

pub struct ParticipantOpts {
    pub coordinator_host: String,
    pub coordinator_port: u16,
    pub failsafe_host: String,
    pub failsafe_port: u16,
    pub timeout: Duration,
}

fn resolve(host: &str, port: u16) -> io::Result<std::net::SocketAddr> {
    (host, port)
        .to_socket_addrs()?
        .next()
        .ok_or_else(|| io::Error::new(io::ErrorKind::NotFound, format!("could not resolve {}:{}", host, port)))
}

fn connect_with_timeout(host: &str, port: u16, timeout: Duration) -> Result<TcpStream, ProtocolError> {
    let addr = resolve(host, port).map_err(ProtocolError::from)?;
    let stream = TcpStream::connect_timeout(&addr, timeout).map_err(ProtocolError::classify)?;
    stream.set_read_timeout(Some(timeout)).map_err(ProtocolError::from)?;
    stream.set_write_timeout(Some(timeout)).map_err(ProtocolError::from)?;
    Ok(stream)
}

/// run()
/// Runs one full participant lifetime: the normal path against the
/// primary coordinator, falling back to the fail-safe coordinator on
/// timeout or refusal. `db` is owned by the caller for the whole call
/// so the same resource-manager handle backs both the normal and
/// fallback branches -- a participant that reaches the fallback path
/// after already calling `db.prepare()` must retain the same handle so
/// commit/rollback refer to the staged work.
pub fn run(opts: &ParticipantOpts, db: &mut dyn ResourceManager, log: &mut OpLog) -> Result<(), ProtocolError> {
    match run_normal(opts, db, log) {
        Ok(()) => Ok(()),
        Err(ProtocolError::Timeout) => {
            warn!("participant: primary coordinator timed out, falling back to fail-safe coordinator");
            run_fallback(opts, db, log)
        }
        Err(ProtocolError::Refused) => {
            warn!("participant: primary coordinator refused connection, falling back to fail-safe coordinator");
            run_fallback(opts, db, log)
        }
        Err(e) => Err(e),
    }
}

fn run_normal(opts: &ParticipantOpts, db: &mut dyn ResourceManager, log: &mut OpLog) -> Result<(), ProtocolError> {
    info!(
        "participant: connecting to primary coordinator at {}:{}",
        opts.coordinator_host, opts.coordinator_port
    );
    let mut stream = connect_with_timeout(&opts.coordinator_host, opts.coordinator_port, opts.timeout)?;
    info!("participant: connected to primary coordinator");

    let prepare = protocol::read_token(&mut stream).map_err(ProtocolError::classify)?;
    let _ = log.append(None, Some(prepare), "received from primary coordinator");
    if prepare != Token::Prepare {
        return Err(ProtocolError::UnexpectedToken {
            expected: Token::Prepare.to_string(),
            got: prepare.as_bytes().to_vec(),
        });
    }
    db.prepare();

    let sql = protocol::read_message(&mut stream).map_err(ProtocolError::classify)?;
    let vote = db.insert(&sql);
    info!("participant: voting {}", vote);
    protocol::write_token(&mut stream, vote).map_err(ProtocolError::classify)?;
    let _ = log.append(None, Some(vote), "sent to primary coordinator");

    let decision = protocol::read_token(&mut stream).map_err(ProtocolError::classify)?;
    let _ = log.append(None, Some(decision), "received from primary coordinator");
    commit_or_rollback(&mut stream, decision, db, log)?;
    let _ = stream.shutdown(Shutdown::Both);
    Ok(())
}

/// run_fallback()
/// The fallback path to the fail-safe coordinator: identify, then
/// receive and apply the cached decision. Any failure here is
/// terminal -- there's nowhere else left to ask for the decision.
fn run_fallback(opts: &ParticipantOpts, db: &mut dyn ResourceManager, log: &mut OpLog) -> Result<(), ProtocolError> {
    info!(
        "participant: connecting to fail-safe coordinator at {}:{}",
        opts.failsafe_host, opts.failsafe_port
    );
    let mut stream = connect_with_timeout(&opts.failsafe_host, opts.failsafe_port, opts.timeout).map_err(|e| {
        error!("participant: fail-safe coordinator unreachable: {}", e);
        e
    })?;
    protocol::write_message(&mut stream, PARTICIPANT_MARKER).map_err(ProtocolError::classify)?;

    let decision = protocol::read_token(&mut stream).map_err(|e| {
        let classified = ProtocolError::classify(e);
        error!("participant: fail-safe coordinator timed out: {:?}", classified);
        classified
    })?;
    let _ = log.append(None, Some(decision), "received from fail-safe coordinator");
    commit_or_rollback(&mut stream, decision, db, log)?;
    let _ = stream.shutdown(Shutdown::Both);
    Ok(())
}

/// commit_or_rollback()
/// Applies the global decision to the resource manager and replies
/// with the matching terminal ack. Shared by both the normal and
/// fallback paths.
///
/// Note: if this participant already voted VOTE_ABORT because its
/// insert failed, `GlobalCommit` here still calls `db.commit()` --
/// which is a no-op since nothing was staged.
fn commit_or_rollback(
    stream: &mut TcpStream,
    decision: Token,
    db: &mut dyn ResourceManager,
    log: &mut OpLog,
) -> Result<(), ProtocolError> {
    let ack = match decision {
        Token::GlobalCommit => {
            db.commit();
            Token::SuccessfulCommit
        }
        Token::GlobalAbort => {
            db.rollback();
            Token::SuccessfulAbort
        }
        other => {
            return Err(ProtocolError::UnexpectedToken {
                expected: format!("{} or {}", Token::GlobalCommit, Token::GlobalAbort),
                got: other.as_bytes().to_vec(),
            })
        }
    };
    protocol::write_token(stream, ack).map_err(ProtocolError::classify)?;
    let _ = log.append(None, Some(ack), "sent");
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn unexpected_token_error_names_both_tokens() {
        let err = ProtocolError::UnexpectedToken {
            expected: format!("{} or {}", Token::GlobalCommit, Token::GlobalAbort),
            got: Token::Prepare.as_bytes().to_vec(),
        };
        let rendered = format!("{}", err);
        assert!(rendered.contains("GLOBAL_COMMIT"));
        assert!(rendered.contains("GLOBAL_ABORT"));
    }

    #[test]
    fn timed_out_io_error_classifies_as_protocol_timeout() {
        let io_err = io::Error::new(io::ErrorKind::TimedOut, "deadline exceeded");
        assert!(matches!(ProtocolError::classify(io_err), ProtocolError::Timeout));
    }

    #[test]
    fn refused_io_error_classifies_as_protocol_refused() {
        let io_err = io::Error::new(io::ErrorKind::ConnectionRefused, "refused");
        assert!(matches!(ProtocolError::classify(io_err), ProtocolError::Refused));
    }
}
