//!
//! protocol.rs
//! Wire grammar for the three-role commit protocol: tokens, the
//! identification markers used on first contact with the fail-safe
//! coordinator, and the length-prefixed framing used to send them.
//!
use std::io::{self, Read, Write};

/// Token
/// The eight wire tokens exchanged between roles, plus the SQL payload
/// which is carried as an opaque frame and never matched as a token.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Token {
    Prepare,
    VoteCommit,
    VoteAbort,
    GlobalCommit,
    GlobalAbort,
    DecidedToCommit,
    RecordedCommit,
    SuccessfulCommit,
    SuccessfulAbort,
}

impl Token {
    pub fn as_bytes(&self) -> &'static [u8] {
        match self {
            Token::Prepare => b"PREPARE",
            Token::VoteCommit => b"VOTE_COMMIT",
            Token::VoteAbort => b"VOTE_ABORT",
            Token::GlobalCommit => b"GLOBAL_COMMIT",
            Token::GlobalAbort => b"GLOBAL_ABORT",
            Token::DecidedToCommit => b"DECIDED_TO_COMMIT",
            Token::RecordedCommit => b"RECORDED_COMMIT",
            Token::SuccessfulCommit => b"SUCCESSFUL_COMMIT",
            Token::SuccessfulAbort => b"SUCCESSFUL_ABORT",
        }
    }

    pub fn from_bytes(bytes: &[u8]) -> Option<Token> {
        match bytes {
            b"PREPARE" => Some(Token::Prepare),
            b"VOTE_COMMIT" => Some(Token::VoteCommit),
            b"VOTE_ABORT" => Some(Token::VoteAbort),
            b"GLOBAL_COMMIT" => Some(Token::GlobalCommit),
            b"GLOBAL_ABORT" => Some(Token::GlobalAbort),
            b"DECIDED_TO_COMMIT" => Some(Token::DecidedToCommit),
            b"RECORDED_COMMIT" => Some(Token::RecordedCommit),
            b"SUCCESSFUL_COMMIT" => Some(Token::SuccessfulCommit),
            b"SUCCESSFUL_ABORT" => Some(Token::SuccessfulAbort),
            _ => None,
        }
    }
}

impl std::fmt::Display for Token {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}", String::from_utf8_lossy(self.as_bytes()))
    }
}

/// The identification marker a participant sends on first contact with
/// the fail-safe coordinator.
pub const PARTICIPANT_MARKER: &[u8] = b"Participant acknowledgement.";

/// The marker the primary coordinator sends on first contact with the
/// fail-safe coordinator. The fail-safe coordinator classifies a peer
/// as the primary by checking whether its first frame *contains* this
/// substring, so this constant doubles as both "what the coordinator
/// sends" and "what the fail-safe greps for".
pub const COORDINATOR_MARKER: &[u8] = b"Main Coordinator";

/// contains_marker()
/// Substring search used by the fail-safe coordinator's role
/// classifier.
pub fn contains_marker(haystack: &[u8], needle: &[u8]) -> bool {
    if needle.is_empty() || haystack.len() < needle.len() {
        return needle.is_empty();
    }
    haystack.windows(needle.len()).any(|w| w == needle)
}

const MAX_FRAME_LEN: u32 = 64 * 1024;

/// write_message()
/// Writes a length-prefixed frame: a 4-byte big-endian length followed
/// by `payload`. Avoids relying on every message arriving in its own
/// single `recv()` the way a bare byte-stream write would.
pub fn write_message<W: Write>(writer: &mut W, payload: &[u8]) -> io::Result<()> {
    let len = payload.len() as u32;
    writer.write_all(&len.to_be_bytes())?;
    writer.write_all(payload)?;
    writer.flush()
}

/// read_message()
/// Reads one length-prefixed frame written by `write_message`.
pub fn read_message<R: Read>(reader: &mut R) -> io::Result<Vec<u8>> {
    let mut len_buf = [0u8; 4];
    reader.read_exact(&mut len_buf)?;
    let len = u32::from_be_bytes(len_buf);
    if len > MAX_FRAME_LEN {
        return Err(io::Error::new(
            io::ErrorKind::InvalidData,
            format!("frame of {} bytes exceeds max {}", len, MAX_FRAME_LEN),
        ));
    }
    let mut payload = vec![0u8; len as usize];
    reader.read_exact(&mut payload)?;
    Ok(payload)
}

pub fn write_token<W: Write>(writer: &mut W, token: Token) -> io::Result<()> {
    write_message(writer, token.as_bytes())
}

/// read_token()
/// Reads one frame and requires it to be a recognized token; any other
/// byte sequence is a protocol garble.
pub fn read_token<R: Read>(reader: &mut R) -> io::Result<Token> {
    let bytes = read_message(reader)?;
    Token::from_bytes(&bytes).ok_or_else(|| {
        io::Error::new(
            io::ErrorKind::InvalidData,
            format!("unrecognized protocol token: {:?}", bytes),
        )
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use std::io::Cursor;

    #[test]
    fn token_round_trips_through_framing() {
        let mut buf = Vec::new();
        write_token(&mut buf, Token::VoteCommit).unwrap();
        let mut cursor = Cursor::new(buf);
        assert_eq!(read_token(&mut cursor).unwrap(), Token::VoteCommit);
    }

    #[test]
    fn unrecognized_bytes_are_rejected() {
        let mut buf = Vec::new();
        write_message(&mut buf, b"not a token").unwrap();
        let mut cursor = Cursor::new(buf);
        assert!(read_token(&mut cursor).is_err());
    }

    #[test]
    fn marker_is_found_as_substring() {
        assert!(contains_marker(b"Main Coordinator", COORDINATOR_MARKER));
        assert!(contains_marker(b"prefix Main Coordinator suffix", COORDINATOR_MARKER));
        assert!(!contains_marker(b"Participant acknowledgement.", COORDINATOR_MARKER));
    }

    #[test]
    fn payload_frame_is_opaque() {
        let mut buf = Vec::new();
        write_message(&mut buf, b"INSERT INTO transaction_table VALUES ('a', 1)").unwrap();
        let mut cursor = Cursor::new(buf);
        let payload = read_message(&mut cursor).unwrap();
        assert_eq!(payload, b"INSERT INTO transaction_table VALUES ('a', 1)");
    }
}
