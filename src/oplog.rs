//!
//! oplog.rs
//! Append-only, per-role run log. Each role (coordinator, fail-safe,
//! participant) keeps one of these alongside the `log`/`stderrlog`
//! console stream: `stderrlog` covers the console half from `main.rs`,
//! this covers the file half with one structured record per line so a
//! run can be replayed or diffed afterward.
//!
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::Path;
use std::time::{SystemTime, UNIX_EPOCH};

use serde::Serialize;

use crate::protocol::Token;

#[derive(Serialize)]
struct LogEntry<'a> {
    unix_millis: u128,
    peer: Option<&'a str>,
    token: Option<&'static str>,
    note: &'a str,
}

/// OpLog
/// A single append-only JSON-lines file. One line per protocol
/// transition observed by the owning role.
pub struct OpLog {
    file: File,
}

impl OpLog {
    pub fn new(path: impl AsRef<Path>) -> io::Result<OpLog> {
        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(path)?;
        Ok(OpLog { file })
    }

    /// append()
    /// Records one transition: which peer it involved (if any), which
    /// wire token was sent or received (if any), and a short
    /// human-readable note. `token` is `None` for events that aren't a
    /// token exchange (e.g. "accepted connection").
    pub fn append(&mut self, peer: Option<&str>, token: Option<Token>, note: &str) -> io::Result<()> {
        let unix_millis = SystemTime::now()
            .duration_since(UNIX_EPOCH)
            .unwrap_or_default()
            .as_millis();
        let entry = LogEntry {
            unix_millis,
            peer,
            token: token.map(|t| {
                // Leak-free: all token byte strings are 'static already.
                std::str::from_utf8(t.as_bytes()).unwrap_or("?")
            }),
            note,
        };
        let line = serde_json::to_string(&entry)
            .unwrap_or_else(|_| String::from("{\"note\":\"<unserializable log entry>\"}"));
        self.file.write_all(line.as_bytes())?;
        self.file.write_all(b"\n")?;
        self.file.flush()
    }
}
