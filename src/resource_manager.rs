//!
//! resource_manager.rs
//! The participant's local resource manager: a concrete, in-memory
//! stand-in for a real datastore driver, just faithful enough to the
//! `prepare / insert / commit / rollback` interface to drive the
//! protocol end to end. `prepare` ensures a table exists, `insert`
//! executes the staged SQL and turns a failure into a vote, `commit`/
//! `rollback` close out the transaction.
//!
use crate::protocol::Token;

/// ResourceManager
/// The interface the participant drives: open a cursor, stage the
/// transaction's SQL, then durably commit or undo it. A real
/// implementation would wrap a database driver connection; this trait
/// is the seam where one would plug in.
pub trait ResourceManager {
    fn prepare(&mut self);
    fn insert(&mut self, sql: &[u8]) -> Token;
    fn commit(&mut self);
    fn rollback(&mut self);
}

#[derive(Debug, Clone, PartialEq, Eq)]
enum Stage {
    Unprepared,
    Prepared,
    Staged(Vec<u8>),
    Committed,
    RolledBack,
}

/// InMemoryResourceManager
/// Stands in for a SQL database. `insert` parses just enough of an
/// `INSERT INTO transaction_table VALUES ('name', salary)` statement to
/// stage a row; any statement it can't parse, or the `force_abort`
/// knob, drives a `VOTE_ABORT` exactly like a rejected SQL statement
/// would on a real driver.
pub struct InMemoryResourceManager {
    stage: Stage,
    table: Vec<(String, f64)>,
    force_abort: bool,
}

impl InMemoryResourceManager {
    pub fn new() -> InMemoryResourceManager {
        InMemoryResourceManager {
            stage: Stage::Unprepared,
            table: Vec::new(),
            force_abort: false,
        }
    }

    /// Test/demo knob standing in for a SQL error on insert: forces
    /// `insert` to vote abort regardless of the staged statement.
    pub fn with_forced_abort(mut self) -> InMemoryResourceManager {
        self.force_abort = true;
        self
    }

    pub fn committed_rows(&self) -> &[(String, f64)] {
        &self.table
    }

    /// Salary is a decimal column, not an integer one, so it's parsed
    /// as `f64` -- an insert for a fractional salary like `1500.50`
    /// must stage and commit cleanly rather than spuriously voting
    /// abort.
    fn parse_insert(sql: &[u8]) -> Option<(String, f64)> {
        let text = std::str::from_utf8(sql).ok()?;
        let open = text.find('(')?;
        let close = text.rfind(')')?;
        let inner = &text[open + 1..close];
        let mut parts = inner.splitn(2, ',');
        let name = parts.next()?.trim().trim_matches('\'').to_string();
        let salary: f64 = parts.next()?.trim().parse().ok()?;
        Some((name, salary))
    }
}

impl Default for InMemoryResourceManager {
    fn default() -> Self {
        InMemoryResourceManager::new()
    }
}

impl ResourceManager for InMemoryResourceManager {
    fn prepare(&mut self) {
        self.stage = Stage::Prepared;
    }

    fn insert(&mut self, sql: &[u8]) -> Token {
        if self.force_abort {
            return Token::VoteAbort;
        }
        match Self::parse_insert(sql) {
            Some(_row) => {
                self.stage = Stage::Staged(sql.to_vec());
                Token::VoteCommit
            }
            None => Token::VoteAbort,
        }
    }

    fn commit(&mut self) {
        if let Stage::Staged(sql) = std::mem::replace(&mut self.stage, Stage::Committed) {
            if let Some(row) = Self::parse_insert(&sql) {
                self.table.push(row);
            }
        }
    }

    fn rollback(&mut self) {
        self.stage = Stage::RolledBack;
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn commit_after_successful_insert_stages_the_row() {
        let mut rm = InMemoryResourceManager::new();
        rm.prepare();
        assert_eq!(
            rm.insert(b"INSERT INTO transaction_table VALUES ('Ada', 1000)"),
            Token::VoteCommit
        );
        rm.commit();
        assert_eq!(rm.committed_rows(), &[("Ada".to_string(), 1000.0)]);
    }

    #[test]
    fn commit_stages_a_fractional_salary_without_aborting() {
        let mut rm = InMemoryResourceManager::new();
        rm.prepare();
        assert_eq!(
            rm.insert(b"INSERT INTO transaction_table VALUES ('Ada', 1500.50)"),
            Token::VoteCommit
        );
        rm.commit();
        assert_eq!(rm.committed_rows(), &[("Ada".to_string(), 1500.50)]);
    }

    #[test]
    fn rollback_after_insert_discards_the_row() {
        let mut rm = InMemoryResourceManager::new();
        rm.prepare();
        rm.insert(b"INSERT INTO transaction_table VALUES ('Ada', 1000)");
        rm.rollback();
        assert!(rm.committed_rows().is_empty());
    }

    #[test]
    fn forced_abort_never_stages_a_row() {
        let mut rm = InMemoryResourceManager::new().with_forced_abort();
        rm.prepare();
        assert_eq!(
            rm.insert(b"INSERT INTO transaction_table VALUES ('Ada', 1000)"),
            Token::VoteAbort
        );
        rm.commit();
        assert!(rm.committed_rows().is_empty());
    }

    #[test]
    fn commit_on_a_failed_insert_is_a_no_op() {
        // A participant that voted abort due to a bad insert but is
        // later told to commit anyway still calls commit() -- nothing
        // was staged, so it's a no-op, not a crash.
        let mut rm = InMemoryResourceManager::new();
        rm.prepare();
        assert_eq!(rm.insert(b"not valid sql"), Token::VoteAbort);
        rm.commit();
        assert!(rm.committed_rows().is_empty());
    }
}
