//! Table-backed reporter.

use std::collections::HashSet;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use serde::{Deserialize, Serialize};
use sqlite as sql;

use crate::status::{PipesResult, Status, TotalCount};
use crate::tuple::FetchEmitTuple;

use super::Reporter;

/// How long to wait for the database lock to be released before failing
/// a write.
const DB_WRITE_TIMEOUT: Duration = Duration::from_secs(6);

pub const DEFAULT_BATCH_SIZE: usize = 100;
pub const DEFAULT_BATCH_TIMEOUT: Duration = Duration::from_secs(1);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    /// An internal database error.
    #[error("internal error: {0}")]
    Internal(#[from] sql::Error),
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(rename_all = "camelCase", deny_unknown_fields)]
pub struct Options {
    /// Database file path.
    pub path: PathBuf,
    #[serde(default = "default_batch_size")]
    pub batch_size: usize,
    #[serde(default = "default_batch_timeout_millis")]
    pub batch_timeout_millis: u64,
    /// Statuses to persist. When non-empty, takes precedence over
    /// `excludes`.
    #[serde(default)]
    pub includes: Vec<Status>,
    /// Statuses to drop.
    #[serde(default)]
    pub excludes: Vec<Status>,
}

fn default_batch_size() -> usize {
    DEFAULT_BATCH_SIZE
}

fn default_batch_timeout_millis() -> u64 {
    DEFAULT_BATCH_TIMEOUT.as_millis() as u64
}

struct Row {
    fetch_key: String,
    status: Status,
    elapsed_ms: u64,
    reported_at: String,
}

/// A persisted outcome row.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusRow {
    pub fetch_key: String,
    pub status: Status,
    pub elapsed_ms: u64,
    pub reported_at: String,
}

/// Writes outcomes to the `tika_status` table, creating the schema on
/// first use. Inserts are buffered and committed in batches.
pub struct SqliteReporter {
    db: sql::Connection,
    buffer: Vec<Row>,
    batch_size: usize,
    batch_timeout: Duration,
    last_flush: Instant,
    includes: HashSet<Status>,
    excludes: HashSet<Status>,
}

impl SqliteReporter {
    const SCHEMA: &'static str = include_str!("schema.sql");

    /// Open a status store at the given path. Creates the schema if it
    /// doesn't exist.
    pub fn open(options: Options) -> Result<Self, Error> {
        let mut db = sql::Connection::open(&options.path)?;
        db.set_busy_timeout(DB_WRITE_TIMEOUT.as_millis() as usize)?;
        db.execute(Self::SCHEMA)?;

        Ok(Self {
            db,
            buffer: Vec::new(),
            batch_size: options.batch_size.max(1),
            batch_timeout: Duration::from_millis(options.batch_timeout_millis),
            last_flush: Instant::now(),
            includes: options.includes.into_iter().collect(),
            excludes: options.excludes.into_iter().collect(),
        })
    }

    /// Create a new in-memory status store.
    pub fn memory() -> Result<Self, Error> {
        let db = sql::Connection::open(":memory:")?;
        db.execute(Self::SCHEMA)?;

        Ok(Self {
            db,
            buffer: Vec::new(),
            batch_size: DEFAULT_BATCH_SIZE,
            batch_timeout: DEFAULT_BATCH_TIMEOUT,
            last_flush: Instant::now(),
            includes: HashSet::new(),
            excludes: HashSet::new(),
        })
    }

    fn accepts(&self, status: Status) -> bool {
        if !self.includes.is_empty() {
            self.includes.contains(&status)
        } else {
            !self.excludes.contains(&status)
        }
    }

    fn flush(&mut self) {
        if self.buffer.is_empty() {
            self.last_flush = Instant::now();
            return;
        }
        let rows = std::mem::take(&mut self.buffer);
        match commit(&self.db, &rows) {
            Ok(()) => {
                log::trace!(target: "reporter", "Committed {} status row(s)", rows.len())
            }
            // Reporter failures never cascade.
            Err(e) => log::error!(target: "reporter", "Failed to commit status rows: {e}"),
        }
        self.last_flush = Instant::now();
    }

    fn maybe_flush(&mut self) {
        if self.buffer.len() >= self.batch_size || self.last_flush.elapsed() >= self.batch_timeout
        {
            self.flush();
        }
    }

    /// All persisted rows, in insertion order.
    pub fn rows(&self) -> Result<Vec<StatusRow>, Error> {
        let stmt = self.db.prepare(
            "SELECT fetch_key, status, elapsed_ms, reported_at
             FROM `tika_status` ORDER BY rowid",
        )?;
        let mut rows = Vec::new();

        for row in stmt.into_iter() {
            let row = row?;
            let status = row.read::<&str, _>("status");
            rows.push(StatusRow {
                fetch_key: row.read::<&str, _>("fetch_key").to_owned(),
                status: status.parse().unwrap_or(Status::UnspecifiedCrash),
                elapsed_ms: row.read::<i64, _>("elapsed_ms") as u64,
                reported_at: row.read::<&str, _>("reported_at").to_owned(),
            });
        }
        Ok(rows)
    }

    /// Number of rows persisted for the given status.
    pub fn count(&self, status: Status) -> Result<u64, Error> {
        let mut stmt = self
            .db
            .prepare("SELECT COUNT(*) AS n FROM `tika_status` WHERE status = ?1")?;
        stmt.bind((1, status.as_str()))?;

        if let Some(Ok(row)) = stmt.into_iter().next() {
            return Ok(row.read::<i64, _>("n") as u64);
        }
        Ok(0)
    }
}

/// Write a batch of rows inside one transaction, reusing a single
/// prepared insert. Rolls back if any insert fails, so a bad batch never
/// leaves partial rows behind.
fn commit(db: &sql::Connection, rows: &[Row]) -> Result<(), sql::Error> {
    db.execute("BEGIN")?;

    let result: Result<(), sql::Error> = (|| {
        let mut stmt = db.prepare(
            "INSERT INTO `tika_status` (fetch_key, status, elapsed_ms, reported_at)
             VALUES (?1, ?2, ?3, ?4)",
        )?;
        for row in rows {
            stmt.reset()?;
            stmt.bind((1, row.fetch_key.as_str()))?;
            stmt.bind((2, row.status.as_str()))?;
            stmt.bind((3, row.elapsed_ms as i64))?;
            stmt.bind((4, row.reported_at.as_str()))?;
            stmt.next()?;
        }
        Ok(())
    })();

    match result {
        Ok(()) => db.execute("COMMIT"),
        Err(e) => {
            db.execute("ROLLBACK")?;
            Err(e)
        }
    }
}

impl Reporter for SqliteReporter {
    fn report(&mut self, tuple: &FetchEmitTuple, result: &PipesResult, elapsed: Duration) {
        if !self.accepts(result.status) {
            return;
        }
        self.buffer.push(Row {
            fetch_key: tuple.fetch_key.key.clone(),
            status: result.status,
            elapsed_ms: elapsed.as_millis() as u64,
            reported_at: chrono::Utc::now().to_rfc3339(),
        });
        self.maybe_flush();
    }

    fn total(&mut self, count: TotalCount) {
        log::debug!(target: "reporter", "Progress: {} tuple(s), {:?}", count.count, count.status);
    }

    fn close(&mut self) {
        self.flush();
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use crate::tuple::{EmitKey, FetchEmitTuple, FetchKey};

    fn tuple(id: &str) -> FetchEmitTuple {
        FetchEmitTuple::new(
            id,
            FetchKey::new("fs", format!("{id}.txt")),
            EmitKey::new("out", format!("{id}.json")),
        )
    }

    #[test]
    fn test_rows_flushed_on_close() {
        let mut reporter = SqliteReporter::memory().unwrap();
        reporter.report(
            &tuple("a"),
            &PipesResult::new(Status::EmitSuccess),
            Duration::from_millis(12),
        );

        // Still buffered.
        assert_eq!(reporter.count(Status::EmitSuccess).unwrap(), 0);
        reporter.close();
        assert_eq!(reporter.count(Status::EmitSuccess).unwrap(), 1);
    }

    #[test]
    fn test_batch_size_triggers_flush() {
        let mut reporter = SqliteReporter::memory().unwrap();
        reporter.batch_size = 2;

        reporter.report(
            &tuple("a"),
            &PipesResult::new(Status::Timeout),
            Duration::ZERO,
        );
        reporter.report(
            &tuple("b"),
            &PipesResult::new(Status::Timeout),
            Duration::ZERO,
        );
        assert_eq!(reporter.count(Status::Timeout).unwrap(), 2);
    }

    #[test]
    fn test_includes_take_precedence() {
        let mut reporter = SqliteReporter::memory().unwrap();
        reporter.includes = [Status::EmitException].into_iter().collect();
        reporter.excludes = [Status::EmitException].into_iter().collect();

        reporter.report(
            &tuple("a"),
            &PipesResult::new(Status::EmitException),
            Duration::ZERO,
        );
        reporter.report(
            &tuple("b"),
            &PipesResult::new(Status::EmitSuccess),
            Duration::ZERO,
        );
        reporter.close();

        assert_eq!(reporter.count(Status::EmitException).unwrap(), 1);
        assert_eq!(reporter.count(Status::EmitSuccess).unwrap(), 0);
    }
}
