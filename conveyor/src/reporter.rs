//! Reporters: sinks for per-tuple outcomes.
//!
//! Distinct from emitters, which sink extracted content. A reporter's own
//! failures are logged and dropped; they never cascade into the run.

pub mod store;

use std::time::Duration;

use crate::status::{PipesResult, TotalCount};
use crate::tuple::FetchEmitTuple;

/// Records per-tuple outcomes and periodic total-count progress.
pub trait Reporter: Send {
    fn report(&mut self, tuple: &FetchEmitTuple, result: &PipesResult, elapsed: Duration);

    /// Periodic progress, from sources that can compute an upper bound.
    fn total(&mut self, _count: TotalCount) {}

    /// Flush and release resources.
    fn close(&mut self) {}
}

/// Discards everything.
pub struct NoopReporter;

impl Reporter for NoopReporter {
    fn report(&mut self, _tuple: &FetchEmitTuple, _result: &PipesResult, _elapsed: Duration) {}
}

/// Writes one structured log line per outcome.
pub struct LogReporter;

impl Reporter for LogReporter {
    fn report(&mut self, tuple: &FetchEmitTuple, result: &PipesResult, elapsed: Duration) {
        match &result.message {
            Some(message) => log::info!(
                target: "reporter",
                "{} {} {}ms: {message}",
                tuple.id,
                result.status,
                elapsed.as_millis()
            ),
            None => log::info!(
                target: "reporter",
                "{} {} {}ms",
                tuple.id,
                result.status,
                elapsed.as_millis()
            ),
        }
    }

    fn total(&mut self, count: TotalCount) {
        log::info!(target: "reporter", "Progress: {} tuple(s), {:?}", count.count, count.status);
    }
}
