//! Tuple sources: the upstream end of the pipeline.
//!
//! A source produces a lazy, possibly infinite sequence of work tuples.
//! Sources are single-consumer and not restartable; restarting a run means
//! building a new instance.

pub mod manifest;
pub mod walk;

use std::io;

use crate::status::TotalCount;
use crate::tuple::FetchEmitTuple;

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("malformed tuple: {0}")]
    Malformed(String),
}

/// Produces the sequence of work tuples for a run.
///
/// `next_tuple` is called from a single consumer; implementations need not
/// be safe for concurrent calls.
pub trait TupleSource: Send {
    /// The next tuple, or `None` at end of stream.
    fn next_tuple(&mut self) -> Result<Option<FetchEmitTuple>, Error>;

    /// Progress of the run, if the source can compute an upper bound.
    fn total_count(&self) -> TotalCount {
        TotalCount::unsupported()
    }
}
