//! The worker pool and the queue drains.
//!
//! Each worker takes one tuple at a time end-to-end: fetch, parse, hand
//! off to the emit queue. Emit drains batch per emitter and own the emit
//! retry loop; the reporter drain serializes reporter calls. A worker
//! never panics outward: every failure collapses to a reported status.

use std::collections::BTreeMap;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

use conveyor::emitter::{EmitRecord, Emitter};
use conveyor::fetcher::{self, FetchStream, Fetcher};
use conveyor::metadata::Metadata;
use conveyor::parser::ParseContext;
use conveyor::reporter::Reporter;
use conveyor::status::{PipesResult, Status, TotalCount};
use conveyor::tuple::{FetchEmitTuple, OnParseError};

use crate::gateway::{self, Gateway};

/// Base delay of the shared retry backoff schedule.
const BACKOFF_BASE: Duration = Duration::from_millis(250);

/// Exponential backoff with jitter, shared by the fetch and emit retry
/// loops.
pub(crate) fn backoff(attempt: u32) -> Duration {
    BACKOFF_BASE * 2u32.saturating_pow(attempt) + Duration::from_millis(fastrand::u64(..100))
}

/// An event for the reporter drain.
pub enum Report {
    Tuple {
        tuple: FetchEmitTuple,
        result: PipesResult,
        elapsed: Duration,
    },
    Total(TotalCount),
}

/// A parsed tuple awaiting emission.
pub struct EmitJob {
    pub tuple: FetchEmitTuple,
    /// Parse records, container first.
    pub records: Vec<Metadata>,
    /// Set when a parse exception rode through under the emit policy.
    pub parse_error: Option<String>,
    /// When the worker dequeued the tuple; reported elapsed time runs
    /// until the emit outcome.
    pub started: Instant,
}

/// Worker pool configuration.
pub struct Config {
    /// Number of worker threads.
    pub capacity: usize,
    /// Transient fetch failures are retried this many times.
    pub fetch_retries: u32,
    /// Fetcher instances, by id.
    pub fetchers: BTreeMap<String, Arc<dyn Fetcher>>,
    pub gateway: Arc<Gateway>,
    /// Emit queues, by emitter id.
    pub emit_txs: BTreeMap<String, chan::Sender<EmitJob>>,
    pub report_tx: chan::Sender<Report>,
    /// When set, workers stop taking new tuples.
    pub shutdown: Arc<AtomicBool>,
}

/// A worker that runs tuples through fetch and parse.
struct Worker {
    id: usize,
    tasks: chan::Receiver<FetchEmitTuple>,
    fetch_retries: u32,
    fetchers: BTreeMap<String, Arc<dyn Fetcher>>,
    gateway: Arc<Gateway>,
    emit_txs: BTreeMap<String, chan::Sender<EmitJob>>,
    report_tx: chan::Sender<Report>,
    shutdown: Arc<AtomicBool>,
}

impl Worker {
    /// Waits for tuples and runs them. Exits when the work queue
    /// disconnects or shutdown is flagged.
    fn run(self) {
        loop {
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            let tuple = match self.tasks.recv() {
                Ok(tuple) => tuple,
                Err(chan::RecvError) => break,
            };
            // Queued but not started at shutdown: dropped, not reported.
            if self.shutdown.load(Ordering::SeqCst) {
                break;
            }
            self.process(tuple);
        }
        log::trace!(target: "worker", "Worker #{} exiting..", self.id);
    }

    fn process(&self, tuple: FetchEmitTuple) {
        let started = Instant::now();
        log::debug!(target: "worker", "Worker #{} processing `{}`..", self.id, tuple.id);

        let Some(fetcher) = self.fetchers.get(&tuple.fetch_key.fetcher_id) else {
            self.report(
                tuple.clone(),
                PipesResult::with_message(
                    Status::FetchException,
                    format!("no fetcher with id `{}`", tuple.fetch_key.fetcher_id),
                ),
                started,
            );
            return;
        };
        let fetcher = fetcher.clone();
        let mut metadata = tuple.metadata.clone();
        let stream = match self.fetch(fetcher.as_ref(), &tuple, &mut metadata) {
            Ok(stream) => stream,
            Err(e) => {
                let status = if e.is_not_found() {
                    Status::FetchNotFound
                } else {
                    Status::FetchException
                };
                self.report(tuple, PipesResult::with_message(status, e.to_string()), started);
                return;
            }
        };

        let reply = match self.gateway.parse(&tuple.id, metadata, stream) {
            Ok(reply) => reply,
            Err(gateway::Error::Read(e)) => {
                self.report(
                    tuple,
                    PipesResult::with_message(Status::FetchException, e.to_string()),
                    started,
                );
                return;
            }
            Err(gateway::Error::Forked(failure)) => {
                self.report(
                    tuple,
                    PipesResult::with_message(failure.status(), failure.to_string()),
                    started,
                );
                return;
            }
        };

        let (records, parse_error) = match reply.status {
            Status::ParseSuccess => (reply.metadata, None),
            Status::ParseSuccessWithException => (reply.metadata, reply.message),
            Status::Empty => {
                self.report(tuple, PipesResult::new(Status::Empty), started);
                return;
            }
            Status::IntermediateParseException => match tuple.on_parse_error {
                OnParseError::Skip => {
                    let mut result = PipesResult::new(Status::ParseExceptionNoEmit);
                    result.message = reply.message;
                    result.metadata = Some(reply.metadata);
                    self.report(tuple, result, started);
                    return;
                }
                OnParseError::Emit => {
                    let message = reply
                        .message
                        .unwrap_or_else(|| "parse failed".to_owned());
                    (reply.metadata, Some(message))
                }
            },
            status => {
                // A parse-stage status we don't fold; pass it through.
                let mut result = PipesResult::new(status);
                result.message = reply.message;
                self.report(tuple, result, started);
                return;
            }
        };
        if records.is_empty() {
            self.report(tuple, PipesResult::new(Status::Empty), started);
            return;
        }

        let Some(emit_tx) = self.emit_txs.get(&tuple.emit_key.emitter_id) else {
            self.report(
                tuple.clone(),
                PipesResult::with_message(
                    Status::NoEmitterFound,
                    format!("no emitter with id `{}`", tuple.emit_key.emitter_id),
                ),
                started,
            );
            return;
        };
        let job = EmitJob {
            tuple,
            records,
            parse_error,
            started,
        };
        if let Err(chan::SendError(job)) = emit_tx.send(job) {
            // The drain is gone; the run is shutting down.
            self.report(
                job.tuple,
                PipesResult::new(Status::InterruptedException),
                job.started,
            );
        }
    }

    /// Fetch with the shared backoff schedule. Not-found is terminal.
    fn fetch(
        &self,
        fetcher: &dyn Fetcher,
        tuple: &FetchEmitTuple,
        metadata: &mut Metadata,
    ) -> Result<FetchStream, fetcher::Error> {
        let ctx = ParseContext::default();
        let mut attempt = 0;
        loop {
            match fetcher.fetch(&tuple.fetch_key, metadata, &ctx) {
                Ok(stream) => return Ok(stream),
                Err(e) if e.is_not_found() => return Err(e),
                Err(e) => {
                    if attempt >= self.fetch_retries {
                        return Err(e);
                    }
                    log::warn!(
                        target: "worker",
                        "Fetch of `{}` failed (attempt {}): {e}; retrying..",
                        tuple.fetch_key.key,
                        attempt + 1
                    );
                    thread::sleep(backoff(attempt));
                    attempt += 1;
                }
            }
        }
    }

    fn report(&self, tuple: FetchEmitTuple, result: PipesResult, started: Instant) {
        self.report_tx
            .send(Report::Tuple {
                tuple,
                result,
                elapsed: started.elapsed(),
            })
            .ok();
    }
}

/// A pool of workers. One thread is allocated for each worker.
pub struct Pool {
    pool: Vec<thread::JoinHandle<()>>,
}

impl Pool {
    /// Create a new worker pool with the given parameters.
    pub fn with(tasks: chan::Receiver<FetchEmitTuple>, config: Config) -> Self {
        let mut pool = Vec::with_capacity(config.capacity);
        for i in 0..config.capacity {
            let worker = Worker {
                id: i,
                tasks: tasks.clone(),
                fetch_retries: config.fetch_retries,
                fetchers: config.fetchers.clone(),
                gateway: config.gateway.clone(),
                emit_txs: config.emit_txs.clone(),
                report_tx: config.report_tx.clone(),
                shutdown: config.shutdown.clone(),
            };
            let thread = thread::Builder::new()
                .name(format!("worker#{i}"))
                .spawn(|| worker.run())
                .expect("thread label must not contain NULL bytes");

            pool.push(thread);
        }
        Self { pool }
    }

    /// Run the worker pool.
    ///
    /// Blocks until all worker threads have exited.
    pub fn run(self) {
        for worker in self.pool {
            worker.join().ok();
        }
        log::debug!(target: "worker", "Worker pool shutting down..");
    }
}

/// Drains one emitter's queue, batching up to the configured size or
/// timeout, whichever comes first.
pub struct EmitDrain {
    pub emitter_id: String,
    pub emitter: Arc<dyn Emitter>,
    pub jobs: chan::Receiver<EmitJob>,
    pub report_tx: chan::Sender<Report>,
    pub batch_size: usize,
    pub batch_timeout: Duration,
    pub retries: u32,
}

impl EmitDrain {
    pub fn run(self) {
        loop {
            // A batch opens with the first job and closes on size,
            // timeout, or disconnect.
            let first = match self.jobs.recv() {
                Ok(job) => job,
                Err(chan::RecvError) => break,
            };
            let mut batch = vec![first];
            let deadline = Instant::now() + self.batch_timeout;
            let mut disconnected = false;

            while batch.len() < self.batch_size.max(1) {
                let Some(remaining) = deadline.checked_duration_since(Instant::now()) else {
                    break;
                };
                match self.jobs.recv_timeout(remaining) {
                    Ok(job) => batch.push(job),
                    Err(chan::RecvTimeoutError::Timeout) => break,
                    Err(chan::RecvTimeoutError::Disconnected) => {
                        disconnected = true;
                        break;
                    }
                }
            }
            self.flush(batch);

            if disconnected {
                break;
            }
        }
        log::debug!(target: "emitter", "Emit drain for `{}` exiting..", self.emitter_id);
    }

    fn flush(&self, batch: Vec<EmitJob>) {
        let records: Vec<EmitRecord> = batch
            .iter()
            .map(|job| {
                EmitRecord::new(
                    job.tuple.emit_key.clone(),
                    job.tuple.id.clone(),
                    job.records.clone(),
                )
            })
            .collect();

        let mut attempt = 0;
        let outcome = loop {
            match self.emitter.emit_batch(&records) {
                Ok(()) => break Ok(()),
                Err(e) if e.is_retryable() && attempt < self.retries => {
                    log::warn!(
                        target: "emitter",
                        "Emit batch of {} to `{}` failed (attempt {}): {e}; retrying..",
                        records.len(),
                        self.emitter_id,
                        attempt + 1
                    );
                    thread::sleep(backoff(attempt));
                    attempt += 1;
                }
                Err(e) => break Err(e),
            }
        };
        if let Err(e) = &outcome {
            log::error!(
                target: "emitter",
                "Emit batch of {} to `{}` failed: {e}",
                records.len(),
                self.emitter_id
            );
        }

        for job in batch {
            let result = match (&outcome, &job.parse_error) {
                (Ok(()), None) => PipesResult::new(Status::EmitSuccess),
                (Ok(()), Some(message)) => {
                    PipesResult::with_message(Status::EmitSuccessParseException, message)
                }
                (Err(e), _) => PipesResult::with_message(Status::EmitException, e.to_string()),
            };
            self.report_tx
                .send(Report::Tuple {
                    tuple: job.tuple,
                    result,
                    elapsed: job.started.elapsed(),
                })
                .ok();
        }
    }
}

/// End-of-run tallies for the summary line.
#[derive(Debug, Default, Clone, Copy, PartialEq, Eq)]
pub struct Summary {
    pub succeeded: u64,
    pub failed: u64,
    pub skipped: u64,
}

impl Summary {
    fn add(&mut self, status: Status) {
        if status.is_success() {
            self.succeeded += 1;
        } else if status.is_skipped() {
            self.skipped += 1;
        } else {
            self.failed += 1;
        }
    }

    pub fn total(&self) -> u64 {
        self.succeeded + self.failed + self.skipped
    }
}

impl std::fmt::Display for Summary {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(
            f,
            "{} succeeded, {} failed, {} skipped",
            self.succeeded, self.failed, self.skipped
        )
    }
}

/// Serializes all reporter calls on one thread.
pub struct ReporterDrain {
    pub reporters: Vec<(String, Box<dyn Reporter>)>,
    pub events: chan::Receiver<Report>,
}

impl ReporterDrain {
    /// Consume events until every sender is gone, then close the
    /// reporters and return the run summary.
    pub fn run(mut self) -> Summary {
        let mut summary = Summary::default();

        while let Ok(event) = self.events.recv() {
            match event {
                Report::Tuple {
                    tuple,
                    result,
                    elapsed,
                } => {
                    summary.add(result.status);
                    for (_, reporter) in &mut self.reporters {
                        reporter.report(&tuple, &result, elapsed);
                    }
                }
                Report::Total(count) => {
                    for (_, reporter) in &mut self.reporters {
                        reporter.total(count);
                    }
                }
            }
        }
        for (id, reporter) in &mut self.reporters {
            log::debug!(target: "reporter", "Closing reporter `{id}`..");
            reporter.close();
        }
        summary
    }
}
