//! The orchestrator runtime.
//!
//! `init` wires the registry, queues, worker pool, parser gateway and
//! drains; `run` blocks until the source is exhausted or a shutdown
//! signal arrives. A first signal stops intake and waits out the grace
//! period; a second signal, or the grace expiring, cancels in-flight
//! forked parses.

use std::collections::{BTreeMap, HashSet};
use std::path::PathBuf;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::time::Duration;
use std::{env, io, thread};

use crossbeam_channel as chan;

use conveyor::config::{Config, ConfigError};
use conveyor::parser::CompositeParser;
use conveyor::registry::{BuildContext, Registry};
use conveyor::source::TupleSource;
use conveyor::status::{PipesResult, Status, TotalCountStatus};
use conveyor::temp::{self, RunDir};

use crate::gateway::Gateway;
use crate::signals::Signal;
use crate::supervisor::{self, Supervisor};
use crate::worker::{self, EmitDrain, Pool, Report, ReporterDrain, Summary};

/// Report a total count every this many tuples.
const TOTAL_REPORT_EVERY: u64 = 100;
/// Consecutive source errors tolerated before giving up on the source.
const MAX_SOURCE_ERRORS: u32 = 3;
/// Bound on the hard-cancellation wait, so a wedged in-process parse
/// cannot hold the process forever.
const CANCEL_TIMEOUT: Duration = Duration::from_secs(30);

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Registry(#[from] conveyor::registry::Error),
    #[error("i/o error: {0}")]
    Io(#[from] io::Error),
    #[error("shutdown did not complete in time")]
    CancelTimeout,
}

/// What a finished run reports back to `main`.
#[derive(Debug)]
pub struct Outcome {
    pub summary: Summary,
    /// Set when the run was hard-cancelled rather than drained.
    pub interrupted: bool,
}

/// Holds join handles to the runtime threads.
pub struct Runtime {
    shutdown: Arc<AtomicBool>,
    signals: chan::Receiver<Signal>,
    grace: Duration,
    gateway: Arc<Gateway>,
    temp: Arc<RunDir>,
    driver: thread::JoinHandle<()>,
    pool_done: chan::Receiver<()>,
    summary_rx: chan::Receiver<Summary>,
}

impl Runtime {
    /// Initialize the runtime.
    ///
    /// This function spawns threads.
    pub fn init(config: Config, signals: chan::Receiver<Signal>) -> Result<Runtime, Error> {
        let pipes = config.pipes.clone();

        let temp_base = temp::base_dir(pipes.temp_dir.as_deref());
        match temp::sweep(&temp_base, pipes.temp_retention()) {
            Ok(0) => {}
            Ok(n) => log::info!(target: "node", "Swept {n} stale run director(ies) from {}", temp_base.display()),
            Err(e) => log::warn!(target: "node", "Temp sweep failed: {e}"),
        }
        let temp = Arc::new(RunDir::create(&temp_base)?);
        log::info!(target: "node", "Run directory is {}", temp.path().display());

        let mut registry = Registry::load(&config, &BuildContext { temp: temp.clone() })?;
        let (source_id, source) = registry.take_sole_source()?;
        let reporters = registry.take_reporters();
        log::info!(
            target: "node",
            "Source is `{source_id}`; {} emitter(s), {} reporter(s)",
            registry.emitters().count(),
            reporters.len()
        );

        let gateway = if pipes.forked {
            let command = match pipes.worker_command.clone() {
                Some(command) => command,
                None => default_worker_command()?,
            };
            log::info!(
                target: "node",
                "Parsing in {} forked child(ren) via {}", pipes.max_forked_children, command.display()
            );
            Gateway::Forked {
                supervisor: Supervisor::spawn(supervisor::Config {
                    children: pipes.max_forked_children,
                    command,
                    memory_high_water: pipes.memory_high_water_mark,
                    parse_timeout: pipes.parse_timeout(),
                    client_timeout: pipes.client_timeout(),
                    ping_interval: pipes.ping_interval(),
                    ping_timeout: pipes.ping_timeout(),
                }),
                max_embedded_depth: pipes.max_embedded_depth,
                inline_threshold: pipes.inline_threshold_bytes,
                temp: temp.clone(),
            }
        } else {
            log::info!(target: "node", "Parsing in-process");
            Gateway::InProcess {
                composite: CompositeParser::default(),
                max_embedded_depth: pipes.max_embedded_depth,
            }
        };
        let gateway = Arc::new(gateway);
        let shutdown = Arc::new(AtomicBool::new(false));

        let (work_tx, work_rx) = chan::bounded(pipes.work_queue_capacity());
        let (report_tx, report_rx) = chan::unbounded::<Report>();

        // One bounded queue and drain thread per emitter.
        let mut emit_txs = BTreeMap::new();
        for (id, emitter) in registry.emitters() {
            let (emit_tx, emit_rx) = chan::bounded(pipes.emit_batch_size.max(1) * 2);
            let drain = EmitDrain {
                emitter_id: id.to_owned(),
                emitter: emitter.clone(),
                jobs: emit_rx,
                report_tx: report_tx.clone(),
                batch_size: pipes.emit_batch_size,
                batch_timeout: pipes.emit_batch_timeout(),
                retries: pipes.emit_retries,
            };
            thread::Builder::new()
                .name(format!("emit@{id}"))
                .spawn(move || drain.run())
                .expect("thread label must not contain NULL bytes");
            emit_txs.insert(id.to_owned(), emit_tx);
        }

        let (summary_tx, summary_rx) = chan::bounded(1);
        let reporter_drain = ReporterDrain {
            reporters,
            events: report_rx,
        };
        thread::Builder::new()
            .name("reporter".to_owned())
            .spawn(move || summary_tx.send(reporter_drain.run()).ok())
            .expect("thread label must not contain NULL bytes");

        let pool = Pool::with(
            work_rx,
            worker::Config {
                capacity: pipes.num_workers.max(1),
                fetch_retries: pipes.fetch_retries,
                fetchers: registry
                    .fetchers()
                    .map(|(id, f)| (id.to_owned(), f.clone()))
                    .collect(),
                gateway: gateway.clone(),
                emit_txs,
                report_tx: report_tx.clone(),
                shutdown: shutdown.clone(),
            },
        );
        let (pool_done_tx, pool_done) = chan::bounded(1);
        thread::Builder::new()
            .name("pool".to_owned())
            .spawn(move || {
                pool.run();
                pool_done_tx.send(()).ok();
            })
            .expect("thread label must not contain NULL bytes");

        let driver = thread::Builder::new()
            .name(format!("source@{source_id}"))
            .spawn({
                let shutdown = shutdown.clone();
                move || drive_source(source, work_tx, report_tx, shutdown)
            })
            .expect("thread label must not contain NULL bytes");

        Ok(Runtime {
            shutdown,
            signals,
            grace: pipes.shutdown_grace(),
            gateway,
            temp,
            driver,
            pool_done,
            summary_rx,
        })
    }

    pub fn run(self) -> Result<Outcome, Error> {
        let mut interrupted = false;

        let summary = chan::select! {
            recv(self.summary_rx) -> summary => summary.unwrap_or_default(),
            recv(self.signals) -> signal => {
                if let Ok(signal) = signal {
                    log::info!(target: "node", "{signal} received; waiting for in-flight work..");
                }
                self.shutdown.store(true, Ordering::SeqCst);

                chan::select! {
                    recv(self.summary_rx) -> summary => summary.unwrap_or_default(),
                    recv(self.signals) -> signal => {
                        if let Ok(signal) = signal {
                            log::warn!(target: "node", "Second signal ({signal}); cancelling..");
                        }
                        interrupted = true;
                        self.cancel()?
                    }
                    default(self.grace) => {
                        log::warn!(target: "node", "Shutdown grace expired; cancelling..");
                        interrupted = true;
                        self.cancel()?
                    }
                }
            }
        };

        self.pool_done.recv_timeout(CANCEL_TIMEOUT).ok();
        self.driver.join().ok();

        // Workers are gone; we should hold the last reference.
        match Arc::try_unwrap(self.gateway) {
            Ok(gateway) => gateway.shutdown(),
            Err(gateway) => gateway.cancel(),
        }

        log::info!(target: "node", "Cleaning up run directory..");
        if let Ok(temp) = Arc::try_unwrap(self.temp) {
            temp.close().ok();
        }

        log::info!(target: "node", "Run complete: {summary}");
        Ok(Outcome {
            summary,
            interrupted,
        })
    }

    /// Hard-cancel in-flight work and wait, bounded, for the pipeline to
    /// unwind.
    fn cancel(&self) -> Result<Summary, Error> {
        self.gateway.cancel();
        self.summary_rx
            .recv_timeout(CANCEL_TIMEOUT)
            .map_err(|_| Error::CancelTimeout)
    }
}

/// The source driver: the single consumer of the tuple source. Applies
/// run-wide deduplication, feeds the bounded work queue (blocking when
/// full), and reports total counts.
fn drive_source(
    mut source: Box<dyn TupleSource>,
    work_tx: chan::Sender<conveyor::tuple::FetchEmitTuple>,
    report_tx: chan::Sender<Report>,
    shutdown: Arc<AtomicBool>,
) {
    let mut seen = HashSet::new();
    let mut produced: u64 = 0;
    let mut errors: u32 = 0;

    let total = source.total_count();
    if total.status != TotalCountStatus::Unsupported {
        report_tx.send(Report::Total(total)).ok();
    }

    loop {
        if shutdown.load(Ordering::SeqCst) {
            log::debug!(target: "source", "Stopping intake on shutdown..");
            break;
        }
        match source.next_tuple() {
            Ok(Some(tuple)) => {
                errors = 0;
                if !seen.insert(tuple.id.clone()) {
                    log::debug!(target: "source", "Duplicate tuple `{}`; skipping", tuple.id);
                    report_tx
                        .send(Report::Tuple {
                            tuple,
                            result: PipesResult::new(Status::Skipped),
                            elapsed: Duration::ZERO,
                        })
                        .ok();
                    continue;
                }
                produced += 1;
                // Blocks when the queue is full: backpressure.
                if work_tx.send(tuple).is_err() {
                    break;
                }
                if produced % TOTAL_REPORT_EVERY == 0 {
                    let total = source.total_count();
                    if total.status != TotalCountStatus::Unsupported {
                        report_tx.send(Report::Total(total)).ok();
                    }
                }
            }
            Ok(None) => {
                log::info!(target: "source", "Source exhausted after {produced} tuple(s)");
                let total = source.total_count();
                if total.status != TotalCountStatus::Unsupported {
                    report_tx.send(Report::Total(total)).ok();
                }
                break;
            }
            Err(e) => {
                errors += 1;
                log::error!(target: "source", "Source error ({errors}/{MAX_SOURCE_ERRORS}): {e}");
                if errors >= MAX_SOURCE_ERRORS {
                    break;
                }
                thread::sleep(Duration::from_millis(100));
            }
        }
    }
    // Dropping the sender ends intake; workers drain what's queued.
}

/// The child worker binary that ships next to this one.
fn default_worker_command() -> Result<PathBuf, io::Error> {
    let exe = env::current_exe()?;
    let dir = exe.parent().ok_or_else(|| {
        io::Error::new(io::ErrorKind::NotFound, "executable has no parent directory")
    })?;
    Ok(dir.join("conveyor-worker"))
}
