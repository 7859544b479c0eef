//! Forked-worker supervisor.
//!
//! Parses run in long-lived child processes so that a parser that
//! allocates unboundedly, hangs, or crashes takes down a child rather
//! than the run. The supervisor keeps `children` slots filled, routes
//! requests to idle children (most recently used first), enforces the
//! per-parse timeout, heartbeats idle children, and replaces the dead.

use std::io::{BufRead, BufReader};
use std::os::unix::process::ExitStatusExt;
use std::path::PathBuf;
use std::process::{Child as Process, ChildStdin, ChildStdout, Command, Stdio};
use std::sync::atomic::{AtomicBool, AtomicUsize, Ordering};
use std::sync::{Arc, Condvar, Mutex, MutexGuard};
use std::time::{Duration, Instant};
use std::{io, thread};

use crossbeam_channel as chan;

use crate::child::EXIT_RESTART_REQUESTED;
use crate::wire;
use crate::wire::{frame, Frame, ParseReply, ParseRequest};

/// How long a fresh child gets to send its `READY` frame.
const READY_TIMEOUT: Duration = Duration::from_secs(10);
/// How long a child gets to exit after a `SHUTDOWN` frame.
const SHUTDOWN_TIMEOUT: Duration = Duration::from_secs(3);
/// How long to wait for an exit status after the pipe closed.
const REAP_TIMEOUT: Duration = Duration::from_secs(2);
/// Pause before respawning after a failed spawn.
const RESPAWN_BACKOFF: Duration = Duration::from_millis(250);

/// Supervisor configuration.
#[derive(Debug, Clone)]
pub struct Config {
    /// Number of child processes to keep alive.
    pub children: usize,
    /// Path of the child worker binary.
    pub command: PathBuf,
    /// Passed through to the child's self-monitor.
    pub memory_high_water: u64,
    /// Per-parse timeout; on expiry the child is killed.
    pub parse_timeout: Duration,
    /// How long a caller waits for a free child.
    pub client_timeout: Duration,
    pub ping_interval: Duration,
    pub ping_timeout: Duration,
}

/// How a forked parse can fail.
#[derive(thiserror::Error, Debug)]
pub enum Failure {
    #[error("parse timed out")]
    Timeout,
    #[error("child ran out of memory")]
    Oom,
    #[error("child crashed: {0}")]
    Crash(String),
    /// The child rejected the request without parsing, eg. an unreadable
    /// body file.
    #[error("request failed: {0}")]
    Request(String),
    #[error("no child available within the client timeout")]
    Unavailable,
    #[error("interrupted by shutdown")]
    Interrupted,
}

/// A one-shot handle to an idle child. Popped from the idle stack by a
/// caller, consumed by sending one request.
struct ChildClient {
    req_tx: chan::Sender<Request>,
}

struct Request {
    request: ParseRequest,
    reply: chan::Sender<Result<ParseReply, Failure>>,
}

/// LIFO stack of idle children. Last-in first-out keeps recently used
/// children warm.
struct IdlePool {
    stack: Mutex<Vec<ChildClient>>,
    cond: Condvar,
}

impl IdlePool {
    fn new() -> Self {
        Self {
            stack: Mutex::new(Vec::new()),
            cond: Condvar::new(),
        }
    }

    fn lock(&self) -> MutexGuard<'_, Vec<ChildClient>> {
        match self.stack.lock() {
            Ok(guard) => guard,
            Err(poisoned) => poisoned.into_inner(),
        }
    }

    fn push(&self, client: ChildClient) {
        self.lock().push(client);
        self.cond.notify_one();
    }

    fn acquire(&self, timeout: Duration) -> Option<ChildClient> {
        let deadline = Instant::now() + timeout;
        let mut stack = self.lock();
        loop {
            if let Some(client) = stack.pop() {
                return Some(client);
            }
            let remaining = deadline.checked_duration_since(Instant::now())?;
            stack = match self.cond.wait_timeout(stack, remaining) {
                Ok((guard, _)) => guard,
                Err(poisoned) => poisoned.into_inner().0,
            };
        }
    }
}

/// The supervisor: a handle to the monitor threads plus the idle pool.
pub struct Supervisor {
    config: Config,
    idle: Arc<IdlePool>,
    alive: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
    kill_txs: Vec<chan::Sender<()>>,
    monitors: Vec<thread::JoinHandle<()>>,
}

impl Supervisor {
    /// Start the monitor threads. Children are spawned lazily by their
    /// monitors; this call itself cannot fail on a bad worker binary,
    /// which instead surfaces as `Unavailable` parses and spawn errors
    /// in the log.
    pub fn spawn(config: Config) -> Self {
        let idle = Arc::new(IdlePool::new());
        let alive = Arc::new(AtomicUsize::new(0));
        let stopping = Arc::new(AtomicBool::new(false));
        let mut kill_txs = Vec::with_capacity(config.children);
        let mut monitors = Vec::with_capacity(config.children);

        for slot in 0..config.children {
            let (kill_tx, kill_rx) = chan::bounded::<()>(1);
            let monitor = Monitor {
                slot,
                config: config.clone(),
                idle: idle.clone(),
                alive: alive.clone(),
                stopping: stopping.clone(),
                kill_rx,
            };
            let handle = thread::Builder::new()
                .name(format!("supervisor#{slot}"))
                .spawn(move || monitor.run())
                .expect("thread label must not contain NULL bytes");

            kill_txs.push(kill_tx);
            monitors.push(handle);
        }
        Self {
            config,
            idle,
            alive,
            stopping,
            kill_txs,
            monitors,
        }
    }

    /// Route a parse to an idle child and await the reply. Blocks up to
    /// the client timeout for a slot, then up to the parse timeout for
    /// the reply.
    pub fn parse(&self, request: ParseRequest) -> Result<ParseReply, Failure> {
        let deadline = Instant::now() + self.config.client_timeout;
        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .ok_or(Failure::Unavailable)?;
            let client = self.idle.acquire(remaining).ok_or(Failure::Unavailable)?;
            let (reply_tx, reply_rx) = chan::bounded(1);

            // A stale token addresses a child that was replaced; try for
            // a fresh one until the deadline.
            if client
                .req_tx
                .send(Request {
                    request: request.clone(),
                    reply: reply_tx,
                })
                .is_err()
            {
                continue;
            }
            return match reply_rx.recv() {
                Ok(result) => result,
                Err(chan::RecvError) => Err(Failure::Interrupted),
            };
        }
    }

    /// Number of live child processes.
    pub fn child_count(&self) -> usize {
        self.alive.load(Ordering::SeqCst)
    }

    /// Interrupt in-flight parses and kill the children, without joining
    /// the monitors. Used on hard cancellation.
    pub fn kill_all(&self) {
        self.stopping.store(true, Ordering::SeqCst);
        for kill_tx in &self.kill_txs {
            kill_tx.try_send(()).ok();
        }
    }

    /// Stop all children and wait for the monitors to exit.
    pub fn shutdown(self) {
        log::debug!(target: "supervisor", "Shutting down {} child slot(s)..", self.monitors.len());
        self.kill_all();
        for monitor in self.monitors {
            monitor.join().ok();
        }
    }
}

/// Why a child is being replaced.
enum Replace {
    /// Supervisor shutdown; do not respawn.
    Shutdown,
    /// The child died. `silent` when it died idle or asked for a restart.
    Dead { silent: bool },
    /// Killed after missing the parse deadline.
    TimedOut,
    /// Killed after missing a heartbeat.
    Unresponsive,
}

/// One child slot: spawns, serves, reaps, respawns.
struct Monitor {
    slot: usize,
    config: Config,
    idle: Arc<IdlePool>,
    alive: Arc<AtomicUsize>,
    stopping: Arc<AtomicBool>,
    kill_rx: chan::Receiver<()>,
}

/// A live child process with its pipes.
struct Live {
    process: Process,
    stdin: ChildStdin,
    frames: chan::Receiver<Result<Frame, wire::Error>>,
}

impl Monitor {
    fn run(self) {
        while !self.stopping.load(Ordering::SeqCst) {
            let mut live = match self.spawn_child() {
                Ok(live) => live,
                Err(e) => {
                    log::error!(target: "supervisor", "Failed to spawn child #{}: {e}", self.slot);
                    // Jittered pause so a broken binary doesn't spin.
                    thread::sleep(RESPAWN_BACKOFF + Duration::from_millis(fastrand::u64(..250)));
                    continue;
                }
            };
            self.alive.fetch_add(1, Ordering::SeqCst);
            log::debug!(
                target: "supervisor",
                "Child #{} up (pid {})", self.slot, live.process.id()
            );

            let replace = self.serve(&mut live);
            match &replace {
                Replace::Shutdown => self.stop_child(&mut live, true),
                Replace::Dead { silent } => {
                    if !silent {
                        log::warn!(target: "supervisor", "Child #{} died; replacing..", self.slot);
                    }
                    self.stop_child(&mut live, false)
                }
                Replace::TimedOut => {
                    log::warn!(target: "supervisor", "Child #{} timed out; killing..", self.slot);
                    self.stop_child(&mut live, false)
                }
                Replace::Unresponsive => {
                    log::warn!(
                        target: "supervisor",
                        "Child #{} missed its heartbeat; killing..", self.slot
                    );
                    self.stop_child(&mut live, false)
                }
            }
            self.alive.fetch_sub(1, Ordering::SeqCst);

            if matches!(replace, Replace::Shutdown) {
                break;
            }
        }
        log::debug!(target: "supervisor", "Monitor #{} exiting..", self.slot);
    }

    fn spawn_child(&self) -> io::Result<Live> {
        let mut process = Command::new(&self.config.command)
            .arg("--memory-high-water")
            .arg(self.config.memory_high_water.to_string())
            .stdin(Stdio::piped())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .spawn()?;

        let stdin = process.stdin.take().expect("stdin is piped");
        let stdout = process.stdout.take().expect("stdout is piped");
        let stderr = process.stderr.take().expect("stderr is piped");
        let slot = self.slot;

        // Forward the child's log lines into ours.
        thread::Builder::new()
            .name(format!("child-log#{slot}"))
            .spawn(move || {
                for line in BufReader::new(stderr).lines().map_while(Result::ok) {
                    log::debug!(target: "child", "#{slot}: {line}");
                }
            })
            .ok();

        let (frame_tx, frames) = chan::bounded(1);
        thread::Builder::new()
            .name(format!("child-read#{slot}"))
            .spawn(move || read_frames(stdout, frame_tx))
            .ok();

        let mut live = Live {
            process,
            stdin,
            frames,
        };
        // Handshake: the child announces readiness once initialized.
        match live.frames.recv_timeout(READY_TIMEOUT) {
            Ok(Ok(Frame::Ready)) => Ok(live),
            other => {
                kill(&mut live.process);
                reap(&mut live.process);
                Err(io::Error::new(
                    io::ErrorKind::InvalidData,
                    format!("child did not become ready: {other:?}"),
                ))
            }
        }
    }

    /// Serve requests on a live child until it needs replacing.
    ///
    /// At most one idle token for this child is on the stack at a time;
    /// when the child is replaced, dropping `req_rx` invalidates any
    /// token still out there (sends on it fail and the caller retries).
    fn serve(&self, live: &mut Live) -> Replace {
        let Live {
            process,
            stdin,
            frames,
        } = live;
        let frames = &*frames;
        let (req_tx, req_rx) = chan::bounded::<Request>(1);
        let mut token_out = false;

        loop {
            if !token_out {
                self.idle.push(ChildClient {
                    req_tx: req_tx.clone(),
                });
                token_out = true;
            }

            chan::select! {
                recv(req_rx) -> req => {
                    let Ok(req) = req else { return Replace::Shutdown };
                    token_out = false;
                    match self.serve_one(stdin, frames, process, req) {
                        None => {} // go idle again
                        Some(replace) => return replace,
                    }
                }
                recv(self.kill_rx) -> _ => return Replace::Shutdown,
                recv(frames) -> frame => match frame {
                    // Nothing is expected while idle; an eof or protocol
                    // error means the child died and is silently replaced.
                    Ok(Ok(frame)) => {
                        log::warn!(
                            target: "supervisor",
                            "Unexpected frame {:#04x} from idle child #{}", frame.type_byte(), self.slot
                        );
                    }
                    _ => return Replace::Dead { silent: true },
                },
                default(self.config.ping_interval) => {
                    if let Some(replace) = self.heartbeat(stdin, frames, process) {
                        return replace;
                    }
                }
            }
        }
    }

    /// Write the request, await `RESULT`/`ERROR` within the parse
    /// deadline. Returns the replacement reason, or `None` to keep the
    /// child.
    fn serve_one(
        &self,
        stdin: &mut ChildStdin,
        frames: &chan::Receiver<Result<Frame, wire::Error>>,
        process: &mut Process,
        req: Request,
    ) -> Option<Replace> {
        let Request { request, reply } = req;
        let id = request.id.clone();

        if frame::write(stdin, &Frame::Parse(request)).is_err() {
            // The write end broke: the child died taking the request.
            let failure = exit_failure(process);
            reply.send(Err(failure)).ok();
            return Some(Replace::Dead { silent: false });
        }
        let deadline = Instant::now() + self.config.parse_timeout;

        loop {
            let remaining = deadline
                .checked_duration_since(Instant::now())
                .unwrap_or(Duration::ZERO);

            chan::select! {
                recv(frames) -> frame => match frame {
                    Ok(Ok(Frame::Result(parse_reply))) => {
                        reply.send(Ok(parse_reply)).ok();
                        return None;
                    }
                    Ok(Ok(Frame::Error(e))) => {
                        reply.send(Err(Failure::Request(e.message))).ok();
                        return None;
                    }
                    Ok(Ok(Frame::Pong)) => {
                        // A late reply to a pre-request ping.
                        continue;
                    }
                    Ok(Ok(frame)) => {
                        log::warn!(
                            target: "supervisor",
                            "Unexpected frame {:#04x} while parsing `{id}`", frame.type_byte()
                        );
                    }
                    _ => {
                        let failure = exit_failure(process);
                        reply.send(Err(failure)).ok();
                        return Some(Replace::Dead { silent: false });
                    }
                },
                recv(self.kill_rx) -> _ => {
                    kill(process);
                    reply.send(Err(Failure::Interrupted)).ok();
                    return Some(Replace::Shutdown);
                }
                default(remaining) => {
                    log::warn!(
                        target: "supervisor",
                        "Parse `{id}` exceeded {:?}; killing child #{}", self.config.parse_timeout, self.slot
                    );
                    kill(process);
                    reply.send(Err(Failure::Timeout)).ok();
                    return Some(Replace::TimedOut);
                }
            }
        }
    }

    /// Ping an idle child and await the pong.
    fn heartbeat(
        &self,
        stdin: &mut ChildStdin,
        frames: &chan::Receiver<Result<Frame, wire::Error>>,
        process: &mut Process,
    ) -> Option<Replace> {
        if frame::write(stdin, &Frame::Ping).is_err() {
            return Some(Replace::Dead { silent: true });
        }
        match frames.recv_timeout(self.config.ping_timeout) {
            Ok(Ok(Frame::Pong)) => None,
            Ok(Ok(frame)) => {
                log::warn!(
                    target: "supervisor",
                    "Expected pong from child #{}, got {:#04x}", self.slot, frame.type_byte()
                );
                None
            }
            Ok(Err(_)) | Err(chan::RecvTimeoutError::Disconnected) => {
                Some(Replace::Dead { silent: true })
            }
            Err(chan::RecvTimeoutError::Timeout) => {
                kill(process);
                Some(Replace::Unresponsive)
            }
        }
    }

    /// Stop a child: politely when `graceful`, then by force.
    fn stop_child(&self, live: &mut Live, graceful: bool) {
        if graceful {
            frame::write(&mut live.stdin, &Frame::Shutdown).ok();
            let deadline = Instant::now() + SHUTDOWN_TIMEOUT;
            while Instant::now() < deadline {
                match live.process.try_wait() {
                    Ok(Some(_)) => return,
                    Ok(None) => thread::sleep(Duration::from_millis(20)),
                    Err(_) => break,
                }
            }
            // Ask nicely once more before the hard kill.
            unsafe { libc::kill(live.process.id() as libc::c_int, libc::SIGTERM) };
            thread::sleep(Duration::from_millis(50));
        }
        kill(&mut live.process);
        reap(&mut live.process);
    }
}

/// Pump frames from the child's stdout into a channel until eof.
fn read_frames(stdout: ChildStdout, tx: chan::Sender<Result<Frame, wire::Error>>) {
    let mut reader = BufReader::new(stdout);
    loop {
        match frame::read(&mut reader) {
            Ok(frame) => {
                if tx.send(Ok(frame)).is_err() {
                    break;
                }
            }
            Err(e) => {
                tx.send(Err(e)).ok();
                break;
            }
        }
    }
}

/// Hard-terminate a child.
fn kill(process: &mut Process) {
    process.kill().ok();
}

/// Collect the exit status, bounded.
fn reap(process: &mut Process) -> Option<std::process::ExitStatus> {
    let deadline = Instant::now() + REAP_TIMEOUT;
    loop {
        match process.try_wait() {
            Ok(Some(status)) => return Some(status),
            Ok(None) if Instant::now() < deadline => thread::sleep(Duration::from_millis(20)),
            _ => return None,
        }
    }
}

/// Classify a child's death during a pending request.
fn exit_failure(process: &mut Process) -> Failure {
    let Some(status) = reap(process) else {
        return Failure::Crash("child is unresponsive after its pipe closed".to_owned());
    };
    if let Some(code) = status.code() {
        if code == EXIT_RESTART_REQUESTED {
            return Failure::Crash("child requested a restart mid-request".to_owned());
        }
        return Failure::Crash(format!("child exited with code {code}"));
    }
    match status.signal() {
        // An abort or kernel kill during a parse points at memory
        // exhaustion.
        Some(libc::SIGABRT) | Some(libc::SIGKILL) => Failure::Oom,
        Some(signal) => Failure::Crash(format!("child terminated by signal {signal}")),
        None => Failure::Crash("child exited abnormally".to_owned()),
    }
}

impl Failure {
    /// The per-tuple status this failure reports as.
    pub fn status(&self) -> conveyor::status::Status {
        use conveyor::status::Status;

        match self {
            Failure::Timeout => Status::Timeout,
            Failure::Oom => Status::Oom,
            Failure::Crash(_) | Failure::Request(_) => Status::UnspecifiedCrash,
            Failure::Unavailable => Status::ClientUnavailableWithinMs,
            Failure::Interrupted => Status::InterruptedException,
        }
    }
}
