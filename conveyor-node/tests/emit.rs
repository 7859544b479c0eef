//! Emit drain retry semantics against a misbehaving emitter.

use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::{Arc, Mutex};
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

use conveyor::emitter::{EmitRecord, Emitter, Error};
use conveyor::metadata::{names, Metadata};
use conveyor::status::Status;
use conveyor::tuple::{EmitKey, FetchEmitTuple, FetchKey};
use conveyor_node::worker::{EmitDrain, EmitJob, Report};

/// Fails with a scripted sequence of errors, then writes to its sink.
struct FlakyEmitter {
    /// One entry per call, consumed in order; when exhausted, calls
    /// succeed.
    script: Vec<fn() -> Error>,
    calls: AtomicU32,
    sink: Mutex<Vec<String>>,
}

impl Emitter for FlakyEmitter {
    fn emit_batch(&self, batch: &[EmitRecord]) -> Result<(), Error> {
        let call = self.calls.fetch_add(1, Ordering::SeqCst) as usize;
        if let Some(fail) = self.script.get(call) {
            return Err(fail());
        }
        let mut sink = self.sink.lock().unwrap();
        for record in batch {
            sink.push(record.key.key.clone());
        }
        Ok(())
    }
}

fn job(id: &str) -> EmitJob {
    let mut metadata = Metadata::new();
    metadata.add(names::CONTENT, "x");
    EmitJob {
        tuple: FetchEmitTuple::new(
            id,
            FetchKey::new("fs", format!("{id}.txt")),
            EmitKey::new("out", format!("{id}.json")),
        ),
        records: vec![metadata],
        parse_error: None,
        started: Instant::now(),
    }
}

fn drain(emitter: Arc<FlakyEmitter>, retries: u32) -> (chan::Sender<EmitJob>, chan::Receiver<Report>) {
    let (job_tx, job_rx) = chan::bounded(8);
    let (report_tx, report_rx) = chan::unbounded();
    let drain = EmitDrain {
        emitter_id: "out".to_owned(),
        emitter,
        jobs: job_rx,
        report_tx,
        batch_size: 10,
        batch_timeout: Duration::from_millis(50),
        retries,
    };
    std::thread::spawn(move || drain.run());
    (job_tx, report_rx)
}

fn tuple_reports(report_rx: chan::Receiver<Report>) -> Vec<(String, Status)> {
    report_rx
        .iter()
        .filter_map(|event| match event {
            Report::Tuple { tuple, result, .. } => Some((tuple.id, result.status)),
            Report::Total(_) => None,
        })
        .collect()
}

#[test]
fn test_retryable_then_permanent_reports_once() {
    // Two transient failures, then a permanent one; with two retries the
    // permanent failure lands on the final attempt.
    let emitter = Arc::new(FlakyEmitter {
        script: vec![
            || Error::Retryable("connection reset".to_owned()),
            || Error::Retryable("connection reset".to_owned()),
            || Error::Permanent("schema mismatch".to_owned()),
        ],
        calls: AtomicU32::new(0),
        sink: Mutex::new(Vec::new()),
    });
    let (job_tx, report_rx) = drain(emitter.clone(), 2);

    job_tx.send(job("t-1")).unwrap();
    drop(job_tx);

    let reports = tuple_reports(report_rx);
    assert_eq!(reports, vec![("t-1".to_owned(), Status::EmitException)]);
    assert_eq!(emitter.calls.load(Ordering::SeqCst), 3);
    // No duplicate rows reached the sink.
    assert!(emitter.sink.lock().unwrap().is_empty());
}

#[test]
fn test_retryable_then_success() {
    let emitter = Arc::new(FlakyEmitter {
        script: vec![|| Error::Retryable("hiccup".to_owned())],
        calls: AtomicU32::new(0),
        sink: Mutex::new(Vec::new()),
    });
    let (job_tx, report_rx) = drain(emitter.clone(), 2);

    job_tx.send(job("t-2")).unwrap();
    drop(job_tx);

    let reports = tuple_reports(report_rx);
    assert_eq!(reports, vec![("t-2".to_owned(), Status::EmitSuccess)]);
    assert_eq!(*emitter.sink.lock().unwrap(), vec!["t-2.json".to_owned()]);
}

#[test]
fn test_permanent_failure_no_retry() {
    let emitter = Arc::new(FlakyEmitter {
        script: vec![|| Error::Permanent("forbidden".to_owned())],
        calls: AtomicU32::new(0),
        sink: Mutex::new(Vec::new()),
    });
    let (job_tx, report_rx) = drain(emitter.clone(), 5);

    job_tx.send(job("t-3")).unwrap();
    drop(job_tx);

    let reports = tuple_reports(report_rx);
    assert_eq!(reports, vec![("t-3".to_owned(), Status::EmitException)]);
    // Permanent errors never retry.
    assert_eq!(emitter.calls.load(Ordering::SeqCst), 1);
}

#[test]
fn test_batch_reports_each_tuple_once() {
    let emitter = Arc::new(FlakyEmitter {
        script: vec![],
        calls: AtomicU32::new(0),
        sink: Mutex::new(Vec::new()),
    });
    let (job_tx, report_rx) = drain(emitter.clone(), 0);

    for i in 0..5 {
        job_tx.send(job(&format!("b-{i}"))).unwrap();
    }
    drop(job_tx);

    let mut reports = tuple_reports(report_rx);
    reports.sort_by(|a, b| a.0.cmp(&b.0));
    assert_eq!(reports.len(), 5);
    for (i, (id, status)) in reports.iter().enumerate() {
        assert_eq!(id, &format!("b-{i}"));
        assert_eq!(*status, Status::EmitSuccess);
    }
    assert_eq!(emitter.sink.lock().unwrap().len(), 5);
}
