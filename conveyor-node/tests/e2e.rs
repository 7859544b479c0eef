//! End-to-end runs against file-system connectors.

use std::fs;
use std::path::Path;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

use conveyor::config::Config;
use conveyor::metadata::{names, Metadata};
use conveyor::reporter::store::SqliteReporter;
use conveyor::status::Status;
use conveyor_node::runtime::Runtime;
use conveyor_node::signals::Signal;

/// Build a config over the given fixture directories, reporting into a
/// sqlite store.
fn config(root: &Path, pipes: serde_json::Value) -> Config {
    let value = serde_json::json!({
        "fetchers": {
            "file-fetcher": { "fs": { "basePath": root.join("in") } }
        },
        "sources": {
            "file-walk-source": {
                "walk": { "basePath": root.join("in"), "fetcherId": "fs", "emitterId": "out" }
            }
        },
        "emitters": {
            "file-emitter": { "out": { "basePath": root.join("out") } }
        },
        "reporters": {
            "sqlite-reporter": { "db": { "path": root.join("status.db") } }
        },
        "pipes": pipes,
        "log": { "level": "warn" }
    });
    serde_json::from_value(value).unwrap()
}

fn run(config: Config) -> conveyor_node::runtime::Outcome {
    let (_tx, signals) = chan::bounded(2);
    Runtime::init(config, signals).unwrap().run().unwrap()
}

fn status_rows(root: &Path) -> Vec<(String, Status)> {
    let store = SqliteReporter::open(conveyor::reporter::store::Options {
        path: root.join("status.db"),
        batch_size: 100,
        batch_timeout_millis: 1000,
        includes: vec![],
        excludes: vec![],
    })
    .unwrap();
    store
        .rows()
        .unwrap()
        .into_iter()
        .map(|row| (row.fetch_key, row.status))
        .collect()
}

fn emitted(root: &Path, name: &str) -> Vec<Metadata> {
    let json = fs::read_to_string(root.join("out").join(name)).unwrap();
    serde_json::from_str(&json).unwrap()
}

#[test]
fn test_happy_path_single_tuple() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("in")).unwrap();
    fs::write(dir.path().join("in/a.txt"), b"hello").unwrap();

    let outcome = run(config(
        dir.path(),
        serde_json::json!({ "numWorkers": 1, "tempDir": dir.path().join("tmp") }),
    ));

    assert_eq!(outcome.summary.succeeded, 1);
    assert_eq!(outcome.summary.failed, 0);
    assert!(!outcome.interrupted);

    let records = emitted(dir.path(), "a.txt.json");
    assert_eq!(records.len(), 1);
    assert_eq!(records[0].get(names::CONTENT_TYPE), Some("text/plain"));
    assert_eq!(records[0].get(names::CONTENT), Some("hello"));

    let rows = status_rows(dir.path());
    assert_eq!(rows, vec![("a.txt".to_owned(), Status::EmitSuccess)]);
}

#[test]
fn test_zero_tuples_clean_exit() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("in")).unwrap();

    let outcome = run(config(
        dir.path(),
        serde_json::json!({ "numWorkers": 2, "tempDir": dir.path().join("tmp") }),
    ));

    assert_eq!(outcome.summary.total(), 0);
    assert!(!outcome.interrupted);
    // No emitter calls: the out directory was never created.
    assert!(!dir.path().join("out").exists());
    assert!(status_rows(dir.path()).is_empty());
}

#[test]
fn test_parent_child_emission() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("in")).unwrap();
    fs::write(
        dir.path().join("in/archive.bundle"),
        "#bundle\n--- one.txt\n  first\n--- two.txt\n  second\n--- three.txt\n  third\n",
    )
    .unwrap();

    let outcome = run(config(
        dir.path(),
        serde_json::json!({ "numWorkers": 1, "tempDir": dir.path().join("tmp") }),
    ));
    assert_eq!(outcome.summary.succeeded, 1);

    // One container plus three children, container first.
    let records = emitted(dir.path(), "archive.bundle.json");
    assert_eq!(records.len(), 4);
    assert_eq!(records[0].get(names::RECORD_ID), Some("archive.bundle"));
    assert_eq!(records[0].get(names::PARENT_ID), Some("archive.bundle"));
    for child in &records[1..] {
        assert_eq!(child.get(names::PARENT_ID), Some("archive.bundle"));
    }
    assert_eq!(records[1].get(names::CONTENT), Some("first"));
    assert_eq!(records[3].get(names::CONTENT), Some("third"));
}

#[test]
fn test_backpressure_single_worker_in_order() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("in")).unwrap();
    for i in 0..100 {
        fs::write(
            dir.path().join(format!("in/{i:03}.sleep")),
            b"#sleep 50\ndone",
        )
        .unwrap();
    }

    let started = Instant::now();
    let outcome = run(config(
        dir.path(),
        serde_json::json!({
            "numWorkers": 1,
            "workQueueCapacity": 2,
            "tempDir": dir.path().join("tmp")
        }),
    ));

    // One worker, 100 parses of 50ms each.
    assert!(started.elapsed() >= Duration::from_millis(5000));
    assert_eq!(outcome.summary.succeeded, 100);
    assert_eq!(outcome.summary.failed, 0);

    let rows = status_rows(dir.path());
    assert_eq!(rows.len(), 100);
    for (i, (fetch_key, status)) in rows.iter().enumerate() {
        assert_eq!(fetch_key, &format!("{i:03}.sleep"));
        assert_eq!(*status, Status::EmitSuccess);
    }
    // The sleep dominates each tuple's elapsed time.
    let store = SqliteReporter::open(conveyor::reporter::store::Options {
        path: dir.path().join("status.db"),
        batch_size: 100,
        batch_timeout_millis: 1000,
        includes: vec![],
        excludes: vec![],
    })
    .unwrap();
    assert!(store.rows().unwrap().iter().all(|row| row.elapsed_ms >= 50));
}

#[test]
fn test_graceful_shutdown_completes_in_flight() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("in")).unwrap();
    for i in 0..10 {
        fs::write(
            dir.path().join(format!("in/{i:02}.sleep")),
            b"#sleep 200\ndone",
        )
        .unwrap();
    }

    let (tx, signals) = chan::bounded(2);
    let runtime = Runtime::init(
        config(
            dir.path(),
            serde_json::json!({
                "numWorkers": 1,
                "workQueueCapacity": 2,
                "shutdownGraceMillis": 10_000,
                "tempDir": dir.path().join("tmp")
            }),
        ),
        signals,
    )
    .unwrap();

    let handle = std::thread::spawn(move || runtime.run().unwrap());
    std::thread::sleep(Duration::from_millis(300));
    tx.send(Signal::Interrupt).unwrap();
    let outcome = handle.join().unwrap();

    // In-flight tuples finished; queued-but-not-started ones were
    // neither run nor reported.
    assert!(!outcome.interrupted);
    assert!(outcome.summary.succeeded >= 1);
    assert!(outcome.summary.succeeded < 10);
    assert!(status_rows(dir.path())
        .iter()
        .all(|(_, status)| *status == Status::EmitSuccess));
}

#[test]
fn test_duplicate_tuple_ids_skipped() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("in")).unwrap();
    fs::write(dir.path().join("in/a.txt"), b"alpha").unwrap();

    let manifest = dir.path().join("manifest.jsonl");
    let line = r#"{"id":"dup","fetchKey":{"fetcherId":"fs","key":"a.txt"},"emitKey":{"emitterId":"out","key":"a.json"}}"#;
    fs::write(&manifest, format!("{line}\n{line}\n")).unwrap();

    let mut config = config(
        dir.path(),
        serde_json::json!({ "numWorkers": 1, "tempDir": dir.path().join("tmp") }),
    );
    config.sources = serde_json::from_value(serde_json::json!({
        "manifest-source": { "manifest": { "path": manifest } }
    }))
    .unwrap();

    let outcome = run(config);
    assert_eq!(outcome.summary.succeeded, 1);
    assert_eq!(outcome.summary.skipped, 1);

    let rows = status_rows(dir.path());
    assert!(rows.contains(&("a.txt".to_owned(), Status::Skipped)));
    assert!(rows.contains(&("a.txt".to_owned(), Status::EmitSuccess)));
}

#[test]
fn test_fetch_not_found_is_terminal() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("in")).unwrap();

    let manifest = dir.path().join("manifest.jsonl");
    fs::write(
        &manifest,
        r#"{"id":"m","fetchKey":{"fetcherId":"fs","key":"missing.txt"},"emitKey":{"emitterId":"out","key":"m.json"}}"#,
    )
    .unwrap();

    let mut config = config(
        dir.path(),
        serde_json::json!({ "numWorkers": 1, "tempDir": dir.path().join("tmp") }),
    );
    config.sources = serde_json::from_value(serde_json::json!({
        "manifest-source": { "manifest": { "path": manifest } }
    }))
    .unwrap();

    let outcome = run(config);
    assert_eq!(outcome.summary.failed, 1);
    assert_eq!(
        status_rows(dir.path()),
        vec![("missing.txt".to_owned(), Status::FetchNotFound)]
    );
}

#[test]
fn test_parse_error_policy_skip() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("in")).unwrap();
    fs::write(dir.path().join("in/locked.bundle"), "#bundle encrypted\n").unwrap();

    let mut config = config(
        dir.path(),
        serde_json::json!({ "numWorkers": 1, "tempDir": dir.path().join("tmp") }),
    );
    config.sources = serde_json::from_value(serde_json::json!({
        "file-walk-source": {
            "walk": {
                "basePath": dir.path().join("in"),
                "fetcherId": "fs",
                "emitterId": "out",
                "onParseError": "skip"
            }
        }
    }))
    .unwrap();

    let outcome = run(config);
    assert_eq!(outcome.summary.failed, 1);
    assert_eq!(
        status_rows(dir.path()),
        vec![("locked.bundle".to_owned(), Status::ParseExceptionNoEmit)]
    );
    // Nothing was emitted.
    assert!(!dir.path().join("out/locked.bundle.json").exists());
}

#[test]
fn test_parse_error_policy_emit() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("in")).unwrap();
    fs::write(dir.path().join("in/locked.bundle"), "#bundle encrypted\n").unwrap();

    let outcome = run(config(
        dir.path(),
        serde_json::json!({ "numWorkers": 1, "tempDir": dir.path().join("tmp") }),
    ));

    // The default policy emits what accumulated, plus the failure.
    assert_eq!(outcome.summary.succeeded, 1);
    assert_eq!(
        status_rows(dir.path()),
        vec![(
            "locked.bundle".to_owned(),
            Status::EmitSuccessParseException
        )]
    );
    let records = emitted(dir.path(), "locked.bundle.json");
    assert!(records[0].get(names::PARSE_ERROR).is_some());
}

#[test]
fn test_no_emitter_found() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("in")).unwrap();
    fs::write(dir.path().join("in/a.txt"), b"alpha").unwrap();

    let manifest = dir.path().join("manifest.jsonl");
    fs::write(
        &manifest,
        r#"{"id":"a","fetchKey":{"fetcherId":"fs","key":"a.txt"},"emitKey":{"emitterId":"nowhere","key":"a.json"}}"#,
    )
    .unwrap();

    let mut config = config(
        dir.path(),
        serde_json::json!({ "numWorkers": 1, "tempDir": dir.path().join("tmp") }),
    );
    config.sources = serde_json::from_value(serde_json::json!({
        "manifest-source": { "manifest": { "path": manifest } }
    }))
    .unwrap();

    let outcome = run(config);
    assert_eq!(outcome.summary.failed, 1);
    assert_eq!(
        status_rows(dir.path()),
        vec![("a.txt".to_owned(), Status::NoEmitterFound)]
    );
}

#[test]
fn test_no_temp_files_after_clean_run() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("in")).unwrap();
    fs::write(dir.path().join("in/a.txt"), b"hello").unwrap();

    let tmp = dir.path().join("tmp");
    let mut config = config(
        dir.path(),
        serde_json::json!({ "numWorkers": 1, "tempDir": tmp }),
    );
    // Spooling exercises the scoped-file path.
    config.fetchers = serde_json::from_value(serde_json::json!({
        "file-fetcher": {
            "fs": { "basePath": dir.path().join("in"), "spoolToTemp": true }
        }
    }))
    .unwrap();

    run(config);

    let tmp = dir.path().join("tmp");
    let leftovers: Vec<_> = fs::read_dir(&tmp)
        .map(|entries| entries.flatten().collect())
        .unwrap_or_default();
    assert!(leftovers.is_empty(), "leftover temp entries: {leftovers:?}");
}
