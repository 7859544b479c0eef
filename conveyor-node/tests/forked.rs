//! Tests that exercise the forked-worker path against the real child
//! binary.

use std::fs;
use std::path::PathBuf;
use std::time::{Duration, Instant};

use crossbeam_channel as chan;

use conveyor::metadata::{names, Metadata};
use conveyor::status::Status;
use conveyor_node::runtime::Runtime;
use conveyor_node::supervisor::{Config, Failure, Supervisor};
use conveyor_node::wire::{Body, ParseRequest};

fn worker_command() -> PathBuf {
    PathBuf::from(env!("CARGO_BIN_EXE_conveyor-worker"))
}

fn supervisor_config(children: usize, parse_timeout: Duration) -> Config {
    Config {
        children,
        command: worker_command(),
        memory_high_water: 0,
        parse_timeout,
        client_timeout: Duration::from_secs(10),
        ping_interval: Duration::from_millis(500),
        ping_timeout: Duration::from_secs(5),
    }
}

fn request(id: &str, name: &str, body: &[u8]) -> ParseRequest {
    let mut metadata = Metadata::new();
    metadata.add(names::RESOURCE_NAME, name);
    ParseRequest {
        id: id.to_owned(),
        metadata,
        max_embedded_depth: 20,
        body: Body::Inline(body.to_vec()),
    }
}

/// Wait for the pool to hold the expected number of children.
fn await_children(supervisor: &Supervisor, expected: usize) {
    let deadline = Instant::now() + Duration::from_secs(10);
    while Instant::now() < deadline {
        if supervisor.child_count() == expected {
            return;
        }
        std::thread::sleep(Duration::from_millis(50));
    }
    panic!(
        "expected {expected} children, have {}",
        supervisor.child_count()
    );
}

#[test]
fn test_forked_parse_round_trip() {
    let supervisor = Supervisor::spawn(supervisor_config(1, Duration::from_secs(10)));
    await_children(&supervisor, 1);

    let reply = supervisor
        .parse(request("t-1", "a.txt", b"hello from the child"))
        .unwrap();
    assert_eq!(reply.status, Status::ParseSuccess);
    assert_eq!(
        reply.metadata[0].get(names::CONTENT),
        Some("hello from the child")
    );

    supervisor.shutdown();
}

#[test]
fn test_parse_timeout_kills_and_respawns() {
    let supervisor = Supervisor::spawn(supervisor_config(2, Duration::from_millis(500)));
    await_children(&supervisor, 2);

    let started = Instant::now();
    let err = supervisor
        .parse(request("slow", "slow.sleep", b"#sleep 2000\nnever"))
        .unwrap_err();
    assert!(matches!(err, Failure::Timeout));
    assert!(started.elapsed() < Duration::from_secs(2));

    // The pool heals and a fresh child serves the next request.
    await_children(&supervisor, 2);
    let reply = supervisor
        .parse(request("next", "ok.txt", b"still alive"))
        .unwrap();
    assert_eq!(reply.status, Status::ParseSuccess);

    supervisor.shutdown();
}

#[test]
fn test_result_delivered_then_child_replaced() {
    // A one-byte high-water mark makes every request trip the child's
    // memory self-check: the result is delivered, then the child exits
    // asking for a restart and is silently replaced.
    let mut config = supervisor_config(1, Duration::from_secs(10));
    config.memory_high_water = 1;
    let supervisor = Supervisor::spawn(config);
    await_children(&supervisor, 1);

    let reply = supervisor.parse(request("r-1", "a.txt", b"first")).unwrap();
    assert_eq!(reply.status, Status::ParseSuccess);

    await_children(&supervisor, 1);
    let reply = supervisor.parse(request("r-2", "b.txt", b"second")).unwrap();
    assert_eq!(reply.status, Status::ParseSuccess);

    supervisor.shutdown();
}

#[test]
fn test_forked_end_to_end_run() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("in")).unwrap();
    fs::write(dir.path().join("in/a.txt"), b"alpha").unwrap();
    fs::write(dir.path().join("in/b.txt"), b"beta").unwrap();
    fs::write(
        dir.path().join("in/archive.bundle"),
        "#bundle\n--- entry.txt\n  inside\n",
    )
    .unwrap();

    let config: conveyor::config::Config = serde_json::from_value(serde_json::json!({
        "fetchers": {
            "file-fetcher": { "fs": { "basePath": dir.path().join("in") } }
        },
        "sources": {
            "file-walk-source": {
                "walk": { "basePath": dir.path().join("in"), "fetcherId": "fs", "emitterId": "out" }
            }
        },
        "emitters": {
            "file-emitter": { "out": { "basePath": dir.path().join("out") } }
        },
        "reporters": {
            "log-reporter": { "log": {} }
        },
        "pipes": {
            "numWorkers": 2,
            "forked": true,
            "maxForkedChildren": 2,
            "workerCommand": worker_command(),
            "tempDir": dir.path().join("tmp")
        },
        "log": { "level": "warn" }
    }))
    .unwrap();

    let (_tx, signals) = chan::bounded(2);
    let outcome = Runtime::init(config, signals).unwrap().run().unwrap();

    assert_eq!(outcome.summary.succeeded, 3);
    assert_eq!(outcome.summary.failed, 0);

    let json = fs::read_to_string(dir.path().join("out/archive.bundle.json")).unwrap();
    let records: Vec<Metadata> = serde_json::from_str(&json).unwrap();
    assert_eq!(records.len(), 2);
    assert_eq!(records[1].get(names::CONTENT), Some("inside"));
}

#[test]
fn test_oversized_body_goes_by_path() {
    let dir = tempfile::tempdir().unwrap();
    fs::create_dir(dir.path().join("in")).unwrap();
    // Well above the 1-byte inline threshold below.
    fs::write(dir.path().join("in/big.txt"), "x".repeat(64 * 1024)).unwrap();

    let config: conveyor::config::Config = serde_json::from_value(serde_json::json!({
        "fetchers": {
            "file-fetcher": { "fs": { "basePath": dir.path().join("in") } }
        },
        "sources": {
            "file-walk-source": {
                "walk": { "basePath": dir.path().join("in"), "fetcherId": "fs", "emitterId": "out" }
            }
        },
        "emitters": {
            "file-emitter": { "out": { "basePath": dir.path().join("out") } }
        },
        "reporters": {
            "log-reporter": { "log": {} }
        },
        "pipes": {
            "numWorkers": 1,
            "forked": true,
            "maxForkedChildren": 1,
            "workerCommand": worker_command(),
            "inlineThresholdBytes": 1,
            "tempDir": dir.path().join("tmp")
        },
        "log": { "level": "warn" }
    }))
    .unwrap();

    let (_tx, signals) = chan::bounded(2);
    let outcome = Runtime::init(config, signals).unwrap().run().unwrap();
    assert_eq!(outcome.summary.succeeded, 1);

    let json = fs::read_to_string(dir.path().join("out/big.txt.json")).unwrap();
    let records: Vec<Metadata> = serde_json::from_str(&json).unwrap();
    assert_eq!(
        records[0].get(names::CONTENT).map(str::len),
        Some(64 * 1024)
    );
}

#[test]
fn test_client_timeout_when_no_children() {
    // A nonexistent worker binary means no child ever comes up; slot
    // acquisition must give up within the client timeout.
    let supervisor = Supervisor::spawn(Config {
        children: 1,
        command: PathBuf::from("/nonexistent/conveyor-worker"),
        memory_high_water: 0,
        parse_timeout: Duration::from_secs(5),
        client_timeout: Duration::from_millis(300),
        ping_interval: Duration::from_millis(500),
        ping_timeout: Duration::from_secs(5),
    });

    let started = Instant::now();
    let err = supervisor
        .parse(request("t", "a.txt", b"hello"))
        .unwrap_err();
    assert!(matches!(err, Failure::Unavailable));
    assert!(started.elapsed() >= Duration::from_millis(300));
    assert!(started.elapsed() < Duration::from_secs(5));

    supervisor.shutdown();
}
