//! Built-in tools driven through the orchestrator.

mod common;

use std::path::Path;

use common::{have_program, test_config, write_file};
use dtn_engine::{AgentConfig, EngineError, Orchestrator, Role, TransferResult};
use serde_json::{json, Map, Value};
use tempfile::TempDir;

fn options(value: Value) -> Map<String, Value> {
    match value {
        Value::Object(map) => map,
        _ => panic!("expected an object"),
    }
}

fn poll_to_end(
    orchestrator: &Orchestrator,
    tool: &str,
    role: Role,
    key: dtn_engine::SessionKey,
    options: &Map<String, Value>,
) -> TransferResult {
    for _ in 0..100 {
        match orchestrator.poll(tool, role, key, options) {
            Ok(result) => return result,
            Err(e) if e.is_still_in_progress() => continue,
            Err(e) => panic!("poll failed: {}", e),
        }
    }
    panic!("session {} never finished", key);
}

fn pattern(len: usize) -> Vec<u8> {
    (0..len).map(|i| (i % 253) as u8).collect()
}

#[test]
fn test_dd_copies_file_end_to_end() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let content = pattern(1 << 20);
    let source = write_file(temp_dir.path(), "src.bin", &content);
    let destination = temp_dir.path().join("nested").join("dst.bin");
    let orchestrator = Orchestrator::new(test_config(temp_dir.path()));

    let sender = orchestrator
        .create("dd", Role::Sender, Some(&source), &Map::new())
        .expect("sender starts");
    assert_eq!(sender.size, Some(1 << 20));
    assert!(sender.pid.is_none());

    let receiver_options = options(json!({
        "sessionKey": sender.session_key,
        "blocksize": 1,
        "direct": false,
        "timeout": 60,
    }));
    let receiver = orchestrator
        .create("dd", Role::Receiver, Some(&destination), &receiver_options)
        .expect("receiver starts");
    assert_eq!(receiver.session_key, sender.session_key);

    let result = poll_to_end(&orchestrator, "dd", Role::Receiver, receiver.session_key, &receiver_options);
    assert_eq!(result.as_pair(), (0, Some(1 << 20)));
    assert_eq!(std::fs::read(&destination).expect("Failed to read copy"), content);

    let sent = poll_to_end(&orchestrator, "dd", Role::Sender, sender.session_key, &Map::new());
    assert_eq!(sent.returncode, 0);
    assert!(orchestrator.backend("dd").expect("registered").registry().is_empty());
}

#[test]
fn test_dd_receiver_with_explicit_source() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let source = write_file(temp_dir.path(), "src.bin", &pattern(10_000));
    let destination = temp_dir.path().join("dst.bin");
    let orchestrator = Orchestrator::new(test_config(temp_dir.path()));

    let receiver_options = options(json!({
        "srcfile": source,
        "direct": false,
        "timeout": 30,
    }));
    let receiver = orchestrator
        .create("dd", Role::Receiver, Some(&destination), &receiver_options)
        .expect("receiver starts with a key of its own");

    let result = poll_to_end(&orchestrator, "dd", Role::Receiver, receiver.session_key, &receiver_options);
    assert_eq!(result.as_pair(), (0, Some(10_000)));
}

#[test]
fn test_dd_receiver_without_source_is_rejected() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let orchestrator = Orchestrator::new(test_config(temp_dir.path()));

    let err = orchestrator
        .create("dd", Role::Receiver, Some(&temp_dir.path().join("dst.bin")), &Map::new())
        .expect_err("no source known");
    assert!(err.is_configuration());
    assert!(!temp_dir.path().join("dst.bin").exists());
}

#[test]
fn test_memory_receiver_needs_duration() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let orchestrator = Orchestrator::new(test_config(temp_dir.path()));

    let err = orchestrator
        .create(
            "ncat",
            Role::Receiver,
            None,
            &options(json!({"sessionKey": 33001, "address": "127.0.0.1"})),
        )
        .expect_err("no file and no duration");
    assert!(matches!(err, EngineError::Configuration { .. }));
    assert!(orchestrator.backend("ncat").expect("registered").registry().is_empty());

    let err = orchestrator
        .create(
            "nuttcp",
            Role::Receiver,
            Some(&temp_dir.path().join("dst.bin")),
            &options(json!({"sessionKey": 30001, "address": "127.0.0.1"})),
        )
        .expect_err("dual-port tool without a data port");
    assert!(err.is_configuration());
}

#[test]
fn test_msrsync_needs_existing_source_directory() {
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let orchestrator = Orchestrator::new(test_config(temp_dir.path()));
    let missing = temp_dir.path().join("missing");

    let err = orchestrator
        .create(
            "msrsync",
            Role::Receiver,
            Some(&temp_dir.path().join("out")),
            &options(json!({"address": missing})),
        )
        .expect_err("source directory does not exist");
    assert!(err.is_configuration());
}

#[test]
fn test_ncat_copies_file_end_to_end() {
    if !have_program("ncat") {
        eprintln!("ncat not found, skipping");
        return;
    }
    let temp_dir = TempDir::new().expect("Failed to create temp dir");
    let content = pattern(256 * 1024);
    let source = write_file(temp_dir.path(), "src.bin", &content);
    let destination = temp_dir.path().join("dst.bin");
    let config = AgentConfig {
        retry_backoff_ms: 200,
        ..test_config(temp_dir.path())
    };
    let orchestrator = Orchestrator::new(config);

    let send_options = options(json!({"timeout": 30}));
    let sender = orchestrator
        .create("ncat", Role::Sender, Some(&source), &send_options)
        .expect("sender starts");

    // May start before the listener is up; refused attempts are re-issued
    let receiver_options = options(json!({
        "sessionKey": sender.session_key,
        "address": "127.0.0.1",
        "timeout": 30,
    }));
    let receiver = orchestrator
        .create("ncat", Role::Receiver, Some(&destination), &receiver_options)
        .expect("receiver starts");

    let result = poll_to_end(&orchestrator, "ncat", Role::Receiver, receiver.session_key, &receiver_options);
    assert_eq!(result.as_pair(), (0, Some(content.len() as u64)));
    assert_eq!(std::fs::read(&destination).expect("Failed to read copy"), content);

    let sent = poll_to_end(&orchestrator, "ncat", Role::Sender, sender.session_key, &send_options);
    assert!(sent.succeeded);

    assert_eq!(orchestrator.cleanup_all(), 0);
    assert_files_equal(&source, &destination);
}

fn assert_files_equal(a: &Path, b: &Path) {
    let (expected, matches) =
        dtn_engine::verify_transfer(a, b, dtn_engine::ChecksumAlgorithm::Sha256).expect("Failed to hash");
    assert!(matches, "{} differs from {}", b.display(), expected);
}
