//! Signal channel integration tests
//!
//! Two `SignalChannel`s on one directory stand in for the two processes.

use std::time::Duration;

use duet::signal::NoPeer;
use duet::{InputMode, SignalChannel, SignalName, WaitOutcome};
use tokio_test::assert_ok;

fn open(dir: &std::path::Path) -> SignalChannel {
    SignalChannel::open(dir, Duration::from_millis(10)).unwrap()
}

#[test]
fn test_records_are_visible_across_channels() {
    let dir = tempfile::tempdir().unwrap();
    let writer = open(dir.path());
    let reader = open(dir.path());

    assert!(!reader.is_signaled(SignalName::JoinedChannel));
    writer.signal(SignalName::JoinedChannel, None).unwrap();
    assert!(reader.is_signaled(SignalName::JoinedChannel));

    writer
        .signal(SignalName::InputMode, Some(InputMode::Voice.as_str()))
        .unwrap();
    let value = assert_ok!(reader.read_value(SignalName::InputMode));
    let mode: InputMode = assert_ok!(value.unwrap().parse());
    assert_eq!(mode, InputMode::Voice);
}

#[test]
fn test_rewrite_replaces_value_and_leaves_no_temp_files() {
    let dir = tempfile::tempdir().unwrap();
    let signals = open(dir.path());

    signals.signal(SignalName::InputMode, Some("text")).unwrap();
    signals.signal(SignalName::InputMode, Some("voice")).unwrap();

    assert_eq!(
        signals.read_value(SignalName::InputMode).unwrap().as_deref(),
        Some("voice")
    );
    let files = std::fs::read_dir(dir.path()).unwrap().count();
    assert_eq!(files, 1);
}

#[test]
fn test_clear_is_idempotent() {
    let dir = tempfile::tempdir().unwrap();
    let signals = open(dir.path());

    signals.signal(SignalName::VoiceModeActive, None).unwrap();
    assert!(signals.clear(SignalName::VoiceModeActive).unwrap());
    assert!(!signals.clear(SignalName::VoiceModeActive).unwrap());
    assert_eq!(signals.read_value(SignalName::VoiceModeActive).unwrap(), None);

    signals.clear_quietly(&SignalName::ALL);
    for name in SignalName::ALL {
        assert!(!signals.is_signaled(name));
    }
}

#[tokio::test]
async fn test_wait_sees_a_record_written_later() {
    let dir = tempfile::tempdir().unwrap();
    let waiter = open(dir.path());
    let writer = open(dir.path());

    let write = tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(50)).await;
        writer.signal(SignalName::JoinedChannel, None).unwrap();
    });

    let outcome = waiter
        .wait_for(SignalName::JoinedChannel, Duration::from_secs(5), &mut NoPeer)
        .await;
    write.await.unwrap();

    assert_eq!(outcome, WaitOutcome::Signaled);
}

#[tokio::test]
async fn test_wait_times_out_without_a_writer() {
    let dir = tempfile::tempdir().unwrap();
    let signals = open(dir.path());

    let outcome = signals
        .wait_for(SignalName::InputMode, Duration::from_millis(60), &mut NoPeer)
        .await;

    assert_eq!(outcome, WaitOutcome::TimedOut);
}

#[cfg(unix)]
#[tokio::test]
async fn test_wait_notices_a_dead_peer() {
    let dir = tempfile::tempdir().unwrap();
    let signals = open(dir.path());

    let mut child = tokio::process::Command::new("sh")
        .args(["-c", "exit 7"])
        .spawn()
        .unwrap();

    let outcome = signals
        .wait_for(SignalName::JoinedChannel, Duration::from_secs(5), &mut child)
        .await;

    assert_eq!(outcome, WaitOutcome::PeerDied(Some(7)));
}
