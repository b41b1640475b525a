#![cfg(unix)]

mod common;

use std::collections::BTreeSet;
use std::fs;
use std::process::Command;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::Arc;
use std::thread;
use std::time::{Duration, Instant};

use common::RecordingProcess;
use tr_updater::platform::Platform;
use tr_updater::relaunch::SystemProcessControl;
use tr_updater::swap::{
    sibling_with_suffix, strategy_for, BackupRecord, InPlaceSwap, LockedFileSwap, SwapOutcome,
    SwapRequest, SwapStrategy,
};

#[test]
fn strategy_follows_platform() {
    let process = Arc::new(RecordingProcess::default());
    assert_eq!(strategy_for(Platform::Linux, process.clone()).name(), "in-place");
    assert_eq!(strategy_for(Platform::MacOs, process.clone()).name(), "in-place");
    assert_eq!(strategy_for(Platform::Windows, process).name(), "locked-file");
}

#[test]
fn in_place_swap_never_exposes_partial_file() {
    const OLD_LEN: usize = 64 * 1024;
    const NEW_LEN: usize = 512 * 1024;

    let dir = tempfile::tempdir().expect("tempdir");
    let live = dir.path().join("agent");
    let old = dir.path().join("old.payload");
    let new = dir.path().join("new.payload");
    fs::write(&live, vec![b'a'; OLD_LEN]).expect("live");
    fs::write(&old, vec![b'a'; OLD_LEN]).expect("old");
    fs::write(&new, vec![b'b'; NEW_LEN]).expect("new");
    let backup = sibling_with_suffix(&live, ".backup");

    let stop = Arc::new(AtomicBool::new(false));
    let observer = {
        let stop = stop.clone();
        let live = live.clone();
        thread::spawn(move || {
            let mut seen = BTreeSet::new();
            while !stop.load(Ordering::Relaxed) {
                if let Ok(bytes) = fs::read(&live) {
                    let uniform = match bytes.first() {
                        Some(first) => bytes.iter().all(|b| b == first),
                        None => false,
                    };
                    seen.insert((bytes.len(), uniform));
                }
            }
            seen
        })
    };

    for round in 0..40 {
        let payload = if round % 2 == 0 { &new } else { &old };
        let outcome = InPlaceSwap
            .apply(&SwapRequest {
                payload,
                live: &live,
                backup: &backup,
                args: &[],
            })
            .expect("swap");
        assert_eq!(outcome, SwapOutcome::Replaced);
    }

    stop.store(true, Ordering::Relaxed);
    let seen = observer.join().expect("observer");
    assert!(!seen.is_empty());
    for (len, uniform) in seen {
        assert!(len == OLD_LEN || len == NEW_LEN, "observed length {len}");
        assert!(uniform, "observed mixed content");
    }
    assert!(!sibling_with_suffix(&live, ".new").exists());
}

#[test]
fn in_place_swap_failure_keeps_live() {
    let dir = tempfile::tempdir().expect("tempdir");
    let live = dir.path().join("agent");
    fs::write(&live, b"old").expect("live");

    let result = InPlaceSwap.apply(&SwapRequest {
        payload: &dir.path().join("does-not-exist"),
        live: &live,
        backup: &sibling_with_suffix(&live, ".backup"),
        args: &[],
    });

    assert!(result.is_err());
    assert_eq!(fs::read(&live).expect("read"), b"old");
    assert!(!sibling_with_suffix(&live, ".new").exists());
}

#[test]
fn locked_file_swap_cleans_up_when_helper_fails() {
    let dir = tempfile::tempdir().expect("tempdir");
    let live = dir.path().join("agent");
    let payload = dir.path().join("payload");
    fs::write(&live, b"old").expect("live");
    fs::write(&payload, b"new").expect("payload");

    let swap = LockedFileSwap::new(
        Arc::new(RecordingProcess::failing_helper()),
        std::process::id(),
    );
    let result = swap.apply(&SwapRequest {
        payload: &payload,
        live: &live,
        backup: &sibling_with_suffix(&live, ".backup"),
        args: &[],
    });

    assert!(result.is_err());
    assert_eq!(fs::read(&live).expect("read"), b"old");
    let mut leftovers: Vec<String> = fs::read_dir(dir.path())
        .expect("read dir")
        .filter_map(Result::ok)
        .map(|e| e.file_name().to_string_lossy().into_owned())
        .collect();
    leftovers.sort();
    assert_eq!(leftovers, vec!["agent".to_string(), "payload".to_string()]);
}

#[test]
fn locked_file_helper_replaces_and_relaunches() {
    let dir = tempfile::tempdir().expect("tempdir");
    let live = dir.path().join("agent");
    let payload = dir.path().join("payload");
    let marker = dir.path().join("relaunched");

    fs::write(&live, b"#!/bin/sh\nexit 0\n").expect("live");
    fs::write(
        &payload,
        format!("#!/bin/sh\necho \"$@\" > '{}'\n", marker.display()),
    )
    .expect("payload");

    let backup = BackupRecord::create(&live).expect("backup");

    // A process that has already exited stands in for the agent.
    let mut finished = Command::new("true").spawn().expect("spawn true");
    let dead_pid = finished.id();
    finished.wait().expect("wait");

    let swap = LockedFileSwap::new(Arc::new(SystemProcessControl), dead_pid);
    let args = vec!["--host".to_string(), "local".to_string()];
    let outcome = swap
        .apply(&SwapRequest {
            payload: &payload,
            live: &live,
            backup: &backup.backup_path,
            args: &args,
        })
        .expect("hand off");
    assert_eq!(outcome, SwapOutcome::HandedOff);

    let deadline = Instant::now() + Duration::from_secs(10);
    let relaunched = || fs::read_to_string(&marker).is_ok_and(|s| !s.trim().is_empty());
    while !relaunched() || backup.backup_path.exists() {
        assert!(Instant::now() < deadline, "helper did not finish in time");
        thread::sleep(Duration::from_millis(50));
    }

    assert_eq!(fs::read_to_string(&marker).expect("marker").trim(), "--host local");
    assert_eq!(fs::read(&live).expect("live"), fs::read(&payload).expect("payload"));
    assert!(!sibling_with_suffix(&live, ".update").exists());
}
