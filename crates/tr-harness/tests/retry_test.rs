use std::sync::atomic::{AtomicU32, Ordering};
use std::sync::Arc;
use std::time::Duration;

use tr_harness::retry::{retry_with_backoff, RetryError, RetryPolicy};
use tr_harness::shutdown::ShutdownSignal;

fn fast_policy(max_attempts: u32) -> RetryPolicy {
    RetryPolicy {
        max_attempts,
        initial_delay: Duration::from_millis(5),
        max_delay: Duration::from_millis(20),
        multiplier: 2.0,
    }
}

#[tokio::test]
async fn succeeds_first_try() {
    let calls = AtomicU32::new(0);
    let result: Result<u32, RetryError<String>> =
        retry_with_backoff(&fast_policy(3), "op", None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Ok(7) }
        })
        .await;

    assert_eq!(result.unwrap(), 7);
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn retries_until_success() {
    let calls = Arc::new(AtomicU32::new(0));
    let result: Result<&str, RetryError<String>> =
        retry_with_backoff(&fast_policy(5), "flaky", None, |attempt| {
            let calls = calls.clone();
            async move {
                calls.fetch_add(1, Ordering::SeqCst);
                if attempt < 3 {
                    Err(format!("boom {attempt}"))
                } else {
                    Ok("done")
                }
            }
        })
        .await;

    assert_eq!(result.unwrap(), "done");
    assert_eq!(calls.load(Ordering::SeqCst), 3);
}

#[tokio::test]
async fn exhausts_and_reports_last_error() {
    let result: Result<(), RetryError<String>> =
        retry_with_backoff(&fast_policy(3), "register", None, |attempt| async move {
            Err(format!("failure #{attempt}"))
        })
        .await;

    match result {
        Err(RetryError::Exhausted {
            operation,
            attempts,
            last,
        }) => {
            assert_eq!(operation, "register");
            assert_eq!(attempts, 3);
            assert_eq!(last, "failure #3");
        }
        other => panic!("expected exhaustion, got {other:?}"),
    }
}

#[tokio::test]
async fn zero_attempts_still_runs_once() {
    let calls = AtomicU32::new(0);
    let _: Result<(), RetryError<String>> =
        retry_with_backoff(&fast_policy(0), "once", None, |_| {
            calls.fetch_add(1, Ordering::SeqCst);
            async { Err("nope".to_string()) }
        })
        .await;
    assert_eq!(calls.load(Ordering::SeqCst), 1);
}

#[tokio::test]
async fn shutdown_interrupts_backoff() {
    let shutdown = ShutdownSignal::new();
    let policy = RetryPolicy {
        max_attempts: 10,
        initial_delay: Duration::from_secs(30),
        max_delay: Duration::from_secs(30),
        multiplier: 1.0,
    };

    let trigger = shutdown.clone();
    tokio::spawn(async move {
        tokio::time::sleep(Duration::from_millis(20)).await;
        trigger.trigger();
    });

    let result: Result<(), RetryError<String>> = tokio::time::timeout(
        Duration::from_secs(2),
        retry_with_backoff(&policy, "slow", Some(&shutdown), |_| async {
            Err("down".to_string())
        }),
    )
    .await
    .expect("retry should stop promptly on shutdown");

    assert!(result.expect_err("cancelled").is_cancelled());
}
