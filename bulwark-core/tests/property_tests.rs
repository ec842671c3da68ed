//! Property tests for the retry engine

use std::sync::Arc;
use std::sync::atomic::{AtomicU32, Ordering};
use std::time::Duration;

use bulwark_core::error::{ErrorRecord, LlmFailure, SessionFailure, SessionOperation, ToolFailure};
use bulwark_core::resilience::{RetryPolicy, with_retry, with_retry_counted};
use proptest::prelude::*;

fn paused_runtime() -> tokio::runtime::Runtime {
    tokio::runtime::Builder::new_current_thread()
        .enable_time()
        .start_paused(true)
        .build()
        .unwrap()
}

fn retryable_error(choice: u8, attempt: u32) -> ErrorRecord {
    let message = format!("attempt {}", attempt);
    match choice % 4 {
        0 => ErrorRecord::tool(ToolFailure::Transient, "tool", message),
        1 => ErrorRecord::llm(LlmFailure::Status(503), "model", message),
        2 => ErrorRecord::rate_limit("model", None, message),
        _ => ErrorRecord::session(
            SessionOperation::Get,
            SessionFailure::Store,
            "session",
            message,
        ),
    }
}

fn fatal_error(choice: u8) -> ErrorRecord {
    match choice % 4 {
        0 => ErrorRecord::config("bad config"),
        1 => ErrorRecord::tool(ToolFailure::InvalidArguments, "tool", "bad args"),
        2 => ErrorRecord::llm(LlmFailure::Status(401), "model", "unauthorized"),
        _ => ErrorRecord::model("model", Some(false), "gone"),
    }
}

proptest! {
    #[test]
    fn backoff_doubles_until_capped(
        base_ms in 1u64..1_000,
        cap_factor in 1u64..200,
        attempt in 1u32..24,
    ) {
        let max_ms = base_ms * cap_factor;
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(base_ms))
            .with_max_delay(Duration::from_millis(max_ms))
            .with_jitter(false);

        let expected = (base_ms as u128 * (1u128 << (attempt - 1))).min(max_ms as u128);
        prop_assert_eq!(policy.delay_for_attempt(attempt).as_millis(), expected);
    }

    #[test]
    fn jitter_adds_at_most_ten_percent(base_ms in 10u64..1_000, attempt in 1u32..6) {
        let policy = RetryPolicy::default()
            .with_base_delay(Duration::from_millis(base_ms))
            .with_max_delay(Duration::from_secs(3600))
            .with_jitter(true);

        let plain = policy.backoff_for_attempt(attempt);
        let jittered = policy.delay_for_attempt(attempt);
        prop_assert!(jittered >= plain);
        prop_assert!(jittered.as_millis() <= plain.as_millis() + plain.as_millis() / 10);
    }

    #[test]
    fn retryable_failures_use_every_attempt(max_attempts in 1u32..8, choice in any::<u8>()) {
        let policy = RetryPolicy::default()
            .with_max_attempts(max_attempts)
            .with_base_delay(Duration::from_millis(10))
            .with_jitter(false);

        let (error, attempts) = paused_runtime().block_on(async {
            with_retry_counted(&policy, |attempt| async move {
                Err::<(), _>(retryable_error(choice, attempt))
            })
            .await
            .unwrap_err()
        });

        prop_assert_eq!(attempts, max_attempts);
        let expected = format!("attempt {}", max_attempts);
        prop_assert_eq!(error.message(), expected.as_str());
    }

    #[test]
    fn fatal_failures_are_attempted_once(max_attempts in 1u32..8, choice in any::<u8>()) {
        let policy = RetryPolicy::default().with_max_attempts(max_attempts);
        let calls = Arc::new(AtomicU32::new(0));

        let result = paused_runtime().block_on(async {
            let calls = calls.clone();
            with_retry(&policy, move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
                async move { Err::<(), _>(fatal_error(choice)) }
            })
            .await
        });

        prop_assert!(result.is_err());
        prop_assert_eq!(calls.load(Ordering::SeqCst), 1);
    }
}
