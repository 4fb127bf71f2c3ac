/*
 * Copyright Bret Ambrose. All Rights Reserved.
 * SPDX-License-Identifier: Apache-2.0.
 */

/*!
Reconnect delay computation.
 */

use rand::Rng;

use std::time::Duration;

/// Signature of a pluggable reconnect delay function:
/// `(last_connect_latency, attempt, min_delay, max_delay, max_jitter) -> delay`
pub type RetryDelayFn = fn(Duration, u32, Duration, Duration, Duration) -> Duration;

/// Default reconnect delay: exponential backoff from `min_delay` capped at `max_delay`, plus a
/// random jitter in `[0, max_jitter)` while the result stays below `max_delay`, minus the
/// latency of the last connect attempt.
pub fn default_retry_delay(last_connect_latency: Duration, attempt: u32, min_delay: Duration, max_delay: Duration, max_jitter: Duration) -> Duration {
    let jitter_millis = max_jitter.as_millis() as u64;
    let random_millis =
        if jitter_millis > 0 {
            rand::thread_rng().gen_range(0..jitter_millis)
        } else {
            0
        };

    compute_retry_delay(last_connect_latency, attempt, min_delay, max_delay, Duration::from_millis(random_millis))
}

/// Deterministic core of [`default_retry_delay`] with the random component supplied by the caller.
pub fn compute_retry_delay(last_connect_latency: Duration, attempt: u32, min_delay: Duration, max_delay: Duration, random: Duration) -> Duration {
    let delay = backoff_delay(attempt, min_delay, max_delay);

    let delay =
        if max_delay.saturating_sub(delay) > random {
            delay + random
        } else {
            delay
        };

    delay.saturating_sub(last_connect_latency)
}

// min_delay * 2^attempt, saturating at max_delay
fn backoff_delay(attempt: u32, min_delay: Duration, max_delay: Duration) -> Duration {
    let min_millis = min_delay.as_millis() as u64;
    let max_millis = max_delay.as_millis() as u64;

    let scaled = 2u64.checked_pow(attempt)
        .and_then(|factor| min_millis.checked_mul(factor))
        .unwrap_or(max_millis);

    Duration::from_millis(scaled.min(max_millis))
}
