// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Timer awaiter (§4.4), mapped onto `tokio::time`.
//!
//! `tokio::time::sleep`/`sleep_until` already suspend until a wall-clock
//! point and are cancel-safe by construction: dropping the future (which is
//! exactly what happens on the losing side of a `tokio::select!`) removes
//! it from tokio's timer wheel, which is the Rust-native equivalent of a
//! cancellation registration removing a node from the timer heap.

use std::time::Duration;

use tokio::time::Instant;

/// Suspends the current task until `deadline`. A `deadline` in the past
/// resolves on the next scheduler tick without deadlock (§8 boundary
/// behaviour, generalized from `sleep_for(0)` to an arbitrary past instant).
pub async fn sleep_until(deadline: Instant) {
    tokio::time::sleep_until(deadline).await;
}

/// Suspends the current task for `duration`. `sleep_for(Duration::ZERO)`
/// resolves on the next scheduler tick (§8).
pub async fn sleep_for(duration: Duration) {
    tokio::time::sleep(duration).await;
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn zero_duration_sleep_does_not_deadlock() {
        tokio::time::timeout(Duration::from_secs(1), sleep_for(Duration::ZERO))
            .await
            .expect("must not deadlock");
    }

    #[tokio::test]
    async fn past_deadline_resolves_immediately() {
        let past = Instant::now() - Duration::from_secs(5);
        tokio::time::timeout(Duration::from_secs(1), sleep_until(past))
            .await
            .expect("must not deadlock");
    }
}
