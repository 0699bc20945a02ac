// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Scheduler surface (§4.1), mapped onto the ambient `tokio` runtime.
//!
//! The source's scheduler is a single OS thread draining a locked FIFO
//! queue, a timer heap, and a resume list. `tokio`'s runtime already is
//! that loop; `post`/`post_immediate`/`wake_up_coroutine` are kept here as
//! named functions purely so call sites elsewhere in this crate read the
//! same as the design's vocabulary, rather than bare `tokio::spawn` calls
//! scattered around with no unifying name.

use std::future::Future;

use tokio::task::JoinHandle;

/// Schedules `fut` to run, without waiting for it. The `tokio` analogue of
/// the source's thread-safe `post(fn)`: callable from any task, always
/// queues rather than running inline.
pub fn post<F>(fut: F) -> JoinHandle<F::Output>
where
    F: Future + Send + 'static,
    F::Output: Send + 'static,
{
    tokio::spawn(fut)
}

/// A periodic tick used by the application host's per-frame update (§4.18,
/// `frame_interval`). Wraps `tokio::time::interval` with
/// `MissedTickBehavior::Delay` so a slow frame doesn't cause a burst of
/// catch-up ticks.
pub struct FrameTicker {
    interval: tokio::time::Interval,
}

impl FrameTicker {
    /// Builds a ticker firing every `period`.
    pub fn new(period: std::time::Duration) -> Self {
        let mut interval = tokio::time::interval(period);
        interval.set_missed_tick_behavior(tokio::time::MissedTickBehavior::Delay);
        Self { interval }
    }

    /// Waits for the next frame boundary.
    pub async fn tick(&mut self) {
        self.interval.tick().await;
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn post_runs_and_returns_value() {
        let handle = post(async { 7 });
        assert_eq!(handle.await.expect("join"), 7);
    }

    #[tokio::test]
    async fn frame_ticker_fires() {
        let mut ticker = FrameTicker::new(Duration::from_millis(1));
        tokio::time::timeout(Duration::from_secs(1), ticker.tick())
            .await
            .expect("tick must fire");
    }
}
