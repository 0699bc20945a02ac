// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

use std::time::Duration;

use rand::Rng;

/// Reconnect backoff table (§4.11): seconds to wait before the `n`-th
/// retry, indexed by prior failure count. Saturates at the last entry.
const RECONNECT_BACKOFF_SECS: &[u64] = &[0, 0, 1, 2, 4, 6, 8, 8];

/// Seconds to sleep before the next dial attempt, given the number of
/// consecutive prior failures.
pub fn reconnect_backoff(fail_count: usize) -> Duration {
    let idx = fail_count.min(RECONNECT_BACKOFF_SECS.len() - 1);
    Duration::from_secs(RECONNECT_BACKOFF_SECS[idx])
}

/// A duration uniformly jittered within `± fraction` of `base`. Used for
/// watchdog intervals (e.g. a 180s peer-gate watchdog with ±⅓ jitter) so
/// that many connections don't expire in lockstep.
pub fn jittered(base: Duration, fraction: f64) -> Duration {
    let base_secs = base.as_secs_f64();
    let delta = base_secs * fraction;
    let offset = rand::rng().random_range(-delta..=delta);
    Duration::from_secs_f64((base_secs + offset).max(0.0))
}

/// A duration uniformly drawn from `[low, high]`. Used for the gate
/// master's 60-240s peer inactivity watchdog.
pub fn jittered_range(low: Duration, high: Duration) -> Duration {
    if high <= low {
        return low;
    }
    let secs = rand::rng().random_range(low.as_secs_f64()..=high.as_secs_f64());
    Duration::from_secs_f64(secs)
}
