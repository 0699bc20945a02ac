// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! Cancellation source/token/registration (§4.3), mapped onto
//! [`tokio_util::sync::CancellationToken`].
//!
//! A [`tokio_util::sync::CancellationToken`] already is the
//! source+token+registration graph described in the design: cloning it is
//! "deriving a token", [`tokio_util::sync::CancellationToken::cancel`] is
//! "requesting cancellation" (idempotent, runs every `.cancelled()` waiter
//! exactly once), and [`tokio_util::sync::CancellationToken::child_token`]
//! is parent-to-child propagation. This module only adds the one thing the
//! raw type doesn't give for free: a scoped guard for suspension points that
//! must observe "already cancelled" before blocking and must stop listening
//! once they resolve on their own, mirroring the source's requirement
//! (§4.3) that every blocking suspension point check-then-register-then-
//! recheck around cancellation.

use tokio_util::sync::CancellationToken;

use crate::error::MeshError;

/// Checks a token for the "already cancelled" fast path required at every
/// suspension point (§4.3 step 2), returning [`MeshError::Canceled`] if so.
pub fn fail_if_cancelled(token: &CancellationToken) -> Result<(), MeshError> {
    if token.is_cancelled() {
        Err(MeshError::Canceled)
    } else {
        Ok(())
    }
}

/// Races a future against a token's cancellation, returning
/// [`MeshError::Canceled`] if the token fires first. This is the direct
/// analogue of registering a cancellation callback that removes a
/// suspension from its queue and resumes the coroutine: `tokio::select!`
/// does the removal implicitly by dropping the losing branch.
pub async fn cancelable<F, T>(token: &CancellationToken, fut: F) -> Result<T, MeshError>
where F: Future<Output = T> {
    fail_if_cancelled(token)?;
    tokio::select! {
        biased;
        () = token.cancelled() => Err(MeshError::Canceled),
        v = fut => Ok(v),
    }
}

/// A child cancellation scope that is cancelled either explicitly or when
/// dropped, whichever comes first — the RAII form of "detach a registration
/// once the suspension point resolves without cancellation" so long-lived
/// parent tokens (a connection's lifetime token) don't accumulate
/// registrations from short-lived loops (a single ping round-trip).
pub struct CancelGuard {
    token: CancellationToken,
}

impl CancelGuard {
    /// Creates a child scope of `parent` that is torn down when this guard
    /// drops.
    pub fn child_of(parent: &CancellationToken) -> Self {
        Self {
            token: parent.child_token(),
        }
    }

    /// The scope's token, to pass into a single suspension point.
    pub fn token(&self) -> CancellationToken {
        self.token.clone()
    }
}

impl Drop for CancelGuard {
    fn drop(&mut self) {
        self.token.cancel();
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    #[tokio::test]
    async fn cancelable_returns_value_when_not_canceled() {
        let token = CancellationToken::new();
        let r = cancelable(&token, async { 42 }).await;
        assert_eq!(r.expect("ok"), 42);
    }

    #[tokio::test]
    async fn cancelable_short_circuits_when_already_canceled() {
        let token = CancellationToken::new();
        token.cancel();
        let r = cancelable(&token, async { 42 }).await;
        assert!(matches!(r, Err(MeshError::Canceled)));
    }

    #[tokio::test]
    async fn cancelable_races_a_pending_cancellation() {
        let token = CancellationToken::new();
        let t2 = token.clone();
        tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(5)).await;
            t2.cancel();
        });
        let r = cancelable(&token, async {
            tokio::time::sleep(Duration::from_secs(3600)).await;
            1
        })
        .await;
        assert!(matches!(r, Err(MeshError::Canceled)));
    }

    #[tokio::test]
    async fn guard_cancels_child_scope_on_drop() {
        let parent = CancellationToken::new();
        let child_token = {
            let guard = CancelGuard::child_of(&parent);
            let t = guard.token();
            assert!(!t.is_cancelled());
            t
        };
        assert!(child_token.is_cancelled());
        assert!(!parent.is_cancelled());
    }
}
