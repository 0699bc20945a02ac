// SPDX-License-Identifier: AGPL-3.0-or-later
// Copyright (C) 2012-2025 Andrei Maltsev

//! `AND`/`OR` composition of awaitables (§4.2), mapped onto
//! `tokio::select!`.
//!
//! The source composes two coroutines with `AND` (wait-both, fail-fast) and
//! `OR` (wait-first-success). Both reduce to the same shape once results
//! flow through `Result`: race two pinned futures, and depending on which
//! side resolves first and whether it succeeded, either finish immediately
//! or poll the remaining side to completion. Dropping the losing future is
//! this crate's cancellation of it — cooperative cancellation by
//! construction, the same guarantee `tokio::select!` gives everywhere else
//! in this crate.

use tokio::pin;

/// The side that completed, used as the "variant index" the design asks
/// callers of `OR` to inspect (e.g. an RPC call's reply vs. a timeout).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Either<A, B> {
    /// The left branch (first argument) produced the result.
    Left(A),
    /// The right branch (second argument) produced the result.
    Right(B),
}

impl<A, B> Either<A, B> {
    /// `0` if [`Either::Left`], `1` if [`Either::Right`] — the variant
    /// index the design refers to for `OR`-with-timeout composition.
    pub fn index(&self) -> usize {
        match self {
            Either::Left(_) => 0,
            Either::Right(_) => 1,
        }
    }
}

/// Both sides of an `AND`/`OR` composition failed. At least one of `a`/`b`
/// is always `Some` on this path through the combinators below; both are
/// `Some` exactly in the "both raised" case the design calls out.
#[derive(Debug, thiserror::Error)]
#[error("composition failed: left={a:?} right={b:?}")]
pub struct MultiError<EA: std::fmt::Debug, EB: std::fmt::Debug> {
    /// The left branch's error, if it failed.
    pub a: Option<EA>,
    /// The right branch's error, if it failed.
    pub b: Option<EB>,
}

/// `A AND B`: wait for both to complete; fail fast on the first error but
/// still drains the other branch so a near-simultaneous second failure is
/// reported as [`MultiError`] with both errors populated, per the design's
/// "if both raise, wrap both".
pub async fn all<FA, FB, TA, TB, EA, EB>(
    fut_a: FA,
    fut_b: FB,
) -> Result<(TA, TB), MultiError<EA, EB>>
where
    FA: Future<Output = Result<TA, EA>>,
    FB: Future<Output = Result<TB, EB>>,
    EA: std::fmt::Debug,
    EB: std::fmt::Debug,
{
    pin!(fut_a);
    pin!(fut_b);

    tokio::select! {
        ra = &mut fut_a => match ra {
            Ok(va) => match fut_b.await {
                Ok(vb) => Ok((va, vb)),
                Err(eb) => Err(MultiError { a: None, b: Some(eb) }),
            },
            Err(ea) => match fut_b.await {
                Ok(_) => Err(MultiError { a: Some(ea), b: None }),
                Err(eb) => Err(MultiError { a: Some(ea), b: Some(eb) }),
            },
        },
        rb = &mut fut_b => match rb {
            Ok(vb) => match fut_a.await {
                Ok(va) => Ok((va, vb)),
                Err(ea) => Err(MultiError { a: Some(ea), b: None }),
            },
            Err(eb) => match fut_a.await {
                Ok(_) => Err(MultiError { a: None, b: Some(eb) }),
                Err(ea) => Err(MultiError { a: Some(ea), b: Some(eb) }),
            },
        },
    }
}

/// `A OR B`: the first side to complete *successfully* wins and is the
/// result, implicitly cancelling the other by no longer polling it. If the
/// first side to complete failed, the other side is awaited instead; if
/// both fail, the result is [`MultiError`] with both populated.
pub async fn first_ok<FA, FB, TA, TB, EA, EB>(
    fut_a: FA,
    fut_b: FB,
) -> Result<Either<TA, TB>, MultiError<EA, EB>>
where
    FA: Future<Output = Result<TA, EA>>,
    FB: Future<Output = Result<TB, EB>>,
    EA: std::fmt::Debug,
    EB: std::fmt::Debug,
{
    pin!(fut_a);
    pin!(fut_b);

    tokio::select! {
        ra = &mut fut_a => match ra {
            Ok(va) => Ok(Either::Left(va)),
            Err(ea) => match fut_b.await {
                Ok(vb) => Ok(Either::Right(vb)),
                Err(eb) => Err(MultiError { a: Some(ea), b: Some(eb) }),
            },
        },
        rb = &mut fut_b => match rb {
            Ok(vb) => Ok(Either::Right(vb)),
            Err(eb) => match fut_a.await {
                Ok(va) => Ok(Either::Left(va)),
                Err(ea) => Err(MultiError { a: Some(ea), b: Some(eb) }),
            },
        },
    }
}

#[cfg(test)]
mod tests {
    use std::time::Duration;

    use super::*;

    async fn ok_after(ms: u64) -> Result<u32, &'static str> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Ok(ms as u32)
    }

    async fn err_after(ms: u64) -> Result<u32, &'static str> {
        tokio::time::sleep(Duration::from_millis(ms)).await;
        Err("boom")
    }

    #[tokio::test]
    async fn or_returns_first_success() {
        let r = first_ok(ok_after(5), ok_after(500)).await.expect("ok");
        assert_eq!(r, Either::Left(5));
        assert_eq!(r.index(), 0);
    }

    #[tokio::test]
    async fn or_falls_back_to_other_side_on_first_failure() {
        let r = first_ok(err_after(5), ok_after(50)).await.expect("ok");
        assert_eq!(r, Either::Right(50));
    }

    #[tokio::test]
    async fn or_wraps_both_errors_when_both_fail() {
        let r = first_ok(err_after(5), err_after(10)).await;
        let e = r.expect_err("should fail");
        assert_eq!(e.a, Some("boom"));
        assert_eq!(e.b, Some("boom"));
    }

    #[tokio::test]
    async fn and_waits_for_both_successes() {
        let (a, b) = all(ok_after(5), ok_after(10)).await.expect("ok");
        assert_eq!((a, b), (5, 10));
    }

    #[tokio::test]
    async fn and_fails_fast_on_first_error() {
        let r = all(err_after(5), ok_after(200)).await;
        assert!(r.is_err());
    }
}
