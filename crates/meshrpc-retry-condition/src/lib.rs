// SPDX-License-Identifier: MIT OR Apache-2.0
//! Retry predicates for the meshrpc retry engine.
//!
//! A [`Condition<E>`] classifies whether a given error, at a given attempt
//! number, is eligible for retry. The family is generic over the error type
//! `E` the retry engine is instantiated with (almost always
//! `meshrpc_error::ClientError`) rather than hard-coded to one concrete
//! type, so a downstream crate retrying its own error enum can still reuse
//! `And`/`Or`/`Not`/`Custom`.
#![deny(unsafe_code)]
#![warn(missing_docs)]

use meshrpc_error::{HasRpcCode, HasStatusCode, RpcCode};
use std::collections::HashSet;
use std::error::Error as StdError;

/// A predicate `(err, attempt) -> bool` deciding retry eligibility.
///
/// All provided implementations return `false` when given no signal to work
/// with (e.g. `OnCodes` against an error with no RPC code attached) rather
/// than panicking or guessing.
pub trait Condition<E>: Send + Sync {
    /// Should the caller retry, given this error occurred on `attempt`?
    fn should_retry(&self, err: &E, attempt: u32) -> bool;
}

impl<E, F> Condition<E> for F
where
    F: Fn(&E, u32) -> bool + Send + Sync,
{
    fn should_retry(&self, err: &E, attempt: u32) -> bool {
        self(err, attempt)
    }
}

/// A type-erased, heap-allocated [`Condition`].
pub type BoxCondition<E> = Box<dyn Condition<E>>;

/// Always eligible for retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Always;

impl<E> Condition<E> for Always {
    fn should_retry(&self, _err: &E, _attempt: u32) -> bool {
        true
    }
}

/// Never eligible for retry.
#[derive(Debug, Clone, Copy, Default)]
pub struct Never;

impl<E> Condition<E> for Never {
    fn should_retry(&self, _err: &E, _attempt: u32) -> bool {
        false
    }
}

/// True iff `err` wraps `target` somewhere in its source chain (transitive
/// cause inspection), including `err` itself.
pub struct OnError<T> {
    target: T,
}

impl<T> OnError<T> {
    /// Build a condition matching any error whose chain contains `target`.
    pub fn new(target: T) -> Self {
        Self { target }
    }
}

impl<E, T> Condition<E> for OnError<T>
where
    E: StdError + 'static,
    T: PartialEq + 'static,
{
    fn should_retry(&self, err: &E, _attempt: u32) -> bool {
        chain_contains(err, &self.target)
    }
}

/// True iff `err`'s chain contains any of `targets` (any-of variant of
/// [`OnError`]).
pub struct OnErrors<T> {
    targets: Vec<T>,
}

impl<T> OnErrors<T> {
    /// Build a condition matching any error whose chain contains any of
    /// `targets`.
    pub fn new(targets: Vec<T>) -> Self {
        Self { targets }
    }
}

impl<E, T> Condition<E> for OnErrors<T>
where
    E: StdError + 'static,
    T: PartialEq + 'static,
{
    fn should_retry(&self, err: &E, _attempt: u32) -> bool {
        self.targets.iter().any(|target| chain_contains(err, target))
    }
}

fn chain_contains<E, T>(err: &E, target: &T) -> bool
where
    E: StdError + 'static,
    T: PartialEq + 'static,
{
    let mut cursor: Option<&(dyn StdError + 'static)> = Some(err);
    while let Some(current) = cursor {
        if let Some(candidate) = current.downcast_ref::<T>()
            && candidate == target
        {
            return true;
        }
        cursor = current.source();
    }
    false
}

/// True iff the RPC status code extracted from `err` (via [`HasRpcCode`])
/// matches any of the configured codes.
pub struct OnCodes {
    codes: HashSet<RpcCode>,
}

impl OnCodes {
    /// Build a condition matching any of `codes`.
    #[must_use]
    pub fn new(codes: impl IntoIterator<Item = RpcCode>) -> Self {
        Self {
            codes: codes.into_iter().collect(),
        }
    }
}

impl<E: HasRpcCode> Condition<E> for OnCodes {
    fn should_retry(&self, err: &E, _attempt: u32) -> bool {
        err.rpc_code().is_some_and(|code| self.codes.contains(&code))
    }
}

/// True iff the HTTP status code extracted from `err` (via
/// [`HasStatusCode`]) matches any of the configured statuses.
pub struct OnHttpStatus {
    statuses: HashSet<u16>,
}

impl OnHttpStatus {
    /// Build a condition matching any of `statuses`.
    #[must_use]
    pub fn new(statuses: impl IntoIterator<Item = u16>) -> Self {
        Self {
            statuses: statuses.into_iter().collect(),
        }
    }
}

impl<E: HasStatusCode> Condition<E> for OnHttpStatus {
    fn should_retry(&self, err: &E, _attempt: u32) -> bool {
        err.status_code().is_some_and(|code| self.statuses.contains(&code))
    }
}

/// True for errors that look transient: an RPC code of `Unavailable` or
/// `DeadlineExceeded` via [`HasRpcCode`], or (when `E` also exposes a
/// source chain) a wrapped [`std::io::Error`] whose kind is one of
/// connection-refused, connection-reset, timed-out, or broken-pipe.
#[derive(Debug, Clone, Copy, Default)]
pub struct OnTemporary;

impl<E> Condition<E> for OnTemporary
where
    E: HasRpcCode + StdError + 'static,
{
    fn should_retry(&self, err: &E, _attempt: u32) -> bool {
        if matches!(
            err.rpc_code(),
            Some(RpcCode::Unavailable) | Some(RpcCode::DeadlineExceeded)
        ) {
            return true;
        }
        let mut cursor: Option<&(dyn StdError + 'static)> = Some(err);
        while let Some(current) = cursor {
            if let Some(io_err) = current.downcast_ref::<std::io::Error>() {
                use std::io::ErrorKind;
                if matches!(
                    io_err.kind(),
                    ErrorKind::ConnectionRefused
                        | ErrorKind::ConnectionReset
                        | ErrorKind::TimedOut
                        | ErrorKind::BrokenPipe
                ) {
                    return true;
                }
            }
            cursor = current.source();
        }
        false
    }
}

/// A user-supplied predicate wrapped to satisfy [`Condition`].
pub struct Custom<E> {
    predicate: Box<dyn Fn(&E, u32) -> bool + Send + Sync>,
}

impl<E> Custom<E> {
    /// Wrap `predicate` as a [`Condition`].
    pub fn new(predicate: impl Fn(&E, u32) -> bool + Send + Sync + 'static) -> Self {
        Self {
            predicate: Box::new(predicate),
        }
    }
}

impl<E> Condition<E> for Custom<E> {
    fn should_retry(&self, err: &E, attempt: u32) -> bool {
        (self.predicate)(err, attempt)
    }
}

/// True iff both wrapped conditions are true.
pub struct And<E> {
    left: BoxCondition<E>,
    right: BoxCondition<E>,
}

impl<E> And<E> {
    /// Combine `left` and `right` with logical AND.
    pub fn new(left: BoxCondition<E>, right: BoxCondition<E>) -> Self {
        Self { left, right }
    }
}

impl<E> Condition<E> for And<E> {
    fn should_retry(&self, err: &E, attempt: u32) -> bool {
        self.left.should_retry(err, attempt) && self.right.should_retry(err, attempt)
    }
}

/// True iff either wrapped condition is true.
pub struct Or<E> {
    left: BoxCondition<E>,
    right: BoxCondition<E>,
}

impl<E> Or<E> {
    /// Combine `left` and `right` with logical OR.
    pub fn new(left: BoxCondition<E>, right: BoxCondition<E>) -> Self {
        Self { left, right }
    }
}

impl<E> Condition<E> for Or<E> {
    fn should_retry(&self, err: &E, attempt: u32) -> bool {
        self.left.should_retry(err, attempt) || self.right.should_retry(err, attempt)
    }
}

/// Negates the wrapped condition.
pub struct Not<E> {
    inner: BoxCondition<E>,
}

impl<E> Not<E> {
    /// Negate `inner`.
    pub fn new(inner: BoxCondition<E>) -> Self {
        Self { inner }
    }
}

impl<E> Condition<E> for Not<E> {
    fn should_retry(&self, err: &E, attempt: u32) -> bool {
        !self.inner.should_retry(err, attempt)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use meshrpc_error::ClientError;
    use std::io;

    fn transport(code: RpcCode) -> ClientError {
        ClientError::transport_with_code(code, io::Error::new(io::ErrorKind::Other, "boom"))
    }

    #[test]
    fn always_and_never() {
        let err = transport(RpcCode::Internal);
        assert!(Always.should_retry(&err, 1));
        assert!(!Never.should_retry(&err, 1));
    }

    #[test]
    fn on_codes_matches_configured_set() {
        let cond = OnCodes::new([RpcCode::Unavailable, RpcCode::Aborted]);
        assert!(cond.should_retry(&transport(RpcCode::Unavailable), 1));
        assert!(!cond.should_retry(&transport(RpcCode::Internal), 1));
    }

    #[test]
    fn on_temporary_matches_unavailable_and_deadline() {
        let cond = OnTemporary;
        assert!(cond.should_retry(&transport(RpcCode::Unavailable), 1));
        let deadline = ClientError::DeadlineExceeded {
            elapsed: std::time::Duration::from_secs(1),
        };
        assert!(cond.should_retry(&deadline, 1));
        assert!(!cond.should_retry(&transport(RpcCode::InvalidArgument), 1));
    }

    #[test]
    fn on_temporary_matches_wrapped_io_errors() {
        let cond = OnTemporary;
        let err = ClientError::dial_failed(
            "127.0.0.1:9000",
            io::Error::new(io::ErrorKind::ConnectionRefused, "refused"),
        );
        assert!(cond.should_retry(&err, 1));
    }

    #[test]
    fn on_error_walks_source_chain() {
        #[derive(Debug, PartialEq)]
        struct Sentinel;
        impl std::fmt::Display for Sentinel {
            fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
                write!(f, "sentinel")
            }
        }
        impl StdError for Sentinel {}

        let err = ClientError::transport(Sentinel);
        let cond = OnError::new(Sentinel);
        assert!(cond.should_retry(&err, 1));
    }

    #[test]
    fn custom_predicate_is_invoked() {
        let cond = Custom::new(|_err: &ClientError, attempt: u32| attempt < 3);
        let err = transport(RpcCode::Internal);
        assert!(cond.should_retry(&err, 1));
        assert!(!cond.should_retry(&err, 3));
    }

    #[test]
    fn combinators_compose() {
        let err = transport(RpcCode::Unavailable);
        let and: And<ClientError> = And::new(Box::new(Always), Box::new(Never));
        assert!(!and.should_retry(&err, 1));

        let or: Or<ClientError> = Or::new(Box::new(Never), Box::new(Always));
        assert!(or.should_retry(&err, 1));

        let not: Not<ClientError> = Not::new(Box::new(Always));
        assert!(!not.should_retry(&err, 1));
    }
}

#[cfg(test)]
mod proptests {
    use super::*;
    use meshrpc_error::ClientError;
    use proptest::prelude::*;

    const ALL_CODES: [RpcCode; 17] = [
        RpcCode::Ok,
        RpcCode::Cancelled,
        RpcCode::Unknown,
        RpcCode::InvalidArgument,
        RpcCode::DeadlineExceeded,
        RpcCode::NotFound,
        RpcCode::AlreadyExists,
        RpcCode::PermissionDenied,
        RpcCode::ResourceExhausted,
        RpcCode::FailedPrecondition,
        RpcCode::Aborted,
        RpcCode::OutOfRange,
        RpcCode::Unimplemented,
        RpcCode::Internal,
        RpcCode::Unavailable,
        RpcCode::DataLoss,
        RpcCode::Unauthenticated,
    ];

    fn any_code() -> impl Strategy<Value = RpcCode> {
        proptest::sample::select(&ALL_CODES[..])
    }

    fn transport(code: RpcCode) -> ClientError {
        ClientError::transport_with_code(code, std::io::Error::other("boom"))
    }

    proptest! {
        #[test]
        fn not_and_is_or_of_nots_de_morgan(
            left_codes in proptest::collection::vec(any_code(), 0..5),
            right_codes in proptest::collection::vec(any_code(), 0..5),
            probe in any_code(),
        ) {
            let err = transport(probe);
            let make_and_negated = || -> Not<ClientError> {
                Not::new(Box::new(And::new(
                    Box::new(OnCodes::new(left_codes.clone())),
                    Box::new(OnCodes::new(right_codes.clone())),
                )))
            };
            let make_or_of_nots = || -> Or<ClientError> {
                Or::new(
                    Box::new(Not::new(Box::new(OnCodes::new(left_codes.clone())))),
                    Box::new(Not::new(Box::new(OnCodes::new(right_codes.clone())))),
                )
            };
            prop_assert_eq!(
                make_and_negated().should_retry(&err, 1),
                make_or_of_nots().should_retry(&err, 1)
            );
        }

        #[test]
        fn on_codes_matches_iff_probe_is_in_the_set(codes in proptest::collection::vec(any_code(), 0..17), probe in any_code()) {
            let cond = OnCodes::new(codes.clone());
            let err = transport(probe);
            prop_assert_eq!(cond.should_retry(&err, 1), codes.contains(&probe));
        }
    }
}
