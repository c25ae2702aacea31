//! Idempotency records and the store that arbitrates access to them.
//!
//! The store is the single synchronization point of the middleware: every
//! race between concurrent requests sharing a key is resolved inside
//! [`IdempotencyStore::try_acquire`], nowhere else. The coordinator and key
//! resolver are stateless per request.

use std::time::{Duration, Instant};

use async_trait::async_trait;
use axum::body::Bytes;
use axum::http::{HeaderName, HeaderValue, Method, StatusCode};

pub mod memory;

/// State of a record's single lifecycle transition.
///
/// A record is created `InFlight` by a successful acquisition and moves to
/// `Completed` exactly once; the only other exit is deletion (explicit
/// failure cleanup or expiry).
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum RecordState {
    InFlight,
    Completed,
}

/// The response payload persisted for a completed record, replayed verbatim
/// on cache hits.
#[derive(Clone, Debug, PartialEq)]
pub struct StoredResponse {
    pub status: StatusCode,
    pub body: Bytes,
    pub content_type: Option<HeaderValue>,
    /// Filtered snapshot of the remaining response headers, present only when
    /// header snapshotting is enabled.
    pub headers: Option<Vec<(HeaderName, HeaderValue)>>,
}

/// One (key → outcome) mapping.
#[derive(Clone, Debug)]
pub struct IdempotencyRecord {
    pub key: String,
    pub resource_path: String,
    pub http_method: Method,
    /// Digest of the request body at acquisition time. Used to detect a key
    /// being reused for a different logical request; never part of the key.
    pub request_body_hash: String,
    pub state: RecordState,
    /// Set exactly when `state` is `Completed`.
    pub response: Option<StoredResponse>,
    pub correlation_id: Option<String>,
    pub created_at: Instant,
    pub expires_at: Instant,
}

impl IdempotencyRecord {
    pub fn is_expired(&self, now: Instant) -> bool {
        now >= self.expires_at
    }
}

/// Arguments to [`IdempotencyStore::try_acquire`].
#[derive(Clone, Copy, Debug)]
pub struct AcquireRequest<'a> {
    pub key: &'a str,
    pub resource_path: &'a str,
    pub http_method: &'a Method,
    pub request_body_hash: &'a str,
    pub ttl: Duration,
    pub correlation_id: Option<&'a str>,
}

/// Outcome of an acquisition attempt.
///
/// `CachedHit` and `InFlight` both carry the existing record so the caller
/// can compare `request_body_hash` and distinguish a legitimate retry from a
/// key-reuse conflict. The store itself never merges differing payloads.
#[derive(Clone, Debug)]
pub enum LockResult {
    /// No live record existed; the caller now owns the `InFlight` record and
    /// must eventually call `complete` or `fail`.
    Acquired,
    /// A completed, unexpired record exists; replay it.
    CachedHit(IdempotencyRecord),
    /// Another execution for this key is still running.
    InFlight(IdempotencyRecord),
}

/// Errors surfaced by a store backend.
#[derive(Debug, thiserror::Error)]
pub enum StoreError {
    /// The backing storage could not be reached or answered with a transport
    /// error. The coordinator maps this to its fail-open/fail-closed policy.
    #[error("idempotency store unavailable: {0}")]
    Unavailable(#[source] Box<dyn std::error::Error + Send + Sync>),

    /// The caller violated an operation precondition (empty key, zero TTL).
    #[error("invalid store request: {0}")]
    InvalidRequest(&'static str),
}

/// Atomic lock-acquire, complete, and fail operations over idempotency
/// records.
///
/// Implementations must make `try_acquire` a single atomic read-modify-write
/// per key: two concurrent acquisitions for the same key must never both
/// observe [`LockResult::Acquired`]. Records past their `expires_at` are
/// logically absent to `try_acquire` regardless of physical cleanup timing.
#[async_trait]
pub trait IdempotencyStore: Send + Sync + 'static {
    /// Attempts to take ownership of `key` for one execution.
    ///
    /// Creates an `InFlight` record with `expires_at = now + ttl` when no
    /// live record exists (including when only an expired record exists,
    /// which is overwritten). Otherwise reports the live record's state.
    async fn try_acquire(&self, request: AcquireRequest<'_>) -> Result<LockResult, StoreError>;

    /// Transitions `key` from `InFlight` to `Completed`, persisting the
    /// response to replay.
    ///
    /// Calling this without a prior `Acquired` is a contract violation;
    /// implementations log it and must not fail on an identical
    /// double-complete.
    async fn complete(&self, key: &str, response: StoredResponse) -> Result<(), StoreError>;

    /// Releases the lock after a failed execution.
    ///
    /// With `remove_record = true` the record is deleted and the next
    /// retry proceeds from scratch. With `false` the `InFlight` record is
    /// left to expire naturally, blocking immediate retries for the rest of
    /// the TTL. A `Completed` record is never deleted by this call.
    async fn fail(&self, key: &str, remove_record: bool) -> Result<(), StoreError>;
}
