use std::collections::HashSet;
use std::time::Duration;

use axum::http::{HeaderName, Method, StatusCode};

use crate::matcher::PathMatcher;

/// What the coordinator does when the backing store cannot be reached.
///
/// Idempotency protection trades availability for correctness; neither
/// answer is universally right, so the choice is explicit.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum StoreErrorPolicy {
    /// Skip protection for this request and log loudly. The handler runs
    /// without at-most-once guarantees.
    FailOpen,
    /// Reject the request with `503 Service Unavailable`.
    FailClosed,
}

/// What happens to the in-flight record when the handler fails.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum HandlerFailurePolicy {
    /// Delete the record so the client's next retry executes from scratch.
    RemoveRecord,
    /// Leave the in-flight record to expire with its TTL, blocking immediate
    /// retries. Useful when the failure suggests a downstream already under
    /// load and a retry storm would make it worse.
    RetainUntilExpiry,
}

/// Configuration for the idempotency layer.
///
/// Configure:
/// - which methods and paths the protection applies to,
/// - where a key is mandatory rather than optional,
/// - record TTL and which response statuses are never cached,
/// - header names and the in-flight conflict response,
/// - policy for store outages and handler failures.
///
/// # Example
/// ```rust
/// use std::time::Duration;
/// use axum_idempotency::{IdempotencyOptions, StoreErrorPolicy};
///
/// let options = IdempotencyOptions::default()
///     .expire_after(Duration::from_secs(60 * 10))
///     .exclude_path("/internal/**")
///     .require_key_for("/payments/**")
///     .on_store_error(StoreErrorPolicy::FailClosed);
/// ```
///
/// The TTL is the only timeout the store recognizes: a handler that runs
/// longer than the TTL risks a second caller observing an expired lock and
/// re-executing. Choose it comfortably above the worst-case handler latency.
#[derive(Clone, Debug)]
pub struct IdempotencyOptions {
    pub(crate) key_header: HeaderName,
    pub(crate) replay_header: HeaderName,
    pub(crate) correlation_header: HeaderName,
    pub(crate) methods: HashSet<Method>,
    pub(crate) excluded_paths: PathMatcher,
    pub(crate) require_key_paths: PathMatcher,
    pub(crate) ttl: Duration,
    pub(crate) uncacheable_statuses: HashSet<StatusCode>,
    pub(crate) in_flight_status: StatusCode,
    pub(crate) retry_after_secs: u32,
    pub(crate) snapshot_headers: bool,
    pub(crate) on_store_error: StoreErrorPolicy,
    pub(crate) on_handler_failure: HandlerFailurePolicy,
}

impl IdempotencyOptions {
    pub fn new(ttl: Duration) -> Self {
        Self {
            ttl,
            ..Default::default()
        }
    }

    /// Sets how long a record lives, counted from lock acquisition. Replay
    /// reads never extend it.
    pub fn expire_after(mut self, ttl: Duration) -> Self {
        self.ttl = ttl;
        self
    }

    /// Sets the request header carrying the client-supplied idempotency key.
    ///
    /// The same header name is echoed on every response the layer produces
    /// for a keyed request. Default: `idempotency-key`.
    ///
    /// Alongside the key, the raw request body bytes are digested to detect
    /// the key being reused for a different payload. The digest is not
    /// structure-aware: a retry that reorders JSON fields or reformats the
    /// body is rejected as a key-reuse conflict rather than replayed.
    pub fn key_header(mut self, name: &'static str) -> Self {
        self.key_header = HeaderName::from_static(name);
        self
    }

    /// Sets the header added to a response served from the cache.
    /// Default: `idempotency-replayed: true`.
    pub fn replay_header(mut self, name: &'static str) -> Self {
        self.replay_header = HeaderName::from_static(name);
        self
    }

    /// Sets the request header whose value is carried into the record as a
    /// correlation id for tracing. Default: `x-correlation-id`.
    pub fn correlation_header(mut self, name: &'static str) -> Self {
        self.correlation_header = HeaderName::from_static(name);
        self
    }

    /// Adds a method to the set the protection applies to.
    /// Default set: POST, PUT, PATCH.
    pub fn add_method(mut self, method: Method) -> Self {
        self.methods.insert(method);
        self
    }

    /// Excludes paths matching `pattern` from idempotency handling entirely.
    ///
    /// Patterns match path segments literally, with `*` for one segment and
    /// a trailing `**` for a whole subtree.
    pub fn exclude_path(mut self, pattern: &str) -> Self {
        self.excluded_paths.push(pattern);
        self
    }

    /// Requires a key on paths matching `pattern`: a request there without
    /// one is rejected with `400` instead of passing through unprotected.
    pub fn require_key_for(mut self, pattern: &str) -> Self {
        self.require_key_paths.push(pattern);
        self
    }

    /// Requires a key on every applicable request.
    pub fn require_key_always(self) -> Self {
        self.require_key_for("/**")
    }

    /// Adds a status code to the set that is never cached. A handler
    /// response with such a status releases the lock instead of completing
    /// the record, so a retry is not blocked behind a transient error.
    pub fn uncacheable_status(mut self, status: StatusCode) -> Self {
        self.uncacheable_statuses.insert(status);
        self
    }

    /// Sets the response for a request that loses the race to an in-flight
    /// execution. Default: `409` with `Retry-After: 5`.
    pub fn in_flight_response(mut self, status: StatusCode, retry_after_secs: u32) -> Self {
        self.in_flight_status = status;
        self.retry_after_secs = retry_after_secs;
        self
    }

    /// Whether to snapshot response headers and replay them on cache hits.
    ///
    /// Connection-scoped headers (`set-cookie`, `transfer-encoding`, and
    /// friends) are excluded from the snapshot. When disabled, only status,
    /// content type, and body are replayed. Default: disabled.
    pub fn snapshot_headers(mut self, snapshot: bool) -> Self {
        self.snapshot_headers = snapshot;
        self
    }

    /// Sets the policy for store outages. Default: [`StoreErrorPolicy::FailOpen`].
    pub fn on_store_error(mut self, policy: StoreErrorPolicy) -> Self {
        self.on_store_error = policy;
        self
    }

    /// Sets the policy for handler failures while holding the lock.
    /// Default: [`HandlerFailurePolicy::RemoveRecord`].
    pub fn on_handler_failure(mut self, policy: HandlerFailurePolicy) -> Self {
        self.on_handler_failure = policy;
        self
    }
}

impl Default for IdempotencyOptions {
    fn default() -> Self {
        let mut options = Self {
            key_header: HeaderName::from_static("idempotency-key"),
            replay_header: HeaderName::from_static("idempotency-replayed"),
            correlation_header: HeaderName::from_static("x-correlation-id"),
            methods: HashSet::new(),
            excluded_paths: PathMatcher::default(),
            require_key_paths: PathMatcher::default(),
            ttl: Duration::from_secs(60 * 5), // 5 mins default
            uncacheable_statuses: HashSet::new(),
            in_flight_status: StatusCode::CONFLICT,
            retry_after_secs: 5,
            snapshot_headers: false,
            on_store_error: StoreErrorPolicy::FailOpen,
            on_handler_failure: HandlerFailurePolicy::RemoveRecord,
        };

        for method in [Method::POST, Method::PUT, Method::PATCH] {
            options.methods.insert(method);
        }

        let default_uncacheable_statuses = [
            StatusCode::BAD_GATEWAY,
            StatusCode::BAD_REQUEST,
            StatusCode::FORBIDDEN,
            StatusCode::GATEWAY_TIMEOUT,
            StatusCode::INTERNAL_SERVER_ERROR,
            StatusCode::REQUEST_TIMEOUT,
            StatusCode::SERVICE_UNAVAILABLE,
            StatusCode::TOO_MANY_REQUESTS,
            StatusCode::UNAUTHORIZED,
        ];

        for status_code in default_uncacheable_statuses {
            options.uncacheable_statuses.insert(status_code);
        }

        options
    }
}
