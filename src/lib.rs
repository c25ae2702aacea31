//! Idempotency coordination middleware for axum.
//!
//! This crate guarantees that a non-idempotent write request (POST, PUT,
//! PATCH), when retried by a client under the same idempotency key, executes
//! its side effects **at most once** and returns a byte-identical replayed
//! response. It arbitrates races between concurrent requests sharing a key,
//! distinguishes "never seen", "in-flight", and "completed" states, bounds
//! record lifetime with a TTL, and survives handler failures without leaving
//! a key permanently locked.
//!
//! ## How it works
//!
//! Each applicable request resolves a key from a client-supplied header
//! (default: `Idempotency-Key`) together with a blake3 digest of the request
//! body, then asks the store to acquire a per-key lock in a single atomic
//! step:
//!
//! 1. **Acquired** — no live record existed. The downstream handler runs with
//!    its output captured; on success the response is persisted and the
//!    record completes, on failure the lock is released.
//! 2. **Cached hit** — a completed record exists. The stored response is
//!    replayed verbatim with a replay marker header; the handler never runs.
//! 3. **In flight** — another execution for the same key is still running.
//!    The request is answered with a conflict status and a `Retry-After`
//!    hint; the handler never runs.
//!
//! A key reused with a different request body is rejected with `422`, since
//! retrying such a request can never succeed. The comparison digests the raw
//! body bytes: a retry must resend the body byte-for-byte, so reordered JSON
//! fields or changed whitespace count as a different payload. Requests
//! without a key pass through unprotected unless the path is configured to
//! require one.
//!
//! ## Example
//!
//! ```rust,no_run
//! use std::sync::Arc;
//! use std::time::Duration;
//! use axum::{Router, routing::post};
//! use axum_idempotency::{IdempotencyLayer, IdempotencyOptions};
//! use axum_idempotency::store::memory::MemoryStore;
//!
//! # #[tokio::main]
//! # async fn main() {
//! let store = Arc::new(MemoryStore::new());
//!
//! let options = IdempotencyOptions::default()
//!     .expire_after(Duration::from_secs(60 * 5))
//!     .require_key_for("/payments/**");
//!
//! let app = Router::new()
//!     .route("/payments", post(process_payment))
//!     .layer(IdempotencyLayer::new(store, options));
//!
//! # let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
//! # axum::serve(listener, app).await.unwrap();
//! # }
//! #
//! # async fn process_payment() -> &'static str {
//! #     "Payment processed"
//! # }
//! ```
//!
//! ## Default behavior
//!
//! Responses with the following status codes are never cached; the lock is
//! released instead so a retry is not blocked behind a transient error:
//! `400`, `401`, `403`, `408`, `429`, `500`, `502`, `503`, `504`.
//!
//! The TTL (default: 5 minutes) bounds both how long a completed response is
//! replayable and how long a crashed execution can block its key. A handler
//! slower than the TTL risks re-execution by a concurrent retry; size the TTL
//! above worst-case handler latency.

use std::future::Future;
use std::pin::Pin;
use std::sync::Arc;
use std::task::{Context, Poll};

use axum::body::Body;
use axum::extract::Request;
use axum::http::header::{CONTENT_TYPE, RETRY_AFTER};
use axum::http::{HeaderValue, StatusCode};
use axum::response::Response;
use tower_layer::Layer;
use tower_service::Service;

mod capture;
mod config;
mod key;
mod matcher;
pub mod store;

pub use crate::config::{HandlerFailurePolicy, IdempotencyOptions, StoreErrorPolicy};
use crate::key::ResolvedKey;
use crate::store::{AcquireRequest, IdempotencyStore, LockResult};

/// Service that coordinates idempotent request processing.
#[derive(Debug)]
pub struct IdempotencyService<S, T> {
    inner: S,
    store: Arc<T>,
    config: IdempotencyOptions,
}

impl<S: Clone, T> Clone for IdempotencyService<S, T> {
    fn clone(&self) -> Self {
        Self {
            inner: self.inner.clone(),
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}

impl<S, T> IdempotencyService<S, T> {
    pub fn new(inner: S, store: Arc<T>, config: IdempotencyOptions) -> Self {
        Self {
            inner,
            store,
            config,
        }
    }
}

impl<S, T> Service<Request> for IdempotencyService<S, T>
where
    S: Service<Request, Response = Response> + Clone + Send + 'static,
    S::Error: Send,
    S::Future: Send + 'static,
    T: IdempotencyStore,
{
    type Response = S::Response;
    type Error = S::Error;
    type Future = Pin<Box<dyn Future<Output = Result<Self::Response, Self::Error>> + Send>>;

    fn poll_ready(&mut self, cx: &mut Context<'_>) -> Poll<Result<(), Self::Error>> {
        self.inner.poll_ready(cx).map_err(Into::into)
    }

    fn call(&mut self, req: Request) -> Self::Future {
        let clone = self.inner.clone();
        let mut inner = std::mem::replace(&mut self.inner, clone);
        let config = self.config.clone();
        let store = self.store.clone();

        Box::pin(async move {
            // Applicability is decided before any key work: non-write methods
            // and excluded paths bypass the coordinator entirely.
            if !config.methods.contains(req.method())
                || config.excluded_paths.matches(req.uri().path())
            {
                return inner.call(req).await;
            }

            let path = req.uri().path().to_owned();
            let method = req.method().clone();
            let correlation_id = req
                .headers()
                .get(&config.correlation_header)
                .and_then(|value| value.to_str().ok())
                .map(str::to_owned);

            let (req, resolved) = match key::resolve_key(req, &config).await {
                Ok(pair) => pair,
                Err(err) => {
                    tracing::error!(error = %err, "failed to buffer request body for idempotency hashing");
                    return Ok(text_response(
                        StatusCode::BAD_REQUEST,
                        "unreadable request body".into(),
                    ));
                }
            };

            let Some(resolved) = resolved else {
                if config.require_key_paths.matches(&path) {
                    tracing::debug!(%path, "rejecting request without required idempotency key");
                    return Ok(text_response(
                        StatusCode::BAD_REQUEST,
                        format!("missing required {} header", config.key_header),
                    ));
                }
                // Keyless and no requirement on this path: pass through
                // unprotected.
                return inner.call(req).await;
            };

            let acquisition = store
                .try_acquire(AcquireRequest {
                    key: &resolved.key,
                    resource_path: &path,
                    http_method: &method,
                    request_body_hash: &resolved.request_body_hash,
                    ttl: config.ttl,
                    correlation_id: correlation_id.as_deref(),
                })
                .await;

            let acquisition = match acquisition {
                Ok(acquisition) => acquisition,
                Err(err) => match config.on_store_error {
                    StoreErrorPolicy::FailOpen => {
                        tracing::error!(
                            key = %resolved.key,
                            ?correlation_id,
                            error = %err,
                            "idempotency store unavailable; failing open without protection"
                        );
                        return inner.call(req).await;
                    }
                    StoreErrorPolicy::FailClosed => {
                        tracing::error!(
                            key = %resolved.key,
                            ?correlation_id,
                            error = %err,
                            "idempotency store unavailable; failing closed"
                        );
                        let mut res = text_response(
                            StatusCode::SERVICE_UNAVAILABLE,
                            "idempotency store unavailable".into(),
                        );
                        echo_key(&mut res, &config, &resolved);
                        return Ok(res);
                    }
                },
            };

            match acquisition {
                LockResult::CachedHit(record) => {
                    if record.request_body_hash != resolved.request_body_hash {
                        return Ok(key_reuse_response(&config, &resolved));
                    }
                    let Some(stored) = &record.response else {
                        // A completed record always carries its response;
                        // treat a violation as a miss rather than replaying
                        // nothing.
                        tracing::error!(key = %resolved.key, "completed record without a stored response");
                        return Ok(text_response(
                            StatusCode::INTERNAL_SERVER_ERROR,
                            "idempotency record corrupted".into(),
                        ));
                    };
                    tracing::debug!(key = %resolved.key, ?correlation_id, "replaying cached response");
                    let mut res = capture::replay_response(stored);
                    res.headers_mut()
                        .insert(config.replay_header.clone(), HeaderValue::from_static("true"));
                    echo_key(&mut res, &config, &resolved);
                    Ok(res)
                }
                LockResult::InFlight(record) => {
                    if record.request_body_hash != resolved.request_body_hash {
                        return Ok(key_reuse_response(&config, &resolved));
                    }
                    tracing::debug!(
                        key = %resolved.key,
                        ?correlation_id,
                        "another execution holds this key; answering with conflict"
                    );
                    let mut res = text_response(
                        config.in_flight_status,
                        "a request with this idempotency key is already in flight".into(),
                    );
                    res.headers_mut()
                        .insert(RETRY_AFTER, HeaderValue::from(config.retry_after_secs));
                    echo_key(&mut res, &config, &resolved);
                    Ok(res)
                }
                LockResult::Acquired => {
                    execute_and_record(inner, req, store, config, resolved, correlation_id).await
                }
            }
        })
    }
}

/// Drives the downstream handler while holding the lock, then reports the
/// outcome back to the store.
async fn execute_and_record<S, T>(
    mut inner: S,
    req: Request,
    store: Arc<T>,
    config: IdempotencyOptions,
    resolved: ResolvedKey,
    correlation_id: Option<String>,
) -> Result<Response, S::Error>
where
    S: Service<Request, Response = Response>,
    T: IdempotencyStore,
{
    let remove_record = config.on_handler_failure == HandlerFailurePolicy::RemoveRecord;
    // Lock release on cancellation is mandatory: if this future is dropped
    // mid-execution (client disconnect), the guard spawns the cleanup. It
    // stays armed until the complete/fail round-trip has returned, since the
    // drop can also land mid-await on the store; the cleanup it spawns then
    // is redundant but harmless (`fail` only ever removes an in-flight
    // record).
    let mut guard = LockCleanup::new(store.clone(), resolved.key.clone(), remove_record);

    let res = match inner.call(req).await {
        Ok(res) => res,
        Err(err) => {
            // Handler errors propagate unchanged; the coordinator only
            // releases the lock.
            release_lock(&store, &resolved.key, remove_record).await;
            guard.disarm();
            return Err(err);
        }
    };

    let status = res.status();
    if config.uncacheable_statuses.contains(&status) {
        tracing::debug!(
            key = %resolved.key,
            ?correlation_id,
            status = status.as_u16(),
            "handler status is not cacheable; releasing lock"
        );
        release_lock(&store, &resolved.key, remove_record).await;
        guard.disarm();
        let mut res = res;
        echo_key(&mut res, &config, &resolved);
        return Ok(res);
    }

    match capture::capture_response(res, config.snapshot_headers).await {
        Ok((mut res, stored)) => {
            if let Err(err) = store.complete(&resolved.key, stored).await {
                tracing::error!(
                    key = %resolved.key,
                    ?correlation_id,
                    error = %err,
                    "failed to persist completed idempotency record"
                );
                // The record is still in-flight; release it so retries are
                // not stuck behind a store outage.
                release_lock(&store, &resolved.key, remove_record).await;
            }
            guard.disarm();
            echo_key(&mut res, &config, &resolved);
            Ok(res)
        }
        Err(err) => {
            tracing::error!(
                key = %resolved.key,
                ?correlation_id,
                error = %err,
                "failed to buffer handler response"
            );
            release_lock(&store, &resolved.key, remove_record).await;
            guard.disarm();
            let mut res = text_response(
                StatusCode::INTERNAL_SERVER_ERROR,
                "response body could not be buffered".into(),
            );
            echo_key(&mut res, &config, &resolved);
            Ok(res)
        }
    }
}

async fn release_lock<T: IdempotencyStore>(store: &Arc<T>, key: &str, remove_record: bool) {
    if let Err(err) = store.fail(key, remove_record).await {
        tracing::error!(key, error = %err, "failed to release idempotency lock");
    }
}

/// Releases the lock if the request future is dropped before the normal
/// complete/fail paths disarm it.
struct LockCleanup<T: IdempotencyStore> {
    store: Arc<T>,
    key: Option<String>,
    remove_record: bool,
}

impl<T: IdempotencyStore> LockCleanup<T> {
    fn new(store: Arc<T>, key: String, remove_record: bool) -> Self {
        Self {
            store,
            key: Some(key),
            remove_record,
        }
    }

    fn disarm(&mut self) {
        self.key = None;
    }
}

impl<T: IdempotencyStore> Drop for LockCleanup<T> {
    fn drop(&mut self) {
        let Some(key) = self.key.take() else {
            return;
        };
        match tokio::runtime::Handle::try_current() {
            Ok(handle) => {
                let store = self.store.clone();
                let remove_record = self.remove_record;
                handle.spawn(async move {
                    tracing::warn!(key = %key, "request cancelled while holding idempotency lock");
                    if let Err(err) = store.fail(&key, remove_record).await {
                        tracing::error!(key = %key, error = %err, "failed to release lock after cancellation");
                    }
                });
            }
            Err(_) => {
                tracing::warn!(key = %key, "cancelled outside a runtime; lock will expire with its ttl");
            }
        }
    }
}

fn text_response(status: StatusCode, body: String) -> Response {
    let mut res = Response::new(Body::from(body));
    *res.status_mut() = status;
    res.headers_mut().insert(
        CONTENT_TYPE,
        HeaderValue::from_static("text/plain; charset=utf-8"),
    );
    res
}

fn key_reuse_response(config: &IdempotencyOptions, resolved: &ResolvedKey) -> Response {
    tracing::debug!(key = %resolved.key, "idempotency key reused with a different request body");
    let mut res = text_response(
        StatusCode::UNPROCESSABLE_ENTITY,
        "idempotency key reused with a different request body".into(),
    );
    echo_key(&mut res, config, resolved);
    res
}

fn echo_key(res: &mut Response, config: &IdempotencyOptions, resolved: &ResolvedKey) {
    // The key came from a request header, so it is always a valid value.
    if let Ok(value) = HeaderValue::from_str(&resolved.key) {
        res.headers_mut().insert(config.key_header.clone(), value);
    }
}

/// Layer to apply [`IdempotencyService`] middleware in `axum`.
///
/// # Example
/// ```rust,no_run
/// # use std::sync::Arc;
/// # use std::time::Duration;
/// # use axum::Router;
/// # use axum::routing::post;
/// # use axum_idempotency::{IdempotencyLayer, IdempotencyOptions};
/// # use axum_idempotency::store::memory::MemoryStore;
/// # #[tokio::main]
/// # async fn main() {
/// let store = Arc::new(MemoryStore::new());
/// let options = IdempotencyOptions::default().expire_after(Duration::from_secs(30));
///
/// let app = Router::new()
///     .route("/orders", post(|| async { "created" }))
///     .layer(IdempotencyLayer::new(store, options));
/// # let listener = tokio::net::TcpListener::bind("0.0.0.0:3000").await.unwrap();
/// # axum::serve(listener, app).await.unwrap();
/// # }
/// ```
#[derive(Debug)]
pub struct IdempotencyLayer<T> {
    store: Arc<T>,
    config: IdempotencyOptions,
}

impl<T> Clone for IdempotencyLayer<T> {
    fn clone(&self) -> Self {
        Self {
            store: self.store.clone(),
            config: self.config.clone(),
        }
    }
}

impl<T> IdempotencyLayer<T> {
    pub fn new(store: Arc<T>, config: IdempotencyOptions) -> Self {
        Self { store, config }
    }
}

impl<S, T> Layer<S> for IdempotencyLayer<T> {
    type Service = IdempotencyService<S, T>;

    fn layer(&self, service: S) -> Self::Service {
        IdempotencyService::new(service, self.store.clone(), self.config.clone())
    }
}
