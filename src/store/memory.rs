//! In-memory [`IdempotencyStore`] backed by a sharded concurrent map.
//!
//! Atomicity of `try_acquire` comes from the map's entry API: the entry
//! handle holds the shard lock for the key, so the read-check-write sequence
//! is a per-key compare-and-swap. Unrelated keys proceed in parallel; there
//! is no global mutex.

use std::sync::Arc;
use std::time::Instant;

use async_trait::async_trait;
use dashmap::DashMap;
use dashmap::mapref::entry::Entry;

use crate::store::{
    AcquireRequest, IdempotencyRecord, IdempotencyStore, LockResult, RecordState, StoreError,
    StoredResponse,
};

/// Process-local store. Cheap to clone; clones share the same records.
///
/// Expired records become invisible to `try_acquire` immediately; physical
/// cleanup is lazy (an expired entry is overwritten on the next acquisition
/// for its key) plus whatever sweeping the caller schedules via
/// [`evict_expired`](MemoryStore::evict_expired).
#[derive(Clone, Debug, Default)]
pub struct MemoryStore {
    records: Arc<DashMap<String, IdempotencyRecord>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    /// Physically removes every expired record. Suitable for a periodic
    /// background task; correctness never depends on it running.
    pub fn evict_expired(&self) {
        let now = Instant::now();
        self.records.retain(|_, record| !record.is_expired(now));
    }

    /// Number of records currently held, expired or not.
    pub fn len(&self) -> usize {
        self.records.len()
    }

    pub fn is_empty(&self) -> bool {
        self.records.is_empty()
    }
}

fn new_in_flight(request: &AcquireRequest<'_>, now: Instant) -> IdempotencyRecord {
    IdempotencyRecord {
        key: request.key.to_owned(),
        resource_path: request.resource_path.to_owned(),
        http_method: request.http_method.clone(),
        request_body_hash: request.request_body_hash.to_owned(),
        state: RecordState::InFlight,
        response: None,
        correlation_id: request.correlation_id.map(str::to_owned),
        created_at: now,
        expires_at: now + request.ttl,
    }
}

#[async_trait]
impl IdempotencyStore for MemoryStore {
    async fn try_acquire(&self, request: AcquireRequest<'_>) -> Result<LockResult, StoreError> {
        if request.key.is_empty() {
            return Err(StoreError::InvalidRequest("empty idempotency key"));
        }
        if request.ttl.is_zero() {
            return Err(StoreError::InvalidRequest("zero ttl"));
        }

        let now = Instant::now();
        // The entry handle keeps the shard locked for the whole decision.
        match self.records.entry(request.key.to_owned()) {
            Entry::Occupied(mut occupied) => {
                if occupied.get().is_expired(now) {
                    *occupied.get_mut() = new_in_flight(&request, now);
                    return Ok(LockResult::Acquired);
                }
                let record = occupied.get().clone();
                match record.state {
                    RecordState::Completed => Ok(LockResult::CachedHit(record)),
                    RecordState::InFlight => Ok(LockResult::InFlight(record)),
                }
            }
            Entry::Vacant(vacant) => {
                vacant.insert(new_in_flight(&request, now));
                Ok(LockResult::Acquired)
            }
        }
    }

    async fn complete(&self, key: &str, response: StoredResponse) -> Result<(), StoreError> {
        let Some(mut record) = self.records.get_mut(key) else {
            // The record can expire and be evicted while the handler runs;
            // there is nothing left to transition.
            tracing::warn!(key, "complete called for a missing record");
            return Ok(());
        };

        match record.state {
            RecordState::InFlight => {
                record.state = RecordState::Completed;
                record.response = Some(response);
            }
            RecordState::Completed => {
                if record.response.as_ref() == Some(&response) {
                    tracing::warn!(key, "identical double-complete");
                } else {
                    tracing::error!(key, "double-complete with a different response; keeping the original");
                }
            }
        }
        Ok(())
    }

    async fn fail(&self, key: &str, remove_record: bool) -> Result<(), StoreError> {
        if remove_record {
            let removed = self
                .records
                .remove_if(key, |_, record| record.state == RecordState::InFlight)
                .is_some();
            tracing::debug!(key, removed, "released lock after failure");
        } else {
            tracing::debug!(key, "leaving in-flight record to expire after failure");
        }
        Ok(())
    }
}
