//! Coordination-store client (C1): atomic string/counter ops, TTL keys,
//! distributed locks, and small atomic script evaluation.
//!
//! The real backend (Redis/etcd-class store) is an external collaborator;
//! this crate ships an in-memory stand-in
//! ([`memory::InMemoryCoordinationStore`]) behind the same trait so the
//! rest of the pipeline is backend-agnostic.

pub mod lock;
pub mod memory;
pub mod rate_limit;

use async_trait::async_trait;
use std::time::Duration;

use crate::error::CoreError;

/// Outcome of the atomic token-bucket script: reads tokens and
/// last-refill instant, computes elapsed refill, clamps to burst, and
/// either decrements + writes or leaves tokens unchanged.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct TokenBucketResult {
    pub allowed: bool,
    pub tokens_remaining: f64,
}

#[async_trait]
pub trait CoordinationStore: Send + Sync {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError>;
    async fn set(&self, key: &str, value: Vec<u8>, ttl: Option<Duration>)
    -> Result<(), CoreError>;

    /// Atomic "set if absent with TTL". Returns `true` if this call set
    /// the value (i.e. the key was previously absent or expired) — the
    /// primitive a distributed lock is built on.
    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, CoreError>;

    /// Extend the TTL of an existing key without changing its value.
    /// Returns `false` if the key is absent or its value does not match
    /// `expected_value` (used by lock extension to avoid touching another
    /// holder's lock).
    async fn extend_ttl(
        &self,
        key: &str,
        expected_value: &[u8],
        ttl: Duration,
    ) -> Result<bool, CoreError>;

    /// Delete a key only if its current value matches `expected_value`
    /// (used by lock release). Returns `true` if deleted.
    async fn delete_if_matches(
        &self,
        key: &str,
        expected_value: &[u8],
    ) -> Result<bool, CoreError>;

    async fn increment(&self, key: &str, by: i64) -> Result<i64, CoreError>;
    async fn delete(&self, key: &str) -> Result<(), CoreError>;

    /// Atomic token-bucket admission check. `now` is the
    /// caller-supplied instant so the bucket can be tested deterministically.
    async fn take_token(
        &self,
        key: &str,
        rate_per_second: f64,
        burst_size: u64,
        now: std::time::Instant,
    ) -> Result<TokenBucketResult, CoreError>;
}
