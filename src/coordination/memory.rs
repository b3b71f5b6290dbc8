use async_trait::async_trait;
use dashmap::DashMap;
use std::sync::Mutex;
use std::time::{Duration, Instant};

use super::{CoordinationStore, TokenBucketResult};
use crate::error::CoreError;

struct Entry {
    value: Vec<u8>,
    expires_at: Option<Instant>,
}

impl Entry {
    fn is_live(&self, now: Instant) -> bool {
        self.expires_at.map(|e| now <= e).unwrap_or(true)
    }
}

struct BucketState {
    tokens: f64,
    last_refill: Instant,
}

/// In-memory stand-in for the coordination store: DashMap-backed hot
/// in-process state with per-entry TTL expiry.
pub struct InMemoryCoordinationStore {
    entries: DashMap<String, Entry>,
    counters: DashMap<String, i64>,
    buckets: DashMap<String, Mutex<BucketState>>,
}

impl InMemoryCoordinationStore {
    pub fn new() -> Self {
        Self {
            entries: DashMap::new(),
            counters: DashMap::new(),
            buckets: DashMap::new(),
        }
    }
}

impl Default for InMemoryCoordinationStore {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl CoordinationStore for InMemoryCoordinationStore {
    async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, CoreError> {
        let now = Instant::now();
        match self.entries.get(key) {
            Some(entry) if entry.is_live(now) => Ok(Some(entry.value.clone())),
            Some(_) => {
                self.entries.remove(key);
                Ok(None)
            }
            None => Ok(None),
        }
    }

    async fn set(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Option<Duration>,
    ) -> Result<(), CoreError> {
        self.entries.insert(
            key.to_string(),
            Entry {
                value,
                expires_at: ttl.map(|d| Instant::now() + d),
            },
        );
        Ok(())
    }

    async fn set_if_absent(
        &self,
        key: &str,
        value: Vec<u8>,
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let now = Instant::now();
        match self.entries.entry(key.to_string()) {
            dashmap::mapref::entry::Entry::Occupied(mut occ) => {
                if occ.get().is_live(now) {
                    Ok(false)
                } else {
                    occ.insert(Entry {
                        value,
                        expires_at: Some(now + ttl),
                    });
                    Ok(true)
                }
            }
            dashmap::mapref::entry::Entry::Vacant(vac) => {
                vac.insert(Entry {
                    value,
                    expires_at: Some(now + ttl),
                });
                Ok(true)
            }
        }
    }

    async fn extend_ttl(
        &self,
        key: &str,
        expected_value: &[u8],
        ttl: Duration,
    ) -> Result<bool, CoreError> {
        let now = Instant::now();
        if let Some(mut entry) = self.entries.get_mut(key) {
            if entry.is_live(now) && entry.value == expected_value {
                entry.expires_at = Some(now + ttl);
                return Ok(true);
            }
        }
        Ok(false)
    }

    async fn delete_if_matches(
        &self,
        key: &str,
        expected_value: &[u8],
    ) -> Result<bool, CoreError> {
        let now = Instant::now();
        let matches = self
            .entries
            .get(key)
            .map(|e| e.is_live(now) && e.value == expected_value)
            .unwrap_or(false);
        if matches {
            self.entries.remove(key);
        }
        Ok(matches)
    }

    async fn increment(&self, key: &str, by: i64) -> Result<i64, CoreError> {
        let mut counter = self.counters.entry(key.to_string()).or_insert(0);
        *counter += by;
        Ok(*counter)
    }

    async fn delete(&self, key: &str) -> Result<(), CoreError> {
        self.entries.remove(key);
        self.counters.remove(key);
        self.buckets.remove(key);
        Ok(())
    }

    async fn take_token(
        &self,
        key: &str,
        rate_per_second: f64,
        burst_size: u64,
        now: Instant,
    ) -> Result<TokenBucketResult, CoreError> {
        let state = self
            .buckets
            .entry(key.to_string())
            .or_insert_with(|| {
                Mutex::new(BucketState {
                    tokens: burst_size as f64,
                    last_refill: now,
                })
            });
        let mut state = state.lock().map_err(|_| {
            CoreError::TransientStore("token bucket lock poisoned".into())
        })?;

        let elapsed = now.saturating_duration_since(state.last_refill).as_secs_f64();
        let refilled = (state.tokens + elapsed * rate_per_second).min(burst_size as f64);
        state.last_refill = now;

        if refilled >= 1.0 {
            state.tokens = refilled - 1.0;
            Ok(TokenBucketResult {
                allowed: true,
                tokens_remaining: state.tokens,
            })
        } else {
            state.tokens = refilled;
            Ok(TokenBucketResult {
                allowed: false,
                tokens_remaining: state.tokens,
            })
        }
    }
}
