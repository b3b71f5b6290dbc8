//! Global and per-partition rate limiting (C6), built on the coordination
//! store's atomic token-bucket primitive.

use std::sync::Arc;
use std::time::Instant;

use super::CoordinationStore;
use crate::config::BucketConfig;
use crate::error::CoreError;
use crate::model::PartitionKey;

pub struct RateLimiter {
    store: Arc<dyn CoordinationStore>,
    global: BucketConfig,
    per_partition: BucketConfig,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RateLimitDecision {
    Allow,
    DenyGlobal,
    DenyPartition,
}

impl RateLimiter {
    pub fn new(store: Arc<dyn CoordinationStore>, global: BucketConfig, per_partition: BucketConfig) -> Self {
        Self {
            store,
            global,
            per_partition,
        }
    }

    /// Check both the global and per-partition buckets. The global bucket is
    /// consulted first since it protects the whole service; coordination
    /// store errors fail open (allow) so a transient store outage never
    /// blocks ingress.
    pub async fn check(&self, partition_key: &PartitionKey) -> RateLimitDecision {
        let now = Instant::now();

        match self
            .store
            .take_token("ratelimit:global", self.global.requests_per_second, self.global.burst_size, now)
            .await
        {
            Ok(result) if !result.allowed => return RateLimitDecision::DenyGlobal,
            Ok(_) => {}
            Err(_) => return RateLimitDecision::Allow,
        }

        let partition_key_name = format!("ratelimit:partition:{partition_key}");
        match self
            .store
            .take_token(
                &partition_key_name,
                self.per_partition.requests_per_second,
                self.per_partition.burst_size,
                now,
            )
            .await
        {
            Ok(result) if !result.allowed => RateLimitDecision::DenyPartition,
            Ok(_) => RateLimitDecision::Allow,
            Err(_) => RateLimitDecision::Allow,
        }
    }

    pub fn to_core_error(decision: RateLimitDecision, partition_key: &PartitionKey) -> Option<CoreError> {
        match decision {
            RateLimitDecision::Allow => None,
            RateLimitDecision::DenyGlobal => Some(CoreError::RateLimited("global".into())),
            RateLimitDecision::DenyPartition => {
                Some(CoreError::RateLimited(partition_key.to_string()))
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::InMemoryCoordinationStore;

    fn partition() -> PartitionKey {
        PartitionKey::derive("A1", "B1", "S1")
    }

    #[tokio::test]
    async fn denies_once_partition_burst_exhausted() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
        let limiter = RateLimiter::new(
            store,
            BucketConfig {
                requests_per_second: 100.0,
                burst_size: 1000,
            },
            BucketConfig {
                requests_per_second: 1.0,
                burst_size: 1,
            },
        );
        let p = partition();

        assert_eq!(limiter.check(&p).await, RateLimitDecision::Allow);
        assert_eq!(limiter.check(&p).await, RateLimitDecision::DenyPartition);
    }

    #[tokio::test]
    async fn global_bucket_gates_before_partition_bucket() {
        let store: Arc<dyn CoordinationStore> = Arc::new(InMemoryCoordinationStore::new());
        let limiter = RateLimiter::new(
            store,
            BucketConfig {
                requests_per_second: 1.0,
                burst_size: 1,
            },
            BucketConfig {
                requests_per_second: 100.0,
                burst_size: 1000,
            },
        );
        let p = partition();

        assert_eq!(limiter.check(&p).await, RateLimitDecision::Allow);
        assert_eq!(limiter.check(&p).await, RateLimitDecision::DenyGlobal);
    }
}
