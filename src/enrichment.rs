//! Enrichment service (C12): concurrent, cache-through lookups of security
//! and account reference data for a single trade.

use std::sync::Arc;

use crate::config::ReferenceDataConfig;
use crate::coordination::CoordinationStore;
use crate::model::{EnrichmentStatus, TradeCaptureMessage};
use crate::refdata::{AccountMasterClient, AccountRecord, SecurityMasterClient, SecurityRecord};

#[derive(Debug, Clone, Default)]
pub struct EnrichedData {
    pub security: Option<SecurityRecord>,
    pub account: Option<AccountRecord>,
}

pub struct EnrichmentService {
    coordination: Arc<dyn CoordinationStore>,
    security_client: Arc<dyn SecurityMasterClient>,
    account_client: Arc<dyn AccountMasterClient>,
    config: ReferenceDataConfig,
}

impl EnrichmentService {
    pub fn new(
        coordination: Arc<dyn CoordinationStore>,
        security_client: Arc<dyn SecurityMasterClient>,
        account_client: Arc<dyn AccountMasterClient>,
        config: ReferenceDataConfig,
    ) -> Self {
        Self {
            coordination,
            security_client,
            account_client,
            config,
        }
    }

    /// Launch the security and account lookups concurrently, consulting
    /// the reference-data cache first and populating it on a client hit
    ///.
    pub async fn enrich(&self, request: &TradeCaptureMessage) -> (EnrichmentStatus, EnrichedData) {
        let (security, account) = tokio::join!(
            self.lookup_security(&request.security_id),
            self.lookup_account(&request.account_id, &request.book_id),
        );

        let status = match (security.is_some(), account.is_some()) {
            (true, true) => EnrichmentStatus::Complete,
            (false, false) => EnrichmentStatus::Failed,
            _ => EnrichmentStatus::Partial,
        };

        (status, EnrichedData { security, account })
    }

    async fn lookup_security(&self, security_id: &str) -> Option<SecurityRecord> {
        let cache_key = format!("refdata:security:{security_id}");
        if let Ok(Some(bytes)) = self.coordination.get(&cache_key).await {
            if let Ok(cached) = serde_json::from_slice::<SecurityRecord>(&bytes) {
                return Some(cached);
            }
        }

        let found = self.security_client.lookup(security_id).await.ok().flatten()?;
        if let Ok(bytes) = serde_json::to_vec(&found) {
            let _ = self
                .coordination
                .set(&cache_key, bytes, Some(self.config.security.ttl))
                .await;
        }
        Some(found)
    }

    async fn lookup_account(&self, account_id: &str, book_id: &str) -> Option<AccountRecord> {
        let cache_key = format!("refdata:account:{account_id}:{book_id}");
        if let Ok(Some(bytes)) = self.coordination.get(&cache_key).await {
            if let Ok(cached) = serde_json::from_slice::<AccountRecord>(&bytes) {
                return Some(cached);
            }
        }

        let found = self.account_client.lookup(account_id, book_id).await.ok().flatten()?;
        if let Ok(bytes) = serde_json::to_vec(&found) {
            let _ = self
                .coordination
                .set(&cache_key, bytes, Some(self.config.account.ttl))
                .await;
        }
        Some(found)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::coordination::memory::InMemoryCoordinationStore;
    use crate::error::CoreError;
    use crate::model::Source;
    use async_trait::async_trait;
    use chrono::{NaiveDate, Utc};
    use std::sync::atomic::{AtomicU32, Ordering};
    use std::time::Duration;

    fn ref_config() -> ReferenceDataConfig {
        use crate::config::{CacheConfig, RefDataClientConfig};
        ReferenceDataConfig {
            security: CacheConfig {
                ttl: Duration::from_secs(300),
            },
            account: CacheConfig {
                ttl: Duration::from_secs(300),
            },
            client: RefDataClientConfig {
                timeout: Duration::from_millis(50),
                max_retries: 1,
                retry_backoff: Duration::from_millis(1),
                circuit_failure_threshold: 3,
                circuit_success_threshold: 1,
                circuit_open_timeout: Duration::from_millis(20),
            },
        }
    }

    fn request() -> TradeCaptureMessage {
        TradeCaptureMessage {
            trade_id: "T1".into(),
            account_id: "A1".into(),
            book_id: "B1".into(),
            security_id: "S1".into(),
            source: Source::Automated,
            trade_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            trade_timestamp: Utc::now(),
            booking_timestamp: None,
            sequence_number: Some(1),
            idempotency_key: None,
            counterparty_ids: vec!["CP1".into()],
            trade_lots: vec![],
            metadata: Default::default(),
            manual_entry: None,
        }
    }

    struct CountingSecurityClient {
        calls: AtomicU32,
        found: bool,
    }

    #[async_trait]
    impl SecurityMasterClient for CountingSecurityClient {
        async fn lookup(&self, security_id: &str) -> Result<Option<SecurityRecord>, CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Ok(self.found.then(|| SecurityRecord {
                security_id: security_id.to_string(),
                isin: "US1234567890".into(),
                description: "desc".into(),
            }))
        }
    }

    struct CountingAccountClient {
        found: bool,
    }

    #[async_trait]
    impl AccountMasterClient for CountingAccountClient {
        async fn lookup(&self, account_id: &str, book_id: &str) -> Result<Option<AccountRecord>, CoreError> {
            Ok(self.found.then(|| AccountRecord {
                account_id: account_id.to_string(),
                book_id: book_id.to_string(),
                legal_entity: "LE1".into(),
            }))
        }
    }

    #[tokio::test]
    async fn both_found_is_complete() {
        let svc = EnrichmentService::new(
            Arc::new(InMemoryCoordinationStore::new()),
            Arc::new(CountingSecurityClient {
                calls: AtomicU32::new(0),
                found: true,
            }),
            Arc::new(CountingAccountClient { found: true }),
            ref_config(),
        );
        let (status, data) = svc.enrich(&request()).await;
        assert_eq!(status, EnrichmentStatus::Complete);
        assert!(data.security.is_some());
        assert!(data.account.is_some());
    }

    #[tokio::test]
    async fn one_missing_is_partial() {
        let svc = EnrichmentService::new(
            Arc::new(InMemoryCoordinationStore::new()),
            Arc::new(CountingSecurityClient {
                calls: AtomicU32::new(0),
                found: true,
            }),
            Arc::new(CountingAccountClient { found: false }),
            ref_config(),
        );
        let (status, _data) = svc.enrich(&request()).await;
        assert_eq!(status, EnrichmentStatus::Partial);
    }

    #[tokio::test]
    async fn both_missing_is_failed() {
        let svc = EnrichmentService::new(
            Arc::new(InMemoryCoordinationStore::new()),
            Arc::new(CountingSecurityClient {
                calls: AtomicU32::new(0),
                found: false,
            }),
            Arc::new(CountingAccountClient { found: false }),
            ref_config(),
        );
        let (status, _data) = svc.enrich(&request()).await;
        assert_eq!(status, EnrichmentStatus::Failed);
    }

    #[tokio::test]
    async fn second_lookup_hits_cache_not_client() {
        let coordination = Arc::new(InMemoryCoordinationStore::new());
        let client = Arc::new(CountingSecurityClient {
            calls: AtomicU32::new(0),
            found: true,
        });
        let svc = EnrichmentService::new(
            coordination,
            client.clone(),
            Arc::new(CountingAccountClient { found: true }),
            ref_config(),
        );
        svc.enrich(&request()).await;
        svc.enrich(&request()).await;
        assert_eq!(client.calls.load(Ordering::SeqCst), 1);
    }
}
