//! Reference-data clients (C11): security master, account master, and
//! approval workflow, each wrapped with a request timeout, bounded retry
//! with backoff, and a circuit breaker, falling back to "not found"
//! rather than propagating an error once resilience is exhausted.

pub mod circuit_breaker;

use std::future::Future;
use std::sync::Arc;

use async_trait::async_trait;
use serde::{Deserialize, Serialize};

use crate::config::RefDataClientConfig;
use crate::error::CoreError;
use circuit_breaker::{CircuitBreaker, CircuitBreakerConfig};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SecurityRecord {
    pub security_id: String,
    pub isin: String,
    pub description: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct AccountRecord {
    pub account_id: String,
    pub book_id: String,
    pub legal_entity: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum ApprovalDecision {
    Approved,
    Rejected,
    Pending,
}

#[async_trait]
pub trait SecurityMasterClient: Send + Sync {
    async fn lookup(&self, security_id: &str) -> Result<Option<SecurityRecord>, CoreError>;
}

#[async_trait]
pub trait AccountMasterClient: Send + Sync {
    async fn lookup(&self, account_id: &str, book_id: &str) -> Result<Option<AccountRecord>, CoreError>;
}

#[async_trait]
pub trait ApprovalWorkflowClient: Send + Sync {
    async fn submit(&self, trade_id: &str) -> Result<ApprovalDecision, CoreError>;
}

fn breaker_config(config: &RefDataClientConfig) -> CircuitBreakerConfig {
    CircuitBreakerConfig {
        failure_threshold: config.circuit_failure_threshold,
        success_threshold: config.circuit_success_threshold,
        open_timeout: config.circuit_open_timeout,
    }
}

/// Runs `op` under a timeout, retrying transient failures with linear
/// backoff up to `config.max_retries`, recording the outcome on `breaker`.
/// Returns `Err(CircuitOpen)` immediately if the breaker has tripped.
async fn call_with_resilience<T, F, Fut>(
    breaker: &CircuitBreaker,
    config: &RefDataClientConfig,
    label: &str,
    mut op: F,
) -> Result<T, CoreError>
where
    F: FnMut() -> Fut,
    Fut: Future<Output = Result<T, CoreError>>,
{
    if !breaker.allow_call() {
        return Err(CoreError::CircuitOpen(label.to_string()));
    }

    let mut attempt = 0u32;
    loop {
        match tokio::time::timeout(config.timeout, op()).await {
            Ok(Ok(value)) => {
                breaker.record_success();
                return Ok(value);
            }
            Ok(Err(_err)) if attempt < config.max_retries => {
                attempt += 1;
                tokio::time::sleep(config.retry_backoff * attempt).await;
            }
            Ok(Err(err)) => {
                breaker.record_failure();
                return Err(err);
            }
            Err(_elapsed) if attempt < config.max_retries => {
                attempt += 1;
                tokio::time::sleep(config.retry_backoff * attempt).await;
            }
            Err(_elapsed) => {
                breaker.record_failure();
                return Err(CoreError::TransientStore(format!("{label} request timed out")));
            }
        }
    }
}

/// Wraps a [`SecurityMasterClient`] with timeout/retry/circuit-breaker
/// resilience, falling back to `Ok(None)` once exhausted.
pub struct ResilientSecurityMasterClient {
    inner: Arc<dyn SecurityMasterClient>,
    breaker: CircuitBreaker,
    config: RefDataClientConfig,
}

impl ResilientSecurityMasterClient {
    pub fn new(inner: Arc<dyn SecurityMasterClient>, config: RefDataClientConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(breaker_config(&config)),
            inner,
            config,
        }
    }
}

#[async_trait]
impl SecurityMasterClient for ResilientSecurityMasterClient {
    async fn lookup(&self, security_id: &str) -> Result<Option<SecurityRecord>, CoreError> {
        let result = call_with_resilience(&self.breaker, &self.config, "security-master", || {
            self.inner.lookup(security_id)
        })
        .await;
        Ok(result.unwrap_or(None))
    }
}

pub struct ResilientAccountMasterClient {
    inner: Arc<dyn AccountMasterClient>,
    breaker: CircuitBreaker,
    config: RefDataClientConfig,
}

impl ResilientAccountMasterClient {
    pub fn new(inner: Arc<dyn AccountMasterClient>, config: RefDataClientConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(breaker_config(&config)),
            inner,
            config,
        }
    }
}

#[async_trait]
impl AccountMasterClient for ResilientAccountMasterClient {
    async fn lookup(&self, account_id: &str, book_id: &str) -> Result<Option<AccountRecord>, CoreError> {
        let result = call_with_resilience(&self.breaker, &self.config, "account-master", || {
            self.inner.lookup(account_id, book_id)
        })
        .await;
        Ok(result.unwrap_or(None))
    }
}

/// Wraps an [`ApprovalWorkflowClient`]; once resilience is exhausted there
/// is no "not found" to fall back to, so the trade is treated as still
/// pending rather than silently approved.
pub struct ResilientApprovalWorkflowClient {
    inner: Arc<dyn ApprovalWorkflowClient>,
    breaker: CircuitBreaker,
    config: RefDataClientConfig,
}

impl ResilientApprovalWorkflowClient {
    pub fn new(inner: Arc<dyn ApprovalWorkflowClient>, config: RefDataClientConfig) -> Self {
        Self {
            breaker: CircuitBreaker::new(breaker_config(&config)),
            inner,
            config,
        }
    }
}

#[async_trait]
impl ApprovalWorkflowClient for ResilientApprovalWorkflowClient {
    async fn submit(&self, trade_id: &str) -> Result<ApprovalDecision, CoreError> {
        let result = call_with_resilience(&self.breaker, &self.config, "approval-workflow", || {
            self.inner.submit(trade_id)
        })
        .await;
        Ok(result.unwrap_or(ApprovalDecision::Pending))
    }
}

/// Deterministic canned data for local/dev, behind the `mock-refdata`
/// feature (default-on).
#[cfg(feature = "mock-refdata")]
pub mod mock {
    use super::*;

    pub struct MockSecurityMasterClient;

    #[async_trait]
    impl SecurityMasterClient for MockSecurityMasterClient {
        async fn lookup(&self, security_id: &str) -> Result<Option<SecurityRecord>, CoreError> {
            if security_id.is_empty() {
                return Ok(None);
            }
            Ok(Some(SecurityRecord {
                security_id: security_id.to_string(),
                isin: format!("MOCK{security_id:0>8}").chars().take(12).collect(),
                description: format!("Mock security {security_id}"),
            }))
        }
    }

    pub struct MockAccountMasterClient;

    #[async_trait]
    impl AccountMasterClient for MockAccountMasterClient {
        async fn lookup(&self, account_id: &str, book_id: &str) -> Result<Option<AccountRecord>, CoreError> {
            if account_id.is_empty() || book_id.is_empty() {
                return Ok(None);
            }
            Ok(Some(AccountRecord {
                account_id: account_id.to_string(),
                book_id: book_id.to_string(),
                legal_entity: format!("Mock LE for {account_id}"),
            }))
        }
    }

    pub struct MockApprovalWorkflowClient;

    #[async_trait]
    impl ApprovalWorkflowClient for MockApprovalWorkflowClient {
        async fn submit(&self, _trade_id: &str) -> Result<ApprovalDecision, CoreError> {
            Ok(ApprovalDecision::Approved)
        }
    }
}
