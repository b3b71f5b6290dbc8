//! Broker adapter (C3): a single interface behind which a log-style broker
//! (partitioned topics, manual offset commit) and a JMS-style broker
//! (wildcard subscriptions, client-ack sessions) are interchangeable.
//!
//! Both concrete brokers are in-process simulations; the real broker is
//! treated as an external collaborator.

pub mod jms_broker;
pub mod log_broker;

use async_trait::async_trait;
use std::collections::HashMap;

use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct SubscriptionId(pub u64);

#[derive(Debug, Clone)]
pub struct BrokerMessage {
    pub topic: String,
    pub partition: u32,
    pub offset: u64,
    pub key: String,
    pub bytes: Vec<u8>,
    pub headers: HashMap<String, String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartitionLag {
    pub partition: u32,
    pub committed_offset: u64,
    pub end_offset: u64,
}

impl PartitionLag {
    pub fn lag(&self) -> u64 {
        self.end_offset.saturating_sub(self.committed_offset)
    }
}

/// Broker adapter. Consumption is pull-based (`poll`) rather
/// than callback-driven: the orchestrator's consumer loop owns its own
/// `tokio::spawn`ed task and calls `poll` in a loop, acking explicitly.
#[async_trait]
pub trait BrokerAdapter: Send + Sync {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        bytes: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<(), CoreError>;

    /// Subscribe to a topic pattern (exact name, or a `*` suffix wildcard
    /// as used for partitioned subtopics like `trade/capture/input/*`).
    /// Acknowledgement is always manual (client-ack).
    async fn subscribe(&self, pattern: &str) -> Result<SubscriptionId, CoreError>;

    /// Pull the next unacked message for a subscription, or `None` if none
    /// is currently available or the subscription is paused.
    async fn poll(&self, subscription: SubscriptionId) -> Result<Option<BrokerMessage>, CoreError>;

    async fn ack(&self, subscription: SubscriptionId, message: &BrokerMessage) -> Result<(), CoreError>;

    async fn pause(&self, subscription: SubscriptionId) -> Result<(), CoreError>;
    async fn resume(&self, subscription: SubscriptionId) -> Result<(), CoreError>;

    /// Committed vs end-of-log offset per partition for topics matching
    /// `pattern`, used by the backpressure monitor (C7) to compute lag.
    async fn lag(&self, pattern: &str) -> Result<Vec<PartitionLag>, CoreError>;

    /// Close the adapter, waiting for any in-flight publishes to land.
    async fn close(&self) -> Result<(), CoreError>;
}

pub(crate) fn matches_pattern(pattern: &str, topic: &str) -> bool {
    match pattern.strip_suffix('*') {
        Some(prefix) => topic.starts_with(prefix),
        None => pattern == topic,
    }
}
