//! Log-style broker: partitioned topics, manual offset commit.
//!
//! An in-process simulation: a `DashMap`-backed registry standing in for
//! a real fan-out transport.

use async_trait::async_trait;
use dashmap::{DashMap, DashSet};
use rustc_hash::FxHasher;
use std::collections::{HashMap, VecDeque};
use std::hash::{Hash, Hasher};
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;

use super::{matches_pattern, BrokerAdapter, BrokerMessage, PartitionLag, SubscriptionId};
use crate::error::CoreError;

type PartitionKey = (String, u32);

struct SubscriptionState {
    pattern: String,
    paused: AtomicBool,
}

pub struct LogBroker {
    partition_count: u32,
    topics: DashSet<String>,
    logs: DashMap<PartitionKey, Mutex<VecDeque<BrokerMessage>>>,
    end_offsets: DashMap<PartitionKey, AtomicU64>,
    committed: DashMap<PartitionKey, AtomicU64>,
    delivered: DashMap<PartitionKey, BrokerMessage>,
    subscriptions: DashMap<SubscriptionId, SubscriptionState>,
    next_subscription_id: AtomicU64,
}

impl LogBroker {
    pub fn new(partition_count: u32) -> Self {
        Self {
            partition_count: partition_count.max(1),
            topics: DashSet::new(),
            logs: DashMap::new(),
            end_offsets: DashMap::new(),
            committed: DashMap::new(),
            delivered: DashMap::new(),
            subscriptions: DashMap::new(),
            next_subscription_id: AtomicU64::new(1),
        }
    }

    fn partition_for(&self, key: &str) -> u32 {
        let mut hasher = FxHasher::default();
        key.hash(&mut hasher);
        (hasher.finish() % self.partition_count as u64) as u32
    }

    fn matching_topics(&self, pattern: &str) -> Vec<String> {
        self.topics
            .iter()
            .filter(|t| matches_pattern(pattern, t.key()))
            .map(|t| t.key().clone())
            .collect()
    }
}

#[async_trait]
impl BrokerAdapter for LogBroker {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        bytes: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<(), CoreError> {
        self.topics.insert(topic.to_string());
        let partition = self.partition_for(key);
        let pk: PartitionKey = (topic.to_string(), partition);

        let offset = self
            .end_offsets
            .entry(pk.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst);

        let message = BrokerMessage {
            topic: topic.to_string(),
            partition,
            offset,
            key: key.to_string(),
            bytes,
            headers,
        };

        self.logs
            .entry(pk)
            .or_insert_with(|| Mutex::new(VecDeque::new()))
            .lock()
            .unwrap()
            .push_back(message);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<SubscriptionId, CoreError> {
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::SeqCst));
        self.subscriptions.insert(
            id,
            SubscriptionState {
                pattern: pattern.to_string(),
                paused: AtomicBool::new(false),
            },
        );
        Ok(id)
    }

    async fn poll(&self, subscription: SubscriptionId) -> Result<Option<BrokerMessage>, CoreError> {
        let sub = self
            .subscriptions
            .get(&subscription)
            .ok_or_else(|| CoreError::NotFound(format!("subscription {subscription:?}")))?;
        if sub.paused.load(Ordering::SeqCst) {
            return Ok(None);
        }
        let pattern = sub.pattern.clone();
        drop(sub);

        for topic in self.matching_topics(&pattern) {
            for partition in 0..self.partition_count {
                let pk: PartitionKey = (topic.clone(), partition);
                if self.delivered.contains_key(&pk) {
                    continue;
                }
                let committed = self
                    .committed
                    .entry(pk.clone())
                    .or_insert_with(|| AtomicU64::new(0))
                    .load(Ordering::SeqCst);

                let message = {
                    let Some(queue) = self.logs.get(&pk) else {
                        continue;
                    };
                    let queue = queue.lock().unwrap();
                    queue
                        .iter()
                        .find(|m| m.offset == committed)
                        .cloned()
                };

                if let Some(message) = message {
                    self.delivered.insert(pk, message.clone());
                    return Ok(Some(message));
                }
            }
        }
        Ok(None)
    }

    async fn ack(&self, _subscription: SubscriptionId, message: &BrokerMessage) -> Result<(), CoreError> {
        let pk: PartitionKey = (message.topic.clone(), message.partition);
        let matches = self
            .delivered
            .get(&pk)
            .map(|m| m.offset == message.offset)
            .unwrap_or(false);
        if !matches {
            return Err(CoreError::Internal(format!(
                "ack for unexpected offset {} on {}:{}",
                message.offset, message.topic, message.partition
            )));
        }
        self.delivered.remove(&pk);
        self.committed
            .entry(pk)
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn pause(&self, subscription: SubscriptionId) -> Result<(), CoreError> {
        let sub = self
            .subscriptions
            .get(&subscription)
            .ok_or_else(|| CoreError::NotFound(format!("subscription {subscription:?}")))?;
        sub.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self, subscription: SubscriptionId) -> Result<(), CoreError> {
        let sub = self
            .subscriptions
            .get(&subscription)
            .ok_or_else(|| CoreError::NotFound(format!("subscription {subscription:?}")))?;
        sub.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn lag(&self, pattern: &str) -> Result<Vec<PartitionLag>, CoreError> {
        let mut lags = Vec::new();
        for topic in self.matching_topics(pattern) {
            for partition in 0..self.partition_count {
                let pk: PartitionKey = (topic.clone(), partition);
                let end = self
                    .end_offsets
                    .get(&pk)
                    .map(|v| v.load(Ordering::SeqCst))
                    .unwrap_or(0);
                let committed = self
                    .committed
                    .get(&pk)
                    .map(|v| v.load(Ordering::SeqCst))
                    .unwrap_or(0);
                lags.push(PartitionLag {
                    partition,
                    committed_offset: committed,
                    end_offset: end,
                });
            }
        }
        Ok(lags)
    }

    async fn close(&self) -> Result<(), CoreError> {
        Ok(())
    }
}
