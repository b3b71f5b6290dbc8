//! JMS-style broker: wildcard-subscription topics, client-ack sessions.
//!
//! Built on `tokio::sync::broadcast` for fan-out; an unacked-message
//! tracking map stands in for the JMS session's redelivery queue.

use async_trait::async_trait;
use dashmap::DashMap;
use std::collections::HashMap;
use std::sync::atomic::{AtomicBool, AtomicU64, Ordering};
use std::sync::Mutex;
use tokio::sync::broadcast;

use super::{matches_pattern, BrokerAdapter, BrokerMessage, PartitionLag, SubscriptionId};
use crate::error::CoreError;

const CHANNEL_CAPACITY: usize = 4096;

struct Session {
    pattern: String,
    paused: AtomicBool,
    receiver: Mutex<broadcast::Receiver<BrokerMessage>>,
    unacked: DashMap<(String, u64), BrokerMessage>,
}

pub struct JmsBroker {
    sender: broadcast::Sender<BrokerMessage>,
    end_offsets: DashMap<String, AtomicU64>,
    committed: DashMap<String, AtomicU64>,
    sessions: DashMap<SubscriptionId, Session>,
    next_subscription_id: AtomicU64,
}

impl JmsBroker {
    pub fn new() -> Self {
        let (sender, _) = broadcast::channel(CHANNEL_CAPACITY);
        Self {
            sender,
            end_offsets: DashMap::new(),
            committed: DashMap::new(),
            sessions: DashMap::new(),
            next_subscription_id: AtomicU64::new(1),
        }
    }
}

impl Default for JmsBroker {
    fn default() -> Self {
        Self::new()
    }
}

#[async_trait]
impl BrokerAdapter for JmsBroker {
    async fn publish(
        &self,
        topic: &str,
        key: &str,
        bytes: Vec<u8>,
        headers: HashMap<String, String>,
    ) -> Result<(), CoreError> {
        let offset = self
            .end_offsets
            .entry(topic.to_string())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst);

        let message = BrokerMessage {
            topic: topic.to_string(),
            partition: 0,
            offset,
            key: key.to_string(),
            bytes,
            headers,
        };

        // No active subscriber is not an error for a topic-based broker:
        // the message is simply not observed by anyone yet.
        let _ = self.sender.send(message);
        Ok(())
    }

    async fn subscribe(&self, pattern: &str) -> Result<SubscriptionId, CoreError> {
        let id = SubscriptionId(self.next_subscription_id.fetch_add(1, Ordering::SeqCst));
        self.sessions.insert(
            id,
            Session {
                pattern: pattern.to_string(),
                paused: AtomicBool::new(false),
                receiver: Mutex::new(self.sender.subscribe()),
                unacked: DashMap::new(),
            },
        );
        Ok(id)
    }

    async fn poll(&self, subscription: SubscriptionId) -> Result<Option<BrokerMessage>, CoreError> {
        let session = self
            .sessions
            .get(&subscription)
            .ok_or_else(|| CoreError::NotFound(format!("subscription {subscription:?}")))?;
        if session.paused.load(Ordering::SeqCst) {
            return Ok(None);
        }

        loop {
            let attempt = {
                let mut receiver = session.receiver.lock().unwrap();
                receiver.try_recv()
            };
            match attempt {
                Ok(message) => {
                    if matches_pattern(&session.pattern, &message.topic) {
                        session
                            .unacked
                            .insert((message.topic.clone(), message.offset), message.clone());
                        return Ok(Some(message));
                    }
                    // Not a topic this session cares about; keep draining.
                }
                Err(broadcast::error::TryRecvError::Empty) => return Ok(None),
                Err(broadcast::error::TryRecvError::Closed) => return Ok(None),
                Err(broadcast::error::TryRecvError::Lagged(_)) => continue,
            }
        }
    }

    async fn ack(&self, subscription: SubscriptionId, message: &BrokerMessage) -> Result<(), CoreError> {
        let session = self
            .sessions
            .get(&subscription)
            .ok_or_else(|| CoreError::NotFound(format!("subscription {subscription:?}")))?;
        let key = (message.topic.clone(), message.offset);
        if session.unacked.remove(&key).is_none() {
            return Err(CoreError::Internal(format!(
                "ack for untracked message {}:{}",
                message.topic, message.offset
            )));
        }
        self.committed
            .entry(message.topic.clone())
            .or_insert_with(|| AtomicU64::new(0))
            .fetch_add(1, Ordering::SeqCst);
        Ok(())
    }

    async fn pause(&self, subscription: SubscriptionId) -> Result<(), CoreError> {
        let session = self
            .sessions
            .get(&subscription)
            .ok_or_else(|| CoreError::NotFound(format!("subscription {subscription:?}")))?;
        session.paused.store(true, Ordering::SeqCst);
        Ok(())
    }

    async fn resume(&self, subscription: SubscriptionId) -> Result<(), CoreError> {
        let session = self
            .sessions
            .get(&subscription)
            .ok_or_else(|| CoreError::NotFound(format!("subscription {subscription:?}")))?;
        session.paused.store(false, Ordering::SeqCst);
        Ok(())
    }

    async fn lag(&self, pattern: &str) -> Result<Vec<PartitionLag>, CoreError> {
        let mut lags = Vec::new();
        for entry in self.end_offsets.iter() {
            let topic = entry.key();
            if !matches_pattern(pattern, topic) {
                continue;
            }
            let end = entry.value().load(Ordering::SeqCst);
            let committed = self
                .committed
                .get(topic)
                .map(|v| v.load(Ordering::SeqCst))
                .unwrap_or(0);
            lags.push(PartitionLag {
                partition: 0,
                committed_offset: committed,
                end_offset: end,
            });
        }
        Ok(lags)
    }

    async fn close(&self) -> Result<(), CoreError> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn wildcard_subscription_receives_matching_topics_only() {
        let broker = JmsBroker::new();
        let sub = broker.subscribe("trade/capture/*").await.unwrap();

        broker
            .publish("trade/capture/input", "k", b"a".to_vec(), HashMap::new())
            .await
            .unwrap();
        broker
            .publish("other/topic", "k", b"b".to_vec(), HashMap::new())
            .await
            .unwrap();

        let msg = broker.poll(sub).await.unwrap().unwrap();
        assert_eq!(msg.bytes, b"a");
        assert!(broker.poll(sub).await.unwrap().is_none());
    }

    #[tokio::test]
    async fn ack_of_unknown_message_errors() {
        let broker = JmsBroker::new();
        let sub = broker.subscribe("t").await.unwrap();
        let bogus = BrokerMessage {
            topic: "t".into(),
            partition: 0,
            offset: 99,
            key: "k".into(),
            bytes: vec![],
            headers: HashMap::new(),
        };
        assert!(broker.ack(sub, &bogus).await.is_err());
    }
}
