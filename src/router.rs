//! Message router (C4): fans the single ingress topic into per-partition
//! subtopics, stateless and safe to run as multiple instances behind the
//! broker's own consumer-group semantics.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use crate::broker::{BrokerAdapter, SubscriptionId};
use crate::config::TopicsConfig;
use crate::error::CoreError;
use crate::model::{wire, TradeCaptureMessage};
use crate::telemetry::Counters;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RouteOutcome {
    Routed,
    SentToDlq,
}

pub struct MessageRouter {
    broker: Arc<dyn BrokerAdapter>,
    topics: TopicsConfig,
    counters: Arc<Counters>,
}

impl MessageRouter {
    pub fn new(broker: Arc<dyn BrokerAdapter>, topics: TopicsConfig, counters: Arc<Counters>) -> Self {
        Self {
            broker,
            topics,
            counters,
        }
    }

    pub async fn subscribe_ingress(&self) -> Result<SubscriptionId, CoreError> {
        self.broker.subscribe(&self.topics.input).await
    }

    /// Process a single polled message, if one is available.
    pub async fn route_next(&self, subscription: SubscriptionId) -> Result<Option<RouteOutcome>, CoreError> {
        let Some(incoming) = self.broker.poll(subscription).await? else {
            return Ok(None);
        };

        let outcome = match self.route_one(&incoming.bytes, &incoming.topic).await {
            Ok(partition_key) => {
                self.counters.messages_routed.fetch_add(1, Ordering::Relaxed);
                tracing::debug!(partition_key = %partition_key, "routed message");
                RouteOutcome::Routed
            }
            Err(err) => {
                self.counters.routing_failures.fetch_add(1, Ordering::Relaxed);
                self.send_to_router_dlq(&incoming.bytes, &incoming.topic, &err)
                    .await?;
                RouteOutcome::SentToDlq
            }
        };

        self.broker.ack(subscription, &incoming).await?;
        Ok(Some(outcome))
    }

    async fn route_one(&self, bytes: &[u8], routed_from: &str) -> Result<String, CoreError> {
        let message: TradeCaptureMessage = wire::decode(bytes)?;

        if message.account_id.is_empty() || message.book_id.is_empty() || message.security_id.is_empty() {
            return Err(CoreError::Validation(vec![crate::error::ValidationIssue::new(
                "partitionKey",
                "cannot derive partition key: account/book/security must be non-empty",
            )]));
        }

        let partition_key = message.partition_key();
        let sanitized = partition_key.sanitize_for_topic();
        let subtopic = self
            .topics
            .partition_pattern
            .replace("{partition}", &sanitized);

        let mut headers = HashMap::new();
        headers.insert("tradeId".to_string(), message.trade_id.clone());
        headers.insert("partitionKey".to_string(), partition_key.to_string());
        headers.insert("messageType".to_string(), "TradeCapture".to_string());
        headers.insert("routedFrom".to_string(), routed_from.to_string());

        self.broker
            .publish(&subtopic, partition_key.as_str(), bytes.to_vec(), headers)
            .await?;

        Ok(partition_key.to_string())
    }

    async fn send_to_router_dlq(&self, bytes: &[u8], routed_from: &str, reason: &CoreError) -> Result<(), CoreError> {
        let mut headers = HashMap::new();
        headers.insert("routedFrom".to_string(), routed_from.to_string());
        headers.insert("errorReason".to_string(), reason.to_string());
        self.broker
            .publish(&self.topics.router_dlq, routed_from, bytes.to_vec(), headers)
            .await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::log_broker::LogBroker;
    use crate::config::AppConfig;
    use crate::model::{PartitionKey, Source};
    use chrono::{NaiveDate, Utc};

    fn sample_message(account: &str) -> TradeCaptureMessage {
        TradeCaptureMessage {
            trade_id: "T1".into(),
            account_id: account.into(),
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

    #[tokio::test]
    async fn routes_valid_message_to_partition_subtopic() {
        let broker: Arc<dyn BrokerAdapter> = Arc::new(LogBroker::new(4));
        let topics = AppConfig::dev_default().messaging.topics;
        let counters = Arc::new(Counters::new());
        let router = MessageRouter::new(broker.clone(), topics.clone(), counters.clone());

        let msg = sample_message("A1");
        let bytes = wire::encode(&msg).unwrap();
        broker
            .publish(&topics.input, "A1", bytes, Default::default())
            .await
            .unwrap();

        let sub = router.subscribe_ingress().await.unwrap();
        let outcome = router.route_next(sub).await.unwrap().unwrap();
        assert_eq!(outcome, RouteOutcome::Routed);
        assert_eq!(counters.snapshot().messages_routed, 1);

        let expected_subtopic = topics.partition_pattern.replace(
            "{partition}",
            &PartitionKey::derive("A1", "B1", "S1").sanitize_for_topic(),
        );
        let subtopic_sub = broker.subscribe(&expected_subtopic).await.unwrap();
        let routed = broker.poll(subtopic_sub).await.unwrap().unwrap();
        assert_eq!(routed.bytes, wire::encode(&msg).unwrap());
        assert_eq!(routed.headers.get("tradeId").unwrap(), "T1");
    }

    #[tokio::test]
    async fn routing_failure_goes_to_router_dlq() {
        let broker: Arc<dyn BrokerAdapter> = Arc::new(LogBroker::new(4));
        let topics = AppConfig::dev_default().messaging.topics;
        let counters = Arc::new(Counters::new());
        let router = MessageRouter::new(broker.clone(), topics.clone(), counters.clone());

        let msg = sample_message("");
        let bytes = wire::encode(&msg).unwrap();
        broker
            .publish(&topics.input, "", bytes, Default::default())
            .await
            .unwrap();

        let sub = router.subscribe_ingress().await.unwrap();
        let outcome = router.route_next(sub).await.unwrap().unwrap();
        assert_eq!(outcome, RouteOutcome::SentToDlq);
        assert_eq!(counters.snapshot().routing_failures, 1);

        let dlq_sub = broker.subscribe(&topics.router_dlq).await.unwrap();
        let dlq_msg = broker.poll(dlq_sub).await.unwrap().unwrap();
        assert!(dlq_msg.headers.contains_key("errorReason"));
    }
}
