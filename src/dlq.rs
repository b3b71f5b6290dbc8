//! Dead-letter queue service (C19): publishes failed messages with error
//! metadata to the configured DLQ topic. Also the concrete
//! [`MessageDrainSink`] the sequence buffer's timeout sweep drains into.

use std::collections::HashMap;
use std::sync::atomic::Ordering;
use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::BrokerAdapter;
use crate::error::CoreError;
use crate::model::{wire, PartitionKey, TradeCaptureMessage};
use crate::sequence::{DrainReason, MessageDrainSink};
use crate::telemetry::Counters;

pub struct DlqService {
    broker: Arc<dyn BrokerAdapter>,
    dlq_topic: String,
    counters: Arc<Counters>,
}

impl DlqService {
    pub fn new(broker: Arc<dyn BrokerAdapter>, dlq_topic: String, counters: Arc<Counters>) -> Self {
        Self {
            broker,
            dlq_topic,
            counters,
        }
    }

    pub async fn publish(
        &self,
        partition_key: &PartitionKey,
        trade_id: &str,
        bytes: Vec<u8>,
        reason: &str,
    ) -> Result<(), CoreError> {
        let mut headers = HashMap::new();
        headers.insert("partitionKey".to_string(), partition_key.to_string());
        headers.insert("tradeId".to_string(), trade_id.to_string());
        headers.insert("errorReason".to_string(), reason.to_string());

        self.broker
            .publish(&self.dlq_topic, partition_key.as_str(), bytes, headers)
            .await?;
        self.counters.dlq_published.fetch_add(1, Ordering::Relaxed);
        Ok(())
    }
}

#[async_trait]
impl MessageDrainSink for DlqService {
    async fn drain(
        &self,
        partition_key: &PartitionKey,
        sequence: u64,
        message: TradeCaptureMessage,
        reason: DrainReason,
    ) -> Result<(), CoreError> {
        let trade_id = message.trade_id.clone();
        let bytes = wire::encode(&message)?;
        let reason_text = match reason {
            DrainReason::GapTooLarge => format!("sequence gap too large at {sequence}"),
            DrainReason::Timeout => format!("out-of-order buffer timed out at sequence {sequence}"),
        };
        self.publish(partition_key, &trade_id, bytes, &reason_text).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::log_broker::LogBroker;
    use crate::model::Source;
    use chrono::{NaiveDate, Utc};

    fn message() -> TradeCaptureMessage {
        TradeCaptureMessage {
            trade_id: "T1".into(),
            account_id: "A1".into(),
            book_id: "B1".into(),
            security_id: "S1".into(),
            source: Source::Automated,
            trade_date: NaiveDate::from_ymd_opt(2024, 1, 1).unwrap(),
            trade_timestamp: Utc::now(),
            booking_timestamp: None,
            sequence_number: Some(7),
            idempotency_key: None,
            counterparty_ids: vec!["CP1".into()],
            trade_lots: vec![],
            metadata: Default::default(),
            manual_entry: None,
        }
    }

    #[tokio::test]
    async fn publish_lands_on_dlq_topic_with_reason_header() {
        let broker: Arc<dyn BrokerAdapter> = Arc::new(LogBroker::new(2));
        let counters = Arc::new(Counters::new());
        let dlq = DlqService::new(broker.clone(), "trade-capture-dlq".into(), counters.clone());

        dlq.publish(&PartitionKey::derive("A1", "B1", "S1"), "T1", vec![1, 2, 3], "gap too large")
            .await
            .unwrap();

        assert_eq!(counters.snapshot().dlq_published, 1);
        let sub = broker.subscribe("trade-capture-dlq").await.unwrap();
        let msg = broker.poll(sub).await.unwrap().unwrap();
        assert_eq!(msg.headers.get("errorReason").unwrap(), "gap too large");
    }

    #[tokio::test]
    async fn drain_encodes_message_and_publishes_with_sequence_in_reason() {
        let broker: Arc<dyn BrokerAdapter> = Arc::new(LogBroker::new(2));
        let counters = Arc::new(Counters::new());
        let dlq = DlqService::new(broker.clone(), "trade-capture-dlq".into(), counters);

        dlq.drain(&PartitionKey::derive("A1", "B1", "S1"), 7, message(), DrainReason::Timeout)
            .await
            .unwrap();

        let sub = broker.subscribe("trade-capture-dlq").await.unwrap();
        let msg = broker.poll(sub).await.unwrap().unwrap();
        assert!(msg.headers.get("errorReason").unwrap().contains('7'));
        let decoded: TradeCaptureMessage = wire::decode(&msg.bytes).unwrap();
        assert_eq!(decoded.trade_id, "T1");
    }
}
