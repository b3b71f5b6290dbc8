//! Output publisher (C17): primary broker publish plus optional parallel
//! webhook publishers. A webhook failure is logged but never fails the
//! primary path.

use std::collections::HashMap;
use std::sync::Arc;

use async_trait::async_trait;

use crate::broker::BrokerAdapter;
use crate::error::CoreError;
use crate::model::{wire, SwapBlotter};

#[async_trait]
pub trait WebhookPublisher: Send + Sync {
    async fn publish(&self, blotter: &SwapBlotter) -> Result<(), CoreError>;
}

/// JSON-over-HTTP webhook for outbound notifications.
pub struct HttpWebhookPublisher {
    client: reqwest::Client,
    url: String,
}

impl HttpWebhookPublisher {
    pub fn new(url: String) -> Self {
        Self {
            client: reqwest::Client::new(),
            url,
        }
    }
}

#[async_trait]
impl WebhookPublisher for HttpWebhookPublisher {
    async fn publish(&self, blotter: &SwapBlotter) -> Result<(), CoreError> {
        let response = self
            .client
            .post(&self.url)
            .json(blotter)
            .send()
            .await
            .map_err(|e| CoreError::Publish(e.to_string()))?;
        response
            .error_for_status()
            .map_err(|e| CoreError::Publish(e.to_string()))?;
        Ok(())
    }
}

pub struct OutputPublisher {
    broker: Arc<dyn BrokerAdapter>,
    output_topic: String,
    webhooks: Vec<Arc<dyn WebhookPublisher>>,
}

impl OutputPublisher {
    pub fn new(broker: Arc<dyn BrokerAdapter>, output_topic: String, webhooks: Vec<Arc<dyn WebhookPublisher>>) -> Self {
        Self {
            broker,
            output_topic,
            webhooks,
        }
    }

    /// Publish a canonical serialization of `blotter` to the primary
    /// output topic, with `tradeId`/`partitionKey` as headers, then fan
    /// the same payload out to any configured webhooks.
    pub async fn publish(&self, blotter: &SwapBlotter) -> Result<(), CoreError> {
        let bytes = wire::encode(blotter)?;
        let mut headers = HashMap::new();
        headers.insert("tradeId".to_string(), blotter.trade_id.clone());
        headers.insert("partitionKey".to_string(), blotter.partition_key.to_string());

        self.broker
            .publish(&self.output_topic, blotter.partition_key.as_str(), bytes, headers)
            .await?;

        if !self.webhooks.is_empty() {
            let results = futures::future::join_all(self.webhooks.iter().map(|w| w.publish(blotter))).await;
            for (index, result) in results.into_iter().enumerate() {
                if let Err(err) = result {
                    tracing::warn!(webhook_index = index, error = %err, "webhook publish failed");
                }
            }
        }
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::broker::log_broker::LogBroker;
    use crate::model::{EnrichmentStatus, PartitionKey, PositionState, ProcessingMetadata, WorkflowStatus};
    use std::sync::atomic::{AtomicU32, Ordering};

    fn blotter() -> SwapBlotter {
        SwapBlotter {
            trade_id: "T1".into(),
            partition_key: PartitionKey::derive("A1", "B1", "S1"),
            trade_lots: vec![],
            contract: "swap".into(),
            state: PositionState::Formed,
            enrichment_status: EnrichmentStatus::Complete,
            workflow_status: WorkflowStatus::Approved,
            processing_metadata: ProcessingMetadata::new(),
            version: 1,
            archive_flag: false,
        }
    }

    struct FailingWebhook {
        calls: AtomicU32,
    }

    #[async_trait]
    impl WebhookPublisher for FailingWebhook {
        async fn publish(&self, _blotter: &SwapBlotter) -> Result<(), CoreError> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            Err(CoreError::Publish("webhook down".into()))
        }
    }

    #[tokio::test]
    async fn publishes_to_output_topic_with_headers() {
        let broker: Arc<dyn BrokerAdapter> = Arc::new(LogBroker::new(2));
        let publisher = OutputPublisher::new(broker.clone(), "trade-capture-blotter".into(), vec![]);

        publisher.publish(&blotter()).await.unwrap();

        let sub = broker.subscribe("trade-capture-blotter").await.unwrap();
        let msg = broker.poll(sub).await.unwrap().unwrap();
        assert_eq!(msg.headers.get("tradeId").unwrap(), "T1");
        assert_eq!(msg.headers.get("partitionKey").unwrap(), "A1|B1|S1");
    }

    #[tokio::test]
    async fn failing_webhook_never_fails_the_primary_publish() {
        let broker: Arc<dyn BrokerAdapter> = Arc::new(LogBroker::new(2));
        let webhook = Arc::new(FailingWebhook {
            calls: AtomicU32::new(0),
        });
        let publisher = OutputPublisher::new(broker.clone(), "trade-capture-blotter".into(), vec![webhook.clone()]);

        publisher.publish(&blotter()).await.unwrap();

        assert_eq!(webhook.calls.load(Ordering::SeqCst), 1);
        let sub = broker.subscribe("trade-capture-blotter").await.unwrap();
        assert!(broker.poll(sub).await.unwrap().is_some());
    }
}
