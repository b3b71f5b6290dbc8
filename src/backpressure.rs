//! Backpressure monitor (C7): samples broker lag and in-process queue
//! depth, pausing/resuming a subscription across a hysteresis band so the
//! pipeline doesn't flap between pause and resume at the boundary.

use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Arc;

use crate::broker::{BrokerAdapter, SubscriptionId};
use crate::config::BackpressureConfig;
use crate::error::CoreError;

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubscriptionState {
    Running,
    Paused,
}

pub struct BackpressureMonitor {
    broker: Arc<dyn BrokerAdapter>,
    config: BackpressureConfig,
    queue_depth: Arc<AtomicUsize>,
    state: std::sync::Mutex<SubscriptionState>,
}

impl BackpressureMonitor {
    pub fn new(broker: Arc<dyn BrokerAdapter>, config: BackpressureConfig, queue_depth: Arc<AtomicUsize>) -> Self {
        Self {
            broker,
            config,
            queue_depth,
            state: std::sync::Mutex::new(SubscriptionState::Running),
        }
    }

    /// Sample lag for `pattern` and pause/resume `subscription` accordingly.
    /// Returns the subscription state after this sample.
    pub async fn sample(
        &self,
        subscription: SubscriptionId,
        pattern: &str,
    ) -> Result<SubscriptionState, CoreError> {
        let lags = self.broker.lag(pattern).await?;
        let total_lag: u64 = lags.iter().map(|l| l.lag()).sum();

        let current = *self.state.lock().unwrap();
        match current {
            SubscriptionState::Running if total_lag >= self.config.lag_max => {
                self.broker.pause(subscription).await?;
                *self.state.lock().unwrap() = SubscriptionState::Paused;
                Ok(SubscriptionState::Paused)
            }
            SubscriptionState::Paused if total_lag < self.config.lag_resume => {
                self.broker.resume(subscription).await?;
                *self.state.lock().unwrap() = SubscriptionState::Running;
                Ok(SubscriptionState::Running)
            }
            other => Ok(other),
        }
    }

    /// Whether the in-process queue has room for another in-flight
    /// message. Callers that get `false` must reject and rely on broker
    /// redelivery.
    pub fn can_process_message(&self) -> bool {
        self.queue_depth.load(Ordering::Relaxed) < self.config.queue_max
    }
}
