//! Tracing init, MDC-equivalent logging context, and lightweight counters.
//!
//! Log init sets up a rolling file appender plus an optional stdout layer,
//! gated by an `EnvFilter`. Counters are bare `AtomicU64`s.

use std::sync::atomic::{AtomicU64, Ordering};
use tracing_appender::non_blocking::WorkerGuard;
use tracing_subscriber::{fmt, prelude::*, EnvFilter};

use crate::config::TelemetryConfig;

/// Initialize the global tracing subscriber. The returned guard must be
/// held for the process lifetime; dropping it stops the background flush
/// thread for the file appender.
pub fn init_logging(config: &TelemetryConfig) -> WorkerGuard {
    let file_appender = match config.rotation.as_str() {
        "hourly" => tracing_appender::rolling::hourly(&config.log_dir, &config.log_file),
        "daily" => tracing_appender::rolling::daily(&config.log_dir, &config.log_file),
        _ => tracing_appender::rolling::never(&config.log_dir, &config.log_file),
    };
    let (non_blocking, guard) = tracing_appender::non_blocking(file_appender);

    let filter = EnvFilter::try_from_default_env().unwrap_or_else(|_| EnvFilter::new(&config.log_level));
    let registry = tracing_subscriber::registry().with(filter);

    if config.use_json {
        let file_layer = fmt::layer()
            .json()
            .with_target(true)
            .with_writer(non_blocking)
            .with_ansi(false);
        registry.with(file_layer).init();
    } else {
        let file_layer = fmt::layer()
            .with_target(false)
            .with_writer(non_blocking)
            .with_ansi(false);
        if config.log_to_stdout {
            let stdout_layer = fmt::layer().with_target(false).with_ansi(true);
            registry.with(file_layer).with(stdout_layer).init();
        } else {
            registry.with(file_layer).init();
        }
    }

    guard
}

/// Per-message logging context (trade id, partition key, job id), attached
/// to a `tracing::Span` so every log line inside pipeline processing
/// carries it without threading the values through every call — the
/// structured-logging equivalent of an MDC.
pub fn message_span(trade_id: &str, partition_key: &str) -> tracing::Span {
    tracing::info_span!("trade_capture", trade_id = %trade_id, partition_key = %partition_key)
}

/// Atomic counters surfaced by the orchestrator and control-plane
/// components (messages processed, routing failures, etc.) without pulling
/// in a full metrics-export stack.
#[derive(Default)]
pub struct Counters {
    pub messages_routed: AtomicU64,
    pub routing_failures: AtomicU64,
    pub messages_processed: AtomicU64,
    pub duplicates_rejected: AtomicU64,
    pub rate_limited: AtomicU64,
    pub dlq_published: AtomicU64,
    pub processing_failures: AtomicU64,
}

impl Counters {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn snapshot(&self) -> CountersSnapshot {
        CountersSnapshot {
            messages_routed: self.messages_routed.load(Ordering::Relaxed),
            routing_failures: self.routing_failures.load(Ordering::Relaxed),
            messages_processed: self.messages_processed.load(Ordering::Relaxed),
            duplicates_rejected: self.duplicates_rejected.load(Ordering::Relaxed),
            rate_limited: self.rate_limited.load(Ordering::Relaxed),
            dlq_published: self.dlq_published.load(Ordering::Relaxed),
            processing_failures: self.processing_failures.load(Ordering::Relaxed),
        }
    }
}

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CountersSnapshot {
    pub messages_routed: u64,
    pub routing_failures: u64,
    pub messages_processed: u64,
    pub duplicates_rejected: u64,
    pub rate_limited: u64,
    pub dlq_published: u64,
    pub processing_failures: u64,
}
