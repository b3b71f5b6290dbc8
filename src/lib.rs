//! Trade-capture processing core.
//!
//! The per-partition, in-order, exactly-once message pipeline: a router
//! fans an ingress topic into partition subtopics, an ordered processor
//! enforces per-partition sequencing and idempotency, and an orchestrator
//! drives each message through enrichment, rules, validation, the CDM
//! state machine, and persistence, under a backpressure/rate-limit/DLQ
//! control plane.
//!
//! # Modules
//!
//! - [`model`] - wire/domain types (TradeCaptureMessage, SwapBlotter, ...)
//! - [`config`] - typed YAML configuration
//! - [`error`] - crate-wide error taxonomy
//! - [`telemetry`] - tracing init, logging context, counters
//! - [`coordination`] - coordination-store client, locks, rate limiter
//! - [`durable`] - durable-store client (idempotency, partition state, blotters)
//! - [`broker`] - broker adapter (log-style and JMS-style)
//! - [`router`] - ingress -> partition subtopic router
//! - [`ingress`] - API request -> ingress message publisher
//! - [`backpressure`] - lag/queue-depth monitor
//! - [`idempotency`] - two-tier idempotency service
//! - [`sequence`] - sequence validator + out-of-order buffer
//! - [`refdata`] - reference-data clients with circuit breaker + retry
//! - [`enrichment`] - parallel enrichment
//! - [`rules`] - rules engine
//! - [`validation`] - structural/semantic validation
//! - [`state_machine`] - CDM position-state transitions
//! - [`orchestrator`] - drives the pipeline per message
//! - [`output`] - output publisher (broker + webhook)
//! - [`job_status`] - job-status service
//! - [`dlq`] - dead-letter queue service

pub mod config;
pub mod error;
pub mod model;
pub mod telemetry;

pub mod coordination;
pub mod durable;

pub mod broker;
pub mod router;
pub mod ingress;

pub mod backpressure;
pub mod idempotency;
pub mod sequence;

pub mod refdata;
pub mod enrichment;
pub mod rules;
pub mod validation;
pub mod state_machine;

pub mod orchestrator;
pub mod output;
pub mod job_status;
pub mod dlq;

pub use config::AppConfig;
pub use error::CoreError;
pub use orchestrator::{ProcessOutcome, TradeCaptureOrchestrator};
