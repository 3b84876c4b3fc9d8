//! Observability-to-remediation analyzer.
//!
//! Gathers live pod state, firing alerts and recent error logs for one
//! workload, asks a reasoning service for a decision under a strict JSON
//! contract, and turns a valid heal proposal into an approval card.
//!
//! # Modules
//!
//! - [`target`] - Target selectors and their PromQL/LogQL renderings
//! - [`snapshot`] - Pod projection for stable evidence text
//! - [`sources`] - Kubernetes, Prometheus and Loki evidence sources
//! - [`evidence`] - Concurrent aggregation into the three-section report
//! - [`prompt`] - Request text rendering
//! - [`decision`] - Reasoning service clients, outcome types and the parser
//! - [`dispatch`] - Approval cards and noop recording
//! - [`pending`] - Spool for undelivered approval cards
//! - [`pipeline`] - End-to-end run
//! - [`config`] - Configuration loading and validation

#![warn(clippy::pedantic)]

pub mod config;
pub mod decision;
pub mod dispatch;
pub mod error;
pub mod evidence;
pub mod guard;
pub mod pending;
pub mod pipeline;
pub mod prompt;
pub mod snapshot;
pub mod sources;
pub mod target;

pub use config::AnalyzerConfig;
pub use decision::{DecisionClient, DecisionOutcome, HealAction, NoopAction, RiskLevel};
pub use dispatch::{ActionDispatcher, DispatchReport};
pub use error::{AnalyzerError, DecisionError, DeliveryError, TransportError};
pub use evidence::{EvidenceAggregator, EvidenceReport};
pub use pipeline::{Pipeline, RunReport};
pub use prompt::PromptBuilder;
pub use target::{ResolvedTarget, Target};
