//! Unified market-data access platform: symbol normalization, provider
//! routing with circuit-breaker fallback, a two-level cache, corporate-
//! action price adjustment, drift detection, and two-provider
//! reconciliation, fronted by a single [`service::DataService`].
//!
//! This crate never installs a `tracing` subscriber itself — only the
//! `vprism` binary (`src/bin/vprism.rs`) does — so it stays embeddable.

pub mod adjustment;
pub mod cache;
pub mod config;
pub mod drift;
pub mod error;
pub mod model;
pub mod provider;
pub mod reconcile;
pub mod registry;
pub mod router;
pub mod service;
pub mod store;
pub mod support;
pub mod symbol;

pub use error::{DomainError, DomainResult, ErrorCode};
pub use service::DataService;
