//! Prometheus exporter for on-demand probe commands.
//!
//! Operators declare named probes (an executable plus ordered arguments) in
//! YAML files; each `GET /probe?module=<name>` request resolves the probe's
//! arguments against the query string, runs the command, and renders `up`,
//! `success` and `duration_seconds` gauges from the outcome.
//!
//! # Architecture
//!
//! ```text
//! ┌─────────────────┐     ┌─────────────────┐     ┌─────────────────┐
//! │   ConfigStore   │────>│  build_command  │────>│       run       │
//! │  (YAML merge)   │     │  (arg resolve)  │     │  (subprocess)   │
//! └─────────────────┘     └─────────────────┘     └────────┬────────┘
//!                                                          │
//!                            ┌─────────────────┐  ┌────────┴────────┐
//!                            │   HTTP /probe   │<─│ probe_registry  │
//!                            │  (axum router)  │  │ (fresh gauges)  │
//!                            └─────────────────┘  └─────────────────┘
//! ```
//!
//! The configuration is merged and validated once at startup and shared
//! read-only into the HTTP layer; per-request gauge registries keep probe
//! invocations fully isolated from each other.
//!
//! # Usage
//!
//! ```bash
//! probe-script-exporter --config-dir /etc/probe-script-exporter
//! ```

pub mod config;
pub mod http;
pub mod metrics;
pub mod runner;

pub use config::{ConfigError, ConfigStore, ProbeDefinition};
pub use http::HttpServer;
pub use metrics::ProcessMetrics;
pub use runner::{RunResult, build_command, run};
