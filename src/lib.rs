//! A serverless blackbox exporter: every HTTP invocation runs one probe against a
//! target and answers with the resulting metrics in Prometheus exposition format.

pub mod cold_start;
pub mod config;
pub mod error;
pub mod handler;
pub mod metrics;
pub mod overrides;
pub mod probe;
