//! Request-level failures of the probe endpoint.
//!
//! A failed probe is not one of these: it is reported as `probe_success 0` with a 200.

use axum::{
    http::StatusCode,
    response::{IntoResponse, Response},
};
use thiserror::Error;

use crate::config::ConfigError;
use crate::overrides::OverrideError;

#[derive(Debug, Error)]
pub enum ProbeError {
    #[error("Target parameter is missing")]
    MissingTarget,

    #[error("Unknown module \"{0}\"")]
    ConfigNotFound(String),

    #[error("Unknown prober \"{0}\"")]
    UnknownCapability(String),

    #[error("Query parameter config is not set")]
    MissingInlineConfig,

    #[error("Invalid inline config: {0}")]
    InvalidInlineConfig(String),

    #[error("Error during parsing module overwrites: {0}")]
    InvalidOverride(#[from] OverrideError),

    #[error("Unable to load config: {0}")]
    ConfigLoad(#[from] ConfigError),

    #[error("Unable to make a cold start request: {0}")]
    WarmupFailed(String),

    #[error("Unable to encode metrics: {0}")]
    Encoding(String),
}

impl ProbeError {
    /// Caller faults map to 400, server faults to 500.
    pub fn status(&self) -> StatusCode {
        match self {
            ProbeError::MissingTarget
            | ProbeError::ConfigNotFound(_)
            | ProbeError::UnknownCapability(_)
            | ProbeError::MissingInlineConfig
            | ProbeError::InvalidInlineConfig(_)
            | ProbeError::InvalidOverride(_) => StatusCode::BAD_REQUEST,
            ProbeError::ConfigLoad(_) | ProbeError::WarmupFailed(_) | ProbeError::Encoding(_) => {
                StatusCode::INTERNAL_SERVER_ERROR
            }
        }
    }
}

impl IntoResponse for ProbeError {
    fn into_response(self) -> Response {
        (self.status(), self.to_string()).into_response()
    }
}
