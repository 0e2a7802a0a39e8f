use crate::overlay::GatewayError;
use thiserror::Error;

/// All errors produced by the chart engine.
#[derive(Debug, Error)]
pub enum ChartError {
    #[error("drawing persistence failed: {0}")]
    Persistence(#[from] std::io::Error),

    #[error("drawing serialization failed: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("order gateway call failed: {0}")]
    Gateway(#[from] GatewayError),
}

impl ChartError {
    /// Determine whether a retry could plausibly succeed.
    pub fn is_transient(&self) -> bool {
        match self {
            ChartError::Persistence(_) | ChartError::Serialization(_) => false,
            ChartError::Gateway(err) => err.is_transient(),
        }
    }
}
