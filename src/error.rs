//! Error types shared across the controller, sidecar and router.

use thiserror::Error;

#[derive(Debug, Error)]
pub enum AppError {
    #[error("kubernetes error: {0}")]
    Kubernetes(#[from] kube::Error),

    #[error("http error: {0}")]
    Http(#[from] reqwest::Error),

    #[error("serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    #[error("invalid http response: {0}")]
    InvalidResponse(#[from] axum::http::Error),

    #[error("request body error: {0}")]
    Body(#[from] axum::Error),

    #[error("unable to determine app name from pod labels ({0})")]
    MissingAppLabel(String),

    #[error("error parsing {annotation} annotation: {value:?}")]
    InvalidAnnotation { annotation: String, value: String },

    #[error("no nodes available")]
    NoNodesAvailable,

    #[error("no pods found for the app {0}")]
    NoPodsAvailable(String),

    #[error("pod {0} has no IP")]
    PodNotRunning(String),
}

pub type Result<T> = std::result::Result<T, AppError>;
