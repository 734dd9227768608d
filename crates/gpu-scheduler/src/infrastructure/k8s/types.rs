use thiserror::Error;

/// Errors that can occur during Kubernetes operations.
#[derive(Debug, Error)]
pub enum KubernetesError {
    #[error("Failed to connect to Kubernetes API: {message}")]
    ConnectionFailed { message: String },
    #[error("Failed to watch resources: {message}")]
    WatchFailed { message: String },
    #[error("Kubernetes request failed: {message}")]
    RequestFailed { message: String },
    #[error("Write conflict on {kind} {name} after {attempts} attempts")]
    Conflict {
        kind: &'static str,
        name: String,
        attempts: u32,
    },
    #[error("Leader election failed: {message}")]
    LeaderElection { message: String },
}

/// Whether `error` is an API error with the given HTTP status code.
pub fn is_status(error: &kube::Error, code: u16) -> bool {
    matches!(error, kube::Error::Api(response) if response.code == code)
}

pub fn is_not_found(error: &kube::Error) -> bool {
    is_status(error, 404)
}

pub fn is_conflict(error: &kube::Error) -> bool {
    is_status(error, 409)
}
