//! Error types for the LBCF operator

use thiserror::Error;

/// Result type alias using the operator's Error type
pub type Result<T> = std::result::Result<T, Error>;

/// Operator error types
#[derive(Error, Debug)]
pub enum Error {
    /// Kubernetes API error
    #[error("Kubernetes API error: {0}")]
    Kube(#[from] kube::Error),

    /// The object being written no longer exists
    #[error("Not found: {0}")]
    NotFound(String),

    /// Optimistic concurrency conflict, the object changed since it was read
    #[error("Conflict: {0}")]
    Conflict(String),

    /// Create of an object whose name is already taken
    #[error("Already exists: {0}")]
    AlreadyExists(String),

    /// An object the reconciliation depends on is missing
    #[error("Missing dependency: {0}")]
    MissingDependency(String),

    /// Webhook transport or protocol failure
    #[error("Webhook {hook} of driver {driver} failed: {message}")]
    Webhook {
        driver: String,
        hook: String,
        message: String,
    },

    /// Webhook answered with a status token the operator does not understand
    #[error("Invalid webhook response: unknown status {0:?}")]
    InvalidResponse(String),

    /// Malformed reconciliation key
    #[error("Invalid key: {0}")]
    InvalidKey(String),

    /// Serialization error
    #[error("Serialization error: {0}")]
    Serialization(#[from] serde_json::Error),

    /// Configuration error
    #[error("Configuration error: {0}")]
    Config(String),

    /// Several independent operations failed
    #[error("{} operations failed: {}", .0.len(), join_errors(.0))]
    Aggregate(Vec<Error>),
}

fn join_errors(errors: &[Error]) -> String {
    errors
        .iter()
        .map(ToString::to_string)
        .collect::<Vec<_>>()
        .join("; ")
}

impl Error {
    /// Create a configuration error
    pub fn config(msg: impl Into<String>) -> Self {
        Error::Config(msg.into())
    }

    /// Create a missing dependency error
    pub fn missing(msg: impl Into<String>) -> Self {
        Error::MissingDependency(msg.into())
    }

    /// Create a webhook transport error
    pub fn webhook(driver: &str, hook: &str, msg: impl Into<String>) -> Self {
        Error::Webhook {
            driver: driver.to_string(),
            hook: hook.to_string(),
            message: msg.into(),
        }
    }

    /// Translate a Kubernetes API error, lifting the status codes the
    /// reconcilers care about into dedicated variants
    pub fn from_kube(err: kube::Error, what: &str) -> Self {
        match err {
            kube::Error::Api(ref resp) if resp.code == 404 => Error::NotFound(what.to_string()),
            kube::Error::Api(ref resp) if resp.code == 409 && resp.reason == "AlreadyExists" => {
                Error::AlreadyExists(what.to_string())
            }
            kube::Error::Api(ref resp) if resp.code == 409 => Error::Conflict(what.to_string()),
            other => Error::Kube(other),
        }
    }

    /// Collapse a list of errors into a single one
    pub fn aggregate(mut errors: Vec<Error>) -> Option<Self> {
        match errors.len() {
            0 => None,
            1 => errors.pop(),
            _ => Some(Error::Aggregate(errors)),
        }
    }

    pub fn is_not_found(&self) -> bool {
        matches!(self, Error::NotFound(_))
    }

    pub fn is_conflict(&self) -> bool {
        matches!(self, Error::Conflict(_))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aggregate_of_nothing_is_none() {
        assert!(Error::aggregate(vec![]).is_none());
    }

    #[test]
    fn aggregate_of_one_is_that_error() {
        let err = Error::aggregate(vec![Error::config("bad")]).unwrap();
        assert!(matches!(err, Error::Config(_)));
    }

    #[test]
    fn aggregate_lists_every_message() {
        let err = Error::aggregate(vec![
            Error::Conflict("a".into()),
            Error::NotFound("b".into()),
        ])
        .unwrap();
        let msg = err.to_string();
        assert!(msg.starts_with("2 operations failed"));
        assert!(msg.contains("Conflict: a"));
        assert!(msg.contains("Not found: b"));
    }
}
