use std::time::Duration;
use thiserror::Error;

/// Errors returned by the registry capability.
#[derive(Debug, Error)]
pub enum RegistryError {
    /// The registry answered with an error for this image, e.g. `ImageNotFoundException`,
    /// `ImageAlreadyExistsException` or `ThrottlingException`.
    #[error("{operation} failed with {code}: {message}")]
    Api {
        operation: &'static str,
        code: String,
        message: String,
    },

    /// The request never produced a registry answer.
    #[error("{operation} failed: {source}")]
    Transport {
        operation: &'static str,
        #[source]
        source: Box<dyn std::error::Error + Send + Sync>,
    },
}

impl RegistryError {
    pub fn is_transport(&self) -> bool {
        matches!(self, RegistryError::Transport { .. })
    }
}

#[derive(Debug, Error)]
pub enum WatchError {
    #[error("Timed out after {0:?} waiting for the Pod cache to sync")]
    SyncTimeout(Duration),

    #[error("Pod watch stream ended unexpectedly")]
    StreamEnded,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_api_error_display() {
        let err = RegistryError::Api {
            operation: "PutImage",
            code: "ImageAlreadyExistsException".to_string(),
            message: "tag already exists".to_string(),
        };
        assert_eq!(
            err.to_string(),
            "PutImage failed with ImageAlreadyExistsException: tag already exists"
        );
        assert!(!err.is_transport());
    }

    #[test]
    fn test_transport_error_is_transport() {
        let err = RegistryError::Transport {
            operation: "BatchGetImage",
            source: "connection reset".into(),
        };
        assert!(err.is_transport());
        assert_eq!(err.to_string(), "BatchGetImage failed: connection reset");
    }
}
