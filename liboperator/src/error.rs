use std::time::Duration;

#[derive(Debug, thiserror::Error)]
pub enum OperatorError {
    #[error("{kind} `{name}` not found")]
    NotFound { kind: &'static str, name: String },
    #[error("{kind} `{name}` already exists")]
    AlreadyExists { kind: &'static str, name: String },
    #[error("`{operation}` is not supported by the {backend} backend")]
    Unsupported {
        operation: &'static str,
        backend: &'static str,
    },
    #[error("backend call did not finish within {0:?}")]
    Timeout(Duration),
    #[error("backend refused the request: {0}")]
    Rejected(String),
    #[error(transparent)]
    Xline(#[from] Box<etcd_client::Error>),
    #[cfg(feature = "docker")]
    #[error(transparent)]
    Docker(#[from] bollard::errors::Error),
    #[error(transparent)]
    Yaml(#[from] serde_yaml::Error),
}

impl From<etcd_client::Error> for OperatorError {
    fn from(e: etcd_client::Error) -> Self {
        OperatorError::Xline(Box::new(e))
    }
}

impl OperatorError {
    pub fn not_found(kind: &'static str, name: impl Into<String>) -> Self {
        OperatorError::NotFound {
            kind,
            name: name.into(),
        }
    }

    pub fn is_not_found(&self) -> bool {
        match self {
            OperatorError::NotFound { .. } => true,
            #[cfg(feature = "docker")]
            OperatorError::Docker(bollard::errors::Error::DockerResponseServerError {
                status_code,
                ..
            }) => *status_code == 404,
            _ => false,
        }
    }

    /// Errors that will not go away by retrying the same request, such as a
    /// missing image or a configuration the backend cannot satisfy.
    pub fn is_permanent(&self) -> bool {
        matches!(
            self,
            OperatorError::Unsupported { .. }
                | OperatorError::Rejected(_)
                | OperatorError::AlreadyExists { .. }
        )
    }
}

/// Swallow "not found" so that delete operations stay idempotent.
pub(crate) fn ignore_not_found(
    result: Result<(), OperatorError>,
    kind: &str,
    name: &str,
) -> Result<(), OperatorError> {
    match result {
        Err(e) if e.is_not_found() => {
            log::debug!("{kind} {name} already gone, nothing to delete");
            Ok(())
        }
        other => other,
    }
}
