use std::time::Duration;

use crate::addon::{AddonKey, Fingerprint};

pub type Result<T, E = Error> = std::result::Result<T, E>;

/// Errors surfaced by the supervisor, its config watchers and the object store backends.
#[derive(Debug, thiserror::Error)]
pub enum Error {
    /// A queue key that does not have the `namespace/name` form.
    #[error("invalid addon key {0:?}")]
    InvalidKey(String),

    /// The addon status was written concurrently by someone else.
    #[error("conflict while updating the status of addon {0}")]
    Conflict(AddonKey),

    /// The addon vanished between read and write.
    #[error("addon {0} not found")]
    NotFound(AddonKey),

    #[error("external call timed out after {0:?}")]
    Timeout(Duration),

    #[error("addon {0} has no discovered config reference")]
    NoReference(AddonKey),

    /// The config watcher for a reference could not be brought up.
    #[error("cannot build config watcher for {fingerprint}: {source}")]
    Build {
        fingerprint: Fingerprint,
        #[source]
        source: Box<Error>,
    },

    /// The referenced group/version does not serve the resource.
    #[error("resource {0} is not served by the cluster")]
    UnknownResource(String),

    #[error("kubernetes api error: {0}")]
    Kube(#[from] kube_client::Error),

    #[error("watch error: {0}")]
    Watch(#[from] kube_runtime::watcher::Error),

    #[error("cannot serialize addon: {0}")]
    Serialize(#[from] serde_json::Error),
}

impl Error {
    /// Whether the work queue should retry the key that produced this error.
    pub fn is_retryable(&self) -> bool {
        !matches!(self, Error::InvalidKey(_))
    }
}

/// Bounds `fut` by `deadline`, mapping an elapsed deadline to [`Error::Timeout`].
pub(crate) async fn with_timeout<T>(
    deadline: Duration,
    fut: impl std::future::Future<Output = Result<T>>,
) -> Result<T> {
    match tokio::time::timeout(deadline, fut).await {
        Ok(result) => result,
        Err(_) => Err(Error::Timeout(deadline)),
    }
}
