use thiserror::Error;

/// Failure modes of calls against the provider API.
#[derive(Debug, Clone, Error, PartialEq)]
pub enum ProviderError {
    #[error("the provider rejected the authorisation grant")]
    InvalidGrant,
    #[error("the provider rejected the access token")]
    Unauthorized,
    #[error("the provider is unavailable: {0}")]
    Unavailable(String),
    #[error("unexpected response from the provider: {0}")]
    UnexpectedResponse(String),
}

#[derive(Debug, Error)]
pub enum StorageError {
    #[error("user_id={0} does not exist")]
    UnknownUser(String),
    #[error("database error: {0}")]
    Database(#[source] sqlx::Error),
    #[error("storage unavailable: {0}")]
    Unavailable(String),
}

impl From<sqlx::Error> for StorageError {
    fn from(err: sqlx::Error) -> Self {
        match err {
            sqlx::Error::PoolTimedOut | sqlx::Error::PoolClosed | sqlx::Error::Io(_) => {
                StorageError::Unavailable(err.to_string())
            }
            err => StorageError::Database(err),
        }
    }
}

/// Errors returned by the operations exposed to the HTTP layer.
#[derive(Debug, Error)]
pub enum ServiceError {
    #[error("user_id={user_id} has no {kind} credential")]
    NotLinked { user_id: String, kind: String },
    #[error("refreshing the {kind} credential for user_id={user_id} failed")]
    RefreshFailed {
        user_id: String,
        kind: String,
        #[source]
        source: ProviderError,
    },
    #[error(transparent)]
    Provider(#[from] ProviderError),
    #[error(transparent)]
    Storage(#[from] StorageError),
}

impl ServiceError {
    /// True when the user has to go through the provider's authorisation flow
    /// again before anything else can succeed.
    pub fn requires_authorisation(&self) -> bool {
        matches!(
            self,
            ServiceError::NotLinked { .. } | ServiceError::RefreshFailed { .. }
        )
    }
}
