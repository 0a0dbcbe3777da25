use reqwest::StatusCode;
use thiserror::Error;

/// An error that happens when reading a blob through the [`StorageClient`](super::StorageClient).
///
/// This is the only error shape callers see, origin specific errors are translated into it by
/// the storage client.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum StorageError {
    /// The blob does not exist.
    ///
    /// The attached string is the `<host>/<path>` of the blob.
    #[error("not found: {0}")]
    NotFound(String),
    /// The caller is not allowed to read the blob.
    ///
    /// The attached string contains the status the origin responded with.
    #[error("permission denied: {0}")]
    PermissionDenied(String),
    /// An unexpected error, including a cached blob that was changed at the origin.
    ///
    /// Details are logged where the error happens and are not exposed to callers.
    #[error("internal error")]
    InternalError,
}

impl StorageError {
    /// Creates a [`NotFound`](Self::NotFound) error naming the host and path of `url`.
    pub fn not_found(url: &url::Url) -> Self {
        let host = url.host_str().unwrap_or_default();
        let path = url.path().trim_start_matches('/');
        Self::NotFound(format!("{host}/{path}"))
    }

    /// Creates a [`PermissionDenied`](Self::PermissionDenied) error from the origin's status.
    pub fn permission_denied(status: StatusCode) -> Self {
        Self::PermissionDenied(status.to_string())
    }

    /// Logs the given error and returns an [`InternalError`](Self::InternalError).
    #[track_caller]
    pub fn from_std_error<E: std::error::Error + 'static>(e: E) -> Self {
        let dynerr: &dyn std::error::Error = &e; // tracing expects a `&dyn Error`
        tracing::error!(error = dynerr);
        Self::InternalError
    }

    /// The HTTP status an API serving this error should respond with.
    pub fn status_code(&self) -> StatusCode {
        match self {
            Self::NotFound(_) => StatusCode::NOT_FOUND,
            Self::PermissionDenied(_) => StatusCode::FORBIDDEN,
            Self::InternalError => StatusCode::INTERNAL_SERVER_ERROR,
        }
    }

    /// A short name of the variant, used as metrics tag.
    pub(super) fn as_tag(&self) -> &'static str {
        match self {
            Self::NotFound(_) => "notfound",
            Self::PermissionDenied(_) => "permissiondenied",
            Self::InternalError => "internalerror",
        }
    }
}

impl From<serde_json::Error> for StorageError {
    #[track_caller]
    fn from(err: serde_json::Error) -> Self {
        Self::from_std_error(err)
    }
}
