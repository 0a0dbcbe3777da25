use reqwest::StatusCode;
use thiserror::Error;
use tokio::time::error::Elapsed;

/// An error response of the blob store.
///
/// This is the structured error behind every non-successful HTTP status, including
/// `304 Not Modified`. The [`HttpOrigin`](super::HttpOrigin) does not return it directly, but wrapped
/// in an [`anyhow::Error`] with context, use [`unpack_blob_error`] to get it back.
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("blob store responded with {status} ({})", .code.as_deref().unwrap_or("no error code"))]
pub struct BlobStoreError {
    /// The HTTP status of the response.
    pub status: StatusCode,
    /// The storage error code, taken from the `x-ms-error-code` header.
    pub code: Option<String>,
    /// The response body, if any.
    pub message: Option<String>,
}

impl BlobStoreError {
    /// Maximum number of bytes of the response body kept as message.
    const MAX_MESSAGE_LEN: usize = 1024;

    pub(super) async fn from_response(response: reqwest::Response) -> Self {
        let status = response.status();
        let code = response
            .headers()
            .get("x-ms-error-code")
            .and_then(|v| v.to_str().ok())
            .map(str::to_owned);

        let message = match response.text().await {
            Ok(text) if !text.trim().is_empty() => {
                let mut text = text.trim().to_owned();
                if text.len() > Self::MAX_MESSAGE_LEN {
                    let mut end = Self::MAX_MESSAGE_LEN;
                    while !text.is_char_boundary(end) {
                        end -= 1;
                    }
                    text.truncate(end);
                }
                Some(text)
            }
            _ => None,
        };

        Self {
            status,
            code,
            message,
        }
    }
}

/// Recovers the structured [`BlobStoreError`] from a generic download error.
///
/// Download errors are wrapped in any number of context layers. If a [`BlobStoreError`] is found
/// behind those, it is returned. Otherwise, the original error is handed back unchanged.
pub fn unpack_blob_error(error: anyhow::Error) -> Result<BlobStoreError, anyhow::Error> {
    error.downcast::<BlobStoreError>()
}

/// Names the concrete kind of a download error that did not carry a status.
pub fn error_kind(error: &anyhow::Error) -> &'static str {
    if error.downcast_ref::<Elapsed>().is_some() {
        return "timeout";
    }

    match error.downcast_ref::<reqwest::Error>() {
        Some(e) if e.is_timeout() => "timeout",
        Some(e) if e.is_connect() => "connect",
        Some(e) if e.is_body() || e.is_decode() => "body",
        Some(_) => "request",
        None => "other",
    }
}
