use std::io;

use http::StatusCode;

use crate::ErrorKind;

/// An extension trait to decide whether a failed attempt is worth another
/// try through a different proxy.
///
/// Failures that point at the proxy (refused or dropped connections,
/// timeouts, gateway errors, proxy authentication) are retryable. Failures
/// that point at the target itself (most `4xx` codes) or at our own setup
/// (unbuildable clients, bad headers) are not, since switching the proxy
/// would not change the outcome.
pub(crate) trait RetryExt {
    fn should_retry(&self) -> bool;
}

impl RetryExt for StatusCode {
    #[allow(clippy::if_same_then_else)]
    fn should_retry(&self) -> bool {
        let status = *self;
        if status.is_server_error() {
            true
        } else if matches!(
            status,
            StatusCode::FORBIDDEN
                | StatusCode::PROXY_AUTHENTICATION_REQUIRED
                | StatusCode::REQUEST_TIMEOUT
                | StatusCode::TOO_MANY_REQUESTS
        ) {
            // Commonly produced by the proxy, or by the target blocking the proxy's address
            true
        } else if status.is_client_error() || status.is_success() {
            false
        } else {
            // Informational or redirect codes left over after the redirect limit
            true
        }
    }
}

impl RetryExt for reqwest::Error {
    #[allow(clippy::if_same_then_else)]
    fn should_retry(&self) -> bool {
        if self.is_builder() || self.is_redirect() {
            false
        } else if self.is_timeout() || self.is_connect() {
            true
        } else if let Some(status) = self.status() {
            status.should_retry()
        } else if let Some(hyper_error) = get_source_error_type::<hyper::Error>(self) {
            // Proxies often cut the connection halfway through a response
            if hyper_error.is_incomplete_message() || hyper_error.is_canceled() {
                true
            } else if let Some(io_error) = get_source_error_type::<io::Error>(hyper_error) {
                should_retry_io(io_error)
            } else {
                true
            }
        } else {
            !self.is_decode()
        }
    }
}

impl RetryExt for ErrorKind {
    fn should_retry(&self) -> bool {
        if let Some(r) = self.reqwest_error() {
            return r.should_retry();
        }
        match self {
            Self::RejectedStatusCode(status) => status.should_retry(),
            Self::AttemptTimeout(_) | Self::AttemptFailure { .. } | Self::ValidationTimeout(..) => {
                true
            }
            Self::Io(e) => should_retry_io(e),
            _ => false,
        }
    }
}

/// Classifies an `io::Error` into retryable or not.
fn should_retry_io(error: &io::Error) -> bool {
    matches!(
        error.kind(),
        io::ErrorKind::ConnectionReset
            | io::ErrorKind::ConnectionAborted
            | io::ErrorKind::ConnectionRefused
            | io::ErrorKind::BrokenPipe
            | io::ErrorKind::UnexpectedEof
            | io::ErrorKind::TimedOut
    )
}

/// Downcasts the given err source into T.
fn get_source_error_type<T: std::error::Error + 'static>(
    err: &dyn std::error::Error,
) -> Option<&T> {
    let mut source = err.source();

    while let Some(err) = source {
        if let Some(typed) = err.downcast_ref::<T>() {
            return Some(typed);
        }

        source = err.source();
    }
    None
}
