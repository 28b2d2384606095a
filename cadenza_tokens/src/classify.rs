//! Classification of failures into retry decisions

use bytes::Bytes;
use http::{header::RETRY_AFTER, HeaderMap, StatusCode};
use serde::{de::DeserializeOwned, Deserialize};

use crate::{DecodingError, Error, HttpResponse, Scopes};

/// What a failure means for the caller
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum ErrorClassification {
    /// The provider is rate limiting the client
    RateLimited {
        /// Seconds to wait, if the provider said
        retry_after: Option<u64>,
    },
    /// The provider had a transient failure
    TransientServer {
        /// One of 500, 502, 503 or 504
        status: StatusCode,
    },
    /// No usable credentials are held
    Unauthorized,
    /// The access token lacks scopes the request needs
    InsufficientScope {
        /// The scopes the request needs
        required: Scopes,
        /// The scopes the access token holds
        granted: Scopes,
    },
    /// Anything else
    Fatal {
        /// A description of the failure
        reason: String,
    },
}

impl ErrorClassification {
    /// Whether a failure of this kind may be retried
    #[inline]
    pub fn is_retryable(&self) -> bool {
        matches!(self, Self::RateLimited { .. } | Self::TransientServer { .. })
    }
}

/// Types that can be classified for retry
pub trait Classify {
    /// Classifies the failure
    fn classify(&self) -> ErrorClassification;
}

impl Classify for Error {
    fn classify(&self) -> ErrorClassification {
        match self {
            Self::RateLimited { retry_after } => ErrorClassification::RateLimited {
                retry_after: *retry_after,
            },
            Self::Api { status, .. } | Self::Http { status, .. } if is_transient(*status) => {
                ErrorClassification::TransientServer { status: *status }
            }
            Self::Unauthorized(_) => ErrorClassification::Unauthorized,
            Self::InsufficientScope { required, granted } => {
                ErrorClassification::InsufficientScope {
                    required: required.clone(),
                    granted: granted.clone(),
                }
            }
            other => ErrorClassification::Fatal {
                reason: other.to_string(),
            },
        }
    }
}

fn is_transient(status: StatusCode) -> bool {
    matches!(
        status,
        StatusCode::INTERNAL_SERVER_ERROR
            | StatusCode::BAD_GATEWAY
            | StatusCode::SERVICE_UNAVAILABLE
            | StatusCode::GATEWAY_TIMEOUT
    )
}

/// Reads the `Retry-After` header as a whole number of seconds
pub fn retry_after(headers: &HeaderMap) -> Option<u64> {
    headers
        .get(RETRY_AFTER)?
        .to_str()
        .ok()?
        .trim()
        .parse()
        .ok()
}

/// Classifies a response using only its status line and headers
///
/// Returns `None` for responses that should not be retried.
pub fn classify_status(status: StatusCode, headers: &HeaderMap) -> Option<ErrorClassification> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        Some(ErrorClassification::RateLimited {
            retry_after: retry_after(headers),
        })
    } else if is_transient(status) {
        Some(ErrorClassification::TransientServer { status })
    } else {
        None
    }
}

#[derive(Deserialize)]
struct AuthenticationErrorBody {
    error: String,
    error_description: Option<String>,
}

#[derive(Deserialize)]
struct PlayerErrorBody {
    error: PlayerErrorObject,
}

#[derive(Deserialize)]
struct PlayerErrorObject {
    message: String,
    reason: String,
}

#[derive(Deserialize)]
struct RegularErrorBody {
    error: RegularErrorObject,
}

#[derive(Deserialize)]
struct RegularErrorObject {
    message: String,
}

/// Interprets an error response from the provider
///
/// A 429 is always a rate limit. Any other 4xx or 5xx response is decoded as
/// an authentication error, a player error or a regular error object, in that
/// order. Returns `None` if the status is not an error or no error shape
/// matched the body.
pub fn decode_errors(status: StatusCode, headers: &HeaderMap, body: &[u8]) -> Option<Error> {
    if status == StatusCode::TOO_MANY_REQUESTS {
        return Some(Error::RateLimited {
            retry_after: retry_after(headers),
        });
    }

    if !(status.is_client_error() || status.is_server_error()) {
        return None;
    }

    if let Ok(auth) = serde_json::from_slice::<AuthenticationErrorBody>(body) {
        return Some(Error::Authentication {
            error: auth.error,
            description: auth.error_description,
        });
    }

    if let Ok(player) = serde_json::from_slice::<PlayerErrorBody>(body) {
        return Some(Error::Api {
            status,
            message: player.error.message,
            reason: Some(player.error.reason),
        });
    }

    if let Ok(regular) = serde_json::from_slice::<RegularErrorBody>(body) {
        return Some(Error::Api {
            status,
            message: regular.error.message,
            reason: None,
        });
    }

    None
}

/// Decodes a response into `T`, surfacing provider errors first
pub fn decode_response<T: DeserializeOwned>(response: HttpResponse) -> Result<T, Error> {
    let (parts, body) = response.into_parts();
    check_errors(parts.status, &parts.headers, &body)?;

    match serde_json::from_slice::<T>(&body) {
        Ok(value) if parts.status.is_success() => Ok(value),
        Ok(_) => Err(Error::Http {
            status: parts.status,
            body,
        }),
        Err(err) => Err(decoding_failure::<T>(parts.status, body, err)),
    }
}

/// Checks a response whose body is not interesting, surfacing provider errors
pub fn expect_success(response: HttpResponse) -> Result<(), Error> {
    let (parts, body) = response.into_parts();
    check_errors(parts.status, &parts.headers, &body)?;

    if parts.status.is_success() {
        Ok(())
    } else {
        Err(Error::Http {
            status: parts.status,
            body,
        })
    }
}

fn check_errors(status: StatusCode, headers: &HeaderMap, body: &Bytes) -> Result<(), Error> {
    match decode_errors(status, headers, body) {
        Some(err) => {
            tracing::debug!(status = status.as_u16(), error = %err, "provider returned an error");
            Err(err)
        }
        None => Ok(()),
    }
}

fn decoding_failure<T>(status: StatusCode, body: Bytes, err: serde_json::Error) -> Error {
    if !status.is_success() {
        tracing::error!(
            status = status.as_u16(),
            expected_type = std::any::type_name::<T>(),
            body = %String::from_utf8_lossy(&body),
            "error response could not be decoded as any known error shape"
        );
    }

    Error::Decoding(DecodingError::new::<T>(body, Some(status), err))
}
