use std::{any, fmt, sync::Arc};

use bytes::Bytes;
use http::StatusCode;
use thiserror::Error;

use crate::{Scopes, State, TransportError};

/// An error produced while authorizing or while making an authorized request
///
/// Errors are cheap to clone, so that a single failed refresh can be handed
/// to every caller that was waiting on it.
#[derive(Clone, Debug, Error)]
#[non_exhaustive]
pub enum Error {
    /// The provider asked the client to slow down
    #[error("rate limited by the provider (retry after {}s)", DisplayRetryAfter(*.retry_after))]
    RateLimited {
        /// The `Retry-After` header value in seconds, if one was given
        retry_after: Option<u64>,
    },

    /// The provider returned an error object
    #[error("provider returned {status}: {message}")]
    Api {
        /// The HTTP status of the response
        status: StatusCode,
        /// The message in the error object
        message: String,
        /// The reason code, for errors returned by player endpoints
        reason: Option<String>,
    },

    /// The token endpoint rejected the request
    #[error("authentication failed: {error}")]
    Authentication {
        /// The OAuth2 error code
        error: String,
        /// A human-readable description, if the provider gave one
        description: Option<String>,
    },

    /// The user or provider denied the authorization request
    #[error(transparent)]
    AuthorizationDenied(#[from] AuthorizationDenied),

    /// The state returned on the redirect did not match the state that was sent
    #[error("authorization state mismatch (supplied {supplied:?}, received {received:?})")]
    InvalidState {
        /// The state the caller expected
        supplied: Option<State>,
        /// The state found on the redirect
        received: Option<State>,
    },

    /// No usable credentials are held
    #[error("unauthorized: {0}")]
    Unauthorized(String),

    /// The held access token was not granted every scope the request needs
    #[error("insufficient scope: missing [{}]", .required.missing_from(.granted))]
    InsufficientScope {
        /// The scopes the request needs
        required: Scopes,
        /// The scopes the access token holds
        granted: Scopes,
    },

    /// The redirect carried neither an authorization code nor an error
    #[error("redirect did not contain an authorization code")]
    MissingAuthorizationCode,

    /// The token endpoint returned a response without a required field
    #[error("token response did not contain `{0}`")]
    IncompleteTokenResponse(&'static str),

    /// A confidential client that talks to the authorization server directly
    /// has no client secret
    #[error("client secret is missing")]
    MissingClientSecret,

    /// A URL could not be parsed
    #[error("invalid URL")]
    InvalidUrl(#[from] url::ParseError),

    /// An HTTP request could not be built
    #[error("invalid request: {0}")]
    InvalidRequest(String),

    /// A response body could not be decoded
    #[error(transparent)]
    Decoding(#[from] DecodingError),

    /// The response had an error status, but its body decoded as a success value
    #[error("unexpected HTTP status {status}")]
    Http {
        /// The HTTP status of the response
        status: StatusCode,
        /// The raw response body
        body: Bytes,
    },

    /// The request could not be sent or no response was received
    #[error("error sending request")]
    Transport(#[from] TransportError),
}

struct DisplayRetryAfter(Option<u64>);

impl fmt::Display for DisplayRetryAfter {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(secs) => fmt::Display::fmt(&secs, f),
            None => f.write_str("?"),
        }
    }
}

impl Error {
    /// Whether recovering from this error requires sending the user through
    /// authorization again
    pub fn requires_reauthorization(&self) -> bool {
        match self {
            Self::AuthorizationDenied(_)
            | Self::InvalidState { .. }
            | Self::Unauthorized(_)
            | Self::MissingAuthorizationCode => true,
            Self::Authentication { error, .. } => error == "invalid_grant",
            _ => false,
        }
    }

    pub(crate) fn unauthorized(reason: impl Into<String>) -> Self {
        Self::Unauthorized(reason.into())
    }

    pub(crate) fn invalid_request(err: http::Error) -> Self {
        Self::InvalidRequest(err.to_string())
    }
}

/// The authorization server redirected back with an error instead of a code
#[derive(Clone, Debug, PartialEq, Eq, Error)]
#[error("authorization request denied: {error}")]
pub struct AuthorizationDenied {
    /// The OAuth2 error code, such as `access_denied`
    pub error: String,
    /// The state returned on the redirect
    pub state: Option<State>,
}

impl AuthorizationDenied {
    /// Whether the user explicitly refused to grant access
    #[inline]
    pub fn access_was_denied(&self) -> bool {
        self.error == "access_denied"
    }
}

/// A response body did not have the expected shape
#[derive(Clone, Debug, Error)]
#[error("unable to decode {expected_type} from response{}", DisplayStatus(*.status))]
pub struct DecodingError {
    raw: Bytes,
    expected_type: &'static str,
    status: Option<StatusCode>,
    #[source]
    source: Arc<serde_json::Error>,
}

struct DisplayStatus(Option<StatusCode>);

impl fmt::Display for DisplayStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.0 {
            Some(status) => write!(f, " with status {}", status),
            None => Ok(()),
        }
    }
}

impl DecodingError {
    pub(crate) fn new<T>(raw: Bytes, status: Option<StatusCode>, source: serde_json::Error) -> Self {
        Self {
            raw,
            expected_type: any::type_name::<T>(),
            status,
            source: Arc::new(source),
        }
    }

    /// The undecodable body
    #[inline]
    pub fn raw(&self) -> &Bytes {
        &self.raw
    }

    /// The body as text, replacing invalid UTF-8
    pub fn raw_text(&self) -> String {
        String::from_utf8_lossy(&self.raw).into_owned()
    }

    /// The name of the type that was expected
    #[inline]
    pub fn expected_type(&self) -> &'static str {
        self.expected_type
    }

    /// The HTTP status of the response
    #[inline]
    pub fn status(&self) -> Option<StatusCode> {
        self.status
    }
}
