//! Credential management for OAuth2 clients of the Spotify web API
//!
//! This library holds the credentials an application obtains through one of
//! three authorization flows and keeps them usable. Expired access tokens are
//! refreshed before a request goes out and concurrent refreshes are coalesced
//! into a single token request. Requests that are rate limited or hit a
//! transient server error are retried within a bounded delay budget.
//!
//! # Authorization flows
//!
//! * [`AuthorizationCodeManager`]: the user grants access in a browser and the
//!   application exchanges the resulting code using its client secret.
//! * [`PkceManager`]: as above, but proves possession of a code verifier
//!   instead of a client secret.
//! * [`ClientCredentialsManager`]: the application acts on its own behalf.
//!   No user context, no scopes.
//!
//! All three implement [`AuthorizationManager`], which is what the rest of an
//! application should depend on.
//!
//! # Authorizing a user
//!
//! ```
//! use cadenza_tokens::{ClientId, PkceManager, Scopes, State};
//! # use cadenza_tokens::{HttpRequest, HttpResponse, HttpTransport, TransportError};
//! #
//! # #[derive(Debug)]
//! # struct Unreachable;
//! #
//! # #[async_trait::async_trait]
//! # impl HttpTransport for Unreachable {
//! #     async fn send(&self, _: HttpRequest) -> Result<HttpResponse, TransportError> {
//! #         Err(TransportError::new("unreachable"))
//! #     }
//! # }
//! # let transport = Unreachable;
//!
//! let manager = PkceManager::new(ClientId::from_static("my-client-id"), transport);
//!
//! let redirect_uri = url::Url::parse("http://localhost:8888/callback").unwrap();
//! let scopes: Scopes = ["user-read-email", "playlist-read-private"]
//!     .into_iter()
//!     .collect();
//! let state = State::random();
//!
//! let (url, verifier) = manager.authorization_url(&redirect_uri, &scopes, Some(&*state));
//! // Send the user to `url`. Once they are redirected back, hand the full
//! // redirect URL, the verifier, and the state to `exchange_code()`.
//! # drop((url, verifier));
//! ```
//!
//! # Making requests
//!
//! [`ApiClient`] checks that the required scopes were granted, refreshes the
//! access token if needed, attaches it, and retries on rate limiting. The
//! `cadenza_reqwest` crate provides an [`HttpTransport`] backed by `reqwest`.
//!
//! # Features
//!
//! * `file` (default): persisting authorizations to the local filesystem,
//!   see [`persist`].

#![cfg_attr(docsrs, feature(doc_cfg))]
#![warn(
    missing_docs,
    unused_import_braces,
    unused_imports,
    unused_qualifications
)]
#![deny(
    missing_debug_implementations,
    trivial_numeric_casts,
    unsafe_code,
    unused_must_use
)]

mod braids;
pub mod classify;
mod client;
mod credentials;
mod error;
mod manager;
mod notifier;
#[cfg(feature = "file")]
#[cfg_attr(docsrs, doc(cfg(feature = "file")))]
pub mod persist;
mod pkce;
pub mod retry;
mod scope;
mod single_flight;
mod transport;

#[cfg(test)]
mod test_support;

pub use braids::*;
pub use classify::{Classify, ErrorClassification};
pub use client::{ApiClient, ApiRequest};
pub use credentials::{CredentialState, PersistedAuthorization, DEFAULT_EXPIRY_TOLERANCE};
pub use error::{AuthorizationDenied, DecodingError, Error};
pub use manager::{
    AuthorizationCodeManager, AuthorizationManager, ClientCredentialsManager, Endpoints,
    PkceManager, ProxyEndpoints,
};
pub use notifier::{ChangeKind, ChangeSubscription, CredentialChange};
pub use pkce::PkceVerifier;
pub use retry::{JitterSource, NullJitter, RandomJitter, RetryConfig, RetryContext, RetryingExecutor};
pub use scope::{Scope, ScopeRef, Scopes};
pub use transport::{HttpRequest, HttpResponse, HttpTransport, TransportError};
