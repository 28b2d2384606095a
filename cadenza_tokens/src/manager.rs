//! Authorization managers for the supported OAuth2 flows
//!
//! Each manager owns the credentials for one client. Credentials are replaced
//! atomically and every replacement is announced to subscribers, so callers
//! sharing a manager never observe a partially applied refresh.

use std::sync::{Arc, LazyLock};

use async_trait::async_trait;
use chrono::Duration;
use url::Url;

use crate::{ChangeSubscription, CredentialState, Error, PersistedAuthorization, Scopes};

mod authorization_code;
mod base;
mod client_credentials;
mod pkce;

pub use self::authorization_code::AuthorizationCodeManager;
pub use self::client_credentials::ClientCredentialsManager;
pub use self::pkce::PkceManager;

// Both literals are constant and well-formed, so parsing cannot fail.
static DEFAULT_AUTHORIZE_URL: LazyLock<Url> = LazyLock::new(|| {
    Url::parse("https://accounts.spotify.com/authorize").expect("authorize URL literal is valid")
});
static DEFAULT_TOKEN_URL: LazyLock<Url> = LazyLock::new(|| {
    Url::parse("https://accounts.spotify.com/api/token").expect("token URL literal is valid")
});

/// The authorization server endpoints used by a manager
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Endpoints {
    authorize_url: Url,
    token_url: Url,
}

impl Default for Endpoints {
    /// The Spotify accounts service
    fn default() -> Self {
        Self {
            authorize_url: DEFAULT_AUTHORIZE_URL.clone(),
            token_url: DEFAULT_TOKEN_URL.clone(),
        }
    }
}

impl Endpoints {
    /// Constructs a new set of endpoints
    pub fn new(authorize_url: Url, token_url: Url) -> Self {
        Self {
            authorize_url,
            token_url,
        }
    }

    /// Replaces the token endpoint
    #[must_use]
    pub fn with_token_url(mut self, token_url: Url) -> Self {
        self.token_url = token_url;
        self
    }

    /// Replaces the authorization endpoint
    #[must_use]
    pub fn with_authorize_url(mut self, authorize_url: Url) -> Self {
        self.authorize_url = authorize_url;
        self
    }

    /// The endpoint users are sent to in order to grant access
    #[inline]
    pub fn authorize_url(&self) -> &Url {
        &self.authorize_url
    }

    /// The endpoint tokens are requested from
    #[inline]
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }
}

/// The endpoints of a token proxy
///
/// A token proxy is a server run alongside the application that holds the
/// client secret and forwards token requests to the authorization server on
/// the client's behalf. Code exchanges are posted to the token URL as a form
/// carrying `code` (and `code_verifier` for PKCE). Refreshes are posted to the
/// refresh URL with `grant_type=refresh_token` and the `refresh_token` (plus
/// `method=PKCE` for PKCE). The Client Credentials flow posts
/// `grant_type=client_credentials` to the token URL and never uses the
/// refresh URL.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ProxyEndpoints {
    token_url: Url,
    refresh_url: Url,
}

impl ProxyEndpoints {
    /// Constructs a new set of proxy endpoints
    pub fn new(token_url: Url, refresh_url: Url) -> Self {
        Self {
            token_url,
            refresh_url,
        }
    }

    /// The endpoint that issues new tokens
    #[inline]
    pub fn token_url(&self) -> &Url {
        &self.token_url
    }

    /// The endpoint that refreshes tokens
    #[inline]
    pub fn refresh_url(&self) -> &Url {
        &self.refresh_url
    }
}

mod private {
    pub trait Sealed {
        fn core(&self) -> &super::base::ManagerCore;
    }
}

/// Operations shared by every authorization manager
///
/// This trait is sealed. The implementations are
/// [`AuthorizationCodeManager`], [`PkceManager`] and
/// [`ClientCredentialsManager`].
#[async_trait]
pub trait AuthorizationManager: private::Sealed + std::fmt::Debug + Send + Sync {
    /// A snapshot of the current credentials
    fn credentials(&self) -> Arc<CredentialState> {
        self.core().credentials()
    }

    /// Whether an access token is held that was granted every scope in `required`
    ///
    /// Client credentials are never granted scopes, so only an empty set of
    /// required scopes is satisfied by them.
    fn is_authorized(&self, required: &Scopes) -> bool {
        self.core().credentials().is_authorized_for(required)
    }

    /// Whether the access token has expired once `tolerance` is added to its
    /// expiration date
    ///
    /// A negative tolerance expires tokens early. Reports `true` if no access
    /// token is held.
    fn is_expired(&self, tolerance: Duration) -> bool {
        self.core().is_expired(tolerance)
    }

    /// Refreshes the access token
    ///
    /// When `only_if_expired` is set and the access token is still valid, the
    /// current credentials are returned without touching the network.
    /// Concurrent refreshes are coalesced into a single token request.
    async fn refresh(
        &self,
        only_if_expired: bool,
        tolerance: Duration,
    ) -> Result<Arc<CredentialState>, Error> {
        self.core().refresh(only_if_expired, tolerance).await
    }

    /// Discards all credentials
    ///
    /// Always announces a change, even if no credentials were held. A refresh
    /// that is in flight when this is called will not restore credentials.
    fn deauthorize(&self) {
        self.core().deauthorize()
    }

    /// Subscribes to changes committed from now on
    fn subscribe(&self) -> ChangeSubscription {
        self.core().subscribe()
    }

    /// The current authorization in its persistable form
    fn to_persisted(&self) -> PersistedAuthorization {
        self.core().to_persisted()
    }
}

impl<M: private::Sealed + ?Sized> private::Sealed for Arc<M> {
    #[inline]
    fn core(&self) -> &base::ManagerCore {
        (**self).core()
    }
}

impl<M: AuthorizationManager + ?Sized> AuthorizationManager for Arc<M> {}
