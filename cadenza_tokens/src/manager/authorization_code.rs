use std::sync::Arc;

use cadenza_clock::Clock;
use url::Url;

use super::{
    base::{Backend, Flow, ManagerCore, Redirect},
    private::Sealed,
    AuthorizationManager, Endpoints, ProxyEndpoints,
};
use crate::{
    ClientId, ClientSecret, CredentialState, Error, HttpTransport, PersistedAuthorization,
    RetryConfig, Scopes, StateRef,
};

/// Manages credentials obtained through the Authorization Code flow
///
/// The client secret is sent to the token endpoint, so this flow is only
/// appropriate for clients that can keep it confidential or that go through a
/// token proxy. The server may
/// rotate the refresh token on any refresh.
#[derive(Debug)]
pub struct AuthorizationCodeManager {
    core: ManagerCore,
}

impl AuthorizationCodeManager {
    /// Constructs a new, unauthorized manager
    pub fn new<T>(client_id: ClientId, client_secret: ClientSecret, transport: T) -> Self
    where
        T: HttpTransport + 'static,
    {
        Self {
            core: ManagerCore::new(
                client_id,
                Flow::AuthorizationCode,
                Backend::Direct {
                    client_secret: Some(client_secret),
                },
                Arc::new(transport),
            ),
        }
    }

    /// Constructs a new, unauthorized manager that obtains tokens through a
    /// token proxy
    ///
    /// The client secret stays with the proxy. A persisted authorization of a
    /// proxied manager is restored with
    /// [`with_credentials()`][Self::with_credentials()].
    pub fn proxied<T>(client_id: ClientId, proxy: ProxyEndpoints, transport: T) -> Self
    where
        T: HttpTransport + 'static,
    {
        Self {
            core: ManagerCore::new(
                client_id,
                Flow::AuthorizationCode,
                Backend::Proxy(proxy),
                Arc::new(transport),
            ),
        }
    }

    /// Restores a manager from a persisted authorization
    ///
    /// Fails if the persisted authorization has no client secret.
    pub fn from_persisted<T>(persisted: PersistedAuthorization, transport: T) -> Result<Self, Error>
    where
        T: HttpTransport + 'static,
    {
        let client_secret = persisted.client_secret.ok_or(Error::MissingClientSecret)?;
        Ok(Self::new(persisted.client_id, client_secret, transport)
            .with_credentials(persisted.credentials))
    }

    /// Uses a different authorization server
    #[must_use]
    pub fn with_endpoints(mut self, endpoints: Endpoints) -> Self {
        self.core.set_endpoints(endpoints);
        self
    }

    /// Uses a different clock for expiry checks
    #[must_use]
    pub fn with_clock<C: Clock + 'static>(mut self, clock: C) -> Self {
        self.core.set_clock(Arc::new(clock));
        self
    }

    /// Uses a different retry configuration for token requests
    #[must_use]
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.core.set_retry_config(config);
        self
    }

    /// Starts from existing credentials
    #[must_use]
    pub fn with_credentials(mut self, credentials: CredentialState) -> Self {
        self.core.set_credentials(credentials);
        self
    }

    /// The client ID
    #[inline]
    pub fn client_id(&self) -> &ClientId {
        self.core.client_id()
    }

    /// Builds the URL to send the user to in order to grant access
    ///
    /// `show_dialog` forces the user to approve the request again even if
    /// they already have. When a `state` is given, the same state must be
    /// passed to [`exchange_code()`][Self::exchange_code()].
    pub fn authorization_url(
        &self,
        redirect_uri: &Url,
        scopes: &Scopes,
        show_dialog: bool,
        state: Option<&StateRef>,
    ) -> Url {
        self.core
            .authorization_url(redirect_uri, scopes, Some(show_dialog), state, None)
    }

    /// Exchanges the authorization code on a redirect for credentials
    ///
    /// `redirect_uri_with_query` is the full URI the user was redirected to.
    /// The state on the redirect is checked against `expected_state` before
    /// anything is sent to the token endpoint.
    pub async fn exchange_code(
        &self,
        redirect_uri_with_query: &Url,
        expected_state: Option<&StateRef>,
    ) -> Result<Arc<CredentialState>, Error> {
        let redirect = Redirect::parse(redirect_uri_with_query, expected_state)?;
        self.core.exchange_code(redirect, None).await
    }
}

impl Sealed for AuthorizationCodeManager {
    #[inline]
    fn core(&self) -> &ManagerCore {
        &self.core
    }
}

impl AuthorizationManager for AuthorizationCodeManager {}
