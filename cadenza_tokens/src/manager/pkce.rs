use std::sync::Arc;

use cadenza_clock::Clock;
use url::Url;

use super::{
    base::{Backend, Flow, ManagerCore, Redirect},
    private::Sealed,
    AuthorizationManager, Endpoints, ProxyEndpoints,
};
use crate::{
    ClientId, CredentialState, Error, HttpTransport, PersistedAuthorization, PkceVerifier,
    RetryConfig, Scopes, StateRef,
};

/// Manages credentials obtained through the Authorization Code flow with
/// Proof Key for Code Exchange
///
/// No client secret is involved, so this flow suits clients that cannot keep
/// one confidential. Every refresh rotates the refresh token.
#[derive(Debug)]
pub struct PkceManager {
    core: ManagerCore,
}

impl PkceManager {
    /// Constructs a new, unauthorized manager
    pub fn new<T>(client_id: ClientId, transport: T) -> Self
    where
        T: HttpTransport + 'static,
    {
        Self {
            core: ManagerCore::new(
                client_id,
                Flow::Pkce,
                Backend::Direct {
                    client_secret: None,
                },
                Arc::new(transport),
            ),
        }
    }

    /// Constructs a new, unauthorized manager that obtains tokens through a
    /// token proxy
    ///
    /// The proxy sees every code exchange and refresh, and may add a client
    /// secret of its own. A persisted authorization of a proxied manager is
    /// restored with [`with_credentials()`][Self::with_credentials()].
    pub fn proxied<T>(client_id: ClientId, proxy: ProxyEndpoints, transport: T) -> Self
    where
        T: HttpTransport + 'static,
    {
        Self {
            core: ManagerCore::new(
                client_id,
                Flow::Pkce,
                Backend::Proxy(proxy),
                Arc::new(transport),
            ),
        }
    }

    /// Restores a manager from a persisted authorization
    pub fn from_persisted<T>(persisted: PersistedAuthorization, transport: T) -> Self
    where
        T: HttpTransport + 'static,
    {
        Self::new(persisted.client_id, transport).with_credentials(persisted.credentials)
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
    /// A fresh code verifier is generated for the attempt. Keep it until the
    /// user is redirected back, then hand it to
    /// [`exchange_code()`][Self::exchange_code()].
    pub fn authorization_url(
        &self,
        redirect_uri: &Url,
        scopes: &Scopes,
        state: Option<&StateRef>,
    ) -> (Url, PkceVerifier) {
        let verifier = PkceVerifier::generate();
        let url = self.authorization_url_with_verifier(redirect_uri, scopes, state, &verifier);
        (url, verifier)
    }

    /// Builds the URL to send the user to, using an existing code verifier
    pub fn authorization_url_with_verifier(
        &self,
        redirect_uri: &Url,
        scopes: &Scopes,
        state: Option<&StateRef>,
        verifier: &PkceVerifier,
    ) -> Url {
        self.core.authorization_url(
            redirect_uri,
            scopes,
            None,
            state,
            Some(&verifier.challenge()),
        )
    }

    /// Exchanges the authorization code on a redirect for credentials
    ///
    /// The verifier is consumed, as it is only valid for a single attempt.
    /// The state on the redirect is checked against `expected_state` before
    /// anything is sent to the token endpoint.
    pub async fn exchange_code(
        &self,
        redirect_uri_with_query: &Url,
        verifier: PkceVerifier,
        expected_state: Option<&StateRef>,
    ) -> Result<Arc<CredentialState>, Error> {
        let redirect = Redirect::parse(redirect_uri_with_query, expected_state)?;
        self.core.exchange_code(redirect, Some(&verifier)).await
    }
}

impl Sealed for PkceManager {
    #[inline]
    fn core(&self) -> &ManagerCore {
        &self.core
    }
}

impl AuthorizationManager for PkceManager {}
