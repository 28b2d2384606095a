use std::sync::Arc;

use cadenza_clock::Clock;
use chrono::Duration;

use super::{
    base::{Backend, Flow, ManagerCore},
    private::Sealed,
    AuthorizationManager, Endpoints, ProxyEndpoints,
};
use crate::{
    ClientId, ClientSecret, CredentialState, Error, HttpTransport, PersistedAuthorization,
    RetryConfig,
};

/// Manages credentials obtained through the Client Credentials flow
///
/// Tokens carry no user context and no scopes, and no refresh token is
/// issued. Refreshing simply requests a new token. Token requests that are
/// rate limited or hit a transient server error are retried.
#[derive(Debug)]
pub struct ClientCredentialsManager {
    core: ManagerCore,
}

impl ClientCredentialsManager {
    /// Constructs a new, unauthorized manager
    pub fn new<T>(client_id: ClientId, client_secret: ClientSecret, transport: T) -> Self
    where
        T: HttpTransport + 'static,
    {
        Self {
            core: ManagerCore::new(
                client_id,
                Flow::ClientCredentials,
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
                Flow::ClientCredentials,
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

    /// Requests a new access token
    ///
    /// Shares the request with any refresh already in flight.
    pub async fn authorize(&self) -> Result<Arc<CredentialState>, Error> {
        self.core.refresh(false, Duration::zero()).await
    }
}

impl Sealed for ClientCredentialsManager {
    #[inline]
    fn core(&self) -> &ManagerCore {
        &self.core
    }
}

impl AuthorizationManager for ClientCredentialsManager {}
