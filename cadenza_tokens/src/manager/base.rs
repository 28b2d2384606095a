use std::{
    fmt,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
};

use aliri_base64::Base64;
use arc_swap::ArcSwap;
use bytes::Bytes;
use cadenza_clock::{Clock, System};
use chrono::Duration;
use http::header::{AUTHORIZATION, CONTENT_TYPE};
use url::Url;

use super::{Endpoints, ProxyEndpoints};
use crate::{
    classify,
    credentials::TokenResponse,
    notifier::ChangeNotifier,
    single_flight::{Role, SingleFlight},
    AuthorizationCode, AuthorizationDenied, ChangeKind, ChangeSubscription, ClientId, ClientSecret,
    CodeChallenge, CredentialState, Error, HttpRequest, HttpTransport, PersistedAuthorization,
    PkceVerifier, RetryConfig, RetryingExecutor, Scopes, State, StateRef,
};

/// The OAuth2 flow a manager follows
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Flow {
    AuthorizationCode,
    Pkce,
    ClientCredentials,
}

/// Where token requests are sent
#[derive(Debug)]
pub enum Backend {
    /// Straight to the authorization server's token endpoint, authenticating
    /// with the client secret when the flow calls for one
    Direct { client_secret: Option<ClientSecret> },
    /// To a token proxy that holds the client secret
    Proxy(ProxyEndpoints),
}

impl Backend {
    fn client_secret(&self) -> Option<&ClientSecret> {
        match self {
            Self::Direct { client_secret } => client_secret.as_ref(),
            Self::Proxy(_) => None,
        }
    }
}

/// A form-encoded token endpoint request
pub struct TokenForm {
    grant_type: &'static str,
    params: Vec<(&'static str, String)>,
    basic_auth: Option<String>,
}

impl fmt::Debug for TokenForm {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("TokenForm")
            .field("grant_type", &self.grant_type)
            .finish_non_exhaustive()
    }
}

impl TokenForm {
    fn new(grant_type: &'static str) -> Self {
        Self {
            grant_type,
            params: vec![("grant_type", grant_type.to_owned())],
            basic_auth: None,
        }
    }

    /// A form that leaves `grant_type` for a token proxy to fill in
    fn relayed(grant_type: &'static str) -> Self {
        Self {
            grant_type,
            params: Vec::new(),
            basic_auth: None,
        }
    }

    fn param(mut self, name: &'static str, value: impl Into<String>) -> Self {
        self.params.push((name, value.into()));
        self
    }

    fn basic_auth(mut self, client_id: &ClientId, client_secret: &ClientSecret) -> Self {
        let raw = format!("{}:{}", client_id.as_str(), client_secret.as_str());
        self.basic_auth = Some(format!("Basic {}", Base64::from_raw(raw)));
        self
    }

    fn to_request(&self, token_url: &Url) -> Result<HttpRequest, Error> {
        let body = url::form_urlencoded::Serializer::new(String::new())
            .extend_pairs(&self.params)
            .finish();

        let mut builder = http::Request::post(token_url.as_str())
            .header(CONTENT_TYPE, "application/x-www-form-urlencoded");

        if let Some(value) = &self.basic_auth {
            builder = builder.header(AUTHORIZATION, value.as_str());
        }

        builder
            .body(Bytes::from(body))
            .map_err(Error::invalid_request)
    }
}

/// Which fields a token response must carry
#[derive(Clone, Copy, Debug)]
pub struct Required {
    refresh_token: bool,
}

impl Required {
    pub const ACCESS_TOKEN: Self = Self {
        refresh_token: false,
    };
    pub const ACCESS_AND_REFRESH_TOKEN: Self = Self {
        refresh_token: true,
    };

    fn check(self, credentials: &CredentialState) -> Result<(), Error> {
        if credentials.access_token().is_none() {
            return Err(Error::IncompleteTokenResponse("access_token"));
        }

        // Also catches an `expires_in` too large to produce a valid date
        if credentials.expiration_date().is_none() {
            return Err(Error::IncompleteTokenResponse("expires_in"));
        }

        if self.refresh_token && credentials.refresh_token().is_none() {
            return Err(Error::IncompleteTokenResponse("refresh_token"));
        }

        Ok(())
    }
}

/// The parts of a redirect that matter to a code exchange
#[derive(Debug)]
pub struct Redirect {
    pub code: AuthorizationCode,
    pub redirect_uri: Url,
}

impl Redirect {
    /// Extracts the authorization code from the URI the user was redirected to
    ///
    /// When `expected_state` is given, the redirect must carry exactly that state.
    pub fn parse(redirect_uri_with_query: &Url, expected_state: Option<&StateRef>) -> Result<Self, Error> {
        let mut code = None;
        let mut error = None;
        let mut received_state = None;

        for (name, value) in redirect_uri_with_query.query_pairs() {
            match &*name {
                "code" => code = Some(AuthorizationCode::new(value.into_owned())),
                "error" => error = Some(value.into_owned()),
                "state" => received_state = Some(State::new(value.into_owned())),
                _ => {}
            }
        }

        let code = match (code, error) {
            (Some(code), _) => code,
            (None, Some(error)) => {
                tracing::warn!(%error, "authorization request was denied");
                return Err(AuthorizationDenied {
                    error,
                    state: received_state,
                }
                .into());
            }
            (None, None) => return Err(Error::MissingAuthorizationCode),
        };

        if let Some(expected) = expected_state {
            if received_state.as_deref() != Some(expected) {
                tracing::warn!("authorization state mismatch");
                return Err(Error::InvalidState {
                    supplied: Some(expected.to_owned()),
                    received: received_state,
                });
            }
        }

        let mut redirect_uri = redirect_uri_with_query.clone();
        redirect_uri.set_query(None);
        redirect_uri.set_fragment(None);

        Ok(Self { code, redirect_uri })
    }
}

#[derive(Debug, Default)]
struct CommitLog {
    sequence: u64,
    generation: u64,
}

/// State and machinery shared by every manager
#[derive(Debug)]
pub struct ManagerCore {
    client_id: ClientId,
    flow: Flow,
    backend: Backend,
    endpoints: Endpoints,
    transport: Arc<dyn HttpTransport>,
    clock: Arc<dyn Clock>,
    executor: RetryingExecutor,
    state: ArcSwap<CredentialState>,
    commits: Mutex<CommitLog>,
    notifier: ChangeNotifier,
    flights: SingleFlight<(), Arc<CredentialState>, Error>,
}

impl ManagerCore {
    pub fn new(
        client_id: ClientId,
        flow: Flow,
        backend: Backend,
        transport: Arc<dyn HttpTransport>,
    ) -> Self {
        Self {
            client_id,
            flow,
            backend,
            endpoints: Endpoints::default(),
            transport,
            clock: Arc::new(System),
            executor: RetryingExecutor::new(RetryConfig::default()),
            state: ArcSwap::from_pointee(CredentialState::unauthorized()),
            commits: Mutex::new(CommitLog::default()),
            notifier: ChangeNotifier::default(),
            flights: SingleFlight::default(),
        }
    }

    pub fn set_endpoints(&mut self, endpoints: Endpoints) {
        self.endpoints = endpoints;
    }

    pub fn set_clock(&mut self, clock: Arc<dyn Clock>) {
        self.clock = clock;
    }

    pub fn set_retry_config(&mut self, config: RetryConfig) {
        self.executor = RetryingExecutor::new(config);
    }

    /// Installs credentials without announcing a change
    pub fn set_credentials(&mut self, credentials: CredentialState) {
        self.state = ArcSwap::from_pointee(credentials);
    }

    pub fn client_id(&self) -> &ClientId {
        &self.client_id
    }

    pub fn credentials(&self) -> Arc<CredentialState> {
        self.state.load_full()
    }

    pub fn is_expired(&self, tolerance: Duration) -> bool {
        self.state.load().is_expired_with_clock(&*self.clock, tolerance)
    }

    pub fn subscribe(&self) -> ChangeSubscription {
        self.notifier.subscribe()
    }

    pub fn to_persisted(&self) -> PersistedAuthorization {
        PersistedAuthorization {
            client_id: self.client_id.clone(),
            client_secret: self.backend.client_secret().cloned(),
            credentials: (*self.state.load_full()).clone(),
        }
    }

    fn lock_commits(&self) -> MutexGuard<'_, CommitLog> {
        self.commits.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Stores new credentials and announces them, in commit order
    pub fn commit(&self, kind: ChangeKind, credentials: CredentialState) -> Arc<CredentialState> {
        let mut log = self.lock_commits();
        self.commit_locked(&mut log, kind, credentials)
    }

    /// Like [`commit()`][Self::commit()], unless another authorization or a
    /// deauthorization was committed since `generation` was observed
    fn commit_if_current(
        &self,
        generation: u64,
        kind: ChangeKind,
        credentials: CredentialState,
    ) -> Result<Arc<CredentialState>, Error> {
        let mut log = self.lock_commits();
        if log.generation != generation {
            tracing::debug!("credentials were replaced while refreshing, discarding the refresh");
            let current = self.state.load_full();
            return if current.has_access_token() {
                Ok(current)
            } else {
                Err(Error::unauthorized("deauthorized while refreshing"))
            };
        }

        Ok(self.commit_locked(&mut log, kind, credentials))
    }

    fn commit_locked(
        &self,
        log: &mut CommitLog,
        kind: ChangeKind,
        credentials: CredentialState,
    ) -> Arc<CredentialState> {
        let credentials = Arc::new(credentials);
        self.state.store(credentials.clone());

        log.sequence += 1;
        if kind != ChangeKind::Refreshed {
            log.generation += 1;
        }

        self.notifier.publish(kind, log.sequence, credentials.clone());
        credentials
    }

    pub fn deauthorize(&self) {
        self.commit(ChangeKind::Deauthorized, CredentialState::unauthorized());
        tracing::info!(client_id = %self.client_id, "deauthorized");
    }

    /// Builds the URL that users are sent to in order to grant access
    pub fn authorization_url(
        &self,
        redirect_uri: &Url,
        scopes: &Scopes,
        show_dialog: Option<bool>,
        state: Option<&StateRef>,
        code_challenge: Option<&CodeChallenge>,
    ) -> Url {
        let mut url = self.endpoints.authorize_url().clone();

        {
            let mut query = url.query_pairs_mut();
            query
                .append_pair("client_id", self.client_id.as_str())
                .append_pair("response_type", "code")
                .append_pair("redirect_uri", redirect_uri.as_str())
                .append_pair("scope", &scopes.to_string());

            if let Some(show_dialog) = show_dialog {
                query.append_pair("show_dialog", if show_dialog { "true" } else { "false" });
            }

            if let Some(state) = state {
                query.append_pair("state", state.as_str());
            }

            if let Some(challenge) = code_challenge {
                query
                    .append_pair("code_challenge_method", "S256")
                    .append_pair("code_challenge", challenge.as_str());
            }
        }

        url
    }

    fn client_secret(&self) -> Result<&ClientSecret, Error> {
        self.backend.client_secret().ok_or(Error::MissingClientSecret)
    }

    /// The token request for exchanging an authorization code, and where to
    /// send it
    fn exchange_form(
        &self,
        redirect: &Redirect,
        verifier: Option<&PkceVerifier>,
    ) -> Result<(TokenForm, &Url), Error> {
        let require_verifier = || {
            verifier.ok_or_else(|| {
                Error::InvalidRequest(
                    "a code verifier is required to exchange a PKCE authorization code".into(),
                )
            })
        };

        match (self.flow, &self.backend) {
            (Flow::ClientCredentials, _) => Err(Error::InvalidRequest(
                "the client credentials flow has no authorization code".into(),
            )),
            (flow, Backend::Direct { .. }) => {
                let form = TokenForm::new("authorization_code")
                    .param("code", redirect.code.as_str())
                    .param("redirect_uri", redirect.redirect_uri.as_str())
                    .param("client_id", self.client_id.as_str());

                let form = if flow == Flow::Pkce {
                    form.param("code_verifier", require_verifier()?.as_str())
                } else {
                    form.param("client_secret", self.client_secret()?.as_str())
                };

                Ok((form, self.endpoints.token_url()))
            }
            (flow, Backend::Proxy(proxy)) => {
                let form =
                    TokenForm::relayed("authorization_code").param("code", redirect.code.as_str());

                let form = if flow == Flow::Pkce {
                    form.param("code_verifier", require_verifier()?.as_str())
                } else {
                    form
                };

                Ok((form, proxy.token_url()))
            }
        }
    }

    /// The token request for refreshing `current`, and where to send it
    fn refresh_form(&self, current: &CredentialState) -> Result<(TokenForm, &Url), Error> {
        let refresh_token = || {
            current
                .refresh_token()
                .ok_or_else(|| Error::unauthorized("no refresh token is held"))
        };

        match (self.flow, &self.backend) {
            (Flow::AuthorizationCode, Backend::Direct { .. }) => Ok((
                TokenForm::new("refresh_token")
                    .param("refresh_token", refresh_token()?.as_str())
                    .basic_auth(&self.client_id, self.client_secret()?),
                self.endpoints.token_url(),
            )),
            (Flow::Pkce, Backend::Direct { .. }) => Ok((
                TokenForm::new("refresh_token")
                    .param("refresh_token", refresh_token()?.as_str())
                    .param("client_id", self.client_id.as_str()),
                self.endpoints.token_url(),
            )),
            (Flow::ClientCredentials, Backend::Direct { .. }) => Ok((
                TokenForm::new("client_credentials")
                    .basic_auth(&self.client_id, self.client_secret()?),
                self.endpoints.token_url(),
            )),
            (Flow::AuthorizationCode, Backend::Proxy(proxy)) => Ok((
                TokenForm::new("refresh_token").param("refresh_token", refresh_token()?.as_str()),
                proxy.refresh_url(),
            )),
            (Flow::Pkce, Backend::Proxy(proxy)) => Ok((
                TokenForm::new("refresh_token")
                    .param("refresh_token", refresh_token()?.as_str())
                    .param("method", "PKCE"),
                proxy.refresh_url(),
            )),
            (Flow::ClientCredentials, Backend::Proxy(proxy)) => {
                Ok((TokenForm::new("client_credentials"), proxy.token_url()))
            }
        }
    }

    #[tracing::instrument(
        err,
        skip(self, form, url, required),
        fields(
            token_url = %url,
            grant_type = form.grant_type,
            client_id = %self.client_id,
        ),
    )]
    async fn request_token(
        &self,
        form: &TokenForm,
        url: &Url,
        required: Required,
    ) -> Result<CredentialState, Error> {
        tracing::trace!("requesting token from authority");

        let request = form.to_request(url)?;
        let response = self.transport.send(request).await?;

        tracing::debug!(
            response.status = response.status().as_u16(),
            "received token response from authority"
        );

        let dto: TokenResponse = classify::decode_response(response)?;
        let credentials = dto.into_credentials(self.clock.now());
        required.check(&credentials)?;

        tracing::info!(
            has_refresh_token = credentials.refresh_token().is_some(),
            expiration_date = ?credentials.expiration_date(),
            scopes = %credentials.scopes(),
            "received new tokens"
        );

        Ok(credentials)
    }

    /// Exchanges the code from a redirect for credentials and commits them
    pub async fn exchange_code(
        &self,
        redirect: Redirect,
        verifier: Option<&PkceVerifier>,
    ) -> Result<Arc<CredentialState>, Error> {
        let (form, url) = self.exchange_form(&redirect, verifier)?;
        let credentials = self
            .request_token(&form, url, Required::ACCESS_AND_REFRESH_TOKEN)
            .await?;

        Ok(self.commit(ChangeKind::Authorized, credentials))
    }

    pub async fn refresh(
        &self,
        only_if_expired: bool,
        tolerance: Duration,
    ) -> Result<Arc<CredentialState>, Error> {
        if only_if_expired {
            let current = self.state.load_full();
            if !current.is_expired_with_clock(&*self.clock, tolerance) {
                tracing::trace!("access token is still valid, skipping refresh");
                return Ok(current);
            }
        }

        let (result, role) = self
            .flights
            .run_tracked((), || self.perform_refresh(only_if_expired, tolerance))
            .await;

        if role == Role::Follower {
            tracing::debug!("shared the result of an in-flight refresh");
        }

        result
    }

    async fn perform_refresh(
        &self,
        only_if_expired: bool,
        tolerance: Duration,
    ) -> Result<Arc<CredentialState>, Error> {
        let generation = self.lock_commits().generation;
        let current = self.state.load_full();

        if only_if_expired && !current.is_expired_with_clock(&*self.clock, tolerance) {
            tracing::debug!("access token was refreshed while waiting");
            return Ok(current);
        }

        let (form, url) = self.refresh_form(&current)?;

        let (next, kind) = match self.flow {
            Flow::AuthorizationCode => {
                let refreshed = self.request_token(&form, url, Required::ACCESS_TOKEN).await?;
                (current.refreshed_with(refreshed), ChangeKind::Refreshed)
            }
            Flow::Pkce => {
                let refreshed = self
                    .request_token(&form, url, Required::ACCESS_AND_REFRESH_TOKEN)
                    .await?;
                (current.refreshed_with(refreshed), ChangeKind::Refreshed)
            }
            Flow::ClientCredentials => {
                let issued = self
                    .executor
                    .execute(|| self.request_token(&form, url, Required::ACCESS_TOKEN))
                    .await?;
                let kind = if current.has_access_token() {
                    ChangeKind::Refreshed
                } else {
                    ChangeKind::Authorized
                };
                (issued.without_scopes(), kind)
            }
        };

        self.commit_if_current(generation, kind, next)
    }
}
