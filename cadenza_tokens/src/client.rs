//! Authorized, retrying requests against the web API

use std::sync::Arc;

use bytes::Bytes;
use chrono::Duration;
use http::{
    header::{AUTHORIZATION, CONTENT_TYPE},
    HeaderValue, Method,
};
use serde::{de::DeserializeOwned, Serialize};
use url::Url;

use crate::{
    classify, AccessTokenRef, AuthorizationManager, Error, HttpRequest, HttpResponse,
    HttpTransport, RetryConfig, RetryingExecutor, Scopes, DEFAULT_EXPIRY_TOLERANCE,
};

/// A request to the web API
#[derive(Clone, Debug)]
pub struct ApiRequest {
    method: Method,
    url: Url,
    body: Option<(Bytes, &'static str)>,
    required_scopes: Scopes,
}

impl ApiRequest {
    /// Constructs a new request without a body
    pub fn new(method: Method, url: Url) -> Self {
        Self {
            method,
            url,
            body: None,
            required_scopes: Scopes::new(),
        }
    }

    /// Constructs a `GET` request
    #[inline]
    pub fn get(url: Url) -> Self {
        Self::new(Method::GET, url)
    }

    /// Constructs a `POST` request
    #[inline]
    pub fn post(url: Url) -> Self {
        Self::new(Method::POST, url)
    }

    /// Constructs a `PUT` request
    #[inline]
    pub fn put(url: Url) -> Self {
        Self::new(Method::PUT, url)
    }

    /// Constructs a `DELETE` request
    #[inline]
    pub fn delete(url: Url) -> Self {
        Self::new(Method::DELETE, url)
    }

    /// Sends `body` as JSON
    pub fn with_json<S: Serialize + ?Sized>(mut self, body: &S) -> Result<Self, serde_json::Error> {
        let body = serde_json::to_vec(body)?;
        self.body = Some((Bytes::from(body), "application/json"));
        Ok(self)
    }

    /// Requires the access token to have been granted `scopes`
    ///
    /// The requirement is checked before anything is sent.
    #[must_use]
    pub fn with_required_scopes(mut self, scopes: Scopes) -> Self {
        self.required_scopes = scopes;
        self
    }

    /// The scopes the request requires
    #[inline]
    pub fn required_scopes(&self) -> &Scopes {
        &self.required_scopes
    }

    fn to_http(&self, access_token: &AccessTokenRef) -> Result<HttpRequest, Error> {
        let mut authorization = HeaderValue::from_str(&format!("Bearer {}", access_token.as_str()))
            .map_err(|err| Error::InvalidRequest(err.to_string()))?;
        authorization.set_sensitive(true);

        let mut builder = http::Request::builder()
            .method(self.method.clone())
            .uri(self.url.as_str())
            .header(AUTHORIZATION, authorization);

        let body = match &self.body {
            Some((body, content_type)) => {
                builder = builder.header(CONTENT_TYPE, *content_type);
                body.clone()
            }
            None => Bytes::new(),
        };

        builder.body(body).map_err(Error::invalid_request)
    }
}

/// Sends requests on behalf of an authorization manager
///
/// Every request is checked against the scopes granted to the manager, sent
/// with a fresh access token, and retried when rate limited or when the
/// provider has a transient failure.
#[derive(Debug)]
pub struct ApiClient<M> {
    manager: M,
    transport: Arc<dyn HttpTransport>,
    executor: RetryingExecutor,
    tolerance: Duration,
}

impl<M: AuthorizationManager> ApiClient<M> {
    /// Constructs a new client
    pub fn new<T: HttpTransport + 'static>(manager: M, transport: T) -> Self {
        Self {
            manager,
            transport: Arc::new(transport),
            executor: RetryingExecutor::new(RetryConfig::default()),
            tolerance: DEFAULT_EXPIRY_TOLERANCE,
        }
    }

    /// Uses a different retry configuration
    #[must_use]
    pub fn with_retry_config(mut self, config: RetryConfig) -> Self {
        self.executor = RetryingExecutor::new(config);
        self
    }

    /// Sets the tolerance added to the expiration date when deciding whether
    /// to refresh
    ///
    /// A negative tolerance refreshes access tokens before they expire.
    #[must_use]
    pub fn with_expiry_tolerance(mut self, tolerance: Duration) -> Self {
        self.tolerance = tolerance;
        self
    }

    /// The authorization manager
    #[inline]
    pub fn manager(&self) -> &M {
        &self.manager
    }

    /// Sends a request and decodes the response body as `T`
    pub async fn send<T: DeserializeOwned>(&self, request: &ApiRequest) -> Result<T, Error> {
        self.execute(request, classify::decode_response).await
    }

    /// Sends a request whose response body is of no interest
    pub async fn send_without_response(&self, request: &ApiRequest) -> Result<(), Error> {
        self.execute(request, classify::expect_success).await
    }

    async fn execute<R>(
        &self,
        request: &ApiRequest,
        decode: fn(HttpResponse) -> Result<R, Error>,
    ) -> Result<R, Error> {
        self.check_scopes(request.required_scopes())?;

        self.executor
            .execute(|| async move {
                let credentials = self.manager.refresh(true, self.tolerance).await?;
                let access_token = credentials
                    .access_token()
                    .ok_or_else(|| Error::unauthorized("no access token is held"))?;

                let response = self.transport.send(request.to_http(access_token)?).await?;

                tracing::debug!(
                    method = %request.method,
                    url = %request.url,
                    response.status = response.status().as_u16(),
                    "received API response"
                );

                decode(response)
            })
            .await
    }

    fn check_scopes(&self, required: &Scopes) -> Result<(), Error> {
        let credentials = self.manager.credentials();

        if !credentials.has_access_token() {
            return Err(Error::unauthorized("no access token is held"));
        }

        if !credentials.is_authorized_for(required) {
            tracing::warn!(
                required = %required,
                granted = %credentials.scopes(),
                "access token lacks required scopes"
            );
            return Err(Error::InsufficientScope {
                required: required.clone(),
                granted: credentials.scopes().clone(),
            });
        }

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use std::sync::Arc;

    use cadenza_clock::{Clock, TestClock};
    use chrono::{TimeZone, Utc};
    use http::StatusCode;
    use serde::Deserialize;

    use super::*;
    use crate::{
        test_support::MockTransport, AccessToken, AuthorizationCodeManager, ClientId,
        ClientSecret, CredentialState, RefreshToken,
    };

    #[derive(Debug, Deserialize)]
    struct Track {
        name: String,
    }

    fn track_request() -> ApiRequest {
        ApiRequest::get(Url::parse("https://api.spotify.com/v1/tracks/abc").unwrap())
    }

    fn client_with(
        transport: &Arc<MockTransport>,
        lifetime: chrono::Duration,
    ) -> ApiClient<AuthorizationCodeManager> {
        let clock = TestClock::new(Utc.with_ymd_and_hms(2024, 1, 1, 0, 0, 0).unwrap());
        let credentials = CredentialState::new(
            AccessToken::from_static("AT0"),
            Some(RefreshToken::from_static("RT0")),
            clock.now() + lifetime,
            Scopes::single("user-read-email"),
        );
        let manager = AuthorizationCodeManager::new(
            ClientId::from_static("client"),
            ClientSecret::from_static("secret"),
            transport.clone(),
        )
        .with_clock(clock)
        .with_credentials(credentials);

        ApiClient::new(manager, transport.clone())
    }

    mod when_scopes_are_missing {
        use super::*;

        #[tokio::test]
        async fn the_request_is_never_sent() {
            let transport = Arc::new(MockTransport::new());
            let client = client_with(&transport, chrono::Duration::hours(1));
            let request =
                track_request().with_required_scopes(Scopes::single("user-modify-playback-state"));

            let err = client.send::<Track>(&request).await.unwrap_err();

            match err {
                Error::InsufficientScope { required, granted } => {
                    assert_eq!(required, Scopes::single("user-modify-playback-state"));
                    assert_eq!(granted, Scopes::single("user-read-email"));
                }
                other => panic!("unexpected error: {:?}", other),
            }
            assert_eq!(transport.calls(), 0);
        }

        #[tokio::test]
        async fn unauthorized_managers_are_rejected_up_front() {
            let transport = Arc::new(MockTransport::new());
            let client = client_with(&transport, chrono::Duration::hours(1));
            client.manager().deauthorize();

            let err = client.send::<Track>(&track_request()).await.unwrap_err();

            assert!(matches!(err, Error::Unauthorized(_)));
            assert_eq!(transport.calls(), 0);
        }
    }

    mod when_authorized {
        use super::*;

        #[tokio::test]
        async fn the_bearer_token_is_attached() {
            let transport = Arc::new(MockTransport::new());
            transport.push_json(200, serde_json::json!({"name": "Hey Jude"}));
            let client = client_with(&transport, chrono::Duration::hours(1));

            let track: Track = client.send(&track_request()).await.unwrap();

            assert_eq!(track.name, "Hey Jude");
            let request = transport.last_request().unwrap();
            assert_eq!(request.headers[AUTHORIZATION], "Bearer AT0");
            assert!(request.headers[AUTHORIZATION].is_sensitive());
        }

        #[tokio::test]
        async fn expired_tokens_are_refreshed_first() {
            let transport = Arc::new(MockTransport::new());
            transport.push_token("AT1", None, "");
            transport.push_json(200, serde_json::json!({"name": "Hey Jude"}));
            let client = client_with(&transport, chrono::Duration::hours(-1));

            let _: Track = client.send(&track_request()).await.unwrap();

            assert_eq!(transport.calls(), 2);
            let request = transport.last_request().unwrap();
            assert_eq!(request.headers[AUTHORIZATION], "Bearer AT1");
        }

        #[tokio::test(start_paused = true)]
        async fn rate_limited_requests_are_retried() {
            let transport = Arc::new(MockTransport::new());
            transport.push_rate_limited(1);
            transport.push_json(200, serde_json::json!({"name": "Hey Jude"}));
            let client = client_with(&transport, chrono::Duration::hours(1));

            let track: Track = client.send(&track_request()).await.unwrap();

            assert_eq!(track.name, "Hey Jude");
            assert_eq!(transport.calls(), 2);
        }

        #[tokio::test]
        async fn provider_errors_are_surfaced() {
            let transport = Arc::new(MockTransport::new());
            transport.push_json(
                404,
                serde_json::json!({"error": {"status": 404, "message": "Non existing id"}}),
            );
            let client = client_with(&transport, chrono::Duration::hours(1));

            let err = client.send::<Track>(&track_request()).await.unwrap_err();

            assert!(matches!(err, Error::Api { status, .. } if status == StatusCode::NOT_FOUND));
            assert_eq!(transport.calls(), 1);
        }

        #[tokio::test]
        async fn empty_responses_are_accepted() {
            let transport = Arc::new(MockTransport::new());
            transport.push(
                http::Response::builder()
                    .status(204)
                    .body(Bytes::new())
                    .unwrap(),
            );
            let client = client_with(&transport, chrono::Duration::hours(1));
            let request = ApiRequest::put(Url::parse("https://api.spotify.com/v1/me/player/pause").unwrap());

            client.send_without_response(&request).await.unwrap();

            let sent = transport.last_request().unwrap();
            assert_eq!(sent.method, Method::PUT);
        }

        #[tokio::test]
        async fn json_bodies_are_sent() {
            let transport = Arc::new(MockTransport::new());
            transport.push_json(201, serde_json::json!({"name": "New Playlist"}));
            let client = client_with(&transport, chrono::Duration::hours(1));
            let request = ApiRequest::post(Url::parse("https://api.spotify.com/v1/me/playlists").unwrap())
                .with_json(&serde_json::json!({"name": "New Playlist"}))
                .unwrap();

            let _: Track = client.send(&request).await.unwrap();

            let sent = transport.last_request().unwrap();
            assert_eq!(sent.headers[CONTENT_TYPE], "application/json");
            assert_eq!(&sent.body[..], br#"{"name":"New Playlist"}"#);
        }
    }
}
