use async_trait::async_trait;
use cadenza_tokens::{HttpRequest, HttpResponse, HttpTransport, TransportError};

/// An [`HttpTransport`] that sends requests with a [`reqwest::Client`]
///
/// Response bodies are buffered in full before being handed back.
#[derive(Clone, Debug, Default)]
pub struct ReqwestTransport {
    client: reqwest::Client,
}

impl ReqwestTransport {
    /// Constructs a new transport from an existing client
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }

    /// The underlying client
    #[inline]
    pub fn client(&self) -> &reqwest::Client {
        &self.client
    }
}

impl From<reqwest::Client> for ReqwestTransport {
    #[inline]
    fn from(client: reqwest::Client) -> Self {
        Self::new(client)
    }
}

#[async_trait]
impl HttpTransport for ReqwestTransport {
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        let request = reqwest::Request::try_from(request).map_err(TransportError::new)?;

        tracing::trace!(
            method = %request.method(),
            url = %request.url(),
            "sending request"
        );

        let response = self
            .client
            .execute(request)
            .await
            .map_err(TransportError::new)?;

        let status = response.status();
        let version = response.version();
        let headers = response.headers().clone();
        let body = response.bytes().await.map_err(TransportError::new)?;

        let mut buffered = http::Response::new(body);
        *buffered.status_mut() = status;
        *buffered.version_mut() = version;
        *buffered.headers_mut() = headers;

        Ok(buffered)
    }
}
