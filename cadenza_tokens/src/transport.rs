//! The HTTP capability consumed by managers and clients

use std::{error, fmt, sync::Arc};

use async_trait::async_trait;
use bytes::Bytes;

/// An outbound HTTP request
pub type HttpRequest = http::Request<Bytes>;

/// A fully-buffered HTTP response
pub type HttpResponse = http::Response<Bytes>;

/// A failure to obtain any HTTP response at all
///
/// Connection failures, timeouts and the like. Responses with error status
/// codes are not transport errors.
#[derive(Clone)]
pub struct TransportError(Arc<dyn error::Error + Send + Sync + 'static>);

impl TransportError {
    /// Wraps an underlying transport failure
    pub fn new(err: impl Into<Box<dyn error::Error + Send + Sync + 'static>>) -> Self {
        Self(Arc::from(err.into()))
    }
}

impl fmt::Debug for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Debug::fmt(&*self.0, f)
    }
}

impl fmt::Display for TransportError {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        fmt::Display::fmt(&*self.0, f)
    }
}

impl error::Error for TransportError {
    fn source(&self) -> Option<&(dyn error::Error + 'static)> {
        self.0.source()
    }
}

/// Something that can send an HTTP request and buffer its response
#[async_trait]
pub trait HttpTransport: fmt::Debug + Send + Sync {
    /// Sends the request
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError>;
}

#[async_trait]
impl<T: HttpTransport + ?Sized> HttpTransport for Arc<T> {
    #[inline]
    async fn send(&self, request: HttpRequest) -> Result<HttpResponse, TransportError> {
        (**self).send(request).await
    }
}
