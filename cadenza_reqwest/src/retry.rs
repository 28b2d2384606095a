use cadenza_tokens::{
    classify::classify_status, JitterSource, RandomJitter, RetryConfig, RetryContext,
};
use reqwest::{Request, Response};
use reqwest_middleware::{Middleware, Next, Result};

/// A middleware that retries requests that are rate limited or that hit a
/// transient server error
///
/// Requests whose bodies cannot be cloned are sent once, without retries.
/// When retries are exhausted, the last response is returned as is.
#[derive(Clone, Debug, Default)]
pub struct RetryMiddleware<J = RandomJitter> {
    config: RetryConfig,
    jitter: J,
}

impl RetryMiddleware {
    /// Constructs a new middleware with random jitter
    pub fn new(config: RetryConfig) -> Self {
        Self {
            config,
            jitter: RandomJitter,
        }
    }
}

impl<J> RetryMiddleware<J> {
    /// Replaces the jitter source
    pub fn with_jitter<K>(self, jitter: K) -> RetryMiddleware<K> {
        RetryMiddleware {
            config: self.config,
            jitter,
        }
    }
}

#[async_trait::async_trait]
impl<J> Middleware for RetryMiddleware<J>
where
    J: JitterSource + 'static,
{
    async fn handle(
        &self,
        req: Request,
        extensions: &mut http::Extensions,
        next: Next<'_>,
    ) -> Result<Response> {
        let mut ctx = RetryContext::new(&self.config);

        loop {
            let Some(attempt) = req.try_clone() else {
                tracing::debug!(url = %req.url(), "request cannot be cloned, sending without retries");
                return next.run(req, extensions).await;
            };

            let response = next.clone().run(attempt, extensions).await?;

            let Some(classification) = classify_status(response.status(), response.headers())
            else {
                return Ok(response);
            };

            match ctx.next_delay(&classification, &self.jitter) {
                Some(delay) => {
                    tracing::warn!(
                        url = %req.url(),
                        status = response.status().as_u16(),
                        ?delay,
                        attempts_remaining = ctx.attempts_remaining(),
                        "request failed, retrying"
                    );
                    tokio::time::sleep(delay).await;
                }
                None => {
                    tracing::warn!(
                        url = %req.url(),
                        status = response.status().as_u16(),
                        "request failed, giving up"
                    );
                    return Ok(response);
                }
            }
        }
    }
}
