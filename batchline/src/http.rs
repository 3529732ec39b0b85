//! HTTP transport on `reqwest`.
//!
//! Wire format:
//!
//! - `POST {base}/jobs` with `{"items": [...]}` answers `{"job_id": "..."}`
//! - `GET {base}/jobs/{id}` answers `{"status", "queue_state", "result", "error"}`
//!
//! Non-2xx responses become [`TransportError`]s carrying the status code and
//! any `Retry-After` hint; failures before a response arrives carry no status.

use std::marker::PhantomData;
use std::time::{Duration, SystemTime};

use async_trait::async_trait;
use reqwest::header::{HeaderMap, ACCEPT, RETRY_AFTER};
use reqwest::{Client, RequestBuilder, Response};
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use tracing::{debug, trace};
use uuid::Uuid;

use crate::breaker::BreakerKey;
use crate::combiner::JobOutput;
use crate::error::{BatchError, BatchResult};
use crate::transport::{ErrorCategory, JobId, PollResponse, Transport, TransportError};

const REQUEST_ID_HEADER: &str = "x-request-id";
const DEFAULT_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

#[derive(Serialize)]
struct SubmitRequest<'a, I> {
    items: &'a [I],
}

#[derive(Deserialize)]
struct SubmitResponse {
    job_id: JobId,
}

/// [`Transport`] speaking JSON over HTTP.
///
/// `I` is the batch item type sent in submissions; `O` is the per-item output
/// type returned by completed jobs.
pub struct HttpTransport<I, O> {
    http: Client,
    base_url: String,
    credential: Option<String>,
    _types: PhantomData<fn(I) -> O>,
}

impl<I, O> std::fmt::Debug for HttpTransport<I, O> {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("HttpTransport")
            .field("base_url", &self.base_url)
            .field("credential", &self.credential.as_ref().map(|_| "<redacted>"))
            .finish_non_exhaustive()
    }
}

impl<I, O> HttpTransport<I, O> {
    /// Create a transport for `base_url` with a 60 second request timeout.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidInput`] if the base URL is empty or the
    /// HTTP client cannot be built.
    pub fn new(base_url: impl Into<String>) -> BatchResult<Self> {
        let http = Client::builder()
            .timeout(DEFAULT_REQUEST_TIMEOUT)
            .build()
            .map_err(|err| BatchError::InvalidInput(format!("cannot build HTTP client: {err}")))?;
        Self::with_client(http, base_url)
    }

    /// Create a transport reusing an existing client.
    ///
    /// # Errors
    ///
    /// Returns [`BatchError::InvalidInput`] if the base URL is empty.
    pub fn with_client(http: Client, base_url: impl Into<String>) -> BatchResult<Self> {
        let base_url = base_url.into().trim().trim_end_matches('/').to_string();
        if base_url.is_empty() {
            return Err(BatchError::InvalidInput("base_url must not be empty".to_string()));
        }
        Ok(Self {
            http,
            base_url,
            credential: None,
            _types: PhantomData,
        })
    }

    /// Send `credential` as a bearer token.
    #[must_use]
    pub fn with_credential(mut self, credential: impl Into<String>) -> Self {
        self.credential = Some(credential.into());
        self
    }

    /// The normalised base URL.
    #[must_use]
    pub fn base_url(&self) -> &str {
        &self.base_url
    }

    /// Endpoint identity for the circuit breaker: base URL plus a credential
    /// fingerprint.
    #[must_use]
    pub fn breaker_key(&self) -> BreakerKey {
        BreakerKey::for_endpoint(&self.base_url, self.credential.as_deref())
    }

    fn authorize(&self, request: RequestBuilder) -> RequestBuilder {
        let request = request
            .header(ACCEPT, "application/json")
            .header(REQUEST_ID_HEADER, Uuid::new_v4().to_string());
        match &self.credential {
            Some(credential) => request.bearer_auth(credential),
            None => request,
        }
    }

    async fn send(&self, request: RequestBuilder) -> Result<Response, TransportError> {
        let response = self
            .authorize(request)
            .send()
            .await
            .map_err(|err| TransportError::connection(err.to_string()))?;

        let status = response.status();
        if status.is_success() {
            return Ok(response);
        }

        let retry_after = retry_after(response.headers(), SystemTime::now());
        let message = response.text().await.unwrap_or_default();
        debug!(status = status.as_u16(), message = %message, "Request rejected");

        let mut error = TransportError::from_status(status.as_u16(), message);
        if let Some(delay) = retry_after {
            error = error.with_retry_after(delay);
        }
        Err(error)
    }
}

async fn decode<T: DeserializeOwned>(response: Response) -> Result<T, TransportError> {
    let status = response.status().as_u16();
    response.json::<T>().await.map_err(|err| TransportError {
        category: ErrorCategory::Unknown,
        status_code: None,
        retry_after: None,
        message: format!("cannot decode response with status {status}: {err}"),
    })
}

/// Parse a `Retry-After` header given as delta-seconds or an HTTP date.
fn retry_after(headers: &HeaderMap, now: SystemTime) -> Option<Duration> {
    let value = headers.get(RETRY_AFTER)?.to_str().ok()?.trim();
    if let Ok(seconds) = value.parse::<u64>() {
        return Some(Duration::from_secs(seconds));
    }
    let at = httpdate::parse_http_date(value).ok()?;
    Some(at.duration_since(now).unwrap_or(Duration::ZERO))
}

#[async_trait]
impl<I, O> Transport for HttpTransport<I, O>
where
    I: Serialize + Send + Sync + 'static,
    O: DeserializeOwned + Send + Sync + 'static,
{
    type Item = I;
    type Output = O;

    async fn submit_job(&self, items: &[I]) -> Result<JobId, TransportError> {
        let url = format!("{}/jobs", self.base_url);
        trace!(url = %url, items = items.len(), "Submitting job");
        let response = self
            .send(self.http.post(&url).json(&SubmitRequest { items }))
            .await?;
        let body: SubmitResponse = decode(response).await?;
        Ok(body.job_id)
    }

    async fn poll_job(&self, job_id: &JobId) -> Result<PollResponse<JobOutput<O>>, TransportError> {
        let url = format!("{}/jobs/{}", self.base_url, job_id);
        trace!(url = %url, "Polling job");
        let response = self.send(self.http.get(&url)).await?;
        decode(response).await
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use reqwest::header::HeaderValue;

    fn headers(value: &str) -> HeaderMap {
        let mut headers = HeaderMap::new();
        headers.insert(RETRY_AFTER, HeaderValue::from_str(value).unwrap());
        headers
    }

    #[test]
    fn test_retry_after_seconds() {
        assert_eq!(
            retry_after(&headers(" 12 "), SystemTime::now()),
            Some(Duration::from_secs(12))
        );
    }

    #[test]
    fn test_retry_after_http_date() {
        let now = SystemTime::UNIX_EPOCH + Duration::from_secs(1_445_412_480);
        let later = httpdate::fmt_http_date(now + Duration::from_secs(90));
        assert_eq!(retry_after(&headers(&later), now), Some(Duration::from_secs(90)));

        let earlier = httpdate::fmt_http_date(now - Duration::from_secs(90));
        assert_eq!(retry_after(&headers(&earlier), now), Some(Duration::ZERO));
    }

    #[test]
    fn test_retry_after_garbage_is_ignored() {
        assert_eq!(retry_after(&headers("soon"), SystemTime::now()), None);
        assert_eq!(retry_after(&HeaderMap::new(), SystemTime::now()), None);
    }

    #[test]
    fn test_breaker_key_and_debug_hide_credential() {
        let transport: HttpTransport<u32, u32> = HttpTransport::new("https://api.example.com/v1/")
            .unwrap()
            .with_credential("sk-secret");
        assert_eq!(transport.base_url(), "https://api.example.com/v1");
        assert!(!transport.breaker_key().as_str().contains("sk-secret"));
        assert!(!format!("{transport:?}").contains("sk-secret"));
    }

    #[test]
    fn test_empty_base_url_rejected() {
        assert!(matches!(
            HttpTransport::<u32, u32>::new("  "),
            Err(BatchError::InvalidInput(_))
        ));
    }
}
