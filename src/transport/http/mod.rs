use std::time::Duration;

use futures_util::TryStreamExt;
use reqwest::header::{CONTENT_TYPE, HeaderMap, HeaderName, HeaderValue};
use serde::Serialize;

use crate::core::error::{AdaptorError, ConfigError};
use crate::core::types::{ProviderReply, ReplyBody};

const DEFAULT_REQUEST_ID_HEADER: &str = "x-request-id";

/// Single-attempt HTTP executor for provider calls.
///
/// Retry and failover belong to the outer relay; a failed attempt is returned
/// as-is.
#[derive(Debug, Clone)]
pub struct HttpTransport {
    client: reqwest::Client,
    timeout_ms: u64,
}

impl HttpTransport {
    pub fn new(timeout_ms: u64) -> Result<Self, ConfigError> {
        Self::with_client(reqwest::Client::new(), timeout_ms)
    }

    pub fn with_client(client: reqwest::Client, timeout_ms: u64) -> Result<Self, ConfigError> {
        Self::validate_timeout(timeout_ms)?;

        Ok(Self { client, timeout_ms })
    }

    pub fn timeout_ms(&self) -> u64 {
        self.timeout_ms
    }

    /// POSTs `body` as JSON.
    ///
    /// With `streaming` set and a 2xx status the reply body is handed over as
    /// a lazy byte stream; otherwise it is read fully before returning.
    pub async fn post_json<TReq>(
        &self,
        url: &str,
        headers: HeaderMap,
        body: &TReq,
        streaming: bool,
    ) -> Result<ProviderReply, AdaptorError>
    where
        TReq: Serialize + ?Sized,
    {
        let payload = serde_json::to_vec(body)
            .map_err(|error| AdaptorError::decode("serialize_request", error))?;

        let mut request_builder = self.client.post(url).headers(headers.clone());
        if !headers.contains_key(CONTENT_TYPE) {
            request_builder =
                request_builder.header(CONTENT_TYPE, HeaderValue::from_static("application/json"));
        }
        if !streaming {
            request_builder = request_builder.timeout(Duration::from_millis(self.timeout_ms));
        }

        let response = request_builder
            .body(payload)
            .send()
            .await
            .map_err(AdaptorError::transport)?;

        let status_code = response.status().as_u16();
        let response_headers = response.headers().clone();
        tracing::debug!(
            url,
            status_code,
            request_id = extract_request_id(&response_headers).as_deref(),
            streaming,
            "provider replied"
        );

        let body = if streaming && response.status().is_success() {
            ReplyBody::Streaming(Box::pin(
                response.bytes_stream().map_err(AdaptorError::transport),
            ))
        } else {
            ReplyBody::Buffered(response.bytes().await.map_err(AdaptorError::transport)?)
        };

        Ok(ProviderReply {
            status_code,
            headers: response_headers,
            body,
        })
    }

    fn validate_timeout(timeout_ms: u64) -> Result<(), ConfigError> {
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout { timeout_ms });
        }
        Ok(())
    }
}

fn extract_request_id(headers: &HeaderMap) -> Option<String> {
    headers
        .get(HeaderName::from_static(DEFAULT_REQUEST_ID_HEADER))
        .and_then(|value| value.to_str().ok())
        .map(str::to_string)
}
