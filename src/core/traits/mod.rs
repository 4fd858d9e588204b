use async_trait::async_trait;
use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde_json::Value;

use crate::core::error::AdaptorError;
use crate::core::types::{
    ChatRequest, ImageRequest, ProviderReply, RawRequestBody, RelayMeta, RelayMode, Usage,
};

/// Per-request adaptor contract consumed by the outer relay.
///
/// The relay creates one instance per inbound request and calls the hooks in
/// order: `request_url`, `setup_request_headers`, `convert_request` or
/// `convert_image_request`, `do_request`, `do_response`. Instances are never
/// shared between requests, so hooks may keep request-scoped state on `self`.
#[async_trait]
pub trait RelayAdaptor: Send + Sync {
    /// Computes the outgoing endpoint for this attempt.
    fn request_url(&mut self, meta: &RelayMeta) -> Result<String, AdaptorError>;

    /// Copies common inbound headers and injects provider authorization.
    fn setup_request_headers(
        &self,
        inbound: &HeaderMap,
        outbound: &mut HeaderMap,
        meta: &RelayMeta,
    ) -> Result<(), AdaptorError>;

    /// Builds the outgoing body for chat, completion and embedding operations.
    ///
    /// `raw` is the untouched inbound payload, used for fields the canonical
    /// request cannot represent.
    fn convert_request(
        &mut self,
        mode: RelayMode,
        request: Option<&ChatRequest>,
        raw: &RawRequestBody,
    ) -> Result<Value, AdaptorError>;

    /// Builds the outgoing body for image generation.
    fn convert_image_request(&self, request: Option<&ImageRequest>)
    -> Result<Value, AdaptorError>;

    /// Sends the converted body; a single attempt, never retried here.
    async fn do_request(
        &self,
        meta: &RelayMeta,
        url: &str,
        headers: HeaderMap,
        body: &Value,
    ) -> Result<ProviderReply, AdaptorError>;

    /// Normalizes the provider reply into the client sink and returns usage.
    async fn do_response(
        &mut self,
        meta: &RelayMeta,
        reply: ProviderReply,
        sink: &mut dyn ResponseSink,
    ) -> Result<Option<Usage>, AdaptorError>;

    fn model_list(&self) -> Vec<String>;

    fn channel_name(&self) -> &'static str;
}

/// Derives the `Authorization` header value from a configured API key.
pub trait TokenProvider: Send + Sync {
    fn authorization(&self, api_key: &str) -> Result<String, AdaptorError>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct BearerTokenProvider;

impl TokenProvider for BearerTokenProvider {
    fn authorization(&self, api_key: &str) -> Result<String, AdaptorError> {
        let api_key = api_key.trim();
        if api_key.is_empty() {
            return Err(AdaptorError::invalid_input("api key is empty"));
        }
        Ok(format!("Bearer {api_key}"))
    }
}

/// Client-facing side of a relayed response.
pub trait ResponseSink: Send {
    /// Writes a complete response body.
    fn write_body(&mut self, status_code: u16, content_type: &str, body: Bytes);

    /// Writes one server-sent event `data` payload.
    fn write_event(&mut self, data: &str);
}

/// Sink that keeps everything in memory.
#[derive(Debug, Default, Clone, PartialEq)]
pub struct CollectedResponse {
    pub status_code: Option<u16>,
    pub content_type: Option<String>,
    pub body: Bytes,
    pub events: Vec<String>,
}

impl CollectedResponse {
    pub fn body_json(&self) -> Option<Value> {
        serde_json::from_slice(&self.body).ok()
    }

    /// Event payloads parsed as JSON; the `[DONE]` marker and non-JSON payloads are skipped.
    pub fn event_json(&self) -> Vec<Value> {
        self.events
            .iter()
            .filter_map(|event| serde_json::from_str(event).ok())
            .collect()
    }
}

impl ResponseSink for CollectedResponse {
    fn write_body(&mut self, status_code: u16, content_type: &str, body: Bytes) {
        self.status_code = Some(status_code);
        self.content_type = Some(content_type.to_string());
        self.body = body;
    }

    fn write_event(&mut self, data: &str) {
        self.events.push(data.to_string());
    }
}
