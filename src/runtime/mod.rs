use std::sync::Arc;

use reqwest::header::HeaderMap;

use crate::core::error::{AdaptorError, ConfigError};
use crate::core::traits::{BearerTokenProvider, RelayAdaptor, ResponseSink, TokenProvider};
use crate::core::types::{ChatRequest, ImageRequest, RawRequestBody, RelayMode, Usage};
use crate::providers::zhipu::{ZhipuAdaptor, ZhipuConfig};
use crate::transport::http::HttpTransport;

/// Drives single request attempts through a fresh [`ZhipuAdaptor`].
///
/// Only the transport and configuration are shared between requests.
pub struct RelayRuntime {
    config: ZhipuConfig,
    transport: HttpTransport,
    token_provider: Arc<dyn TokenProvider>,
}

impl RelayRuntime {
    pub fn new(config: ZhipuConfig) -> Result<Self, ConfigError> {
        let transport = HttpTransport::new(config.timeout_ms)?;
        Ok(Self::with_transport(config, transport))
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::new(ZhipuConfig::from_env()?)
    }

    pub fn with_transport(config: ZhipuConfig, transport: HttpTransport) -> Self {
        Self {
            config,
            transport,
            token_provider: Arc::new(BearerTokenProvider),
        }
    }

    pub fn with_token_provider(mut self, token_provider: Arc<dyn TokenProvider>) -> Self {
        self.token_provider = token_provider;
        self
    }

    pub fn config(&self) -> &ZhipuConfig {
        &self.config
    }

    pub fn new_adaptor(&self) -> ZhipuAdaptor {
        ZhipuAdaptor::with_token_provider(self.transport.clone(), Arc::clone(&self.token_provider))
    }

    /// Relays a chat, completion or embedding request given as raw inbound JSON.
    ///
    /// `prompt_tokens` is the relay's own prompt count, used when the provider
    /// reports no usage.
    pub async fn relay_chat(
        &self,
        mode: RelayMode,
        inbound: &HeaderMap,
        raw: &RawRequestBody,
        prompt_tokens: u64,
        sink: &mut dyn ResponseSink,
    ) -> Result<Option<Usage>, AdaptorError> {
        if mode == RelayMode::ImagesGenerations {
            return Err(AdaptorError::invalid_input(
                "image generation requests go through relay_image",
            ));
        }

        let request: ChatRequest = serde_json::from_slice(&raw.bytes).map_err(|error| {
            AdaptorError::invalid_input(format!("request body is not a valid chat request: {error}"))
        })?;
        let meta = self
            .config
            .relay_meta(mode, &request.model, request.stream, prompt_tokens);

        let mut adaptor = self.new_adaptor();
        let url = adaptor.request_url(&meta)?;
        let mut headers = HeaderMap::new();
        adaptor.setup_request_headers(inbound, &mut headers, &meta)?;
        let body = adaptor.convert_request(mode, Some(&request), raw)?;

        tracing::debug!(
            channel = adaptor.channel_name(),
            model = %meta.actual_model_name,
            stream = meta.is_stream,
            "relaying request"
        );
        let reply = adaptor.do_request(&meta, &url, headers, &body).await?;
        adaptor.do_response(&meta, reply, sink).await
    }

    pub async fn relay_image(
        &self,
        inbound: &HeaderMap,
        request: &ImageRequest,
        sink: &mut dyn ResponseSink,
    ) -> Result<Option<Usage>, AdaptorError> {
        let meta = self
            .config
            .relay_meta(RelayMode::ImagesGenerations, &request.model, false, 0);

        let mut adaptor = self.new_adaptor();
        let url = adaptor.request_url(&meta)?;
        let mut headers = HeaderMap::new();
        adaptor.setup_request_headers(inbound, &mut headers, &meta)?;
        let body = adaptor.convert_image_request(Some(request))?;

        tracing::debug!(
            channel = adaptor.channel_name(),
            model = %meta.actual_model_name,
            "relaying image request"
        );
        let reply = adaptor.do_request(&meta, &url, headers, &body).await?;
        adaptor.do_response(&meta, reply, sink).await
    }
}

#[cfg(test)]
mod tests;
