use std::sync::Arc;

use async_trait::async_trait;
use reqwest::header::{ACCEPT, AUTHORIZATION, CONTENT_TYPE, HeaderMap, HeaderValue};
use serde::Serialize;
use serde_json::Value;

use crate::catalog;
use crate::core::error::{AdaptorError, ConfigError};
use crate::core::traits::{BearerTokenProvider, RelayAdaptor, ResponseSink, TokenProvider};
use crate::core::types::{
    ChatRequest, ImageRequest, ProviderReply, RawRequestBody, RelayMeta, RelayMode, Usage,
};
use crate::providers::openai_compat::{
    handle_chat_response, handle_chat_stream, handle_image_response,
};
use crate::providers::zhipu_translate::{
    encode_chat_request, encode_embedding_request, encode_image_request,
    handle_embedding_response, handle_legacy_response, handle_legacy_stream,
};
use crate::transport::http::HttpTransport;

pub const ZHIPU_CHANNEL_NAME: &str = "zhipu";
pub const ZHIPU_DEFAULT_BASE_URL: &str = "https://open.bigmodel.cn";
pub const ZHIPU_DEFAULT_TIMEOUT_MS: u64 = 60_000;
pub const ZHIPU_API_KEY_ENV: &str = "ZHIPU_API_KEY";
pub const ZHIPU_BASE_URL_ENV: &str = "ZHIPU_BASE_URL";
pub const ZHIPU_TIMEOUT_MS_ENV: &str = "ZHIPU_TIMEOUT_MS";

const CURRENT_FAMILY_PREFIX: &str = "glm-";
const EVENT_STREAM_CONTENT_TYPE: &str = "text/event-stream";

/// Wire dialect generation of the Zhipu API.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize)]
#[serde(rename_all = "snake_case")]
pub enum ApiGeneration {
    /// `v3` model-api with per-model invoke endpoints.
    Legacy,
    /// `v4` OpenAI-compatible API.
    Current,
}

impl ApiGeneration {
    pub fn resolve(model: &str) -> Self {
        if model.starts_with(CURRENT_FAMILY_PREFIX) {
            Self::Current
        } else {
            Self::Legacy
        }
    }

    pub fn path_segment(self) -> &'static str {
        match self {
            Self::Legacy => "v3",
            Self::Current => "v4",
        }
    }
}

/// Outgoing endpoint for one attempt.
///
/// Image and embedding endpoints live under `v4` for every model.
pub fn resolve_url(
    base_url: &str,
    mode: RelayMode,
    model: &str,
    generation: ApiGeneration,
    is_stream: bool,
) -> String {
    let base_url = base_url.trim_end_matches('/');
    let current = ApiGeneration::Current.path_segment();
    match mode {
        RelayMode::ImagesGenerations => format!("{base_url}/api/paas/{current}/images/generations"),
        RelayMode::Embeddings => format!("{base_url}/api/paas/{current}/embeddings"),
        RelayMode::ChatCompletions | RelayMode::Completions => {
            let version = generation.path_segment();
            match generation {
                ApiGeneration::Current => format!("{base_url}/api/paas/{version}/chat/completions"),
                ApiGeneration::Legacy => {
                    let method = if is_stream { "sse-invoke" } else { "invoke" };
                    format!("{base_url}/api/paas/{version}/model-api/{model}/{method}")
                }
            }
        }
    }
}

/// Reply normalizer for one attempt, in priority order.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ResponseRoute {
    Embedding,
    Image,
    CurrentStream,
    CurrentJson,
    LegacyStream,
    LegacyJson,
}

impl ResponseRoute {
    /// Operation kind wins over generation; streaming only splits chat routes.
    pub fn select(mode: RelayMode, generation: ApiGeneration, is_stream: bool) -> Self {
        match (mode, generation, is_stream) {
            (RelayMode::Embeddings, _, _) => Self::Embedding,
            (RelayMode::ImagesGenerations, _, _) => Self::Image,
            (_, ApiGeneration::Current, true) => Self::CurrentStream,
            (_, ApiGeneration::Current, false) => Self::CurrentJson,
            (_, ApiGeneration::Legacy, true) => Self::LegacyStream,
            (_, ApiGeneration::Legacy, false) => Self::LegacyJson,
        }
    }
}

/// Channel settings for the Zhipu adaptor.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ZhipuConfig {
    pub base_url: String,
    pub api_key: String,
    pub timeout_ms: u64,
}

impl ZhipuConfig {
    pub fn new(api_key: impl Into<String>) -> Result<Self, ConfigError> {
        let api_key = sanitize_api_key(Some(api_key.into())).ok_or_else(missing_api_key)?;

        Ok(Self {
            base_url: ZHIPU_DEFAULT_BASE_URL.to_string(),
            api_key,
            timeout_ms: ZHIPU_DEFAULT_TIMEOUT_MS,
        })
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Result<Self, ConfigError> {
        self.base_url = normalize_base_url(base_url)?;
        Ok(self)
    }

    pub fn with_timeout_ms(mut self, timeout_ms: u64) -> Result<Self, ConfigError> {
        if timeout_ms == 0 {
            return Err(ConfigError::InvalidTimeout { timeout_ms });
        }
        self.timeout_ms = timeout_ms;
        Ok(self)
    }

    pub fn from_env() -> Result<Self, ConfigError> {
        Self::from_lookup(|name| std::env::var(name).ok())
    }

    pub(crate) fn from_lookup<F>(lookup: F) -> Result<Self, ConfigError>
    where
        F: Fn(&str) -> Option<String>,
    {
        let mut config = Self::new(lookup(ZHIPU_API_KEY_ENV).unwrap_or_default())?;

        if let Some(base_url) = lookup(ZHIPU_BASE_URL_ENV) {
            config = config.with_base_url(base_url)?;
        }

        if let Some(raw) = lookup(ZHIPU_TIMEOUT_MS_ENV).filter(|value| !value.trim().is_empty()) {
            let timeout_ms =
                raw.trim()
                    .parse::<u64>()
                    .map_err(|_| ConfigError::InvalidEnvValue {
                        name: ZHIPU_TIMEOUT_MS_ENV.to_string(),
                        value: raw.clone(),
                    })?;
            config = config.with_timeout_ms(timeout_ms)?;
        }

        Ok(config)
    }

    pub fn relay_meta(
        &self,
        mode: RelayMode,
        model: impl Into<String>,
        is_stream: bool,
        prompt_tokens: u64,
    ) -> RelayMeta {
        RelayMeta {
            mode,
            base_url: self.base_url.clone(),
            actual_model_name: model.into(),
            is_stream,
            api_key: self.api_key.clone(),
            prompt_tokens,
        }
    }
}

/// Relay adaptor for the Zhipu (BigModel) channel.
///
/// One instance serves one inbound request. The API generation is resolved by
/// whichever of `request_url` and `convert_request` runs first and is reused
/// for the rest of the request.
pub struct ZhipuAdaptor {
    transport: HttpTransport,
    token_provider: Arc<dyn TokenProvider>,
    generation: Option<ApiGeneration>,
}

impl ZhipuAdaptor {
    pub fn new(transport: HttpTransport) -> Self {
        Self::with_token_provider(transport, Arc::new(BearerTokenProvider))
    }

    pub fn with_token_provider(
        transport: HttpTransport,
        token_provider: Arc<dyn TokenProvider>,
    ) -> Self {
        Self {
            transport,
            token_provider,
            generation: None,
        }
    }

    pub fn from_config(config: &ZhipuConfig) -> Result<Self, ConfigError> {
        Ok(Self::new(HttpTransport::new(config.timeout_ms)?))
    }

    /// Generation fixed for this request, if already resolved.
    pub fn generation(&self) -> Option<ApiGeneration> {
        self.generation
    }

    fn generation_for(&mut self, model: &str) -> ApiGeneration {
        *self.generation.get_or_insert_with(|| {
            let generation = ApiGeneration::resolve(model);
            tracing::debug!(model, ?generation, "resolved zhipu api generation");
            generation
        })
    }
}

#[async_trait]
impl RelayAdaptor for ZhipuAdaptor {
    fn request_url(&mut self, meta: &RelayMeta) -> Result<String, AdaptorError> {
        let generation = self.generation_for(&meta.actual_model_name);
        let url = resolve_url(
            &meta.base_url,
            meta.mode,
            &meta.actual_model_name,
            generation,
            meta.is_stream,
        );
        tracing::debug!(mode = ?meta.mode, %url, "selected zhipu endpoint");
        Ok(url)
    }

    fn setup_request_headers(
        &self,
        inbound: &HeaderMap,
        outbound: &mut HeaderMap,
        meta: &RelayMeta,
    ) -> Result<(), AdaptorError> {
        for name in [CONTENT_TYPE, ACCEPT] {
            if let Some(value) = inbound.get(&name) {
                outbound.insert(name, value.clone());
            }
        }
        if meta.is_stream && !outbound.contains_key(ACCEPT) {
            outbound.insert(ACCEPT, HeaderValue::from_static(EVENT_STREAM_CONTENT_TYPE));
        }

        let authorization = self.token_provider.authorization(&meta.api_key)?;
        let mut value = HeaderValue::from_str(&authorization).map_err(|_| {
            AdaptorError::invalid_input("api key contains characters not allowed in a header")
        })?;
        value.set_sensitive(true);
        outbound.insert(AUTHORIZATION, value);
        Ok(())
    }

    fn convert_request(
        &mut self,
        mode: RelayMode,
        request: Option<&ChatRequest>,
        raw: &RawRequestBody,
    ) -> Result<Value, AdaptorError> {
        let request = request.ok_or_else(|| AdaptorError::invalid_input("request is missing"))?;

        match mode {
            RelayMode::Embeddings => to_body(&encode_embedding_request(request)?),
            RelayMode::ChatCompletions | RelayMode::Completions => {
                let generation = self.generation_for(&request.model);
                to_body(&encode_chat_request(request, raw, generation))
            }
            RelayMode::ImagesGenerations => Err(AdaptorError::invalid_input(
                "image generation requests go through convert_image_request",
            )),
        }
    }

    fn convert_image_request(
        &self,
        request: Option<&ImageRequest>,
    ) -> Result<Value, AdaptorError> {
        let request =
            request.ok_or_else(|| AdaptorError::invalid_input("image request is missing"))?;
        to_body(&encode_image_request(request))
    }

    async fn do_request(
        &self,
        meta: &RelayMeta,
        url: &str,
        headers: HeaderMap,
        body: &Value,
    ) -> Result<ProviderReply, AdaptorError> {
        self.transport
            .post_json(url, headers, body, meta.is_stream)
            .await
    }

    async fn do_response(
        &mut self,
        meta: &RelayMeta,
        reply: ProviderReply,
        sink: &mut dyn ResponseSink,
    ) -> Result<Option<Usage>, AdaptorError> {
        let generation = self.generation_for(&meta.actual_model_name);
        let route = ResponseRoute::select(meta.mode, generation, meta.is_stream);
        tracing::debug!(?route, status_code = reply.status_code, "normalizing zhipu reply");

        let model = meta.actual_model_name.as_str();
        match route {
            ResponseRoute::Embedding => handle_embedding_response(reply, sink).await,
            ResponseRoute::Image => handle_image_response(reply, sink).await,
            ResponseRoute::CurrentStream => {
                let outcome = handle_chat_stream(reply, sink).await?;
                tracing::debug!(streamed_chars = outcome.text.chars().count(), "stream drained");
                Ok(outcome
                    .usage
                    .map(|usage| usage.with_prompt_fallback(meta.prompt_tokens)))
            }
            ResponseRoute::CurrentJson => {
                handle_chat_response(reply, meta.prompt_tokens, sink).await
            }
            ResponseRoute::LegacyStream => handle_legacy_stream(reply, model, sink).await,
            ResponseRoute::LegacyJson => handle_legacy_response(reply, model, sink).await,
        }
    }

    fn model_list(&self) -> Vec<String> {
        catalog::model_ids()
    }

    fn channel_name(&self) -> &'static str {
        ZHIPU_CHANNEL_NAME
    }
}

fn to_body<T>(body: &T) -> Result<Value, AdaptorError>
where
    T: Serialize,
{
    serde_json::to_value(body).map_err(|error| AdaptorError::decode("serialize_request", error))
}

fn normalize_base_url(base_url: impl Into<String>) -> Result<String, ConfigError> {
    let value = base_url.into();
    let trimmed = value.trim();
    if trimmed.is_empty() {
        return Ok(ZHIPU_DEFAULT_BASE_URL.to_string());
    }

    if !(trimmed.starts_with("http://") || trimmed.starts_with("https://")) {
        return Err(ConfigError::InvalidBaseUrl {
            base_url: value.clone(),
            reason: "expected an http or https url".to_string(),
        });
    }

    Ok(trimmed.trim_end_matches('/').to_string())
}

fn sanitize_api_key(api_key: Option<String>) -> Option<String> {
    api_key.and_then(|value| {
        let trimmed = value.trim();
        if trimmed.is_empty() {
            None
        } else {
            Some(trimmed.to_string())
        }
    })
}

fn missing_api_key() -> ConfigError {
    ConfigError::MissingApiKey {
        env_candidates: vec![ZHIPU_API_KEY_ENV.to_string()],
    }
}
