use std::time::{SystemTime, UNIX_EPOCH};

use futures_util::StreamExt;
use serde::{Deserialize, Serialize};
use serde_json::{Value, json};

use crate::core::error::AdaptorError;
use crate::core::traits::ResponseSink;
use crate::core::types::{
    ChatRequest, ImageRequest, ProviderReply, RawRequestBody, ToolCapability, Usage, ZhipuTool,
};
use crate::providers::openai_compat::{
    DONE_MARKER, JSON_CONTENT_TYPE, ensure_success, in_band_error_status, json_bytes,
    open_event_stream, parse_error_value, parse_object,
};
use crate::providers::zhipu::ApiGeneration;

/// Zhipu rejects sampling values of exactly 0 or 1.
pub const SAMPLING_FLOOR: f64 = 0.01;
pub const SAMPLING_CEILING: f64 = 0.99;

const LEGACY_STREAM_ERROR_STATUS: u16 = 500;

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct ChatRequestWithTools {
    #[serde(flatten)]
    pub request: ChatRequest,
    pub tools: Vec<ZhipuTool>,
}

/// Outgoing chat body, one variant per downstream dialect.
#[derive(Debug, Clone, PartialEq, Serialize)]
#[serde(untagged)]
pub enum ZhipuChatBody {
    Current(ChatRequest),
    CurrentWithTools(ChatRequestWithTools),
    Legacy(LegacyChatRequest),
}

#[derive(Debug, Clone, PartialEq, Serialize)]
pub struct LegacyChatRequest {
    pub prompt: Vec<LegacyMessage>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub request_id: Option<String>,
    pub incremental: bool,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct LegacyMessage {
    #[serde(default)]
    pub role: String,
    #[serde(default)]
    pub content: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct EmbeddingRequest {
    pub model: String,
    pub input: String,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ImageGenerationRequest {
    pub model: String,
    pub prompt: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub user_id: Option<String>,
}

#[derive(Debug, Default, Deserialize)]
struct RawToolsView {
    #[serde(default)]
    tools: Option<Vec<ZhipuTool>>,
}

#[derive(Debug, Deserialize)]
struct LegacyResponse {
    #[serde(default)]
    code: Value,
    #[serde(default)]
    msg: String,
    #[serde(default)]
    success: bool,
    #[serde(default)]
    data: LegacyResponseData,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyResponseData {
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    choices: Vec<LegacyMessage>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Default, Deserialize)]
struct LegacyStreamMeta {
    #[serde(default)]
    request_id: String,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct EmbeddingResponse {
    #[serde(default)]
    model: String,
    #[serde(default, rename = "data")]
    embeddings: Vec<EmbeddingData>,
    #[serde(default)]
    usage: Usage,
}

#[derive(Debug, Deserialize)]
struct EmbeddingData {
    #[serde(default)]
    index: u32,
    #[serde(default)]
    embedding: Vec<f64>,
}

pub fn clamp_sampling(value: f64) -> f64 {
    value.min(SAMPLING_CEILING).max(SAMPLING_FLOOR)
}

/// Builds the chat body for `generation`.
///
/// Provider-native tool declarations are read from `raw`, since the canonical
/// request cannot carry their `web_search` payload.
pub fn encode_chat_request(
    request: &ChatRequest,
    raw: &RawRequestBody,
    generation: ApiGeneration,
) -> ZhipuChatBody {
    let mut request = request.clone();
    request.top_p = request.top_p.map(clamp_sampling);
    request.temperature = request.temperature.map(clamp_sampling);

    match generation {
        ApiGeneration::Current => {
            let tools = raw_tool_declarations(raw);
            if tools.is_empty() {
                return ZhipuChatBody::Current(request);
            }

            tracing::debug!(
                tools = tools.len(),
                web_search = tools
                    .iter()
                    .filter(|tool| tool.capability() == ToolCapability::WebSearch)
                    .count(),
                "forwarding provider-native tool declarations"
            );
            request.tools = None;
            ZhipuChatBody::CurrentWithTools(ChatRequestWithTools { request, tools })
        }
        ApiGeneration::Legacy => ZhipuChatBody::Legacy(encode_legacy_chat_request(&request)),
    }
}

pub fn raw_tool_declarations(raw: &RawRequestBody) -> Vec<ZhipuTool> {
    raw.json_view::<RawToolsView>()
        .and_then(|view| view.tools)
        .unwrap_or_default()
}

fn encode_legacy_chat_request(request: &ChatRequest) -> LegacyChatRequest {
    LegacyChatRequest {
        prompt: request
            .messages
            .iter()
            .map(|message| LegacyMessage {
                role: message.role.clone(),
                content: message.string_content(),
            })
            .collect(),
        temperature: request.temperature,
        top_p: request.top_p,
        request_id: None,
        incremental: false,
    }
}

pub fn encode_embedding_request(request: &ChatRequest) -> Result<EmbeddingRequest, AdaptorError> {
    let mut inputs = request.parse_input();
    if inputs.len() != 1 {
        return Err(AdaptorError::unsupported_input(format!(
            "zhipu embeddings accept exactly one input, got {}",
            inputs.len()
        )));
    }

    Ok(EmbeddingRequest {
        model: request.model.clone(),
        input: inputs.remove(0),
    })
}

pub fn encode_image_request(request: &ImageRequest) -> ImageGenerationRequest {
    ImageGenerationRequest {
        model: request.model.clone(),
        prompt: request.prompt.clone(),
        user_id: request.user.clone(),
    }
}

/// Legacy non-streaming reply, rewritten as an OpenAI `chat.completion`.
pub(crate) async fn handle_legacy_response(
    reply: ProviderReply,
    model: &str,
    sink: &mut dyn ResponseSink,
) -> Result<Option<Usage>, AdaptorError> {
    let reply = ensure_success(reply).await?;
    let status_code = reply.status_code;
    let body = reply.into_bytes().await?;

    let response: LegacyResponse = serde_json::from_slice(&body)
        .map_err(|error| AdaptorError::decode("legacy_response", error))?;
    if !response.success {
        let code = match &response.code {
            Value::Number(number) => Some(number.to_string()),
            Value::String(code) if !code.is_empty() => Some(code.clone()),
            _ => None,
        };
        let error = AdaptorError::Provider {
            status_code: in_band_error_status(status_code),
            code,
            error_type: Some("zhipu_error".to_string()),
            message: response.msg,
        };
        tracing::warn!(%error, "legacy zhipu request failed");
        return Err(error);
    }

    let usage = response.data.usage;
    let completion = legacy_response_to_openai(&response.data, model);
    sink.write_body(status_code, JSON_CONTENT_TYPE, json_bytes(&completion));
    Ok(Some(usage))
}

fn legacy_response_to_openai(data: &LegacyResponseData, model: &str) -> Value {
    let last = data.choices.len().saturating_sub(1);
    let choices = data
        .choices
        .iter()
        .enumerate()
        .map(|(index, choice)| {
            let finish_reason = if index == last {
                Value::from("stop")
            } else {
                Value::Null
            };
            json!({
                "index": index,
                "message": {
                    "role": choice.role,
                    "content": choice.content.trim_matches('"'),
                },
                "finish_reason": finish_reason,
            })
        })
        .collect::<Vec<_>>();

    json!({
        "id": data.request_id,
        "object": "chat.completion",
        "created": unix_timestamp(),
        "model": model,
        "choices": choices,
        "usage": data.usage,
    })
}

/// Legacy `sse-invoke` reply, rewritten as OpenAI `chat.completion.chunk` events.
pub(crate) async fn handle_legacy_stream(
    reply: ProviderReply,
    model: &str,
    sink: &mut dyn ResponseSink,
) -> Result<Option<Usage>, AdaptorError> {
    let reply = ensure_success(reply).await?;
    let mut chunks = open_event_stream(reply).await?;
    let mut decoder = LegacyEventDecoder::default();
    let mut usage = None;

    while let Some(chunk) = chunks.next().await {
        for event in decoder.push(&chunk?) {
            emit_legacy_event(event, model, sink, &mut usage)?;
        }
    }
    if let Some(event) = decoder.finish() {
        emit_legacy_event(event, model, sink, &mut usage)?;
    }

    sink.write_event(DONE_MARKER);
    Ok(usage)
}

fn emit_legacy_event(
    event: LegacyEvent,
    model: &str,
    sink: &mut dyn ResponseSink,
    usage: &mut Option<Usage>,
) -> Result<(), AdaptorError> {
    if matches!(event.kind.as_str(), "error" | "interrupted") {
        let message = event.data.join("\n");
        return Err(AdaptorError::Provider {
            status_code: LEGACY_STREAM_ERROR_STATUS,
            code: Some(event.kind.clone()),
            error_type: Some("zhipu_error".to_string()),
            message: if message.is_empty() {
                format!("legacy stream {}", event.kind)
            } else {
                message
            },
        });
    }

    for segment in &event.data {
        let chunk = json!({
            "id": "",
            "object": "chat.completion.chunk",
            "created": unix_timestamp(),
            "model": model,
            "choices": [{
                "index": 0,
                "delta": { "content": segment },
                "finish_reason": Value::Null,
            }],
        });
        sink.write_event(&chunk.to_string());
    }

    if let Some(meta) = &event.meta {
        let meta: LegacyStreamMeta = serde_json::from_str(meta)
            .map_err(|error| AdaptorError::decode("legacy_stream_meta", error))?;
        let chunk = json!({
            "id": meta.request_id,
            "object": "chat.completion.chunk",
            "created": unix_timestamp(),
            "model": model,
            "choices": [{
                "index": 0,
                "delta": {},
                "finish_reason": "stop",
            }],
        });
        sink.write_event(&chunk.to_string());
        *usage = Some(meta.usage);
    }

    Ok(())
}

/// Embedding reply, rewritten as an OpenAI embedding list.
pub(crate) async fn handle_embedding_response(
    reply: ProviderReply,
    sink: &mut dyn ResponseSink,
) -> Result<Option<Usage>, AdaptorError> {
    let reply = ensure_success(reply).await?;
    let status_code = reply.status_code;
    let body = reply.into_bytes().await?;

    let root = parse_object(&body, "embedding_response")?;
    if let Some(envelope) = parse_error_value(&root) {
        return Err(envelope.into_error(in_band_error_status(status_code)));
    }

    let response: EmbeddingResponse = serde_json::from_value(Value::Object(root))
        .map_err(|error| AdaptorError::decode("embedding_response", error))?;
    let data = response
        .embeddings
        .iter()
        .map(|item| {
            json!({
                "object": "embedding",
                "index": item.index,
                "embedding": item.embedding,
            })
        })
        .collect::<Vec<_>>();

    let converted = json!({
        "object": "list",
        "data": data,
        "model": response.model,
        "usage": response.usage,
    });
    sink.write_body(status_code, JSON_CONTENT_TYPE, json_bytes(&converted));
    Ok(Some(response.usage))
}

/// One blank-line-delimited block of the legacy event stream.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct LegacyEvent {
    pub kind: String,
    pub data: Vec<String>,
    pub meta: Option<String>,
}

/// Incremental framer for the legacy stream.
///
/// Unlike standard SSE the legacy stream carries a `meta:` field, and `data:`
/// values keep their leading whitespace.
#[derive(Debug, Default)]
pub(crate) struct LegacyEventDecoder {
    buffer: Vec<u8>,
}

impl LegacyEventDecoder {
    pub(crate) fn push(&mut self, chunk: &[u8]) -> Vec<LegacyEvent> {
        self.buffer
            .extend(chunk.iter().copied().filter(|byte| *byte != b'\r'));

        let mut events = Vec::new();
        while let Some(end) = self.buffer.windows(2).position(|window| window == b"\n\n") {
            let block = self.buffer.drain(..end + 2).collect::<Vec<_>>();
            if let Some(event) = parse_legacy_block(&String::from_utf8_lossy(&block[..end])) {
                events.push(event);
            }
        }
        events
    }

    /// Flushes a trailing block that was not terminated by a blank line.
    pub(crate) fn finish(&mut self) -> Option<LegacyEvent> {
        let block = std::mem::take(&mut self.buffer);
        parse_legacy_block(&String::from_utf8_lossy(&block))
    }
}

fn parse_legacy_block(block: &str) -> Option<LegacyEvent> {
    let mut kind = None;
    let mut data = Vec::new();
    let mut meta = None;

    for line in block.split('\n') {
        if let Some(value) = line.strip_prefix("event:") {
            kind = Some(value.trim().to_string());
        } else if let Some(value) = line.strip_prefix("data:") {
            data.push(value.to_string());
        } else if let Some(value) = line.strip_prefix("meta:") {
            meta = Some(value.to_string());
        }
    }

    if kind.is_none() && data.is_empty() && meta.is_none() {
        return None;
    }

    Some(LegacyEvent {
        kind: kind.unwrap_or_else(|| "add".to_string()),
        data,
        meta,
    })
}

fn unix_timestamp() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|elapsed| elapsed.as_secs())
        .unwrap_or_default()
}
