use std::fmt;
use std::pin::Pin;

use bytes::{Bytes, BytesMut};
use futures_util::{Stream, StreamExt, stream};
use reqwest::header::HeaderMap;
use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::AdaptorError;

/// Operation kind assigned by the outer relay router from the inbound path.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RelayMode {
    ChatCompletions,
    Completions,
    Embeddings,
    ImagesGenerations,
}

impl RelayMode {
    pub fn from_path(path: &str) -> Option<Self> {
        let path = path.split('?').next().unwrap_or_default();
        if path.starts_with("/v1/chat/completions") {
            Some(Self::ChatCompletions)
        } else if path.starts_with("/v1/completions") {
            Some(Self::Completions)
        } else if path.starts_with("/v1/embeddings") || path.ends_with("embeddings") {
            Some(Self::Embeddings)
        } else if path.starts_with("/v1/images/generations") {
            Some(Self::ImagesGenerations)
        } else {
            None
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ChatRequest {
    pub model: String,
    #[serde(default, skip_serializing_if = "Vec::is_empty")]
    pub messages: Vec<Message>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub temperature: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub top_p: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub max_tokens: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub stop: Option<Value>,
    #[serde(default, skip_serializing_if = "is_false")]
    pub stream: bool,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tools: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_choice: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub input: Option<Value>,
}

impl ChatRequest {
    /// Ordered text items of `input`; non-string members are skipped.
    pub fn parse_input(&self) -> Vec<String> {
        match &self.input {
            Some(Value::String(text)) => vec![text.clone()],
            Some(Value::Array(items)) => items
                .iter()
                .filter_map(Value::as_str)
                .map(str::to_string)
                .collect(),
            _ => Vec::new(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Message {
    pub role: String,
    #[serde(default)]
    pub content: Value,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_calls: Option<Vec<Tool>>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub tool_call_id: Option<String>,
}

impl Message {
    pub fn text(role: impl Into<String>, text: impl Into<String>) -> Self {
        Self {
            role: role.into(),
            content: Value::String(text.into()),
            ..Self::default()
        }
    }

    /// Plain-text view of the content; array content keeps only its text parts.
    pub fn string_content(&self) -> String {
        match &self.content {
            Value::String(text) => text.clone(),
            Value::Array(parts) => parts
                .iter()
                .filter(|part| part.get("type").and_then(Value::as_str) == Some("text"))
                .filter_map(|part| part.get("text").and_then(Value::as_str))
                .collect(),
            _ => String::new(),
        }
    }
}

/// Canonical tool declaration (request side) or tool call (response side).
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Tool {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "String::is_empty")]
    pub tool_type: String,
    #[serde(default)]
    pub function: Function,
}

#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct Function {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub description: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub name: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parameters: Option<Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub arguments: Option<Value>,
}

/// Provider-native tool declaration; `web_search` has no canonical counterpart.
#[derive(Debug, Clone, PartialEq, Default, Serialize, Deserialize)]
pub struct ZhipuTool {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "type", default, skip_serializing_if = "Option::is_none")]
    pub tool_type: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub function: Option<Function>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub web_search: Option<WebSearch>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ToolCapability {
    Function,
    WebSearch,
    Other,
}

impl ZhipuTool {
    pub fn capability(&self) -> ToolCapability {
        match self.tool_type.as_deref() {
            Some("web_search") => ToolCapability::WebSearch,
            Some("function") => ToolCapability::Function,
            _ if self.web_search.is_some() => ToolCapability::WebSearch,
            _ if self.function.is_some() => ToolCapability::Function,
            _ => ToolCapability::Other,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct WebSearch {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub enable: Option<bool>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_query: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub search_result: Option<bool>,
}

#[derive(Debug, Clone, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct ImageRequest {
    pub model: String,
    pub prompt: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub n: Option<u32>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub size: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub response_format: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub user: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub struct Usage {
    #[serde(default)]
    pub prompt_tokens: u64,
    #[serde(default)]
    pub completion_tokens: u64,
    #[serde(default)]
    pub total_tokens: u64,
}

impl Usage {
    pub fn is_empty(&self) -> bool {
        self.prompt_tokens == 0 && self.completion_tokens == 0 && self.total_tokens == 0
    }

    pub fn derived_total_tokens(&self) -> u64 {
        if self.total_tokens > 0 {
            self.total_tokens
        } else {
            self.prompt_tokens + self.completion_tokens
        }
    }

    /// Fills prompt tokens from the relay's own count when the provider sent none.
    pub fn with_prompt_fallback(mut self, prompt_tokens: u64) -> Self {
        if self.total_tokens == 0 {
            if self.prompt_tokens == 0 {
                self.prompt_tokens = prompt_tokens;
            }
            self.total_tokens = self.prompt_tokens + self.completion_tokens;
        }
        self
    }
}

/// Untouched inbound payload kept next to the canonical struct.
///
/// The canonical schema drops provider-specific fields, so components that
/// need them read this view instead.
#[derive(Debug, Clone, PartialEq, Eq, Default)]
pub struct RawRequestBody {
    pub content_type: Option<String>,
    pub bytes: Bytes,
}

impl RawRequestBody {
    pub fn new(content_type: Option<String>, bytes: impl Into<Bytes>) -> Self {
        Self {
            content_type,
            bytes: bytes.into(),
        }
    }

    pub fn json(bytes: impl Into<Bytes>) -> Self {
        Self::new(Some("application/json".to_string()), bytes)
    }

    pub fn is_json(&self) -> bool {
        self.content_type
            .as_deref()
            .is_some_and(|content_type| content_type.starts_with("application/json"))
    }

    /// Best-effort typed view; `None` when the body is not JSON or does not parse.
    pub fn json_view<T>(&self) -> Option<T>
    where
        T: DeserializeOwned,
    {
        if !self.is_json() || self.bytes.is_empty() {
            return None;
        }

        match serde_json::from_slice(&self.bytes) {
            Ok(view) => Some(view),
            Err(error) => {
                tracing::warn!(%error, "raw request body is not a valid JSON view");
                None
            }
        }
    }
}

/// Per-attempt facts handed to the adaptor by the outer relay.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayMeta {
    pub mode: RelayMode,
    pub base_url: String,
    pub actual_model_name: String,
    pub is_stream: bool,
    pub api_key: String,
    pub prompt_tokens: u64,
}

pub type ByteStream = Pin<Box<dyn Stream<Item = Result<Bytes, AdaptorError>> + Send>>;

pub enum ReplyBody {
    Buffered(Bytes),
    Streaming(ByteStream),
}

impl fmt::Debug for ReplyBody {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Buffered(bytes) => f.debug_tuple("Buffered").field(&bytes.len()).finish(),
            Self::Streaming(_) => f.write_str("Streaming(..)"),
        }
    }
}

/// Provider reply as handed over by the transport.
#[derive(Debug)]
pub struct ProviderReply {
    pub status_code: u16,
    pub headers: HeaderMap,
    pub body: ReplyBody,
}

impl ProviderReply {
    pub fn buffered(status_code: u16, body: impl Into<Bytes>) -> Self {
        Self {
            status_code,
            headers: HeaderMap::new(),
            body: ReplyBody::Buffered(body.into()),
        }
    }

    pub fn streaming(status_code: u16, body: ByteStream) -> Self {
        Self {
            status_code,
            headers: HeaderMap::new(),
            body: ReplyBody::Streaming(body),
        }
    }

    pub fn is_success(&self) -> bool {
        (200..300).contains(&self.status_code)
    }

    /// Drains the body into memory.
    pub async fn into_bytes(self) -> Result<Bytes, AdaptorError> {
        match self.body {
            ReplyBody::Buffered(bytes) => Ok(bytes),
            ReplyBody::Streaming(mut chunks) => {
                let mut buffer = BytesMut::new();
                while let Some(chunk) = chunks.next().await {
                    buffer.extend_from_slice(&chunk?);
                }
                Ok(buffer.freeze())
            }
        }
    }

    pub fn into_stream(self) -> ByteStream {
        match self.body {
            ReplyBody::Streaming(chunks) => chunks,
            ReplyBody::Buffered(bytes) => {
                Box::pin(stream::once(async move { Ok::<_, AdaptorError>(bytes) }))
            }
        }
    }
}

fn is_false(value: &bool) -> bool {
    !*value
}

#[cfg(test)]
mod tests;
