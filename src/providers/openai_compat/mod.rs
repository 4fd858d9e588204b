//! Normalizers for replies already in the OpenAI chat-completions wire format.
//!
//! The v4 generation of the Zhipu API speaks this format, so its replies are
//! forwarded to the client mostly untouched; only usage and errors are read.

use std::pin::pin;

use bytes::{Bytes, BytesMut};
use eventsource_stream::{EventStreamError, Eventsource};
use futures_util::{StreamExt, stream};
use serde_json::{Map, Value};

use crate::core::error::AdaptorError;
use crate::core::traits::ResponseSink;
use crate::core::types::{ByteStream, ProviderReply, Usage};

pub(crate) const JSON_CONTENT_TYPE: &str = "application/json";
pub(crate) const DONE_MARKER: &str = "[DONE]";

#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct ErrorEnvelope {
    pub message: String,
    pub code: Option<String>,
    pub error_type: Option<String>,
}

impl ErrorEnvelope {
    pub(crate) fn into_error(self, status_code: u16) -> AdaptorError {
        AdaptorError::Provider {
            status_code,
            code: self.code,
            error_type: self.error_type,
            message: self.message,
        }
    }
}

/// Outcome of draining a chat-completions event stream.
#[derive(Debug, Clone, PartialEq, Default)]
pub(crate) struct StreamOutcome {
    pub text: String,
    pub usage: Option<Usage>,
}

/// Reads an error envelope in either the `{"error": {...}}` shape or the
/// legacy `{"code", "msg", "success": false}` shape.
pub(crate) fn parse_error_value(root: &Map<String, Value>) -> Option<ErrorEnvelope> {
    if let Some(error) = root.get("error") {
        return match error {
            Value::Object(error) => {
                let message = error
                    .get("message")
                    .and_then(Value::as_str)
                    .unwrap_or_default()
                    .to_string();
                let code = error.get("code").and_then(scalar_to_string);
                let error_type = error
                    .get("type")
                    .and_then(Value::as_str)
                    .filter(|value| !value.is_empty())
                    .map(str::to_string);

                if message.is_empty() && code.is_none() && error_type.is_none() {
                    None
                } else {
                    Some(ErrorEnvelope {
                        message,
                        code,
                        error_type,
                    })
                }
            }
            Value::String(message) if !message.is_empty() => Some(ErrorEnvelope {
                message: message.clone(),
                code: None,
                error_type: None,
            }),
            _ => None,
        };
    }

    if root.get("success").and_then(Value::as_bool) == Some(false) {
        return Some(ErrorEnvelope {
            message: root
                .get("msg")
                .and_then(Value::as_str)
                .unwrap_or("zhipu request failed")
                .to_string(),
            code: root.get("code").and_then(scalar_to_string),
            error_type: None,
        });
    }

    None
}

/// Builds the provider error for a non-2xx reply body.
pub(crate) fn provider_error_from_body(status_code: u16, body: &[u8]) -> AdaptorError {
    let parsed = serde_json::from_slice::<Value>(body).ok();
    if let Some(envelope) = parsed
        .as_ref()
        .and_then(Value::as_object)
        .and_then(parse_error_value)
    {
        return envelope.into_error(status_code);
    }

    let text = String::from_utf8_lossy(body).trim().to_string();
    AdaptorError::Provider {
        status_code,
        code: None,
        error_type: None,
        message: if text.is_empty() {
            format!("http status {status_code}")
        } else {
            text
        },
    }
}

/// Status used for an error payload that arrived after a 2xx status line.
pub(crate) fn in_band_error_status(status_code: u16) -> u16 {
    if (200..300).contains(&status_code) {
        500
    } else {
        status_code
    }
}

/// Turns a non-2xx reply into a provider error, passing 2xx replies through.
pub(crate) async fn ensure_success(reply: ProviderReply) -> Result<ProviderReply, AdaptorError> {
    if reply.is_success() {
        return Ok(reply);
    }

    let status_code = reply.status_code;
    let body = reply.into_bytes().await?;
    let error = provider_error_from_body(status_code, &body);
    tracing::warn!(status_code, %error, "provider returned an error status");
    Err(error)
}

/// Non-streaming chat completion: forwards the body, returns its usage.
pub(crate) async fn handle_chat_response(
    reply: ProviderReply,
    prompt_tokens: u64,
    sink: &mut dyn ResponseSink,
) -> Result<Option<Usage>, AdaptorError> {
    let reply = ensure_success(reply).await?;
    let status_code = reply.status_code;
    let body = reply.into_bytes().await?;

    let root = parse_object(&body, "chat_response")?;
    if let Some(envelope) = parse_error_value(&root) {
        return Err(envelope.into_error(in_band_error_status(status_code)));
    }

    let usage = decode_usage(root.get("usage"), "chat_response")?
        .unwrap_or_default()
        .with_prompt_fallback(prompt_tokens);

    sink.write_body(status_code, JSON_CONTENT_TYPE, body);
    Ok(Some(usage))
}

/// Drains a chat-completions event stream, forwarding every chunk.
///
/// The last chunk carrying `usage` wins. An error payload or a broken stream
/// ends the drain with an error; no partial usage is reported in that case.
pub(crate) async fn handle_chat_stream(
    reply: ProviderReply,
    sink: &mut dyn ResponseSink,
) -> Result<StreamOutcome, AdaptorError> {
    let reply = ensure_success(reply).await?;
    let status_code = reply.status_code;
    let mut events = pin!(open_event_stream(reply).await?.eventsource());
    let mut outcome = StreamOutcome::default();

    while let Some(event) = events.next().await {
        let event = event.map_err(map_event_stream_error)?;
        let data = event.data.trim();
        if data.is_empty() {
            continue;
        }
        if data == DONE_MARKER {
            break;
        }

        let chunk = parse_object(data.as_bytes(), "chat_stream_chunk")?;
        if let Some(envelope) = parse_error_value(&chunk) {
            let error = envelope.into_error(in_band_error_status(status_code));
            tracing::warn!(%error, "provider reported an error mid-stream");
            return Err(error);
        }

        if let Some(usage) = decode_usage(chunk.get("usage"), "chat_stream_chunk")? {
            outcome.usage = Some(usage);
        }
        append_delta_text(&chunk, &mut outcome.text);
        sink.write_event(data);
    }

    sink.write_event(DONE_MARKER);
    Ok(outcome)
}

/// Hands back the byte stream of a 2xx streaming reply.
///
/// An event stream starts with a field name or a comment, never with `{`. A
/// body that does is a JSON object sent in place of events and is read as an
/// error envelope.
pub(crate) async fn open_event_stream(reply: ProviderReply) -> Result<ByteStream, AdaptorError> {
    let status_code = reply.status_code;
    let mut chunks = reply.into_stream();
    let mut head = BytesMut::new();

    while let Some(chunk) = chunks.next().await {
        head.extend_from_slice(&chunk?);
        if !head.trim_ascii_start().is_empty() {
            break;
        }
    }

    if head.trim_ascii_start().first() != Some(&b'{') {
        let head = head.freeze();
        let replayed: ByteStream =
            Box::pin(stream::once(async move { Ok::<_, AdaptorError>(head) }).chain(chunks));
        return Ok(replayed);
    }

    while let Some(chunk) = chunks.next().await {
        head.extend_from_slice(&chunk?);
    }
    let root = parse_object(&head, "event_stream")?;
    let error = match parse_error_value(&root) {
        Some(envelope) => envelope.into_error(in_band_error_status(status_code)),
        None => AdaptorError::decode("event_stream", "expected an event stream, got a JSON object"),
    };
    tracing::warn!(status_code, %error, "provider answered a stream request with a JSON body");
    Err(error)
}

/// Image generation: forwards the provider body; images carry no token usage.
pub(crate) async fn handle_image_response(
    reply: ProviderReply,
    sink: &mut dyn ResponseSink,
) -> Result<Option<Usage>, AdaptorError> {
    let reply = ensure_success(reply).await?;
    let status_code = reply.status_code;
    let body = reply.into_bytes().await?;

    let root = parse_object(&body, "image_response")?;
    if let Some(envelope) = parse_error_value(&root) {
        return Err(envelope.into_error(in_band_error_status(status_code)));
    }

    sink.write_body(status_code, JSON_CONTENT_TYPE, body);
    Ok(None)
}

pub(crate) fn parse_object(body: &[u8], stage: &str) -> Result<Map<String, Value>, AdaptorError> {
    match serde_json::from_slice::<Value>(body) {
        Ok(Value::Object(root)) => Ok(root),
        Ok(_) => Err(AdaptorError::decode(stage, "payload must be a JSON object")),
        Err(error) => Err(AdaptorError::decode(stage, error)),
    }
}

pub(crate) fn decode_usage(
    value: Option<&Value>,
    stage: &str,
) -> Result<Option<Usage>, AdaptorError> {
    match value {
        None | Some(Value::Null) => Ok(None),
        Some(value) => serde_json::from_value::<Usage>(value.clone())
            .map(Some)
            .map_err(|error| AdaptorError::decode(stage, format!("invalid usage: {error}"))),
    }
}

pub(crate) fn json_bytes(value: &Value) -> Bytes {
    Bytes::from(value.to_string())
}

fn append_delta_text(chunk: &Map<String, Value>, text: &mut String) {
    let Some(choices) = chunk.get("choices").and_then(Value::as_array) else {
        return;
    };

    for choice in choices {
        if let Some(content) = choice.pointer("/delta/content").and_then(Value::as_str) {
            text.push_str(content);
        }
    }
}

fn map_event_stream_error(error: EventStreamError<AdaptorError>) -> AdaptorError {
    match error {
        EventStreamError::Transport(error) => error,
        other => AdaptorError::decode("event_stream", other),
    }
}

fn scalar_to_string(value: &Value) -> Option<String> {
    match value {
        Value::String(text) if !text.is_empty() => Some(text.clone()),
        Value::Number(number) => Some(number.to_string()),
        _ => None,
    }
}

#[cfg(test)]
mod tests;
