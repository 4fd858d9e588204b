use serde_json::{Value, json};
use thiserror::Error;

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum ConfigError {
    #[error("missing api key{env_candidates}", env_candidates = format_env_candidates(.env_candidates))]
    MissingApiKey { env_candidates: Vec<String> },
    #[error("invalid base url {base_url:?}: {reason}")]
    InvalidBaseUrl { base_url: String, reason: String },
    #[error("invalid timeout: {timeout_ms} ms")]
    InvalidTimeout { timeout_ms: u64 },
    #[error("invalid value for {name}: {value:?}")]
    InvalidEnvValue { name: String, value: String },
}

/// Failure taxonomy surfaced by every adaptor component.
///
/// Components return these to their caller and never retry; the outer relay
/// decides whether a failed attempt is worth another channel.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum AdaptorError {
    #[error("invalid input: {message}")]
    InvalidInput { message: String },
    #[error("unsupported input: {message}")]
    UnsupportedInput { message: String },
    #[error(
        "provider error{context}: {message}",
        context = format_context(
            Some(*.status_code),
            .code.as_deref(),
            .error_type.as_deref(),
            None
        )
    )]
    Provider {
        status_code: u16,
        code: Option<String>,
        error_type: Option<String>,
        message: String,
    },
    #[error(
        "decode error{context}: {message}",
        context = format_context(None, None, None, Some(.stage.as_str()))
    )]
    Decode { stage: String, message: String },
    #[error("transport error: {message}")]
    Transport { message: String },
    #[error(transparent)]
    Config(#[from] ConfigError),
}

impl AdaptorError {
    pub fn invalid_input(message: impl Into<String>) -> Self {
        Self::InvalidInput {
            message: message.into(),
        }
    }

    pub fn unsupported_input(message: impl Into<String>) -> Self {
        Self::UnsupportedInput {
            message: message.into(),
        }
    }

    pub fn decode(stage: impl Into<String>, message: impl ToString) -> Self {
        Self::Decode {
            stage: stage.into(),
            message: message.to_string(),
        }
    }

    pub fn transport(message: impl ToString) -> Self {
        Self::Transport {
            message: message.to_string(),
        }
    }

    /// HTTP status the relay should answer with when this error ends a request.
    pub fn status_code(&self) -> u16 {
        match self {
            Self::Provider { status_code, .. } => *status_code,
            Self::InvalidInput { .. } | Self::UnsupportedInput { .. } => 400,
            Self::Decode { .. } | Self::Transport { .. } | Self::Config(_) => 500,
        }
    }

    /// Canonical OpenAI-style error payload for the downstream client.
    pub fn to_error_body(&self) -> Value {
        let (message, error_type, code) = match self {
            Self::Provider {
                code,
                error_type,
                message,
                ..
            } => (
                message.clone(),
                error_type.clone().unwrap_or_else(|| "zhipu_error".to_string()),
                code.clone(),
            ),
            Self::InvalidInput { message } => (
                message.clone(),
                "invalid_request_error".to_string(),
                Some("invalid_input".to_string()),
            ),
            Self::UnsupportedInput { message } => (
                message.clone(),
                "invalid_request_error".to_string(),
                Some("unsupported_input".to_string()),
            ),
            Self::Decode { stage, message } => (
                format!("{stage}: {message}"),
                "one_api_error".to_string(),
                Some("decode_response_failed".to_string()),
            ),
            Self::Transport { message } => (
                message.clone(),
                "one_api_error".to_string(),
                Some("do_request_failed".to_string()),
            ),
            Self::Config(error) => (
                error.to_string(),
                "one_api_error".to_string(),
                Some("invalid_channel_config".to_string()),
            ),
        };

        json!({
            "error": {
                "message": message,
                "type": error_type,
                "code": code,
            }
        })
    }
}

fn format_env_candidates(env_candidates: &[String]) -> String {
    if env_candidates.is_empty() {
        String::new()
    } else {
        format!(" [env_candidates={}]", env_candidates.join(", "))
    }
}

fn format_context(
    status_code: Option<u16>,
    code: Option<&str>,
    error_type: Option<&str>,
    stage: Option<&str>,
) -> String {
    let mut context = Vec::new();

    if let Some(status_code) = status_code {
        context.push(format!("status_code={status_code}"));
    }
    if let Some(code) = code {
        context.push(format!("code={code}"));
    }
    if let Some(error_type) = error_type {
        context.push(format!("type={error_type}"));
    }
    if let Some(stage) = stage {
        context.push(format!("stage={stage}"));
    }

    if context.is_empty() {
        String::new()
    } else {
        format!(" [{}]", context.join(", "))
    }
}
