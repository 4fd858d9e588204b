use std::sync::Arc;

use reqwest::header::HeaderMap;

use super::RelayRuntime;
use crate::core::error::AdaptorError;
use crate::core::traits::{CollectedResponse, RelayAdaptor, TokenProvider};
use crate::core::types::{RawRequestBody, RelayMode};
use crate::providers::zhipu::ZhipuConfig;

struct PrefixedToken;

impl TokenProvider for PrefixedToken {
    fn authorization(&self, api_key: &str) -> Result<String, AdaptorError> {
        Ok(format!("Token {api_key}"))
    }
}

fn runtime() -> RelayRuntime {
    let config = ZhipuConfig::new("id.secret")
        .and_then(|config| config.with_base_url("http://127.0.0.1:1"))
        .expect("valid config");
    RelayRuntime::new(config).expect("runtime should build")
}

#[test]
fn test_runtime_hands_out_fresh_adaptors() {
    let runtime = runtime();
    assert_eq!(runtime.config().base_url, "http://127.0.0.1:1");

    let mut first = runtime.new_adaptor();
    let meta = runtime
        .config()
        .relay_meta(RelayMode::ChatCompletions, "glm-4", false, 0);
    first.request_url(&meta).expect("url should resolve");

    let second = runtime.new_adaptor();
    assert!(first.generation().is_some());
    assert_eq!(second.generation(), None);
}

#[test]
fn test_runtime_uses_configured_token_provider() {
    let runtime = runtime().with_token_provider(Arc::new(PrefixedToken));
    let meta = runtime
        .config()
        .relay_meta(RelayMode::ChatCompletions, "glm-4", false, 0);

    let mut headers = HeaderMap::new();
    runtime
        .new_adaptor()
        .setup_request_headers(&HeaderMap::new(), &mut headers, &meta)
        .expect("headers should be set");

    assert_eq!(
        headers
            .get("authorization")
            .and_then(|value| value.to_str().ok()),
        Some("Token id.secret")
    );
}

#[tokio::test]
async fn test_relay_chat_rejects_invalid_body_before_network() {
    let mut sink = CollectedResponse::default();

    let err = runtime()
        .relay_chat(
            RelayMode::ChatCompletions,
            &HeaderMap::new(),
            &RawRequestBody::json("{\"messages\": 3}"),
            0,
            &mut sink,
        )
        .await
        .expect_err("invalid body should fail");

    assert!(matches!(err, AdaptorError::InvalidInput { .. }));
    assert_eq!(sink, CollectedResponse::default());
}

#[tokio::test]
async fn test_relay_chat_rejects_image_mode() {
    let err = runtime()
        .relay_chat(
            RelayMode::ImagesGenerations,
            &HeaderMap::new(),
            &RawRequestBody::json(r#"{"model":"cogview-3"}"#),
            0,
            &mut CollectedResponse::default(),
        )
        .await
        .expect_err("image mode should fail");

    assert_eq!(err.status_code(), 400);
}

#[tokio::test]
async fn test_relay_chat_surfaces_transport_failure() {
    let err = runtime()
        .relay_chat(
            RelayMode::ChatCompletions,
            &HeaderMap::new(),
            &RawRequestBody::json(r#"{"model":"glm-4","messages":[{"role":"user","content":"hi"}]}"#),
            0,
            &mut CollectedResponse::default(),
        )
        .await
        .expect_err("unreachable provider should fail");

    assert!(matches!(err, AdaptorError::Transport { .. }));
    assert_eq!(err.to_error_body()["error"]["code"], "do_request_failed");
}
