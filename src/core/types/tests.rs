use futures_util::stream;
use serde_json::json;

use super::*;

#[test]
fn test_relay_mode_from_path() {
    assert_eq!(
        RelayMode::from_path("/v1/chat/completions"),
        Some(RelayMode::ChatCompletions)
    );
    assert_eq!(
        RelayMode::from_path("/v1/completions?debug=1"),
        Some(RelayMode::Completions)
    );
    assert_eq!(
        RelayMode::from_path("/v1/engines/text-embedding-ada-002/embeddings"),
        Some(RelayMode::Embeddings)
    );
    assert_eq!(
        RelayMode::from_path("/v1/images/generations"),
        Some(RelayMode::ImagesGenerations)
    );
    assert_eq!(RelayMode::from_path("/v1/models"), None);
}

#[test]
fn test_chat_request_serde_skips_absent_fields() {
    let req: ChatRequest = serde_json::from_value(json!({
        "model": "glm-4",
        "messages": [{ "role": "user", "content": "hello" }],
        "frequency_penalty": 0.5
    }))
    .expect("unknown canonical fields are ignored");

    assert!(!req.stream);
    assert_eq!(req.temperature, None);

    let value = serde_json::to_value(&req).expect("request should serialize");
    assert!(value.get("temperature").is_none());
    assert!(value.get("top_p").is_none());
    assert!(value.get("stream").is_none());
    assert!(value.get("tools").is_none());
    assert_eq!(value.pointer("/messages/0/content"), Some(&json!("hello")));
}

#[test]
fn test_canonical_tools_drop_web_search_payload() {
    let req: ChatRequest = serde_json::from_value(json!({
        "model": "glm-4",
        "tools": [
            { "type": "web_search", "web_search": { "enable": true, "search_query": "rust" } },
            { "type": "function", "function": { "name": "lookup", "parameters": { "type": "object" } } }
        ]
    }))
    .expect("canonical request should parse");

    let tools = req.tools.expect("tools should be present");
    assert_eq!(tools.len(), 2);
    assert_eq!(tools[0].tool_type, "web_search");
    assert_eq!(tools[0].function, Function::default());
    assert_eq!(tools[1].function.name.as_deref(), Some("lookup"));
}

#[test]
fn test_parse_input_variants() {
    let mut req = ChatRequest {
        model: "embedding-2".to_string(),
        input: Some(json!("one")),
        ..ChatRequest::default()
    };
    assert_eq!(req.parse_input(), vec!["one".to_string()]);

    req.input = Some(json!(["a", 1, "b"]));
    assert_eq!(req.parse_input(), vec!["a".to_string(), "b".to_string()]);

    req.input = Some(json!({ "text": "nope" }));
    assert!(req.parse_input().is_empty());

    req.input = None;
    assert!(req.parse_input().is_empty());
}

#[test]
fn test_message_string_content() {
    assert_eq!(Message::text("user", "hi").string_content(), "hi");

    let multi_part = Message {
        role: "user".to_string(),
        content: json!([
            { "type": "text", "text": "describe " },
            { "type": "image_url", "image_url": { "url": "https://example.com/cat.png" } },
            { "type": "text", "text": "this" }
        ]),
        ..Message::default()
    };
    assert_eq!(multi_part.string_content(), "describe this");

    let empty = Message {
        role: "assistant".to_string(),
        content: Value::Null,
        ..Message::default()
    };
    assert_eq!(empty.string_content(), "");
}

#[test]
fn test_zhipu_tool_capability() {
    let web_search: ZhipuTool = serde_json::from_value(json!({
        "type": "web_search",
        "web_search": { "enable": true, "search_result": true }
    }))
    .expect("web search tool should parse");
    assert_eq!(web_search.capability(), ToolCapability::WebSearch);

    let function: ZhipuTool = serde_json::from_value(json!({
        "function": { "name": "lookup" }
    }))
    .expect("function tool should parse");
    assert_eq!(function.capability(), ToolCapability::Function);

    assert_eq!(ZhipuTool::default().capability(), ToolCapability::Other);
}

#[test]
fn test_usage_helpers() {
    let reported = Usage {
        prompt_tokens: 3,
        completion_tokens: 4,
        total_tokens: 7,
    };
    assert_eq!(reported.with_prompt_fallback(99), reported);
    assert_eq!(reported.derived_total_tokens(), 7);

    let missing = Usage::default();
    assert!(missing.is_empty());
    assert_eq!(
        missing.with_prompt_fallback(12),
        Usage {
            prompt_tokens: 12,
            completion_tokens: 0,
            total_tokens: 12,
        }
    );

    let partial = Usage {
        prompt_tokens: 0,
        completion_tokens: 5,
        total_tokens: 0,
    };
    assert_eq!(partial.derived_total_tokens(), 5);
    assert_eq!(partial.with_prompt_fallback(2).total_tokens, 7);
}

#[test]
fn test_raw_body_json_view_is_best_effort() {
    #[derive(Debug, serde::Deserialize)]
    struct ToolsView {
        #[serde(default)]
        tools: Vec<ZhipuTool>,
    }

    let raw = RawRequestBody::json(r#"{"tools":[{"type":"web_search","web_search":{"enable":true}}]}"#);
    let view: ToolsView = raw.json_view().expect("json view should parse");
    assert_eq!(view.tools.len(), 1);

    let form = RawRequestBody::new(
        Some("multipart/form-data".to_string()),
        r#"{"tools":[]}"#,
    );
    assert!(form.json_view::<ToolsView>().is_none());

    let broken = RawRequestBody::json("{not json");
    assert!(broken.json_view::<ToolsView>().is_none());

    let charset = RawRequestBody::new(
        Some("application/json; charset=utf-8".to_string()),
        r#"{}"#,
    );
    assert!(charset.json_view::<ToolsView>().is_some());
}

#[tokio::test]
async fn test_provider_reply_drains_streaming_body() {
    let chunks: Vec<Result<Bytes, AdaptorError>> = vec![
        Ok(Bytes::from_static(b"hello ")),
        Ok(Bytes::from_static(b"world")),
    ];
    let reply = ProviderReply::streaming(200, Box::pin(stream::iter(chunks)));
    assert!(reply.is_success());

    let body = reply.into_bytes().await.expect("body should drain");
    assert_eq!(body, Bytes::from_static(b"hello world"));

    let failing: Vec<Result<Bytes, AdaptorError>> = vec![
        Ok(Bytes::from_static(b"partial")),
        Err(AdaptorError::transport("connection reset")),
    ];
    let reply = ProviderReply::streaming(200, Box::pin(stream::iter(failing)));
    let err = reply.into_bytes().await.expect_err("drain should fail");
    assert_eq!(err, AdaptorError::transport("connection reset"));
}
