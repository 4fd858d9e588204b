use bytes::Bytes;
use futures_util::stream;
use serde_json::json;

use super::{
    ErrorEnvelope, handle_chat_response, handle_chat_stream, handle_image_response,
    parse_error_value, provider_error_from_body,
};
use crate::core::error::AdaptorError;
use crate::core::traits::CollectedResponse;
use crate::core::types::{ProviderReply, Usage};

fn streaming_reply(chunks: &[&'static str]) -> ProviderReply {
    let chunks: Vec<Result<Bytes, AdaptorError>> = chunks
        .iter()
        .map(|chunk| Ok(Bytes::from_static(chunk.as_bytes())))
        .collect();
    ProviderReply::streaming(200, Box::pin(stream::iter(chunks)))
}

#[test]
fn test_parse_error_value_shapes() {
    let v4 = json!({ "error": { "code": "1214", "message": "messages invalid" } });
    assert_eq!(
        parse_error_value(v4.as_object().expect("object")),
        Some(ErrorEnvelope {
            message: "messages invalid".to_string(),
            code: Some("1214".to_string()),
            error_type: None,
        })
    );

    let legacy = json!({ "code": 1261, "msg": "prompt too long", "success": false });
    assert_eq!(
        parse_error_value(legacy.as_object().expect("object")),
        Some(ErrorEnvelope {
            message: "prompt too long".to_string(),
            code: Some("1261".to_string()),
            error_type: None,
        })
    );

    let empty_error = json!({ "error": { "message": "", "type": "" }, "choices": [] });
    assert_eq!(
        parse_error_value(empty_error.as_object().expect("object")),
        None
    );

    let ok = json!({ "code": 200, "msg": "ok", "success": true });
    assert_eq!(parse_error_value(ok.as_object().expect("object")), None);
}

#[test]
fn test_provider_error_from_body_falls_back_to_text() {
    let err = provider_error_from_body(502, b"<html>bad gateway</html>");
    assert_eq!(
        err,
        AdaptorError::Provider {
            status_code: 502,
            code: None,
            error_type: None,
            message: "<html>bad gateway</html>".to_string(),
        }
    );

    let err = provider_error_from_body(503, b"   ");
    assert!(err.to_string().contains("http status 503"));
}

#[tokio::test]
async fn test_handle_chat_response_forwards_body_and_usage() {
    let body = r#"{"id":"8311","model":"glm-4","choices":[{"index":0,"message":{"role":"assistant","content":"hi"},"finish_reason":"stop"}],"usage":{"prompt_tokens":6,"completion_tokens":2,"total_tokens":8}}"#;
    let mut sink = CollectedResponse::default();

    let usage = handle_chat_response(ProviderReply::buffered(200, body), 0, &mut sink)
        .await
        .expect("response should normalize");

    assert_eq!(
        usage,
        Some(Usage {
            prompt_tokens: 6,
            completion_tokens: 2,
            total_tokens: 8,
        })
    );
    assert_eq!(sink.status_code, Some(200));
    assert_eq!(sink.body, Bytes::from_static(body.as_bytes()));
}

#[tokio::test]
async fn test_handle_chat_response_falls_back_to_prompt_tokens() {
    let mut sink = CollectedResponse::default();

    let usage = handle_chat_response(
        ProviderReply::buffered(200, r#"{"id":"1","choices":[]}"#),
        42,
        &mut sink,
    )
    .await
    .expect("response should normalize");

    assert_eq!(
        usage,
        Some(Usage {
            prompt_tokens: 42,
            completion_tokens: 0,
            total_tokens: 42,
        })
    );
}

#[tokio::test]
async fn test_handle_chat_response_maps_status_error() {
    let mut sink = CollectedResponse::default();

    let err = handle_chat_response(
        ProviderReply::buffered(
            401,
            r#"{"error":{"code":"1002","message":"Authorization Token invalid"}}"#,
        ),
        0,
        &mut sink,
    )
    .await
    .expect_err("401 should fail");

    assert_eq!(
        err,
        AdaptorError::Provider {
            status_code: 401,
            code: Some("1002".to_string()),
            error_type: None,
            message: "Authorization Token invalid".to_string(),
        }
    );
    assert_eq!(sink, CollectedResponse::default());
}

#[tokio::test]
async fn test_handle_chat_response_rejects_malformed_payload() {
    let mut sink = CollectedResponse::default();

    let err = handle_chat_response(ProviderReply::buffered(200, "not json"), 0, &mut sink)
        .await
        .expect_err("malformed payload should fail");

    assert!(matches!(err, AdaptorError::Decode { ref stage, .. } if stage == "chat_response"));
}

#[tokio::test]
async fn test_handle_chat_stream_accumulates_usage_and_text() {
    let reply = streaming_reply(&[
        "data: {\"id\":\"1\",\"choices\":[{\"index\":0,\"delta\":{\"role\":\"assistant\",\"content\":\"Hel\"}}]}\n\n",
        "data: {\"id\":\"1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"lo\"}}]}\n",
        "\n",
        "data: {\"id\":\"1\",\"choices\":[{\"index\":0,\"finish_reason\":\"stop\",\"delta\":{\"content\":\"\"}}],\"usage\":{\"prompt_tokens\":5,\"completion_tokens\":2,\"total_tokens\":7}}\n\n",
        "data: [DONE]\n\n",
    ]);
    let mut sink = CollectedResponse::default();

    let outcome = handle_chat_stream(reply, &mut sink)
        .await
        .expect("stream should drain");

    assert_eq!(outcome.text, "Hello");
    assert_eq!(
        outcome.usage,
        Some(Usage {
            prompt_tokens: 5,
            completion_tokens: 2,
            total_tokens: 7,
        })
    );
    assert_eq!(sink.events.len(), 4);
    assert_eq!(sink.events.last().map(String::as_str), Some("[DONE]"));
    assert_eq!(sink.event_json().len(), 3);
}

#[tokio::test]
async fn test_handle_chat_stream_without_usage_reports_none() {
    let reply = streaming_reply(&[
        "data: {\"id\":\"1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"x\"}}]}\n\n",
        "data: [DONE]\n\n",
    ]);
    let mut sink = CollectedResponse::default();

    let outcome = handle_chat_stream(reply, &mut sink)
        .await
        .expect("stream should drain");

    assert_eq!(outcome.usage, None);
    assert_eq!(outcome.text, "x");
}

#[tokio::test]
async fn test_handle_chat_stream_surfaces_mid_stream_error() {
    let reply = streaming_reply(&[
        "data: {\"id\":\"1\",\"choices\":[{\"index\":0,\"delta\":{\"content\":\"x\"}}],\"usage\":{\"prompt_tokens\":1,\"completion_tokens\":1,\"total_tokens\":2}}\n\n",
        "data: {\"error\":{\"code\":\"1301\",\"message\":\"unsafe content\"}}\n\n",
    ]);
    let mut sink = CollectedResponse::default();

    let err = handle_chat_stream(reply, &mut sink)
        .await
        .expect_err("error payload should end the stream");

    assert_eq!(
        err,
        AdaptorError::Provider {
            status_code: 500,
            code: Some("1301".to_string()),
            error_type: None,
            message: "unsafe content".to_string(),
        }
    );
    assert_eq!(sink.events.len(), 1);
}

#[tokio::test]
async fn test_handle_chat_stream_rejects_json_error_body() {
    let reply = streaming_reply(&[
        "\n  ",
        "{\"error\":{\"code\":\"1214\",",
        "\"message\":\"messages invalid\"}}",
    ]);
    let mut sink = CollectedResponse::default();

    let err = handle_chat_stream(reply, &mut sink)
        .await
        .expect_err("json error body should fail");

    assert_eq!(
        err,
        AdaptorError::Provider {
            status_code: 500,
            code: Some("1214".to_string()),
            error_type: None,
            message: "messages invalid".to_string(),
        }
    );
    assert_eq!(sink, CollectedResponse::default());
}

#[tokio::test]
async fn test_handle_chat_stream_rejects_json_body_without_error() {
    let reply = streaming_reply(&["{\"id\":\"1\",\"choices\":[]}"]);
    let mut sink = CollectedResponse::default();

    let err = handle_chat_stream(reply, &mut sink)
        .await
        .expect_err("json body should fail");

    assert!(matches!(err, AdaptorError::Decode { ref stage, .. } if stage == "event_stream"));
    assert!(sink.events.is_empty());
}

#[tokio::test]
async fn test_handle_chat_stream_surfaces_transport_failure() {
    let chunks: Vec<Result<Bytes, AdaptorError>> = vec![
        Ok(Bytes::from_static(
            b"data: {\"id\":\"1\",\"choices\":[]}\n\n",
        )),
        Err(AdaptorError::transport("connection reset by peer")),
    ];
    let reply = ProviderReply::streaming(200, Box::pin(stream::iter(chunks)));
    let mut sink = CollectedResponse::default();

    let err = handle_chat_stream(reply, &mut sink)
        .await
        .expect_err("broken stream should fail");

    assert_eq!(err, AdaptorError::transport("connection reset by peer"));
}

#[tokio::test]
async fn test_handle_image_response_passes_body_through() {
    let body = r#"{"created":1703485556,"data":[{"url":"https://example.com/cat.png"}]}"#;
    let mut sink = CollectedResponse::default();

    let usage = handle_image_response(ProviderReply::buffered(200, body), &mut sink)
        .await
        .expect("image response should normalize");

    assert_eq!(usage, None);
    assert_eq!(
        sink.body_json().and_then(|value| value.pointer("/data/0/url").cloned()),
        Some(json!("https://example.com/cat.png"))
    );

    let err = handle_image_response(
        ProviderReply::buffered(400, r#"{"error":{"code":"1210","message":"bad prompt"}}"#),
        &mut CollectedResponse::default(),
    )
    .await
    .expect_err("status error should fail");
    assert_eq!(err.status_code(), 400);
}
