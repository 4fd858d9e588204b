use std::io::{self, Write};

use bytes::Bytes;
use reqwest::header::HeaderMap;
use serde_json::{Value, json};
use tracing_subscriber::EnvFilter;
use zhipu_relay::core::traits::ResponseSink;
use zhipu_relay::core::types::{Message, RawRequestBody, RelayMode};
use zhipu_relay::runtime::RelayRuntime;

const DEFAULT_MODEL: &str = "glm-4";

struct CliConfig {
    model: String,
    stream: bool,
}

/// Prints assistant text as it arrives and keeps it for the history.
#[derive(Default)]
struct TerminalSink {
    text: String,
}

impl ResponseSink for TerminalSink {
    fn write_body(&mut self, _status_code: u16, _content_type: &str, body: Bytes) {
        let content = serde_json::from_slice::<Value>(&body)
            .ok()
            .and_then(|value| {
                value
                    .pointer("/choices/0/message/content")
                    .and_then(Value::as_str)
                    .map(str::to_string)
            })
            .unwrap_or_else(|| String::from_utf8_lossy(&body).to_string());
        print!("{content}");
        self.text.push_str(&content);
    }

    fn write_event(&mut self, data: &str) {
        let Ok(chunk) = serde_json::from_str::<Value>(data) else {
            return;
        };
        if let Some(delta) = chunk
            .pointer("/choices/0/delta/content")
            .and_then(Value::as_str)
        {
            print!("{delta}");
            let _ = io::stdout().flush();
            self.text.push_str(delta);
        }
    }
}

#[tokio::main]
async fn main() -> Result<(), Box<dyn std::error::Error>> {
    let _ = dotenvy::dotenv();
    tracing_subscriber::fmt()
        .with_env_filter(EnvFilter::from_default_env())
        .with_writer(io::stderr)
        .init();

    let config = parse_config(std::env::args().skip(1).collect())?;
    let runtime = RelayRuntime::from_env()?;

    eprintln!(
        "glm_chat: model={}, stream={}, base_url={}, commands=/exit /quit /clear",
        config.model,
        config.stream,
        runtime.config().base_url
    );

    let mut history: Vec<Message> = Vec::new();
    let stdin = io::stdin();

    loop {
        print!("> ");
        io::stdout().flush()?;

        let mut input = String::new();
        if stdin.read_line(&mut input)? == 0 {
            break;
        }

        let user_text = input.trim();
        if user_text.is_empty() {
            continue;
        }
        if user_text.eq_ignore_ascii_case("/exit") || user_text.eq_ignore_ascii_case("/quit") {
            break;
        }
        if user_text.eq_ignore_ascii_case("/clear") {
            history.clear();
            println!("(history cleared)");
            continue;
        }

        history.push(Message::text("user", user_text));
        let body = json!({
            "model": config.model,
            "messages": history,
            "stream": config.stream,
        });
        let raw = RawRequestBody::json(serde_json::to_vec(&body)?);

        let mut sink = TerminalSink::default();
        match runtime
            .relay_chat(
                RelayMode::ChatCompletions,
                &HeaderMap::new(),
                &raw,
                0,
                &mut sink,
            )
            .await
        {
            Ok(usage) => {
                println!();
                if let Some(usage) = usage {
                    eprintln!(
                        "(tokens: prompt={}, completion={}, total={})",
                        usage.prompt_tokens,
                        usage.completion_tokens,
                        usage.derived_total_tokens()
                    );
                }
                history.push(Message::text("assistant", sink.text));
            }
            Err(error) => {
                println!();
                eprintln!("error: {error}");
                history.pop();
            }
        }
    }

    Ok(())
}

fn parse_config(args: Vec<String>) -> Result<CliConfig, String> {
    let mut config = CliConfig {
        model: DEFAULT_MODEL.to_string(),
        stream: false,
    };

    let mut args = args.into_iter();
    while let Some(arg) = args.next() {
        match arg.as_str() {
            "--model" => {
                config.model = args
                    .next()
                    .filter(|value| !value.trim().is_empty())
                    .ok_or_else(|| "--model requires a value".to_string())?;
            }
            "--stream" => config.stream = true,
            other => return Err(format!("unknown argument: {other}")),
        }
    }

    Ok(config)
}
