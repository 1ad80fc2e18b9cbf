use anyhow::{bail, Context, Result};
use reqwest::Client;
use serde_json::{json, Value};
use std::time::Duration;

use crate::config::ModelConfig;
use crate::device::Screenshot;

const REQUEST_TIMEOUT: Duration = Duration::from_secs(120);

/// Minimal client for OpenAI-compatible `/chat/completions` endpoints with image input.
#[derive(Clone)]
pub struct ChatClient {
    http: Client,
    cfg: ModelConfig,
}

impl ChatClient {
    pub fn new(cfg: ModelConfig) -> Result<Self> {
        if cfg.api_key.is_empty() {
            bail!("API key missing for model {}", cfg.model);
        }
        let http = Client::builder()
            .timeout(REQUEST_TIMEOUT)
            .build()
            .context("failed to build HTTP client")?;
        Ok(Self { http, cfg })
    }

    pub fn model(&self) -> &str {
        &self.cfg.model
    }

    /// One user turn with `images` attached after the text, returning the reply text.
    pub async fn complete(
        &self,
        system: Option<&str>,
        prompt: &str,
        images: &[&Screenshot],
    ) -> Result<String> {
        let url = format!("{}/chat/completions", self.cfg.api_base.trim_end_matches('/'));

        let mut content = vec![json!({ "type": "text", "text": prompt })];
        content.extend(images.iter().map(|shot| {
            json!({ "type": "image_url", "image_url": { "url": shot.to_data_url() } })
        }));
        let mut messages = Vec::new();
        if let Some(system) = system {
            messages.push(json!({ "role": "system", "content": system }));
        }
        messages.push(json!({ "role": "user", "content": content }));

        let req = json!({
            "model": self.cfg.model,
            "temperature": self.cfg.temperature,
            "max_tokens": self.cfg.max_tokens,
            "messages": messages,
        });

        let resp = self
            .http
            .post(url)
            .bearer_auth(&self.cfg.api_key)
            .json(&req)
            .send()
            .await?;
        let status = resp.status();
        let text = resp.text().await?;
        if !status.is_success() {
            bail!("model API error {}: {}", status, text);
        }
        let v: Value = serde_json::from_str(&text).context("failed to parse chat completion JSON")?;
        Self::parse_reply(&v)
    }

    fn parse_reply(v: &Value) -> Result<String> {
        let content = v
            .pointer("/choices/0/message/content")
            .context("missing choices[0].message.content")?;
        match content {
            Value::String(s) => Ok(s.trim().to_string()),
            // Some servers return content parts even for plain replies.
            Value::Array(parts) => Ok(parts
                .iter()
                .filter_map(|p| p.get("text").and_then(|t| t.as_str()))
                .collect::<Vec<_>>()
                .join("")
                .trim()
                .to_string()),
            Value::Null => Ok(String::new()),
            other => bail!("unexpected message content: {other}"),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn reads_string_and_part_content() {
        let plain = json!({ "choices": [{ "message": { "content": "  Thought: ok\nAction: wait()\n" } }] });
        assert_eq!(ChatClient::parse_reply(&plain).unwrap(), "Thought: ok\nAction: wait()");

        let parts = json!({ "choices": [{ "message": { "content": [
            { "type": "text", "text": "{\"completed\": " },
            { "type": "text", "text": "false}" }
        ] } }] });
        assert_eq!(ChatClient::parse_reply(&parts).unwrap(), "{\"completed\": false}");
    }

    #[test]
    fn missing_choices_is_an_error() {
        assert!(ChatClient::parse_reply(&json!({ "error": "overloaded" })).is_err());
    }

    #[test]
    fn refuses_empty_api_key() {
        let cfg = ModelConfig {
            api_key: String::new(),
            ..ModelConfig::from_env("DROID_HANDS_TEST_UNSET")
        };
        assert!(ChatClient::new(cfg).is_err());
    }
}
