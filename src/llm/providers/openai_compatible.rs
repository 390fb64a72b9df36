use async_trait::async_trait;

use crate::errors::{HarnessError, HarnessResult};
use crate::llm::provider::ModelClient;
use crate::llm::types::{ChatMessage, ContentPart, ModelConfig, ModelResponse};

pub struct OpenAiCompatibleClient {
    id: String,
    config: ModelConfig,
    api_key: String,
    client: reqwest::Client,
}

impl OpenAiCompatibleClient {
    pub fn new(id: String, config: ModelConfig, api_key: String) -> Self {
        Self {
            id,
            config,
            api_key,
            client: reqwest::Client::new(),
        }
    }
}

#[async_trait]
impl ModelClient for OpenAiCompatibleClient {
    fn name(&self) -> &str {
        &self.id
    }

    async fn chat(&self, messages: Vec<ChatMessage>) -> HarnessResult<ModelResponse> {
        let body = serde_json::json!({
            "model": self.config.model,
            "messages": &messages,
            "stream": false,
            "temperature": self.config.temperature,
            "max_tokens": self.config.max_tokens,
        });

        tracing::debug!(
            provider = %self.id,
            model = %self.config.model,
            messages = messages.len(),
            "sending model request"
        );
        tracing::debug!(
            body = %sanitized_body(&body),
            "request body (sanitized, base64 omitted)"
        );

        let response = self
            .client
            .post(&self.config.api_base)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let err_body = response.text().await.unwrap_or_default();
            return Err(HarnessError::Model(format!("{}: {}", status, err_body)));
        }

        let json: serde_json::Value = response.json().await?;
        let reply = response_from_json(&json)?;
        tracing::info!(parts = reply.parts.len(), "model response received");
        Ok(reply)
    }
}

/// Copy of the request with image payloads blanked, for logging only.
fn sanitized_body(body: &serde_json::Value) -> String {
    let mut log_body = body.clone();
    if let Some(msgs) = log_body.get_mut("messages").and_then(|m| m.as_array_mut()) {
        for msg in msgs {
            let Some(parts) = msg.get_mut("content").and_then(|c| c.as_array_mut()) else {
                continue;
            };
            for part in parts {
                if part.get("type").and_then(|t| t.as_str()) == Some("image_url") {
                    if let Some(url) = part.get_mut("image_url").and_then(|u| u.get_mut("url")) {
                        *url = serde_json::Value::String("<omitted_base64_image>".to_string());
                    }
                }
            }
        }
    }
    serde_json::to_string(&log_body).unwrap_or_default()
}

/// Content of the first choice, either a plain string or a list of parts.
fn response_from_json(json: &serde_json::Value) -> HarnessResult<ModelResponse> {
    let content = &json["choices"][0]["message"]["content"];
    let parts = match content {
        serde_json::Value::String(s) => vec![ContentPart::text(s.clone())],
        serde_json::Value::Array(_) => serde_json::from_value(content.clone())?,
        serde_json::Value::Null => Vec::new(),
        other => {
            return Err(HarnessError::Model(format!("unexpected content: {other}")));
        }
    };
    Ok(ModelResponse { parts })
}
