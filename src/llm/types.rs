use serde::{Deserialize, Serialize};

use crate::errors::{HarnessError, HarnessResult};

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self { role: "system".into(), content: MessageContent::Text(text.into()) }
    }

    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self { role: "user".into(), content: MessageContent::Parts(parts) }
    }

    pub fn assistant(text: impl Into<String>) -> Self {
        Self { role: "assistant".into(), content: MessageContent::Text(text.into()) }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image(url: impl Into<String>) -> Self {
        Self::ImageUrl { image_url: ImageUrl { url: url.into() } }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// The assistant's reply for one round.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ModelResponse {
    pub parts: Vec<ContentPart>,
}

impl ModelResponse {
    pub fn from_text(text: impl Into<String>) -> Self {
        Self { parts: vec![ContentPart::text(text)] }
    }

    /// The one text segment every round must carry.
    pub fn single_text(&self) -> HarnessResult<&str> {
        match self.parts.as_slice() {
            [ContentPart::Text { text }] => Ok(text),
            [_] => Err(HarnessError::Model("response part is not text".into())),
            parts => Err(HarnessError::Model(format!(
                "expected exactly one content part, got {}",
                parts.len()
            ))),
        }
    }
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ModelConfig {
    pub api_base: String,
    pub model: String,
    pub temperature: f32,
    pub max_tokens: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn single_text_rejects_images_and_counts() {
        assert_eq!(ModelResponse::from_text("hi").single_text().unwrap(), "hi");
        let img = ModelResponse { parts: vec![ContentPart::image("data:x")] };
        assert!(img.single_text().is_err());
        assert!(ModelResponse::default().single_text().is_err());
    }

    #[test]
    fn parts_serialize_openai_style() {
        let json = serde_json::to_value(ContentPart::image("u")).unwrap();
        assert_eq!(json, serde_json::json!({"type": "image_url", "image_url": {"url": "u"}}));
    }
}
