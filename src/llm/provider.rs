use async_trait::async_trait;

use crate::errors::HarnessResult;
use crate::llm::types::{ChatMessage, ModelResponse};

/// A chat model the harness can query. One call is one round.
#[async_trait]
pub trait ModelClient: Send + Sync {
    /// Identifier used in logs and history records.
    fn name(&self) -> &str;

    async fn chat(&self, messages: Vec<ChatMessage>) -> HarnessResult<ModelResponse>;
}
