pub mod provider;
pub mod providers;
pub mod types;

pub use provider::ModelClient;
pub use providers::openai_compatible::OpenAiCompatibleClient;
pub use types::{ChatMessage, ContentPart, ModelResponse};
