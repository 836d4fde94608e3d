pub mod error;
mod llm;

pub use error::ExternalError;
pub use llm::{LLMConfig, LanguageModel, ModelRequest, OllamaClient};

#[cfg(test)]
pub use llm::MockLanguageModel;
