//! Model decorators
//!
//! A decorator wraps a built model in another object implementing the same
//! trait. Decorators compose: the factory applies them in the order given,
//! so the last one is outermost.

mod buffered;
mod observed;

#[cfg(test)]
pub(crate) mod fixtures;

pub use buffered::*;
pub use observed::*;

use crate::error::LlmError;
use crate::model::{ChatModel, EmbeddingModel, Llm};

pub trait Decorator: Send + Sync {
    /// Name used in logs and errors
    fn name(&self) -> &'static str;

    fn decorate_chat(&self, model: Box<dyn ChatModel>) -> Result<Box<dyn ChatModel>, LlmError>;

    /// Embedding models are not decorated unless a decorator opts in
    fn decorate_embedding(
        &self,
        model: Box<dyn EmbeddingModel>,
    ) -> Result<Box<dyn EmbeddingModel>, LlmError> {
        drop(model);
        Err(LlmError::UnsupportedDecorator {
            decorator: self.name(),
            kind: "embedding",
        })
    }

    fn decorate(&self, llm: Llm) -> Result<Llm, LlmError> {
        match llm {
            Llm::Chat(model) => Ok(Llm::Chat(self.decorate_chat(model)?)),
            Llm::Embedding(model) => Ok(Llm::Embedding(self.decorate_embedding(model)?)),
        }
    }
}
