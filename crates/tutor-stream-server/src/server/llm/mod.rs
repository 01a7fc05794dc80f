//! LLM collaborators.
//!
//! A backend turns a rendered [`Prompt`] into a lazy, finite stream of text
//! fragments. Streams are not restartable; dropping one abandons the
//! underlying request on a best-effort basis.
//!
//! - [`openai`] - OpenAI-compatible `/chat/completions` streaming backend.

pub mod openai;

use crate::server::prompt::Prompt;
use futures::stream::BoxStream;
use tutor_stream_core::Result;

pub use openai::OpenAiBackend;

/// Stream of generated text fragments. An `Err` item ends the generation.
pub type TextStream = BoxStream<'static, Result<String>>;

pub trait LlmBackend: Send + Sync + 'static {
    fn stream(&self, prompt: Prompt) -> TextStream;
}
