//! Prompt rendering.
//!
//! The prompt text is deployment specific, so the worker only depends on the
//! [`PromptRenderer`] trait. [`TemplatePrompt`] is the default: a configurable
//! system prompt followed by the trailing history (follow-ups only) and the
//! question.

use crate::server::{
    config::PromptConfig,
    history::{Role, Turn},
};
use serde::Serialize;

const DEFAULT_SYSTEM_PROMPT: &str = "You are a helpful tutor. Answer the user's question clearly, \
     using Markdown for structure. If the question is unrelated to learning, say you don't know.";

const DEFAULT_FOLLOWUP_PROMPT: &str = "You are a helpful tutor continuing a conversation. Use the \
     previous messages as context and answer the user's latest question.";

/// One role-tagged message of a chat prompt.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: String,
}

impl ChatMessage {
    pub fn new(role: Role, content: impl Into<String>) -> Self {
        Self {
            role,
            content: content.into(),
        }
    }
}

/// Rendered prompt handed to the LLM collaborator.
pub type Prompt = Vec<ChatMessage>;

pub trait PromptRenderer: Send + Sync + 'static {
    /// Renders `question`. `followup` selects the conversational prompt even
    /// when `history` is still empty.
    fn render(&self, question: &str, history: &[Turn], followup: bool) -> Prompt;
}

#[derive(Debug, Clone)]
pub struct TemplatePrompt {
    system: String,
    followup_system: String,
}

impl TemplatePrompt {
    pub fn new(config: &PromptConfig) -> Self {
        Self {
            system: config
                .system
                .clone()
                .unwrap_or_else(|| DEFAULT_SYSTEM_PROMPT.to_string()),
            followup_system: config
                .followup_system
                .clone()
                .unwrap_or_else(|| DEFAULT_FOLLOWUP_PROMPT.to_string()),
        }
    }
}

impl Default for TemplatePrompt {
    fn default() -> Self {
        Self::new(&PromptConfig::default())
    }
}

impl PromptRenderer for TemplatePrompt {
    fn render(&self, question: &str, history: &[Turn], followup: bool) -> Prompt {
        let system = if followup {
            &self.followup_system
        } else {
            &self.system
        };

        let mut prompt = Vec::with_capacity(history.len() + 2);
        prompt.push(ChatMessage::new(Role::System, system.as_str()));
        prompt.extend(
            history
                .iter()
                .map(|turn| ChatMessage::new(turn.role, turn.text.as_str())),
        );
        prompt.push(ChatMessage::new(Role::User, question));
        prompt
    }
}
