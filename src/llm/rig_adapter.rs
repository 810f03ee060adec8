//! Bridges rig-core completion models to [`LlmProvider`].

use async_trait::async_trait;
use rig::completion::{AssistantContent, CompletionModel, Message};
use tracing::debug;

use crate::error::LlmError;
use crate::llm::provider::{
    ChatMessage, CompletionRequest, CompletionResponse, FinishReason, LlmProvider, Role,
};

/// Wraps any rig `CompletionModel`.
pub struct RigAdapter<M> {
    model: M,
    model_name: String,
}

impl<M: CompletionModel> RigAdapter<M> {
    pub fn new(model: M, model_name: &str) -> Self {
        Self {
            model,
            model_name: model_name.to_string(),
        }
    }
}

/// Split a chat transcript into rig's (preamble, history, prompt) shape.
fn split_messages(messages: Vec<ChatMessage>) -> (Option<String>, Vec<Message>, Option<String>) {
    let mut preamble: Vec<String> = Vec::new();
    let mut history = Vec::new();
    let mut prompt = None;

    let mut iter = messages.into_iter().peekable();
    while let Some(msg) = iter.next() {
        let is_last = iter.peek().is_none();
        match msg.role {
            Role::System => preamble.push(msg.content),
            Role::User if is_last => prompt = Some(msg.content),
            Role::User => history.push(Message::user(msg.content)),
            Role::Assistant => history.push(Message::assistant(msg.content)),
        }
    }

    let preamble = if preamble.is_empty() {
        None
    } else {
        Some(preamble.join("\n\n"))
    };
    (preamble, history, prompt)
}

#[async_trait]
impl<M> LlmProvider for RigAdapter<M>
where
    M: CompletionModel + Send + Sync + 'static,
{
    fn model_name(&self) -> &str {
        &self.model_name
    }

    async fn complete(&self, request: CompletionRequest) -> Result<CompletionResponse, LlmError> {
        let (preamble, history, prompt) = split_messages(request.messages);
        let prompt = prompt.ok_or_else(|| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: "request has no trailing user message".to_string(),
        })?;

        let mut builder = self.model.completion_request(Message::user(prompt));
        if let Some(preamble) = preamble {
            builder = builder.preamble(preamble);
        }
        if !history.is_empty() {
            builder = builder.messages(history);
        }
        if let Some(t) = request.temperature {
            builder = builder.temperature(t as f64);
        }
        if let Some(max) = request.max_tokens {
            builder = builder.max_tokens(max as u64);
        }

        let response = builder.send().await.map_err(|e| LlmError::RequestFailed {
            provider: self.model_name.clone(),
            reason: e.to_string(),
        })?;

        let content: String = response
            .choice
            .iter()
            .filter_map(|c| match c {
                AssistantContent::Text(t) => Some(t.text.clone()),
                _ => None,
            })
            .collect::<Vec<_>>()
            .join("");

        if content.is_empty() {
            return Err(LlmError::InvalidResponse {
                provider: self.model_name.clone(),
                reason: "no text content in response".to_string(),
            });
        }

        debug!(
            model = %self.model_name,
            input_tokens = response.usage.input_tokens,
            output_tokens = response.usage.output_tokens,
            "Completion received"
        );

        Ok(CompletionResponse {
            content,
            input_tokens: response.usage.input_tokens as u32,
            output_tokens: response.usage.output_tokens as u32,
            finish_reason: FinishReason::Stop,
            response_id: None,
        })
    }
}
