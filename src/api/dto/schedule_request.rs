use serde::{Deserialize, Serialize};

use crate::scheduler::PromptInput;

#[derive(Debug, Clone, Deserialize)]
pub struct ChatMessageDto {
    pub role: String,
    pub content: String,
}

/// Either shape a caller can submit a prompt in; exactly one field must be
/// present.
#[derive(Debug, Clone, Deserialize)]
#[serde(untagged)]
pub enum PromptDto {
    Text { prompt: String },
    Chat { messages: Vec<ChatMessageDto> },
}

impl From<PromptDto> for PromptInput {
    fn from(dto: PromptDto) -> Self {
        match dto {
            PromptDto::Text { prompt } => PromptInput::Text(prompt),
            PromptDto::Chat { messages } => PromptInput::Chat(
                messages
                    .into_iter()
                    .map(|m| crate::core::tokenizer::ChatMessage {
                        role: m.role,
                        content: m.content,
                    })
                    .collect(),
            ),
        }
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct ScheduleRequest {
    pub model: String,
    pub user_id: String,
    #[serde(default)]
    pub request_id: Option<String>,
    #[serde(flatten)]
    pub prompt: PromptDto,
}

#[derive(Debug, Clone, Serialize)]
pub struct ScheduleResponse {
    pub decode_pod: String,
    pub prefill_pod: Option<String>,
}
