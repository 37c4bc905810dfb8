//! The seam between chat sessions and whatever runs the model.

use std::{fmt, path::PathBuf};

use serde::{Deserialize, Serialize};

use crate::{config::InferenceConfig, Result};

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum Role {
    System,
    User,
    Assistant,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ImageUrl {
    pub url: String,
}

/// One part of a multimodal message, in the OpenAI content-part layout.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum ContentPart {
    Text { text: String },
    ImageUrl { image_url: ImageUrl },
}

impl ContentPart {
    pub fn text(text: impl Into<String>) -> Self {
        Self::Text { text: text.into() }
    }

    pub fn image_url(url: impl Into<String>) -> Self {
        Self::ImageUrl {
            image_url: ImageUrl { url: url.into() },
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(untagged)]
pub enum MessageContent {
    Text(String),
    Parts(Vec<ContentPart>),
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: Role,
    pub content: MessageContent,
}

impl ChatMessage {
    pub fn system(text: impl Into<String>) -> Self {
        Self {
            role: Role::System,
            content: MessageContent::Text(text.into()),
        }
    }

    pub fn user(parts: Vec<ContentPart>) -> Self {
        Self {
            role: Role::User,
            content: MessageContent::Parts(parts),
        }
    }
}

/// An incremental piece of a streamed response.
///
/// A well-formed stream opens with a [`Fragment::Role`] and continues with
/// [`Fragment::Content`] deltas.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Fragment {
    Role(String),
    Content(String),
}

impl Fragment {
    pub fn as_content(&self) -> Option<&str> {
        match self {
            Self::Content(text) => Some(text),
            Self::Role(_) => None,
        }
    }
}

impl fmt::Display for Fragment {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Role(role) => write!(f, "{role}: "),
            Self::Content(text) => f.write_str(text),
        }
    }
}

/// Lazily produced response fragments. Dropping the iterator abandons the rest
/// of the response.
pub type FragmentStream<'a> = Box<dyn Iterator<Item = Result<Fragment>> + 'a>;

/// Everything an engine needs to bring a model up.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct LoadRequest {
    pub model_path: PathBuf,
    pub projector_path: Option<PathBuf>,
    pub context_size: usize,
    /// Layers to offload to the GPU, negative for all of them.
    pub gpu_layers: i32,
    pub chat_template: Option<String>,
}

/// Something that can turn model files into a ready-to-chat handle.
pub trait InferenceEngine {
    type Handle: EngineHandle;

    fn load(&self, request: &LoadRequest) -> Result<Self::Handle>;
}

/// A loaded model.
pub trait EngineHandle {
    /// Start a streamed chat completion. Fragments are pulled on demand.
    fn stream_chat(
        &self,
        messages: &[ChatMessage],
        config: &InferenceConfig,
    ) -> Result<FragmentStream<'_>>;
}

#[cfg(test)]
mod tests {
    use serde_json::json;

    use super::*;

    #[test]
    fn user_message_uses_content_parts() {
        let msg = ChatMessage::user(vec![
            ContentPart::image_url("data:image/png;base64,AAAA"),
            ContentPart::text("What is this?"),
        ]);
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({
                "role": "user",
                "content": [
                    {"type": "image_url", "image_url": {"url": "data:image/png;base64,AAAA"}},
                    {"type": "text", "text": "What is this?"}
                ]
            })
        );
    }

    #[test]
    fn system_message_is_plain_text() {
        let msg = ChatMessage::system("Be brief.");
        assert_eq!(
            serde_json::to_value(&msg).unwrap(),
            json!({"role": "system", "content": "Be brief."})
        );
    }

    #[test]
    fn fragments_render_like_a_transcript() {
        let rendered: String = [
            Fragment::Role("assistant".to_string()),
            Fragment::Content("A cat".to_string()),
            Fragment::Content(".".to_string()),
        ]
        .iter()
        .map(ToString::to_string)
        .collect();
        assert_eq!(rendered, "assistant: A cat.");
    }
}
