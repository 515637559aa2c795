use std::path::Path;

use reqwest::multipart::{Form, Part};
use serde::{Deserialize, Serialize};

use crate::error::ClientResult;

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct HistoryTurn {
    pub role: String,
    pub content: String,
}

impl HistoryTurn {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }

    pub fn assistant(content: impl Into<String>) -> Self {
        Self {
            role: "assistant".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ImageAttachment {
    pub data: Vec<u8>,
    pub file_name: String,
    pub mime_type: String,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RemoteImage {
    pub url: String,
    pub mime_type: String,
}

/// One user-initiated send. Built once and never mutated after dispatch.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ChatRequest {
    pub message: String,
    pub image: Option<ImageAttachment>,
    /// Takes precedence over `image` when both are set.
    pub image_url: Option<RemoteImage>,
    pub history: Vec<HistoryTurn>,
    pub conversation_id: Option<String>,
}

impl ChatRequest {
    pub fn new(message: impl Into<String>) -> Self {
        Self {
            message: message.into(),
            ..Self::default()
        }
    }

    pub fn with_image(mut self, image: ImageAttachment) -> Self {
        self.image = Some(image);
        self
    }

    pub fn with_image_url(mut self, url: impl Into<String>, mime_type: impl Into<String>) -> Self {
        self.image_url = Some(RemoteImage {
            url: url.into(),
            mime_type: mime_type.into(),
        });
        self
    }

    pub fn with_history(mut self, history: Vec<HistoryTurn>) -> Self {
        self.history = history;
        self
    }

    pub fn with_conversation(mut self, conversation_id: impl Into<String>) -> Self {
        self.conversation_id = Some(conversation_id.into());
        self
    }

    /// Multipart body for `/chat/stream`. Called once per attempt because a
    /// `Form` cannot be reused after it has been sent.
    pub fn to_form(&self) -> ClientResult<Form> {
        let mut form = Form::new().text("message", self.message.clone());

        if let Some(remote) = &self.image_url {
            form = form
                .text("image_url", remote.url.clone())
                .text("image_mime_type", remote.mime_type.clone());
        } else if let Some(image) = &self.image {
            let part = Part::bytes(image.data.clone())
                .file_name(image.file_name.clone())
                .mime_str(&image.mime_type)?;
            form = form.part("image", part);
        }

        if !self.history.is_empty() {
            form = form.text("history", serde_json::to_string(&self.history)?);
        }

        if let Some(conversation_id) = self
            .conversation_id
            .as_deref()
            .filter(|id| !id.trim().is_empty())
        {
            form = form.text("conversation_id", conversation_id.to_string());
        }

        Ok(form)
    }
}

/// Media type from the file extension, for the image and video uploads.
pub fn media_type_for(path: &Path) -> &'static str {
    let extension = path
        .extension()
        .and_then(|ext| ext.to_str())
        .map(str::to_ascii_lowercase)
        .unwrap_or_default();

    match extension.as_str() {
        "png" => "image/png",
        "jpg" | "jpeg" => "image/jpeg",
        "gif" => "image/gif",
        "webp" => "image/webp",
        "heic" => "image/heic",
        "mp4" | "m4v" => "video/mp4",
        "mov" => "video/quicktime",
        "webm" => "video/webm",
        "mkv" => "video/x-matroska",
        "avi" => "video/x-msvideo",
        _ => "application/octet-stream",
    }
}

#[derive(Debug, Deserialize)]
pub(crate) struct RefreshResponse {
    pub(crate) access_token: String,
}

#[derive(Debug, Default, Deserialize)]
pub(crate) struct ErrorBody {
    #[serde(default)]
    pub(crate) error: Option<String>,
    #[serde(default)]
    pub(crate) message: Option<String>,
}

impl ErrorBody {
    pub(crate) fn into_message(self) -> Option<String> {
        self.error.or(self.message)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Conversation {
    pub id: String,
    #[serde(default)]
    pub title: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub updated_at: Option<String>,
}

#[derive(Debug, Serialize)]
pub(crate) struct ConversationTitle<'a> {
    pub(crate) title: &'a str,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Message {
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    pub role: String,
    pub content: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub image_url: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub created_at: Option<String>,
}

impl From<&Message> for HistoryTurn {
    fn from(message: &Message) -> Self {
        Self {
            role: message.role.clone(),
            content: message.content.clone(),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct VideoUpload {
    pub video_id: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VideoStage {
    Uploaded,
    Transcribing,
    Transcribed,
    Analyzing,
    Analyzed,
    Failed,
    /// A stage this client does not know yet. Never counts as reached.
    /// Discriminant -1 keeps it ordered below every known stage.
    #[serde(other)]
    Unknown = -1,
}

impl VideoStage {
    pub fn has_reached(self, target: VideoStage) -> bool {
        !matches!(self, VideoStage::Failed | VideoStage::Unknown) && self >= target
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct VideoStatus {
    pub status: VideoStage,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    /// Percentage as reported by the backend; may be fractional.
    pub progress: Option<f64>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub transcript: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub analysis: Option<serde_json::Value>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub error: Option<String>,
}
