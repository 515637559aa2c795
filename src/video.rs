//! Video upload, transcription and analysis.
//!
//! The backend does the work; the client starts each stage and polls
//! `/videos/{id}/status` until the stage is reached, the backend reports a
//! failure, or the stage's time window runs out.

use std::path::Path;
use std::sync::Arc;

use reqwest::multipart::{Form, Part};
use tokio::time::Instant;
use tracing::{debug, info};

use crate::auth::AuthorizedTransport;
use crate::config::{PollPolicy, VideoPollConfig};
use crate::error::{ClientError, ClientResult};
use crate::protocol::{VideoStage, VideoStatus, VideoUpload, media_type_for};

pub struct VideoClient {
    transport: Arc<AuthorizedTransport>,
    polling: VideoPollConfig,
}

impl VideoClient {
    pub fn new(transport: Arc<AuthorizedTransport>, polling: VideoPollConfig) -> Self {
        Self { transport, polling }
    }

    pub async fn upload(
        &self,
        path: &Path,
        conversation_id: Option<&str>,
    ) -> ClientResult<VideoUpload> {
        let data = tokio::fs::read(path).await?;
        let file_name = path
            .file_name()
            .and_then(|name| name.to_str())
            .unwrap_or("video")
            .to_string();
        self.upload_bytes(data, &file_name, media_type_for(path), conversation_id)
            .await
    }

    pub async fn upload_bytes(
        &self,
        data: Vec<u8>,
        file_name: &str,
        mime_type: &str,
        conversation_id: Option<&str>,
    ) -> ClientResult<VideoUpload> {
        let conversation_id = conversation_id.filter(|id| !id.trim().is_empty());
        let upload: VideoUpload = self
            .transport
            .post_multipart_json("/videos/upload", || {
                let part = Part::bytes(data.clone())
                    .file_name(file_name.to_string())
                    .mime_str(mime_type)?;
                let mut form = Form::new().part("file", part);
                if let Some(id) = conversation_id {
                    form = form.text("conversation_id", id.to_string());
                }
                Ok(form)
            })
            .await?;

        info!(video = %upload.video_id, bytes = data.len(), "video uploaded");
        Ok(upload)
    }

    pub async fn start_transcription(&self, video_id: &str) -> ClientResult<()> {
        self.transport
            .post_empty(&format!("/videos/{}/transcribe", video_id))
            .await
    }

    pub async fn start_analysis(&self, video_id: &str) -> ClientResult<()> {
        self.transport
            .post_empty(&format!("/videos/{}/analyze", video_id))
            .await
    }

    pub async fn status(&self, video_id: &str) -> ClientResult<VideoStatus> {
        self.transport
            .get_json(&format!("/videos/{}/status", video_id))
            .await
    }

    /// Polls until `target` is reached. Every observed status is passed to
    /// `on_progress`, including the final one.
    pub async fn wait_for<F>(
        &self,
        video_id: &str,
        target: VideoStage,
        policy: PollPolicy,
        operation: &'static str,
        mut on_progress: F,
    ) -> ClientResult<VideoStatus>
    where
        F: FnMut(&VideoStatus),
    {
        let deadline = Instant::now() + policy.timeout;

        loop {
            let status = self.status(video_id).await?;
            on_progress(&status);

            if status.status == VideoStage::Failed {
                let reason = status
                    .error
                    .unwrap_or_else(|| format!("{} failed", operation));
                return Err(ClientError::VideoFailed(reason));
            }
            if status.status.has_reached(target) {
                return Ok(status);
            }

            let now = Instant::now();
            if now >= deadline {
                return Err(ClientError::Timeout {
                    operation,
                    waited: policy.timeout,
                });
            }
            debug!(
                video = %video_id,
                stage = ?status.status,
                progress = ?status.progress,
                "waiting for video stage"
            );
            tokio::time::sleep(policy.interval.min(deadline - now)).await;
        }
    }

    /// Upload, transcribe, then analyze, using the configured poll windows.
    pub async fn process<F>(
        &self,
        path: &Path,
        conversation_id: Option<&str>,
        mut on_progress: F,
    ) -> ClientResult<VideoStatus>
    where
        F: FnMut(&VideoStatus),
    {
        let upload = self.upload(path, conversation_id).await?;
        let video_id = upload.video_id.as_str();

        self.start_transcription(video_id).await?;
        self.wait_for(
            video_id,
            VideoStage::Transcribed,
            self.polling.transcription,
            "video transcription",
            &mut on_progress,
        )
        .await?;

        self.start_analysis(video_id).await?;
        self.wait_for(
            video_id,
            VideoStage::Analyzed,
            self.polling.analysis,
            "video analysis",
            &mut on_progress,
        )
        .await
    }
}
