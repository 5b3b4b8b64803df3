//! # Talking-Head Avatar
//!
//! Optional fourth stage of a turn. When `avatar.enabled` is set, the synthesized
//! reply audio is posted to a lip-sync renderer (MuseTalk-style HTTP service) that
//! answers with the URL of the rendered video.
//!
//! ## Renderer contract:
//! - Request: `multipart/form-data` with an `audio` file part and, if configured,
//!   an `image` field naming the source portrait
//! - Response: `{"url": "<video location>"}`

use crate::config::AvatarConfig;
use crate::error::{PipelineError, PipelineResult};
use async_trait::async_trait;
use serde::Deserialize;
use std::path::Path;
use std::sync::Arc;

#[async_trait]
pub trait AvatarRenderer: Send + Sync {
    /// Render a video for the audio at `audio`, returning its URL.
    async fn render(&self, audio: &Path) -> PipelineResult<String>;
}

pub struct HttpAvatarRenderer {
    client: reqwest::Client,
    endpoint: String,
    image: Option<String>,
}

#[derive(Deserialize)]
struct RenderResponse {
    url: String,
}

impl HttpAvatarRenderer {
    pub fn new(client: reqwest::Client, config: &AvatarConfig) -> Self {
        Self {
            client,
            endpoint: config.endpoint.clone(),
            image: config.image.clone(),
        }
    }
}

/// The renderer when the stage is enabled, `None` otherwise.
pub fn from_config(config: &AvatarConfig, http: reqwest::Client) -> Option<Arc<dyn AvatarRenderer>> {
    if !config.enabled {
        return None;
    }
    tracing::info!(endpoint = %config.endpoint, "Avatar rendering enabled");
    Some(Arc::new(HttpAvatarRenderer::new(http, config)))
}

#[async_trait]
impl AvatarRenderer for HttpAvatarRenderer {
    async fn render(&self, audio: &Path) -> PipelineResult<String> {
        let bytes = tokio::fs::read(audio)
            .await
            .map_err(|e| PipelineError::Avatar(format!("cannot read reply audio: {}", e)))?;
        let file_name = audio
            .file_name()
            .map(|n| n.to_string_lossy().into_owned())
            .unwrap_or_else(|| "reply.mp3".to_string());

        let mut form = reqwest::multipart::Form::new().part(
            "audio",
            reqwest::multipart::Part::bytes(bytes).file_name(file_name),
        );
        if let Some(image) = &self.image {
            form = form.text("image", image.clone());
        }

        let response = self
            .client
            .post(&self.endpoint)
            .multipart(form)
            .send()
            .await
            .map_err(|e| PipelineError::Avatar(format!("renderer unavailable: {}", e)))?;
        if !response.status().is_success() {
            return Err(PipelineError::Avatar(format!("renderer returned {}", response.status())));
        }

        let parsed: RenderResponse = response
            .json()
            .await
            .map_err(|e| PipelineError::Avatar(format!("unexpected response: {}", e)))?;
        if parsed.url.trim().is_empty() {
            return Err(PipelineError::Avatar("renderer returned no video".to_string()));
        }
        Ok(parsed.url)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::AppConfig;
    use crate::pipeline::testing::spawn_http_server;
    use actix_web::{web, HttpResponse};

    #[test]
    fn test_disabled_stage_builds_nothing() {
        let config = AppConfig::default();
        assert!(from_config(&config.avatar, reqwest::Client::new()).is_none());
    }

    #[actix_web::test]
    async fn test_render_returns_video_url() {
        let base = spawn_http_server(|cfg| {
            cfg.route(
                "/generate",
                web::post().to(|body: web::Bytes| async move {
                    let has_image = String::from_utf8_lossy(&body).contains("portrait.png");
                    HttpResponse::Ok().json(serde_json::json!({
                        "url": format!("/videos/reply.mp4?image={}", has_image)
                    }))
                }),
            );
        });
        let mut config = AppConfig::default().avatar;
        config.enabled = true;
        config.endpoint = format!("{}/generate", base);
        config.image = Some("portrait.png".to_string());
        let renderer = from_config(&config, reqwest::Client::new()).unwrap();

        let dir = tempfile::tempdir().unwrap();
        let audio = dir.path().join("reply.mp3");
        std::fs::write(&audio, b"ID3").unwrap();

        assert_eq!(renderer.render(&audio).await.unwrap(), "/videos/reply.mp4?image=true");
    }
}
