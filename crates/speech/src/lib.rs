//! Integration with the external AI voice/translation service.
//!
//! The service is asynchronous: every request returns an opaque task id and
//! the result arrives later through a webhook carrying that id. This crate
//! only speaks the HTTP surface; correlation of task ids back to in-flight
//! work lives in the pipeline crate.

use std::time::Duration;

use anyhow::{Context, Result};
use async_trait::async_trait;
use serde::{Deserialize, Serialize};

#[derive(Debug, Clone)]
pub struct SpeechConfig {
    pub base_url: String,
    pub request_timeout_secs: u64,
}

#[derive(Debug, Clone)]
pub struct VoiceProcessRequest {
    pub audio_url: String,
    pub model_id: String,
    pub source_language: String,
    pub target_language: String,
    pub gender: Option<String>,
}

/// Inbound `inference-result` webhook payload. Field casing mirrors the
/// external service exactly.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct InferenceCallback {
    #[serde(rename = "RequestId")]
    pub request_id: String,
    #[serde(rename = "modelId", default)]
    pub model_id: Option<String>,
    #[serde(rename = "Success")]
    pub success: String,
    #[serde(rename = "ErrorMessage", default)]
    pub error_message: Option<String>,
}

impl InferenceCallback {
    pub fn is_success(&self) -> bool {
        self.success == "true"
    }
}

/// Inbound `training-result` webhook payload. The service uses different
/// field casing here than for inference results.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct TrainingCallback {
    #[serde(rename = "RequestId")]
    pub request_id: String,
    #[serde(rename = "modelId", default)]
    pub model_id: Option<String>,
    pub success: String,
    #[serde(rename = "errorMessage", default)]
    pub error_message: Option<String>,
}

impl TrainingCallback {
    pub fn is_success(&self) -> bool {
        self.success == "true"
    }
}

#[derive(Debug, Deserialize)]
struct TaskResponse {
    task_id: String,
}

/// Outbound surface of the AI service. All methods return the opaque task id
/// the service will later reference from its webhook.
#[async_trait]
pub trait SpeechService: Send + Sync {
    async fn process_voice(&self, request: VoiceProcessRequest) -> Result<String>;
    async fn process_text(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String>;
    async fn fetch_voice_result(&self, task_id: &str) -> Result<(Vec<u8>, String)>;
    async fn fetch_text_result(&self, task_id: &str) -> Result<String>;
    async fn train_voice(&self, audio: Vec<u8>, model_id: &str, language: &str) -> Result<String>;
}

pub struct HttpSpeechService {
    client: reqwest::Client,
    base_url: String,
}

impl HttpSpeechService {
    pub fn new(config: &SpeechConfig) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(Duration::from_secs(config.request_timeout_secs))
            .build()
            .context("failed to build speech service http client")?;
        Ok(Self {
            client,
            base_url: config.base_url.trim_end_matches('/').to_string(),
        })
    }

    async fn fetch_source_audio(&self, audio_url: &str) -> Result<Vec<u8>> {
        let response = self
            .client
            .get(audio_url)
            .send()
            .await
            .with_context(|| format!("failed to fetch source audio from '{audio_url}'"))?
            .error_for_status()
            .with_context(|| format!("source audio fetch from '{audio_url}' failed"))?;
        Ok(response.bytes().await?.to_vec())
    }
}

#[async_trait]
impl SpeechService for HttpSpeechService {
    async fn process_voice(&self, request: VoiceProcessRequest) -> Result<String> {
        let audio = self.fetch_source_audio(&request.audio_url).await?;

        let form = reqwest::multipart::Form::new()
            .part(
                "audio",
                reqwest::multipart::Part::bytes(audio).file_name("audio.wav"),
            )
            .text("model_id", request.model_id)
            .text("source_language", request.source_language)
            .text("target_language", request.target_language)
            .text("gender", request.gender.unwrap_or_else(|| "neutral".into()));

        let response: TaskResponse = self
            .client
            .post(format!("{}/voice/process", self.base_url))
            .multipart(form)
            .send()
            .await
            .context("voice process request failed")?
            .error_for_status()
            .context("voice process request rejected")?
            .json()
            .await
            .context("invalid voice process response")?;
        Ok(response.task_id)
    }

    async fn process_text(
        &self,
        text: &str,
        source_language: &str,
        target_language: &str,
    ) -> Result<String> {
        let response: TaskResponse = self
            .client
            .post(format!("{}/text/process", self.base_url))
            .json(&serde_json::json!({
                "text": text,
                "source_language": source_language,
                "target_language": target_language,
            }))
            .send()
            .await
            .context("text process request failed")?
            .error_for_status()
            .context("text process request rejected")?
            .json()
            .await
            .context("invalid text process response")?;
        Ok(response.task_id)
    }

    async fn fetch_voice_result(&self, task_id: &str) -> Result<(Vec<u8>, String)> {
        let response = self
            .client
            .get(format!("{}/voice/result/{task_id}", self.base_url))
            .send()
            .await
            .context("voice result request failed")?
            .error_for_status()
            .context("voice result request rejected")?;

        let content_type = response
            .headers()
            .get(reqwest::header::CONTENT_TYPE)
            .and_then(|value| value.to_str().ok())
            .unwrap_or("application/octet-stream")
            .to_string();
        let bytes = response.bytes().await?.to_vec();
        Ok((bytes, content_type))
    }

    async fn fetch_text_result(&self, task_id: &str) -> Result<String> {
        let text = self
            .client
            .get(format!("{}/text/result/{task_id}", self.base_url))
            .send()
            .await
            .context("text result request failed")?
            .error_for_status()
            .context("text result request rejected")?
            .text()
            .await
            .context("invalid text result response")?;
        Ok(text)
    }

    async fn train_voice(&self, audio: Vec<u8>, model_id: &str, language: &str) -> Result<String> {
        let form = reqwest::multipart::Form::new()
            .part(
                "audio",
                reqwest::multipart::Part::bytes(audio).file_name("sample.wav"),
            )
            .text("model_id", model_id.to_string())
            .text("language", language.to_string());

        let response: TaskResponse = self
            .client
            .post(format!("{}/voice/train", self.base_url))
            .multipart(form)
            .send()
            .await
            .context("voice training request failed")?
            .error_for_status()
            .context("voice training request rejected")?
            .json()
            .await
            .context("invalid voice training response")?;
        Ok(response.task_id)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn inference_callback_success_flag_is_literal_true() {
        let callback: InferenceCallback = serde_json::from_str(
            r#"{"RequestId":"t-1","Success":"true","ErrorMessage":null}"#,
        )
        .expect("parse");
        assert!(callback.is_success());

        let callback: InferenceCallback =
            serde_json::from_str(r#"{"RequestId":"t-2","Success":"False"}"#).expect("parse");
        assert!(!callback.is_success());
    }

    #[test]
    fn training_callback_uses_lowercase_fields() {
        let callback: TrainingCallback = serde_json::from_str(
            r#"{"RequestId":"t-3","modelId":"m-1","success":"true","errorMessage":null}"#,
        )
        .expect("parse");
        assert!(callback.is_success());
        assert_eq!(callback.model_id.as_deref(), Some("m-1"));
    }
}
