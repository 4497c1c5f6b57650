use anyhow::Result;
use async_trait::async_trait;
use dagforge_core::delegate::{AgentDelegate, DelegateOutcome, DelegateRequest};
use serde::{Deserialize, Serialize};
use tracing::{info, warn};

/// Calls a locally-hosted Ollama model via its native chat API.
///
/// Intended for privacy-sensitive plans where task content must not leave
/// the local machine. No tool-calling support, so it only suits jobs whose
/// work is plain text generation rather than repository edits.
pub struct OllamaBackend {
    pub base_url: String,
    pub model: String,
    pub timeout_secs: u64,
}

impl OllamaBackend {
    pub fn new(base_url: impl Into<String>, model: impl Into<String>) -> Self {
        Self {
            base_url: base_url.into(),
            model: model.into(),
            timeout_secs: 300,
        }
    }

    pub fn with_timeout(mut self, secs: u64) -> Self {
        self.timeout_secs = secs;
        self
    }
}

#[derive(Serialize)]
struct OllamaMessage {
    role: String,
    content: String,
}

#[derive(Serialize)]
struct OllamaChatRequest {
    model: String,
    messages: Vec<OllamaMessage>,
    stream: bool,
}

#[derive(Deserialize)]
struct OllamaChatResponse {
    message: OllamaResponseMessage,
}

#[derive(Deserialize)]
struct OllamaResponseMessage {
    content: String,
}

#[async_trait]
impl AgentDelegate for OllamaBackend {
    async fn delegate(&self, request: DelegateRequest) -> Result<DelegateOutcome> {
        let user_content = crate::instruction::build_instruction(&request);
        let model = request.model.clone().unwrap_or_else(|| self.model.clone());

        let messages = vec![OllamaMessage {
            role: "user".into(),
            content: user_content,
        }];
        let body = OllamaChatRequest {
            model: model.clone(),
            messages,
            stream: false,
        };

        info!(base_url = %self.base_url, model, "calling ollama chat API");

        let url = format!("{}/api/chat", self.base_url.trim_end_matches('/'));
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(self.timeout_secs))
            .build()?;

        let response = match client.post(&url).json(&body).send().await {
            Ok(r) => r,
            Err(e) if e.is_timeout() => {
                warn!(timeout_secs = self.timeout_secs, "ollama request timed out");
                return Ok(DelegateOutcome {
                    success: false,
                    error: Some(format!("ollama request timed out after {}s", self.timeout_secs)),
                    ..Default::default()
                });
            }
            Err(e) => {
                warn!("ollama request failed: {e}");
                return Ok(DelegateOutcome {
                    success: false,
                    error: Some(format!("ollama request failed: {e}")),
                    ..Default::default()
                });
            }
        };

        let status = response.status();
        if !status.is_success() {
            let text = response.text().await.unwrap_or_default();
            warn!(%status, "ollama returned non-200: {}", text);
            return Ok(DelegateOutcome {
                success: false,
                error: Some(format!("ollama error {status}: {text}")),
                ..Default::default()
            });
        }

        let parsed: OllamaChatResponse = match response.json().await {
            Ok(v) => v,
            Err(e) => {
                warn!("failed to parse ollama response: {e}");
                return Ok(DelegateOutcome {
                    success: false,
                    error: Some(format!("failed to parse ollama response: {e}")),
                    ..Default::default()
                });
            }
        };

        let output = parsed.message.content;
        if let Some(cb) = &request.log {
            cb(&output);
        }

        info!(output_len = output.len(), "ollama response received");

        Ok(DelegateOutcome {
            success: true,
            session_id: None,
            error: None,
            exit_code: Some(0),
            metrics: None,
        })
    }
}
