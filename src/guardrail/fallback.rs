//! Correction LLM client
//!
//! Rewrites a flagged translation into acceptable polite phrasing via the
//! chat-completions endpoint. Hard timeout: a correction that misses the
//! window is worse than sending the original, so timeouts return the input
//! unchanged.

use anyhow::{Context, Result};
use serde::Deserialize;
use serde_json::json;
use std::time::Duration;
use tracing::warn;

use crate::config::Config;

pub struct FallbackLlm {
    client: reqwest::Client,
    chat_url: String,
    api_key: String,
    model: String,
    timeout: Duration,
}

#[derive(Deserialize)]
struct ChatResponse {
    choices: Vec<ChatChoice>,
}

#[derive(Deserialize)]
struct ChatChoice {
    message: ChatMessageBody,
}

#[derive(Deserialize)]
struct ChatMessageBody {
    content: String,
}

impl FallbackLlm {
    pub fn new(config: &Config) -> Self {
        Self {
            client: reqwest::Client::new(),
            chat_url: config.upstream.chat_url.clone(),
            api_key: config.upstream.api_key.clone(),
            model: config.guardrail.fallback_model.clone(),
            timeout: Duration::from_millis(config.guardrail.fallback_timeout_ms),
        }
    }

    /// Correct the text, returning the original on timeout or failure.
    pub async fn correct(&self, text: &str, target_language: &str) -> String {
        match tokio::time::timeout(self.timeout, self.request_correction(text, target_language))
            .await
        {
            Ok(Ok(corrected)) => corrected,
            Ok(Err(e)) => {
                warn!("Guardrail correction failed: {e}");
                text.to_string()
            }
            Err(_) => {
                warn!("Guardrail correction timed out after {:?}", self.timeout);
                text.to_string()
            }
        }
    }

    async fn request_correction(&self, text: &str, target_language: &str) -> Result<String> {
        let body = json!({
            "model": self.model,
            "messages": [
                {
                    "role": "system",
                    "content": format!(
                        "Rewrite the following {target_language} sentence in polite, \
                         formal register, removing any profanity or rudeness. Keep the \
                         meaning. Reply with ONLY the rewritten sentence."
                    ),
                },
                {"role": "user", "content": text},
            ],
            "max_tokens": 256,
        });

        let response = self
            .client
            .post(&self.chat_url)
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("correction request failed")?
            .error_for_status()
            .context("correction request rejected")?;

        let parsed: ChatResponse = response.json().await.context("correction response body")?;
        let content = parsed
            .choices
            .first()
            .map(|c| c.message.content.trim().to_string())
            .unwrap_or_default();
        if content.is_empty() {
            anyhow::bail!("empty correction");
        }
        Ok(content)
    }
}
