//! OpenAI-compatible completion adapter.
//!
//! Works with OpenAI, Ollama, vLLM, LM Studio, and any other endpoint
//! that follows the chat completions contract.  One request per call, no
//! streaming — the engine wants the whole reply before it touches the
//! timeline.

use async_trait::async_trait;
use serde_json::Value;

use parlor_domain::{Error, Result};

use crate::traits::{CompletionClient, CompletionReply, CompletionRequest};

/// Convert a [`reqwest::Error`] into the domain [`Error`] type.
///
/// Timeout errors map to [`Error::Timeout`]; everything else maps to
/// [`Error::Http`].
fn from_reqwest(e: reqwest::Error) -> Error {
    if e.is_timeout() {
        Error::Timeout(e.to_string())
    } else {
        Error::Http(e.to_string())
    }
}

// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━
// Adapter struct
// ━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━━

/// A [`CompletionClient`] for any OpenAI-compatible API endpoint.
pub struct HttpCompletionClient {
    base_url: String,
    api_key: String,
    client: reqwest::Client,
}

impl HttpCompletionClient {
    /// Create a client against `base_url` (e.g. `https://api.openai.com/v1`).
    ///
    /// The API key comes from the caller — credential storage and refresh
    /// belong to the auth collaborator, not this crate.
    pub fn new(base_url: impl Into<String>, api_key: impl Into<String>) -> Result<Self> {
        let client = reqwest::Client::builder()
            .timeout(std::time::Duration::from_secs(120))
            .build()
            .map_err(from_reqwest)?;

        Ok(Self {
            base_url: base_url.into().trim_end_matches('/').to_string(),
            api_key: api_key.into(),
            client,
        })
    }

    // ── Internal helpers ───────────────────────────────────────────

    fn authed_post(&self, url: &str) -> reqwest::RequestBuilder {
        self.client
            .post(url)
            .header("Authorization", format!("Bearer {}", self.api_key))
            .header("Content-Type", "application/json")
    }

    fn build_chat_body(&self, request: &CompletionRequest) -> Value {
        serde_json::json!({
            "model": request.model,
            "messages": [
                { "role": "user", "content": request.prompt }
            ],
            "stream": false,
        })
    }

    fn parse_chat_response(body: &Value) -> Result<CompletionReply> {
        let text = body["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| {
                Error::CompletionFailed("response missing choices[0].message.content".into())
            })?
            .to_string();

        Ok(CompletionReply {
            text,
            attachments: Vec::new(),
        })
    }
}

#[async_trait]
impl CompletionClient for HttpCompletionClient {
    async fn complete(&self, request: CompletionRequest) -> Result<CompletionReply> {
        let url = format!("{}/chat/completions", self.base_url);
        let body = self.build_chat_body(&request);

        let started = std::time::Instant::now();
        let response = self
            .authed_post(&url)
            .json(&body)
            .send()
            .await
            .map_err(from_reqwest)?;

        let status = response.status();
        if status == reqwest::StatusCode::UNAUTHORIZED || status == reqwest::StatusCode::FORBIDDEN {
            return Err(Error::AuthRequired(format!(
                "completion endpoint returned {status}"
            )));
        }
        if !status.is_success() {
            let detail = response.text().await.unwrap_or_default();
            return Err(Error::CompletionFailed(format!("{status}: {detail}")));
        }

        let parsed: Value = response.json().await.map_err(from_reqwest)?;
        let reply = Self::parse_chat_response(&parsed)?;

        tracing::debug!(
            conversation_id = %request.conversation_id,
            model = %request.model,
            duration_ms = started.elapsed().as_millis() as u64,
            reply_chars = reply.text.len(),
            "completion finished"
        );

        Ok(reply)
    }
}
