//! HTTP client for the local inference server (LM Studio style,
//! OpenAI-compatible API).
//!
//! The server is trusted-local but unreliable: it may be absent, partially
//! loaded, or return malformed payloads. Every operation returns a result or
//! a typed error; retries are the caller's concern, never the client's.

use std::sync::OnceLock;
use std::time::Duration;

use reqwest::Client;
use serde::{Deserialize, Serialize};
use tracing::{debug, warn};

use crate::error::{AppError, AppResult};

/// Model-id substrings that mark an embedding model.
const EMBED_HINTS: [&str; 5] = ["embed", "e5", "bge", "gte", "nomic"];

/// Context length assumed when the server's extended endpoint is missing.
const FALLBACK_CONTEXT_LENGTH: u64 = 4096;

#[derive(Debug, Clone, Serialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn system(content: impl Into<String>) -> Self {
        Self {
            role: "system".to_string(),
            content: content.into(),
        }
    }

    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

// ---------------------------------------------------------------------------
// Wire types
// ---------------------------------------------------------------------------

#[derive(Debug, Deserialize)]
struct ModelsResponse {
    #[serde(default)]
    data: Vec<ModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ModelEntry {
    id: String,
}

#[derive(Debug, Deserialize)]
struct ExtModelsResponse {
    #[serde(default)]
    data: Vec<ExtModelEntry>,
}

#[derive(Debug, Deserialize)]
struct ExtModelEntry {
    #[allow(dead_code)]
    #[serde(default)]
    id: String,
    #[serde(default)]
    loaded_context_length: Option<u64>,
    #[serde(default)]
    max_context_length: Option<u64>,
}

#[derive(Debug, Serialize)]
struct EmbeddingsRequest<'a> {
    model: &'a str,
    input: &'a [String],
}

#[derive(Debug, Deserialize)]
struct EmbeddingsResponse {
    #[serde(default)]
    data: Vec<EmbeddingEntry>,
}

#[derive(Debug, Deserialize)]
struct EmbeddingEntry {
    embedding: Vec<f64>,
}

#[derive(Debug, Serialize)]
struct ChatRequest<'a> {
    model: &'a str,
    messages: &'a [ChatMessage],
    temperature: f64,
    max_tokens: u32,
}

#[derive(Debug, Deserialize)]
struct ChatResponse {
    #[serde(default)]
    choices: Vec<ChatChoice>,
}

#[derive(Debug, Deserialize)]
struct ChatChoice {
    message: ChatChoiceMessage,
}

#[derive(Debug, Deserialize)]
struct ChatChoiceMessage {
    #[serde(default)]
    content: String,
}

// ---------------------------------------------------------------------------
// Client
// ---------------------------------------------------------------------------

pub struct LlmClient {
    http: Client,
    /// OpenAI-compatible base, e.g. `http://127.0.0.1:1234/v1`.
    base_url: String,
    /// Cached context window; first caller wins, later reads are lock-free.
    context_length: OnceLock<u64>,
}

impl LlmClient {
    pub fn new(base_url: &str, timeout_secs: u64) -> AppResult<Self> {
        let http = Client::builder()
            .timeout(Duration::from_secs(timeout_secs))
            .build()?;
        Ok(Self {
            http,
            base_url: base_url.trim_end_matches('/').to_string(),
            context_length: OnceLock::new(),
        })
    }

    /// Server root without the `/v1` suffix, for the non-standard
    /// `/api/v0/models` extension.
    fn server_root(&self) -> &str {
        self.base_url.strip_suffix("/v1").unwrap_or(&self.base_url)
    }

    /// Healthy iff the server lists at least one model.
    pub async fn health(&self) -> bool {
        match self.list_models().await {
            Ok(models) => !models.is_empty(),
            Err(_) => false,
        }
    }

    pub async fn list_models(&self) -> AppResult<Vec<String>> {
        let url = format!("{}/models", self.base_url);
        let resp = self.http.get(&url).send().await?;
        if !resp.status().is_success() {
            return Err(AppError::Llm(format!(
                "GET /models returned {}",
                resp.status()
            )));
        }
        let body: ModelsResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Llm(format!("malformed /models payload: {}", e)))?;
        Ok(body.data.into_iter().map(|m| m.id).collect())
    }

    /// First model whose id looks like an embedding model, else the first
    /// model, else none.
    pub fn pick_embedding_model(models: &[String]) -> Option<String> {
        models
            .iter()
            .find(|m| {
                let id = m.to_lowercase();
                EMBED_HINTS.iter().any(|h| id.contains(h))
            })
            .or_else(|| models.first())
            .cloned()
    }

    /// First model that is neither an embedding model nor a transcription
    /// model, else the first model, else none.
    pub fn pick_chat_model(models: &[String]) -> Option<String> {
        models
            .iter()
            .find(|m| {
                let id = m.to_lowercase();
                !EMBED_HINTS.iter().any(|h| id.contains(h)) && !id.contains("whisper")
            })
            .or_else(|| models.first())
            .cloned()
    }

    pub async fn embedding_model(&self) -> AppResult<String> {
        let models = self.list_models().await?;
        Self::pick_embedding_model(&models)
            .ok_or_else(|| AppError::Llm("no models available for embedding".to_string()))
    }

    pub async fn chat_model(&self) -> AppResult<String> {
        let models = self.list_models().await?;
        Self::pick_chat_model(&models)
            .ok_or_else(|| AppError::Llm("no models available for chat".to_string()))
    }

    /// Context window discovered through the server's extended model list,
    /// cached for the life of the client. Prefers the loaded context length
    /// over the model maximum; falls back to 4096 when the endpoint or the
    /// fields are missing.
    pub async fn context_length(&self) -> u64 {
        if let Some(cached) = self.context_length.get() {
            return *cached;
        }
        let probed = self.probe_context_length().await;
        *self.context_length.get_or_init(|| probed)
    }

    async fn probe_context_length(&self) -> u64 {
        let url = format!("{}/api/v0/models", self.server_root());
        let resp = match self.http.get(&url).send().await {
            Ok(r) if r.status().is_success() => r,
            Ok(r) => {
                debug!(status = %r.status(), "extended model endpoint unavailable");
                return FALLBACK_CONTEXT_LENGTH;
            }
            Err(e) => {
                debug!(error = %e, "extended model endpoint unreachable");
                return FALLBACK_CONTEXT_LENGTH;
            }
        };
        let body: ExtModelsResponse = match resp.json().await {
            Ok(b) => b,
            Err(e) => {
                warn!(error = %e, "malformed extended model payload");
                return FALLBACK_CONTEXT_LENGTH;
            }
        };
        body.data
            .iter()
            .find_map(|m| m.loaded_context_length)
            .or_else(|| body.data.iter().find_map(|m| m.max_context_length))
            .unwrap_or(FALLBACK_CONTEXT_LENGTH)
    }

    /// Batch-embed texts; returns one vector per input, in order.
    pub async fn embed(&self, texts: &[String], model: &str) -> AppResult<Vec<Vec<f64>>> {
        if texts.is_empty() {
            return Ok(Vec::new());
        }
        let url = format!("{}/embeddings", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&EmbeddingsRequest {
                model,
                input: texts,
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AppError::Llm(format!(
                "POST /embeddings returned {}",
                resp.status()
            )));
        }
        let body: EmbeddingsResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Llm(format!("malformed /embeddings payload: {}", e)))?;
        if body.data.is_empty() {
            return Err(AppError::Llm("embeddings response was empty".to_string()));
        }
        if body.data.len() != texts.len() {
            return Err(AppError::Llm(format!(
                "embeddings count mismatch: sent {}, got {}",
                texts.len(),
                body.data.len()
            )));
        }
        Ok(body.data.into_iter().map(|e| e.embedding).collect())
    }

    pub async fn embed_single(&self, text: &str, model: &str) -> AppResult<Vec<f64>> {
        let mut vectors = self.embed(&[text.to_string()], model).await?;
        vectors
            .pop()
            .ok_or_else(|| AppError::Llm("embeddings response was empty".to_string()))
    }

    /// Chat completion returning the first choice's content with reasoning
    /// scratch output stripped.
    pub async fn chat(
        &self,
        messages: &[ChatMessage],
        model: &str,
        temperature: f64,
        max_tokens: u32,
    ) -> AppResult<String> {
        let url = format!("{}/chat/completions", self.base_url);
        let resp = self
            .http
            .post(&url)
            .json(&ChatRequest {
                model,
                messages,
                temperature,
                max_tokens,
            })
            .send()
            .await?;
        if !resp.status().is_success() {
            return Err(AppError::Llm(format!(
                "POST /chat/completions returned {}",
                resp.status()
            )));
        }
        let body: ChatResponse = resp
            .json()
            .await
            .map_err(|e| AppError::Llm(format!("malformed chat payload: {}", e)))?;
        let content = body
            .choices
            .into_iter()
            .next()
            .map(|c| c.message.content)
            .ok_or_else(|| AppError::Llm("chat response had no choices".to_string()))?;
        Ok(sanitize_response(&content))
    }

    /// Run the annotation prompt over a chunk. The chunk is clamped to what
    /// the context window can hold, and surrounding code fences are stripped
    /// from the reply; JSON parsing is the caller's responsibility.
    pub async fn annotate_chunk(
        &self,
        chunk_text: &str,
        prompt_template: &str,
        model: &str,
    ) -> AppResult<String> {
        let ctx = self.context_length().await;
        let max_chars = (ctx.saturating_sub(2000) as usize * 3).max(400);
        let clamped = clamp_chars(chunk_text, max_chars);

        let messages = [
            ChatMessage::system(prompt_template),
            ChatMessage::user(clamped),
        ];
        let reply = self.chat(&messages, model, 0.2, 1024).await?;
        Ok(strip_code_fences(&reply))
    }
}

// ---------------------------------------------------------------------------
// Response sanitization
// ---------------------------------------------------------------------------

/// Strip reasoning-model scratch output: everything up to and including a
/// `</think>` tag is dropped; a `<think>` opening with no close yields an
/// empty reply.
pub fn sanitize_response(body: &str) -> String {
    if let Some(pos) = body.find("</think>") {
        return body[pos + "</think>".len()..].trim().to_string();
    }
    if body.trim_start().starts_with("<think>") {
        return String::new();
    }
    body.trim().to_string()
}

/// Drop surrounding triple-backtick fence lines (```json ... ```), keeping
/// interior content untouched.
pub fn strip_code_fences(body: &str) -> String {
    body.lines()
        .filter(|line| !line.trim_start().starts_with("```"))
        .collect::<Vec<_>>()
        .join("\n")
        .trim()
        .to_string()
}

/// Truncate to at most `max_chars` characters on a char boundary.
fn clamp_chars(text: &str, max_chars: usize) -> String {
    if text.chars().count() <= max_chars {
        return text.to_string();
    }
    text.chars().take(max_chars).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn picks_embedding_model_by_hint() {
        let models = vec![
            "qwen2.5-7b-instruct".to_string(),
            "text-embedding-nomic-embed-text-v1.5".to_string(),
        ];
        assert_eq!(
            LlmClient::pick_embedding_model(&models).unwrap(),
            "text-embedding-nomic-embed-text-v1.5"
        );
        assert_eq!(
            LlmClient::pick_chat_model(&models).unwrap(),
            "qwen2.5-7b-instruct"
        );
    }

    #[test]
    fn falls_back_to_first_model() {
        let models = vec!["mystery-model".to_string()];
        assert_eq!(
            LlmClient::pick_embedding_model(&models).unwrap(),
            "mystery-model"
        );
        assert!(LlmClient::pick_embedding_model(&[]).is_none());
    }

    #[test]
    fn chat_model_skips_whisper() {
        let models = vec![
            "whisper-large-v3".to_string(),
            "bge-m3".to_string(),
            "llama-3.2-3b".to_string(),
        ];
        assert_eq!(LlmClient::pick_chat_model(&models).unwrap(), "llama-3.2-3b");
    }

    #[test]
    fn sanitize_drops_think_block() {
        assert_eq!(
            sanitize_response("<think>step 1\nstep 2</think>\nThe answer."),
            "The answer."
        );
        assert_eq!(sanitize_response("<think>never closed..."), "");
        assert_eq!(sanitize_response("plain reply"), "plain reply");
    }

    #[test]
    fn fences_are_stripped_line_by_line() {
        let body = "```json\n{\"a\": 1}\n```";
        assert_eq!(strip_code_fences(body), "{\"a\": 1}");
        assert_eq!(strip_code_fences("no fences"), "no fences");
    }

    #[test]
    fn clamp_respects_char_boundaries() {
        assert_eq!(clamp_chars("héllo", 2), "hé");
        assert_eq!(clamp_chars("ok", 10), "ok");
    }
}
