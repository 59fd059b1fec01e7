//! LLM provider clients.
//!
//! Provider selection is a sum type — [`LlmClient`] — with one variant per
//! supported backend. The capability surface is `generate_chat` plus
//! explicit streaming: [`LlmClient::supports_streaming`] answers whether
//! [`LlmClient::stream_chat`] is available, so the absence of streaming is a
//! capability answer rather than an error thrown mid-flight.
//!
//! OpenAI and vLLM speak the OpenAI chat-completions API (vLLM through its
//! OpenAI-compatible server) including SSE token streaming. Anthropic speaks
//! the messages API and Ollama its native `/api/chat`; both are wired for
//! one-shot generation only, and callers fall back to a single-token stream.

use std::str::FromStr;
use std::time::Duration;

use anyhow::{bail, Context, Result};
use futures::StreamExt;
use tokio::sync::mpsc;

use crate::config::LlmConfig;
use crate::prompt::ChatMessage;

const ANTHROPIC_VERSION: &str = "2023-06-01";
const REQUEST_TIMEOUT_SECS: u64 = 300;

/// Supported LLM providers.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum LlmProviderKind {
    OpenAi,
    Anthropic,
    Ollama,
    Vllm,
}

impl FromStr for LlmProviderKind {
    type Err = anyhow::Error;

    fn from_str(s: &str) -> Result<Self> {
        match s.trim().to_lowercase().as_str() {
            "openai" => Ok(LlmProviderKind::OpenAi),
            "anthropic" => Ok(LlmProviderKind::Anthropic),
            "ollama" => Ok(LlmProviderKind::Ollama),
            "vllm" => Ok(LlmProviderKind::Vllm),
            other => bail!(
                "Unsupported LLM provider: '{}'. Use openai, anthropic, ollama, or vllm.",
                other
            ),
        }
    }
}

/// Streamed tokens; the channel closes when the provider is done.
pub type TokenReceiver = mpsc::Receiver<Result<String>>;

/// One client per provider variant.
pub enum LlmClient {
    OpenAi(OpenAiChat),
    Anthropic(AnthropicChat),
    Ollama(OllamaChat),
    Vllm(OpenAiChat),
}

impl LlmClient {
    /// Construct the configured provider's client.
    pub fn from_config(config: &LlmConfig) -> Result<Self> {
        match config.provider {
            LlmProviderKind::OpenAi => Ok(LlmClient::OpenAi(OpenAiChat::new(
                config.openai_base_url.as_deref().unwrap_or("https://api.openai.com/v1"),
                &config.openai_api_key,
                &config.model,
            )?)),
            LlmProviderKind::Vllm => Ok(LlmClient::Vllm(OpenAiChat::new(
                &format!("{}/v1", config.vllm_base_url.trim_end_matches('/')),
                // vLLM's OpenAI-compatible server accepts any bearer token.
                "EMPTY",
                &config.model,
            )?)),
            LlmProviderKind::Anthropic => Ok(LlmClient::Anthropic(AnthropicChat::new(
                &config.anthropic_api_key,
                &config.model,
            )?)),
            LlmProviderKind::Ollama => Ok(LlmClient::Ollama(OllamaChat::new(
                &config.ollama_base_url,
                &config.model,
            )?)),
        }
    }

    pub fn model_name(&self) -> &str {
        match self {
            LlmClient::OpenAi(c) | LlmClient::Vllm(c) => &c.model,
            LlmClient::Anthropic(c) => &c.model,
            LlmClient::Ollama(c) => &c.model,
        }
    }

    /// Whether [`LlmClient::stream_chat`] is available for this variant.
    pub fn supports_streaming(&self) -> bool {
        matches!(self, LlmClient::OpenAi(_) | LlmClient::Vllm(_))
    }

    /// One-shot chat completion.
    pub async fn generate_chat(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        match self {
            LlmClient::OpenAi(c) | LlmClient::Vllm(c) => {
                c.generate_chat(messages, max_tokens, temperature).await
            }
            LlmClient::Anthropic(c) => c.generate_chat(messages, max_tokens, temperature).await,
            LlmClient::Ollama(c) => c.generate_chat(messages, max_tokens, temperature).await,
        }
    }

    /// Token streaming. Callers must gate on
    /// [`LlmClient::supports_streaming`]; variants without streaming report
    /// it here as an error rather than silently degrading.
    pub async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<TokenReceiver> {
        match self {
            LlmClient::OpenAi(c) | LlmClient::Vllm(c) => {
                c.stream_chat(messages, max_tokens, temperature).await
            }
            _ => bail!("Streaming not supported by this provider"),
        }
    }
}

// ============ OpenAI-compatible chat ============

pub struct OpenAiChat {
    base_url: String,
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl OpenAiChat {
    pub fn new(base_url: &str, api_key: &str, model: &str) -> Result<Self> {
        if api_key.is_empty() {
            bail!("OPENAI_API_KEY is not set");
        }
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()?,
        })
    }

    async fn generate_chat(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        tracing::info!(model = %self.model, "calling chat completions");
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
        });
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Chat completions request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("Chat API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = resp.json().await?;
        let answer = json["choices"][0]["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Chat response missing message content"))?;
        tracing::info!(chars = answer.len(), "chat response received");
        Ok(answer.to_string())
    }

    async fn stream_chat(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<TokenReceiver> {
        tracing::info!(model = %self.model, "streaming chat completions");
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "temperature": temperature,
            "max_tokens": max_tokens,
            "stream": true,
        });
        let resp = self
            .client
            .post(format!("{}/chat/completions", self.base_url))
            .bearer_auth(&self.api_key)
            .json(&body)
            .send()
            .await
            .context("Chat streaming request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("Chat API error {}: {}", status, body_text);
        }

        let (tx, rx) = mpsc::channel::<Result<String>>(64);
        tokio::spawn(async move {
            let mut stream = resp.bytes_stream();
            let mut buffer = String::new();

            while let Some(item) = stream.next().await {
                let bytes = match item {
                    Ok(bytes) => bytes,
                    Err(e) => {
                        let _ = tx.send(Err(e.into())).await;
                        return;
                    }
                };
                buffer.push_str(&String::from_utf8_lossy(&bytes));

                while let Some(pos) = buffer.find('\n') {
                    let line = buffer[..pos].trim().to_string();
                    buffer.drain(..=pos);

                    let Some(data) = parse_sse_data(&line) else {
                        continue;
                    };
                    if data == "[DONE]" {
                        return;
                    }
                    match serde_json::from_str::<serde_json::Value>(data) {
                        Ok(json) => {
                            if let Some(token) = extract_stream_delta(&json) {
                                if tx.send(Ok(token)).await.is_err() {
                                    return;
                                }
                            }
                        }
                        Err(e) => {
                            let _ = tx.send(Err(e.into())).await;
                            return;
                        }
                    }
                }
            }
        });

        Ok(rx)
    }
}

/// Extract the payload of an SSE `data:` line, if this is one.
fn parse_sse_data(line: &str) -> Option<&str> {
    line.strip_prefix("data:").map(|rest| rest.trim_start())
}

/// Pull the delta token out of one OpenAI streaming chunk.
fn extract_stream_delta(json: &serde_json::Value) -> Option<String> {
    json["choices"][0]["delta"]["content"]
        .as_str()
        .map(|s| s.to_string())
}

// ============ Anthropic messages API ============

pub struct AnthropicChat {
    api_key: String,
    model: String,
    client: reqwest::Client,
}

impl AnthropicChat {
    pub fn new(api_key: &str, model: &str) -> Result<Self> {
        if api_key.is_empty() {
            bail!("ANTHROPIC_API_KEY is not set");
        }
        Ok(Self {
            api_key: api_key.to_string(),
            model: model.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()?,
        })
    }

    async fn generate_chat(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        // The messages API takes the system prompt as a top-level field.
        let system: Vec<&str> = messages
            .iter()
            .filter(|m| m.role == "system")
            .map(|m| m.content.as_str())
            .collect();
        let chat: Vec<&ChatMessage> = messages.iter().filter(|m| m.role != "system").collect();

        let mut body = serde_json::json!({
            "model": self.model,
            "messages": chat,
            "max_tokens": max_tokens,
            "temperature": temperature,
        });
        if !system.is_empty() {
            body["system"] = serde_json::json!(system.join("\n\n"));
        }

        let resp = self
            .client
            .post("https://api.anthropic.com/v1/messages")
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", ANTHROPIC_VERSION)
            .json(&body)
            .send()
            .await
            .context("Anthropic request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("Anthropic API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = resp.json().await?;
        let answer = json["content"][0]["text"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Anthropic response missing content text"))?;
        Ok(answer.to_string())
    }
}

// ============ Ollama chat ============

pub struct OllamaChat {
    base_url: String,
    model: String,
    client: reqwest::Client,
}

impl OllamaChat {
    pub fn new(base_url: &str, model: &str) -> Result<Self> {
        Ok(Self {
            base_url: base_url.trim_end_matches('/').to_string(),
            model: model.to_string(),
            client: reqwest::Client::builder()
                .timeout(Duration::from_secs(REQUEST_TIMEOUT_SECS))
                .build()?,
        })
    }

    async fn generate_chat(
        &self,
        messages: &[ChatMessage],
        max_tokens: u32,
        temperature: f32,
    ) -> Result<String> {
        let body = serde_json::json!({
            "model": self.model,
            "messages": messages,
            "stream": false,
            "options": {
                "temperature": temperature,
                "num_predict": max_tokens,
            },
        });
        let resp = self
            .client
            .post(format!("{}/api/chat", self.base_url))
            .json(&body)
            .send()
            .await
            .context("Ollama request failed")?;

        let status = resp.status();
        if !status.is_success() {
            let body_text = resp.text().await.unwrap_or_default();
            bail!("Ollama API error {}: {}", status, body_text);
        }

        let json: serde_json::Value = resp.json().await?;
        let answer = json["message"]["content"]
            .as_str()
            .ok_or_else(|| anyhow::anyhow!("Ollama response missing message content"))?;
        Ok(answer.to_string())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn provider_kind_parses_case_insensitively() {
        assert_eq!(
            "OpenAI".parse::<LlmProviderKind>().unwrap(),
            LlmProviderKind::OpenAi
        );
        assert_eq!(
            "vllm".parse::<LlmProviderKind>().unwrap(),
            LlmProviderKind::Vllm
        );
        assert!("gemini".parse::<LlmProviderKind>().is_err());
    }

    #[test]
    fn sse_data_lines_parse() {
        assert_eq!(parse_sse_data("data: {\"a\":1}"), Some("{\"a\":1}"));
        assert_eq!(parse_sse_data("data: [DONE]"), Some("[DONE]"));
        assert_eq!(parse_sse_data(": keep-alive"), None);
        assert_eq!(parse_sse_data(""), None);
    }

    #[test]
    fn stream_delta_extraction() {
        let chunk = serde_json::json!({
            "choices": [{"delta": {"content": "tok"}}]
        });
        assert_eq!(extract_stream_delta(&chunk), Some("tok".to_string()));

        let role_only = serde_json::json!({
            "choices": [{"delta": {"role": "assistant"}}]
        });
        assert_eq!(extract_stream_delta(&role_only), None);
    }

    #[test]
    fn streaming_capability_by_variant() {
        let openai = LlmClient::OpenAi(OpenAiChat::new("https://api.openai.com/v1", "k", "m").unwrap());
        assert!(openai.supports_streaming());

        let ollama = LlmClient::Ollama(OllamaChat::new("http://localhost:11434", "m").unwrap());
        assert!(!ollama.supports_streaming());
    }
}
