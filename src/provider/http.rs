//! Bare HTTP LLM provider.
//!
//! Unlike the CLI backend there is no server-side conversation: the full
//! message history is replayed on every call and serialized wholesale into
//! the suspend blob.

use async_trait::async_trait;
use reqwest::Client;
use serde::{Deserialize, Serialize};
use serde_json::{json, Value};
use tokio::sync::mpsc;

use crate::error::{SubstratError, SubstratResult};

use super::traits::{AgentProvider, ChunkReceiver, ProviderSession};

const DEFAULT_MAX_TOKENS: u32 = 4096;

pub struct HttpLlmProvider {
    client: Client,
    base_url: String,
    api_key: String,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct ChatTurn {
    role: String,
    content: String,
}

#[derive(Serialize, Deserialize)]
struct HttpState {
    model: String,
    system_prompt: String,
    history: Vec<ChatTurn>,
}

impl HttpLlmProvider {
    pub fn new(api_key: impl Into<String>) -> Self {
        Self {
            client: Client::new(),
            base_url: "https://api.anthropic.com".into(),
            api_key: api_key.into(),
        }
    }

    pub fn with_base_url(mut self, base_url: impl Into<String>) -> Self {
        self.base_url = base_url.into();
        self
    }
}

#[async_trait]
impl AgentProvider for HttpLlmProvider {
    fn name(&self) -> &str {
        "http-llm"
    }

    async fn create(
        &self,
        model: &str,
        system_prompt: &str,
    ) -> SubstratResult<Box<dyn ProviderSession>> {
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: model.to_string(),
            system_prompt: system_prompt.to_string(),
            history: Vec::new(),
        }))
    }

    async fn restore(&self, state: &[u8]) -> SubstratResult<Box<dyn ProviderSession>> {
        let parsed: HttpState = serde_json::from_slice(state)
            .map_err(|e| SubstratError::Provider(format!("bad http-llm state: {e}")))?;
        Ok(Box::new(HttpSession {
            client: self.client.clone(),
            base_url: self.base_url.clone(),
            api_key: self.api_key.clone(),
            model: parsed.model,
            system_prompt: parsed.system_prompt,
            history: parsed.history,
        }))
    }
}

#[derive(Debug)]
struct HttpSession {
    client: Client,
    base_url: String,
    api_key: String,
    model: String,
    system_prompt: String,
    history: Vec<ChatTurn>,
}

#[async_trait]
impl ProviderSession for HttpSession {
    async fn send(&mut self, prompt: &str) -> SubstratResult<ChunkReceiver> {
        self.history.push(ChatTurn {
            role: "user".into(),
            content: prompt.to_string(),
        });

        let body = json!({
            "model": self.model,
            "max_tokens": DEFAULT_MAX_TOKENS,
            "system": self.system_prompt,
            "messages": self.history,
        });
        let response = self
            .client
            .post(format!("{}/v1/messages", self.base_url))
            .header("x-api-key", &self.api_key)
            .header("anthropic-version", "2023-06-01")
            .json(&body)
            .send()
            .await?;

        if !response.status().is_success() {
            let status = response.status();
            let body = response.text().await.unwrap_or_default();
            // The failed turn must not poison the replayed history.
            self.history.pop();
            return Err(SubstratError::Provider(format!("HTTP {status}: {body}")));
        }

        let value: Value = response.json().await?;
        let mut text = String::new();
        let blocks = value
            .get("content")
            .and_then(Value::as_array)
            .into_iter()
            .flatten();
        for block in blocks {
            if block.get("type").and_then(Value::as_str) == Some("text") {
                if let Some(t) = block.get("text").and_then(Value::as_str) {
                    text.push_str(t);
                }
            }
        }
        self.history.push(ChatTurn {
            role: "assistant".into(),
            content: text.clone(),
        });

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(text));
        Ok(rx)
    }

    async fn suspend(&mut self) -> SubstratResult<Vec<u8>> {
        Ok(serde_json::to_vec(&HttpState {
            model: self.model.clone(),
            system_prompt: self.system_prompt.clone(),
            history: self.history.clone(),
        })?)
    }

    async fn stop(&mut self) -> SubstratResult<()> {
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn suspend_serializes_full_history() {
        let provider = HttpLlmProvider::new("key");
        let mut session = provider.create("model-x", "be terse").await.unwrap();

        let blob = session.suspend().await.unwrap();
        let state: HttpState = serde_json::from_slice(&blob).unwrap();
        assert_eq!(state.model, "model-x");
        assert_eq!(state.system_prompt, "be terse");
        assert!(state.history.is_empty());
    }

    #[tokio::test]
    async fn restore_roundtrips_history() {
        let provider = HttpLlmProvider::new("key");
        let state = HttpState {
            model: "model-x".into(),
            system_prompt: "sys".into(),
            history: vec![
                ChatTurn { role: "user".into(), content: "hi".into() },
                ChatTurn { role: "assistant".into(), content: "hello".into() },
            ],
        };
        let blob = serde_json::to_vec(&state).unwrap();
        let mut restored = provider.restore(&blob).await.unwrap();
        assert_eq!(restored.suspend().await.unwrap(), blob);
    }

    #[tokio::test]
    async fn restore_rejects_garbage() {
        let provider = HttpLlmProvider::new("key");
        assert!(provider.restore(b"]]").await.is_err());
    }
}
