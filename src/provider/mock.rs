//! Scripted in-memory provider for tests and dry runs.

use std::collections::VecDeque;
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex};

use async_trait::async_trait;
use serde::{Deserialize, Serialize};
use tokio::sync::mpsc;

use crate::error::{SubstratError, SubstratResult};

use super::traits::{AgentProvider, ChunkReceiver, ProviderSession};

/// Reference provider: echoes prompts back, or replays scripted responses.
///
/// Every handle cloned from one `MockProvider` shares the same script and
/// call records, so tests can assert on prompts sent through any session.
#[derive(Debug, Clone, Default)]
pub struct MockProvider {
    scripted: Arc<Mutex<VecDeque<String>>>,
    sent: Arc<Mutex<Vec<String>>>,
    restores: Arc<Mutex<Vec<Vec<u8>>>>,
    fail_next_send: Arc<AtomicBool>,
}

#[derive(Serialize, Deserialize)]
struct MockState {
    transcript: Vec<String>,
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue a response; consumed in order by subsequent sends across all
    /// sessions. When the script is empty, sends echo the prompt.
    pub fn push_response(&self, text: impl Into<String>) {
        self.scripted.lock().unwrap().push_back(text.into());
    }

    /// All prompts sent through any session of this provider, in order.
    pub fn sent(&self) -> Vec<String> {
        self.sent.lock().unwrap().clone()
    }

    /// State blobs passed to `restore`, in order.
    pub fn restores(&self) -> Vec<Vec<u8>> {
        self.restores.lock().unwrap().clone()
    }

    /// Make the next `send` fail with a provider error.
    pub fn fail_next_send(&self) {
        self.fail_next_send.store(true, Ordering::SeqCst);
    }
}

#[async_trait]
impl AgentProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn create(
        &self,
        _model: &str,
        system_prompt: &str,
    ) -> SubstratResult<Box<dyn ProviderSession>> {
        let mut transcript = Vec::new();
        if !system_prompt.is_empty() {
            transcript.push(format!("system: {system_prompt}"));
        }
        Ok(Box::new(MockSession {
            provider: self.clone(),
            transcript,
        }))
    }

    async fn restore(&self, state: &[u8]) -> SubstratResult<Box<dyn ProviderSession>> {
        self.restores.lock().unwrap().push(state.to_vec());
        // An empty blob means the session was never suspended cleanly (crash
        // recovery); start from an empty transcript.
        let parsed = if state.is_empty() {
            MockState {
                transcript: Vec::new(),
            }
        } else {
            serde_json::from_slice(state)
                .map_err(|e| SubstratError::Provider(format!("bad mock state: {e}")))?
        };
        Ok(Box::new(MockSession {
            provider: self.clone(),
            transcript: parsed.transcript,
        }))
    }
}

#[derive(Debug)]
struct MockSession {
    provider: MockProvider,
    transcript: Vec<String>,
}

#[async_trait]
impl ProviderSession for MockSession {
    async fn send(&mut self, prompt: &str) -> SubstratResult<ChunkReceiver> {
        self.provider.sent.lock().unwrap().push(prompt.to_string());
        if self.provider.fail_next_send.swap(false, Ordering::SeqCst) {
            return Err(SubstratError::Provider("scripted send failure".into()));
        }
        let response = self
            .provider
            .scripted
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| format!("echo: {prompt}"));
        self.transcript.push(format!("user: {prompt}"));
        self.transcript.push(format!("assistant: {response}"));

        let (tx, rx) = mpsc::unbounded_channel();
        let _ = tx.send(Ok(response));
        Ok(rx)
    }

    async fn suspend(&mut self) -> SubstratResult<Vec<u8>> {
        Ok(serde_json::to_vec(&MockState {
            transcript: self.transcript.clone(),
        })?)
    }

    async fn stop(&mut self) -> SubstratResult<()> {
        Ok(())
    }
}
