use std::collections::VecDeque;
use std::sync::Mutex;

use async_trait::async_trait;

use super::{Completion, CompletionRequest, LlmClient};
use crate::errors::LlmError;

/// Replays canned completions in order and records every request it saw.
///
/// Used for offline runs (`--script`) and throughout the test suite.
#[derive(Debug, Default)]
pub struct ScriptedLlm {
    responses: Mutex<VecDeque<Completion>>,
    requests: Mutex<Vec<CompletionRequest>>,
}

impl ScriptedLlm {
    pub fn new(responses: impl IntoIterator<Item = Completion>) -> Self {
        Self {
            responses: Mutex::new(responses.into_iter().collect()),
            requests: Mutex::new(Vec::new()),
        }
    }

    /// Convenience constructor for text-only completions.
    pub fn from_texts<S: Into<String>>(texts: impl IntoIterator<Item = S>) -> Self {
        Self::new(texts.into_iter().map(Completion::from_text))
    }

    /// Load a script file: a JSON array of completions.
    pub fn from_json(json: &str) -> Result<Self, LlmError> {
        let responses: Vec<Completion> =
            serde_json::from_str(json).map_err(|e| LlmError::Decode(e.to_string()))?;
        Ok(Self::new(responses))
    }

    pub fn push(&self, completion: Completion) {
        if let Ok(mut queue) = self.responses.lock() {
            queue.push_back(completion);
        }
    }

    pub fn remaining(&self) -> usize {
        self.responses.lock().map(|q| q.len()).unwrap_or(0)
    }

    /// Snapshot of every request received so far.
    pub fn requests(&self) -> Vec<CompletionRequest> {
        self.requests
            .lock()
            .map(|r| r.clone())
            .unwrap_or_default()
    }
}

#[async_trait]
impl LlmClient for ScriptedLlm {
    async fn complete(&self, request: CompletionRequest) -> Result<Completion, LlmError> {
        let served = {
            let mut requests = self
                .requests
                .lock()
                .map_err(|_| LlmError::Decode("request log poisoned".into()))?;
            requests.push(request);
            requests.len() - 1
        };
        self.responses
            .lock()
            .map_err(|_| LlmError::Decode("script queue poisoned".into()))?
            .pop_front()
            .ok_or(LlmError::ScriptExhausted { served })
    }
}
