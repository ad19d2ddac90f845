//! Scripted provider for tests and `--dry-run`.

use async_trait::async_trait;
use errors::ProviderError;
use gen_core::traits::{CompletionStream, TextGenerationProvider};
use gen_core::types::{Completion, Prompt, ProviderRequest, StreamDelta, TokenUsage};
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::time::Duration;
use tokio::sync::Mutex;

#[derive(Debug, Clone)]
pub enum MockOutcome {
    Reply(String),
    Fail(ProviderError)
}

impl MockOutcome {
    pub fn reply(text: impl Into<String>) -> Self {
        MockOutcome::Reply(text.into())
    }
}

/// A call observed by [`MockProvider`].
#[derive(Debug, Clone, PartialEq)]
pub struct MockCall {
    pub model: String,
    pub prompt: String,
    pub temperature: f32,
    pub streamed: bool
}

#[derive(Default)]
struct Script {
    queued: VecDeque<MockOutcome>,
    standing: Option<MockOutcome>
}

/// Answers per model: queued one-shot outcomes first, then the standing
/// outcome, then a canned reply echoing the model name.
#[derive(Default)]
pub struct MockProvider {
    scripts: Mutex<HashMap<String, Script>>,
    calls: Mutex<Vec<MockCall>>,
    completed: AtomicUsize,
    delay: Option<Duration>
}

fn word_count(text: &str) -> u32 {
    u32::try_from(text.split_whitespace().count()).unwrap_or(u32::MAX)
}

impl MockProvider {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Sets the outcome returned for `model` whenever nothing is queued.
    pub async fn respond(&self, model: &str, outcome: MockOutcome) {
        self.scripts
            .lock()
            .await
            .entry(model.to_string())
            .or_default()
            .standing = Some(outcome);
    }

    /// Queues an outcome consumed by the next call to `model`.
    pub async fn enqueue(&self, model: &str, outcome: MockOutcome) {
        self.scripts
            .lock()
            .await
            .entry(model.to_string())
            .or_default()
            .queued
            .push_back(outcome);
    }

    pub async fn calls(&self) -> Vec<MockCall> {
        self.calls.lock().await.clone()
    }

    pub async fn call_count(&self) -> usize {
        self.calls.lock().await.len()
    }

    pub async fn calls_for(&self, model: &str) -> usize {
        self.calls
            .lock()
            .await
            .iter()
            .filter(|call| call.model == model)
            .count()
    }

    /// Calls that ran past the configured delay to an outcome.
    pub fn completed_count(&self) -> usize {
        self.completed.load(Ordering::SeqCst)
    }

    async fn next_outcome(
        &self,
        prompt: &Prompt,
        request: &ProviderRequest,
        streamed: bool
    ) -> MockOutcome {
        self.calls.lock().await.push(MockCall {
            model: request.model.clone(),
            prompt: prompt.canonical_text(),
            temperature: request.temperature,
            streamed
        });

        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }
        self.completed.fetch_add(1, Ordering::SeqCst);

        let mut scripts = self.scripts.lock().await;
        match scripts.get_mut(&request.model) {
            Some(script) => match script.queued.pop_front() {
                Some(outcome) => outcome,
                None => script
                    .standing
                    .clone()
                    .unwrap_or_else(|| MockOutcome::reply(canned_reply(&request.model)))
            },
            None => MockOutcome::reply(canned_reply(&request.model))
        }
    }
}

fn canned_reply(model: &str) -> String {
    format!("Mock completion from {model}.")
}

fn into_completion(
    outcome: MockOutcome,
    prompt: &Prompt,
    request: &ProviderRequest
) -> Result<Completion, ProviderError> {
    match outcome {
        MockOutcome::Reply(text) => Ok(Completion {
            usage: TokenUsage::new(word_count(&prompt.canonical_text()), word_count(&text)),
            text,
            model: request.model.clone()
        }),
        MockOutcome::Fail(err) => Err(err)
    }
}

#[async_trait]
impl TextGenerationProvider for MockProvider {
    fn name(&self) -> &str {
        "mock"
    }

    async fn complete(
        &self,
        prompt: &Prompt,
        request: &ProviderRequest
    ) -> Result<Completion, ProviderError> {
        let outcome = self.next_outcome(prompt, request, false).await;
        into_completion(outcome, prompt, request)
    }

    /// Streams the reply word by word; the last delta carries usage.
    async fn complete_stream(
        &self,
        prompt: &Prompt,
        request: &ProviderRequest
    ) -> Result<CompletionStream, ProviderError> {
        let outcome = self.next_outcome(prompt, request, true).await;
        let completion = into_completion(outcome, prompt, request)?;

        let words: Vec<&str> = completion.text.split_inclusive(' ').collect();
        let last = words.len().saturating_sub(1);
        let deltas: Vec<Result<StreamDelta, ProviderError>> = words
            .iter()
            .enumerate()
            .map(|(i, word)| {
                Ok(StreamDelta {
                    content: (*word).to_string(),
                    usage: (i == last).then_some(completion.usage)
                })
            })
            .collect();

        Ok(Box::pin(futures_util::stream::iter(deltas)))
    }
}
