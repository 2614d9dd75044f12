//! Scripted completion client shared by the unit tests

use async_trait::async_trait;
use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::Mutex;
use std::time::Duration;

use crate::modules::completion_client::{CompletionClient, CompletionError, CompletionRequest, Vendor};

/// One scripted reply: wait `delay`, then return `result` (or panic)
#[derive(Debug, Clone)]
pub struct Step {
    pub delay: Duration,
    pub result: Result<String, CompletionError>,
    pub panics: bool,
}

impl Step {
    pub fn reply(content: &str) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Ok(content.to_string()),
            panics: false,
        }
    }

    pub fn fail(error: CompletionError) -> Self {
        Self {
            delay: Duration::ZERO,
            result: Err(error),
            panics: false,
        }
    }

    pub fn panic() -> Self {
        Self {
            panics: true,
            ..Self::reply("unreachable")
        }
    }

    pub fn timeout() -> Self {
        Self::reply("late").after(Duration::from_secs(24 * 3600))
    }

    pub fn after(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }
}

/// Replies per prompt, keyed by the content of the last message. Prompts
/// without a script (or with an exhausted one) get `reply to <prompt>` after
/// the default delay.
#[derive(Default)]
pub struct ScriptedClient {
    scripts: Mutex<HashMap<String, VecDeque<Step>>>,
    default_delay: Duration,
    calls: Mutex<Vec<String>>,
    in_flight: AtomicUsize,
    max_in_flight: AtomicUsize,
}

struct InFlight<'a>(&'a AtomicUsize);

impl Drop for InFlight<'_> {
    fn drop(&mut self) {
        self.0.fetch_sub(1, Ordering::SeqCst);
    }
}

impl ScriptedClient {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn with_delay(delay: Duration) -> Self {
        Self {
            default_delay: delay,
            ..Self::default()
        }
    }

    pub fn script(self, prompt: &str, steps: Vec<Step>) -> Self {
        self.scripts
            .lock()
            .unwrap()
            .insert(prompt.to_string(), steps.into());
        self
    }

    /// Prompts in call order, one entry per attempt
    pub fn calls(&self) -> Vec<String> {
        self.calls.lock().unwrap().clone()
    }

    pub fn calls_for(&self, prompt: &str) -> usize {
        self.calls.lock().unwrap().iter().filter(|c| *c == prompt).count()
    }

    pub fn in_flight(&self) -> usize {
        self.in_flight.load(Ordering::SeqCst)
    }

    pub fn max_in_flight(&self) -> usize {
        self.max_in_flight.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl CompletionClient for ScriptedClient {
    fn vendor(&self) -> Vendor {
        Vendor::OpenAi
    }

    async fn complete(&self, request: &CompletionRequest, _timeout: Duration) -> Result<String, CompletionError> {
        let key = request
            .messages
            .last()
            .map(|m| m.content.clone())
            .unwrap_or_default();
        self.calls.lock().unwrap().push(key.clone());

        let now = self.in_flight.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_in_flight.fetch_max(now, Ordering::SeqCst);
        let _guard = InFlight(&self.in_flight);

        let step = self
            .scripts
            .lock()
            .unwrap()
            .get_mut(&key)
            .and_then(VecDeque::pop_front)
            .unwrap_or_else(|| Step::reply(&format!("reply to {}", key)).after(self.default_delay));

        tokio::time::sleep(step.delay).await;
        if step.panics {
            panic!("scripted panic for {}", key);
        }
        step.result
    }
}
