//! Stub collaborators shared by the unit tests.

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Arc, Mutex};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::{Notify, Semaphore};

use crate::collaborators::{
    ChatLog, HistoryStore, MemoryStore, Notifier, PromptLoader, SearchHit, UrlFetch, WebSearch,
};
use crate::generation::{GenerationBackend, SamplingOptions};
use crate::message::Message;

pub struct ScriptedBackend {
    model: String,
    replies: Mutex<VecDeque<Result<String, String>>>,
    calls: Mutex<Vec<(Vec<Message>, SamplingOptions)>>,
    delay: Option<Duration>,
    gate: Option<Arc<Semaphore>>,
    pub entered: Arc<Notify>,
    active: AtomicUsize,
    max_active: AtomicUsize,
}

impl ScriptedBackend {
    pub fn new(replies: Vec<Result<&str, &str>>) -> Self {
        Self {
            model: "test-model".to_string(),
            replies: Mutex::new(
                replies
                    .into_iter()
                    .map(|r| r.map(str::to_string).map_err(str::to_string))
                    .collect(),
            ),
            calls: Mutex::new(Vec::new()),
            delay: None,
            gate: None,
            entered: Arc::new(Notify::new()),
            active: AtomicUsize::new(0),
            max_active: AtomicUsize::new(0),
        }
    }

    pub fn replying(text: &str) -> Self {
        Self::new(vec![Ok(text)])
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = Some(delay);
        self
    }

    /// Every call blocks until the returned semaphore receives a permit.
    pub fn gated(mut self) -> (Self, Arc<Semaphore>) {
        let gate = Arc::new(Semaphore::new(0));
        self.gate = Some(gate.clone());
        (self, gate)
    }

    pub fn calls(&self) -> Vec<(Vec<Message>, SamplingOptions)> {
        self.calls.lock().unwrap().clone()
    }

    pub fn call_count(&self) -> usize {
        self.calls.lock().unwrap().len()
    }

    pub fn max_concurrency(&self) -> usize {
        self.max_active.load(Ordering::SeqCst)
    }
}

#[async_trait]
impl GenerationBackend for ScriptedBackend {
    fn model_name(&self) -> String {
        self.model.clone()
    }

    async fn chat(&self, messages: &[Message], options: SamplingOptions) -> anyhow::Result<String> {
        let now_active = self.active.fetch_add(1, Ordering::SeqCst) + 1;
        self.max_active.fetch_max(now_active, Ordering::SeqCst);
        self.calls
            .lock()
            .unwrap()
            .push((messages.to_vec(), options));
        self.entered.notify_one();

        if let Some(gate) = &self.gate {
            if let Ok(permit) = gate.acquire().await {
                permit.forget();
            }
        }
        if let Some(delay) = self.delay {
            tokio::time::sleep(delay).await;
        }

        let reply = self
            .replies
            .lock()
            .unwrap()
            .pop_front()
            .unwrap_or_else(|| Ok("default reply".to_string()));
        self.active.fetch_sub(1, Ordering::SeqCst);
        reply.map_err(|e| anyhow::anyhow!(e))
    }
}

#[derive(Default)]
pub struct InMemoryFacts {
    facts: Mutex<HashMap<String, Vec<String>>>,
}

impl InMemoryFacts {
    pub fn with_facts(character: &str, facts: &[&str]) -> Self {
        let store = Self::default();
        for fact in facts {
            store.add_fact(character, fact).unwrap();
        }
        store
    }
}

impl MemoryStore for InMemoryFacts {
    fn load_facts(&self, character: &str) -> anyhow::Result<Vec<String>> {
        Ok(self
            .facts
            .lock()
            .unwrap()
            .get(character)
            .cloned()
            .unwrap_or_default())
    }

    fn add_fact(&self, character: &str, fact: &str) -> anyhow::Result<()> {
        let mut facts = self.facts.lock().unwrap();
        let entry = facts.entry(character.to_string()).or_default();
        if !entry.iter().any(|f| f == fact) {
            entry.push(fact.to_string());
        }
        Ok(())
    }
}

pub struct StaticSearch {
    configured: bool,
    hits: Vec<SearchHit>,
    pub queries: Mutex<Vec<String>>,
}

impl StaticSearch {
    pub fn unconfigured() -> Self {
        Self {
            configured: false,
            hits: Vec::new(),
            queries: Mutex::new(Vec::new()),
        }
    }

    pub fn returning(hits: Vec<SearchHit>) -> Self {
        Self {
            configured: true,
            hits,
            queries: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl WebSearch for StaticSearch {
    fn is_configured(&self) -> bool {
        self.configured
    }

    async fn search(&self, query: &str, limit: usize) -> Vec<SearchHit> {
        self.queries.lock().unwrap().push(query.to_string());
        self.hits.iter().take(limit).cloned().collect()
    }
}

pub struct StaticFetch {
    body: String,
    pub urls: Mutex<Vec<String>>,
}

impl StaticFetch {
    pub fn returning(body: &str) -> Self {
        Self {
            body: body.to_string(),
            urls: Mutex::new(Vec::new()),
        }
    }
}

#[async_trait]
impl UrlFetch for StaticFetch {
    async fn fetch(&self, url: &str, _max_chars: usize) -> String {
        self.urls.lock().unwrap().push(url.to_string());
        self.body.clone()
    }
}

#[derive(Default)]
pub struct RecordingChatLog {
    pub entries: Mutex<Vec<(String, String)>>,
}

impl ChatLog for RecordingChatLog {
    fn record(&self, _timestamp: &str, role: &str, text: &str) -> anyhow::Result<()> {
        self.entries
            .lock()
            .unwrap()
            .push((role.to_string(), text.to_string()));
        Ok(())
    }
}

#[derive(Default)]
pub struct RecordingNotifier {
    pub sent: Mutex<Vec<(String, String)>>,
}

impl Notifier for RecordingNotifier {
    fn notify(&self, title: &str, text: &str) {
        self.sent
            .lock()
            .unwrap()
            .push((title.to_string(), text.to_string()));
    }
}

#[derive(Default)]
pub struct InMemoryHistory {
    pub saved: Mutex<HashMap<String, Vec<Message>>>,
}

impl HistoryStore for InMemoryHistory {
    fn save_history(&self, messages: &[Message], character: &str) -> anyhow::Result<()> {
        let kept = messages.iter().filter(|m| !m.is_system()).cloned().collect();
        self.saved
            .lock()
            .unwrap()
            .insert(character.to_string(), kept);
        Ok(())
    }

    fn load_history(&self, character: &str) -> Vec<Message> {
        self.saved
            .lock()
            .unwrap()
            .get(character)
            .cloned()
            .unwrap_or_default()
    }
}

#[derive(Default)]
pub struct StaticPrompts {
    pub prompts: HashMap<String, String>,
}

impl StaticPrompts {
    pub fn with(mut self, character: &str, prompt: &str) -> Self {
        self.prompts
            .insert(character.to_string(), prompt.to_string());
        self
    }
}

impl PromptLoader for StaticPrompts {
    fn load(&self, character: &str) -> Option<String> {
        self.prompts.get(character).cloned()
    }

    fn list_characters(&self) -> Vec<String> {
        let mut names: Vec<String> = self.prompts.keys().cloned().collect();
        names.sort();
        names
    }
}
