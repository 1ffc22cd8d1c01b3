//! Context window assembly.
//!
//! Turns a conversation snapshot plus memory, URL and search context into the
//! exact message list handed to the generation backend. The steps always run
//! in the same order: memory block, prompt-format wrap, URL note, search note,
//! date/time line, pending user message. Only the local copy is ever mutated.

use std::sync::Arc;

use chrono::{DateTime, Local};
use serde::{Deserialize, Serialize};

use crate::collaborators::{MemoryStore, UrlFetch, WebSearch, FETCH_ERROR_PREFIX};
use crate::conversation::ConversationState;
use crate::error::CoreError;
use crate::message::{Message, Role};

pub const DEFAULT_MEMORY_FACT_LIMIT: usize = 10;
pub const DEFAULT_URL_CHAR_BUDGET: usize = 3000;
pub const SEARCH_RESULT_LIMIT: usize = 3;

const MEMORY_BLOCK_HEADER: &str = "\nLong-term memory (facts learned from user):\n";
const URL_PATTERN: &str = r"https?://\S+";

/// Phrases (lowercased) that signal a need for current information.
const SEARCH_KEYWORDS: &[&str] = &[
    // Ukrainian
    "сьогодні",
    "актуальний час",
    "останні новини",
    "що відбувається",
    "хто такий",
    "що таке",
    "останній",
    "погода",
    "новини",
    // English
    "what time is it",
    "current time",
    "today",
    "latest news",
    "news",
    "weather",
    "who is",
    "what is",
    "what's happening",
];

/// Marker applied in front of the system prompt for models trained on a
/// particular chat template.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
pub enum PromptFormat {
    #[default]
    #[serde(rename = "Plain")]
    Plain,
    #[serde(rename = "<|system|>")]
    SystemTag,
    #[serde(rename = "### System")]
    MarkdownHeader,
}

impl PromptFormat {
    pub const ALL: [PromptFormat; 3] = [
        PromptFormat::Plain,
        PromptFormat::SystemTag,
        PromptFormat::MarkdownHeader,
    ];

    pub fn label(self) -> &'static str {
        match self {
            PromptFormat::Plain => "Plain",
            PromptFormat::SystemTag => "<|system|>",
            PromptFormat::MarkdownHeader => "### System",
        }
    }

    pub fn parse(raw: &str) -> Option<Self> {
        Self::ALL
            .into_iter()
            .find(|format| format.label().eq_ignore_ascii_case(raw.trim()))
    }

    pub fn wrap(self, content: &str) -> String {
        match self {
            PromptFormat::Plain => content.to_string(),
            other => format!("{}\n{}", other.label(), content),
        }
    }
}

/// Output of one assembly pass.
#[derive(Debug, Clone, Default)]
pub struct AssembledContext {
    pub messages: Vec<Message>,
    /// Status lines meant for the visible transcript.
    pub notices: Vec<String>,
    /// Collaborator failures that were downgraded to notes.
    pub degraded: Vec<CoreError>,
}

pub struct ContextAssembler {
    memory: Arc<dyn MemoryStore>,
    search: Arc<dyn WebSearch>,
    fetcher: Arc<dyn UrlFetch>,
    memory_fact_limit: usize,
    url_char_budget: usize,
}

impl ContextAssembler {
    pub fn new(
        memory: Arc<dyn MemoryStore>,
        search: Arc<dyn WebSearch>,
        fetcher: Arc<dyn UrlFetch>,
    ) -> Self {
        Self {
            memory,
            search,
            fetcher,
            memory_fact_limit: DEFAULT_MEMORY_FACT_LIMIT,
            url_char_budget: DEFAULT_URL_CHAR_BUDGET,
        }
    }

    pub fn with_limits(mut self, memory_fact_limit: usize, url_char_budget: usize) -> Self {
        self.memory_fact_limit = memory_fact_limit;
        self.url_char_budget = url_char_budget.max(1);
        self
    }

    /// Build the backend message list for the pending user message at the end
    /// of `state`.
    pub async fn assemble(
        &self,
        state: &ConversationState,
        format: PromptFormat,
        now: DateTime<Local>,
    ) -> Result<AssembledContext, CoreError> {
        let (last_user_message, history) = match state.messages.split_last() {
            Some((last, rest)) if last.role == Role::User => (last.clone(), rest),
            _ => {
                return Err(CoreError::InvariantViolation(
                    "context assembly requires a pending user message".to_string(),
                ))
            }
        };

        let mut out = AssembledContext {
            messages: history.to_vec(),
            ..Default::default()
        };

        self.inject_memory(state, &mut out);

        if let Some(first) = out.messages.first_mut().filter(|m| m.is_system()) {
            first.content = format.wrap(&first.content);
        }

        if let Some(url) = first_url(&last_user_message.content) {
            self.inject_url_note(&url, &mut out).await;
        }

        if needs_web_search(&last_user_message.content.to_lowercase()) {
            self.inject_search_note(&last_user_message.content, &mut out)
                .await;
        }

        let stamp = datetime_line(now);
        match out.messages.first_mut().filter(|m| m.is_system()) {
            Some(first) => {
                first.content.push('\n');
                first.content.push_str(&stamp);
            }
            None => out.messages.insert(
                0,
                Message::system(format!("{}\n{}", state.system_prompt, stamp)),
            ),
        }

        out.messages.push(last_user_message);
        Ok(out)
    }

    fn inject_memory(&self, state: &ConversationState, out: &mut AssembledContext) {
        let facts = match self.memory.load_facts(&state.character) {
            Ok(facts) => facts,
            Err(e) => {
                tracing::warn!("Long-term memory unavailable for '{}': {:#}", state.character, e);
                out.degraded
                    .push(CoreError::collaborator("memory store", format!("{:#}", e)));
                return;
            }
        };
        if facts.is_empty() || self.memory_fact_limit == 0 {
            return;
        }

        let recent = &facts[facts.len().saturating_sub(self.memory_fact_limit)..];
        let block = format!("{}{}", MEMORY_BLOCK_HEADER, recent.join("\n"));
        match out.messages.first_mut().filter(|m| m.is_system()) {
            Some(first) => first.content.push_str(&block),
            None => out
                .messages
                .insert(0, Message::system(format!("{}{}", state.system_prompt, block))),
        }
    }

    async fn inject_url_note(&self, url: &str, out: &mut AssembledContext) {
        out.notices.push(format!("Reading content from {} ...", url));
        let content = self.fetcher.fetch(url, self.url_char_budget).await;
        if content.starts_with(FETCH_ERROR_PREFIX) {
            tracing::warn!("URL fetch degraded: {}", content);
            out.degraded
                .push(CoreError::collaborator("url fetch", content.clone()));
        }
        let content = truncate_with_ellipsis(&content, self.url_char_budget);
        out.messages.push(Message::system(format!(
            "System note: The user provided a link. Here is the content from {}:\n{}",
            url, content
        )));
        out.notices
            .push("Page content fetched and added to context.".to_string());
    }

    async fn inject_search_note(&self, query: &str, out: &mut AssembledContext) {
        if !self.search.is_configured() {
            out.messages.push(Message::system(
                "System note: The user's question may need current information, \
                 but web search is not configured, so no search was performed.",
            ));
            out.notices.push(
                "Web search requested but not configured. Add search credentials to the config."
                    .to_string(),
            );
            return;
        }

        out.notices.push("Performing a web search...".to_string());
        let hits = self.search.search(query, SEARCH_RESULT_LIMIT).await;
        if hits.is_empty() {
            out.messages.push(Message::system(
                "System note: A web search was performed but yielded no relevant results.",
            ));
            out.notices
                .push("Web search yielded no relevant results.".to_string());
            return;
        }

        let lines: Vec<String> = hits
            .iter()
            .take(SEARCH_RESULT_LIMIT)
            .map(|hit| hit.note_line())
            .collect();
        out.messages.push(Message::system(format!(
            "System note: To answer the user's question, I have performed a web search. \
             Here are the results:\n{}",
            lines.join("\n")
        )));
        out.notices
            .push("Web search completed. Results provided to AI.".to_string());
    }
}

/// First `http(s)://` URL in `text`, if any.
pub fn first_url(text: &str) -> Option<String> {
    let re = regex_lite::Regex::new(URL_PATTERN).ok()?;
    re.find(text).map(|m| m.as_str().to_string())
}

pub fn needs_web_search(lowercased: &str) -> bool {
    SEARCH_KEYWORDS
        .iter()
        .any(|keyword| lowercased.contains(keyword))
}

pub fn datetime_line(now: DateTime<Local>) -> String {
    format!(
        "Current date and time: {}",
        now.format("%A, %Y-%m-%d %H:%M:%S")
    )
}

/// Keep at most `max_chars` characters, appending `...` when anything was cut.
pub fn truncate_with_ellipsis(text: &str, max_chars: usize) -> String {
    match text.char_indices().nth(max_chars) {
        Some((byte_idx, _)) => format!("{}...", &text[..byte_idx]),
        None => text.to_string(),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::collaborators::SearchHit;
    use crate::test_support::{InMemoryFacts, StaticFetch, StaticSearch};
    use chrono::TimeZone;

    const CHARACTER: &str = "Nova";

    fn fixed_now() -> DateTime<Local> {
        Local.with_ymd_and_hms(2024, 5, 17, 9, 30, 0).unwrap()
    }

    fn state_with(user_text: &str) -> ConversationState {
        ConversationState {
            messages: vec![
                Message::system("You are Nova."),
                Message::user("earlier question"),
                Message::assistant("earlier answer"),
                Message::user(user_text),
            ],
            system_prompt: "You are Nova.".to_string(),
            character: CHARACTER.to_string(),
        }
    }

    fn assembler(
        memory: InMemoryFacts,
        search: StaticSearch,
        fetch: StaticFetch,
    ) -> (ContextAssembler, Arc<StaticSearch>, Arc<StaticFetch>) {
        let search = Arc::new(search);
        let fetch = Arc::new(fetch);
        let assembler = ContextAssembler::new(Arc::new(memory), search.clone(), fetch.clone());
        (assembler, search, fetch)
    }

    #[tokio::test]
    async fn notes_follow_fixed_order() {
        let (assembler, _, _) = assembler(
            InMemoryFacts::with_facts(CHARACTER, &["likes tea"]),
            StaticSearch::returning(vec![SearchHit {
                snippet: "Sunny, 21C".to_string(),
                source: "weather.example".to_string(),
            }]),
            StaticFetch::returning("page body"),
        );
        let state = state_with("what's the weather near https://example.com/Forecast today?");

        let out = assembler
            .assemble(&state, PromptFormat::MarkdownHeader, fixed_now())
            .await
            .unwrap();
        let msgs = &out.messages;

        assert_eq!(msgs.len(), 6);
        let system = &msgs[0].content;
        assert!(system.starts_with("### System\nYou are Nova."));
        let memory_at = system.find("Long-term memory").unwrap();
        let stamp_at = system.find("Current date and time: Friday, 2024-05-17 09:30:00").unwrap();
        assert!(memory_at < stamp_at);
        assert!(system.ends_with("09:30:00"));

        assert_eq!(msgs[1], Message::user("earlier question"));
        assert_eq!(msgs[2], Message::assistant("earlier answer"));
        assert!(msgs[3]
            .content
            .contains("Here is the content from https://example.com/Forecast:\npage body"));
        assert!(msgs[4].content.contains("Sunny, 21C (Source: weather.example)"));
        assert_eq!(msgs[5].role, Role::User);
        assert_eq!(msgs[5], state.messages[3]);
    }

    #[tokio::test]
    async fn assembly_is_deterministic_and_wrap_never_compounds() {
        let (assembler, _, _) = assembler(
            InMemoryFacts::default(),
            StaticSearch::unconfigured(),
            StaticFetch::returning(""),
        );
        let state = state_with("hello there");

        let first = assembler
            .assemble(&state, PromptFormat::SystemTag, fixed_now())
            .await
            .unwrap();
        let second = assembler
            .assemble(&state, PromptFormat::SystemTag, fixed_now())
            .await
            .unwrap();

        assert_eq!(first.messages, second.messages);
        assert_eq!(first.messages[0].content.matches("<|system|>").count(), 1);
        assert_eq!(state.messages[0].content, "You are Nova.");
    }

    #[tokio::test]
    async fn only_first_url_is_fetched_and_budget_applies() {
        let long_body = "x".repeat(DEFAULT_URL_CHAR_BUDGET + 50);
        let (assembler, _, fetch) = assembler(
            InMemoryFacts::default(),
            StaticSearch::unconfigured(),
            StaticFetch::returning(&long_body),
        );
        let state = state_with("compare https://a.example/one and https://b.example/two");

        let out = assembler
            .assemble(&state, PromptFormat::Plain, fixed_now())
            .await
            .unwrap();

        assert_eq!(
            fetch.urls.lock().unwrap().as_slice(),
            &["https://a.example/one".to_string()]
        );
        let note = &out.messages[out.messages.len() - 2].content;
        assert!(note.ends_with(&format!("{}...", "x".repeat(10))));
        let body = note.split_once(":\n").unwrap().1;
        assert_eq!(body.chars().count(), DEFAULT_URL_CHAR_BUDGET + 3);
    }

    #[tokio::test]
    async fn fetch_failure_becomes_note_not_error() {
        let (assembler, _, _) = assembler(
            InMemoryFacts::default(),
            StaticSearch::unconfigured(),
            StaticFetch::returning("[ERROR] Failed to read page https://down.example: timeout"),
        );
        let state = state_with("read https://down.example");

        let out = assembler
            .assemble(&state, PromptFormat::Plain, fixed_now())
            .await
            .unwrap();

        assert!(out.messages[3].content.contains("[ERROR] Failed to read page"));
        assert!(matches!(
            out.degraded.as_slice(),
            [CoreError::CollaboratorFailure { collaborator: "url fetch", .. }]
        ));
    }

    #[tokio::test]
    async fn unconfigured_search_adds_skip_note_without_calling() {
        let (assembler, search, _) = assembler(
            InMemoryFacts::default(),
            StaticSearch::unconfigured(),
            StaticFetch::returning(""),
        );
        let state = state_with("Who is the mayor?");

        let out = assembler
            .assemble(&state, PromptFormat::Plain, fixed_now())
            .await
            .unwrap();

        assert!(search.queries.lock().unwrap().is_empty());
        assert!(out.messages[3].content.contains("not configured"));
        assert!(out.notices.iter().any(|n| n.contains("not configured")));
    }

    #[tokio::test]
    async fn empty_search_adds_no_results_note() {
        let (assembler, search, _) = assembler(
            InMemoryFacts::default(),
            StaticSearch::returning(Vec::new()),
            StaticFetch::returning(""),
        );
        let state = state_with("Що таке квантова заплутаність?");

        let out = assembler
            .assemble(&state, PromptFormat::Plain, fixed_now())
            .await
            .unwrap();

        assert_eq!(search.queries.lock().unwrap().len(), 1);
        assert!(out.messages[3].content.contains("no relevant results"));
    }

    #[tokio::test]
    async fn search_notes_keep_at_most_three_hits() {
        let hits = (0..5)
            .map(|i| SearchHit {
                snippet: format!("hit {i}"),
                source: "s".to_string(),
            })
            .collect();
        let (assembler, _, _) = assembler(
            InMemoryFacts::default(),
            StaticSearch::returning(hits),
            StaticFetch::returning(""),
        );

        let out = assembler
            .assemble(&state_with("latest news please"), PromptFormat::Plain, fixed_now())
            .await
            .unwrap();

        let note = &out.messages[3].content;
        assert!(note.contains("hit 2"));
        assert!(!note.contains("hit 3"));
    }

    #[tokio::test]
    async fn memory_block_keeps_most_recent_facts() {
        let facts: Vec<String> = (0..15).map(|i| format!("fact {i:02}")).collect();
        let fact_refs: Vec<&str> = facts.iter().map(String::as_str).collect();
        let (assembler, _, _) = assembler(
            InMemoryFacts::with_facts(CHARACTER, &fact_refs),
            StaticSearch::unconfigured(),
            StaticFetch::returning(""),
        );

        let out = assembler
            .assemble(&state_with("hi"), PromptFormat::Plain, fixed_now())
            .await
            .unwrap();

        let system = &out.messages[0].content;
        assert!(!system.contains("fact 04"));
        assert!(system.contains("fact 05\n"));
        assert!(system.contains("fact 14\n"));
    }

    #[tokio::test]
    async fn memory_inserts_leading_system_message_when_missing() {
        let (assembler, _, _) = assembler(
            InMemoryFacts::with_facts(CHARACTER, &["likes tea"]),
            StaticSearch::unconfigured(),
            StaticFetch::returning(""),
        );
        let state = ConversationState {
            messages: vec![Message::user("hi")],
            system_prompt: "You are Nova.".to_string(),
            character: CHARACTER.to_string(),
        };

        let out = assembler
            .assemble(&state, PromptFormat::Plain, fixed_now())
            .await
            .unwrap();

        assert_eq!(out.messages.len(), 2);
        assert!(out.messages[0]
            .content
            .starts_with("You are Nova.\nLong-term memory (facts learned from user):\nlikes tea"));
    }

    #[tokio::test]
    async fn requires_pending_user_message() {
        let (assembler, _, _) = assembler(
            InMemoryFacts::default(),
            StaticSearch::unconfigured(),
            StaticFetch::returning(""),
        );
        let mut state = state_with("hi");
        state.messages.push(Message::assistant("already answered"));

        let err = assembler
            .assemble(&state, PromptFormat::Plain, fixed_now())
            .await
            .unwrap_err();
        assert!(matches!(err, CoreError::InvariantViolation(_)));
    }

    #[test]
    fn url_match_is_greedy_to_whitespace_and_keeps_case() {
        assert_eq!(
            first_url("see https://GitHub.com/Org/Repo?x=1, thanks").as_deref(),
            Some("https://GitHub.com/Org/Repo?x=1,")
        );
        assert_eq!(first_url("no links here"), None);
    }

    #[test]
    fn prompt_format_parses_labels() {
        assert_eq!(PromptFormat::parse("plain"), Some(PromptFormat::Plain));
        assert_eq!(PromptFormat::parse("<|system|>"), Some(PromptFormat::SystemTag));
        assert_eq!(PromptFormat::parse("### system"), Some(PromptFormat::MarkdownHeader));
        assert_eq!(PromptFormat::parse("chatml"), None);
    }

    #[test]
    fn truncation_counts_characters_not_bytes() {
        assert_eq!(truncate_with_ellipsis("привіт", 3), "при...");
        assert_eq!(truncate_with_ellipsis("short", 10), "short");
        assert_eq!(truncate_with_ellipsis("exact", 5), "exact");
    }
}
