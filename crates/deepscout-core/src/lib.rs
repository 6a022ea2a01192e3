use serde::{Deserialize, Serialize};

#[derive(thiserror::Error, Debug)]
pub enum Error {
    #[error("invalid url: {0}")]
    InvalidUrl(String),
    #[error("disallowed url: {0}")]
    DisallowedUrl(String),
    #[error("transport error: {0}")]
    Transport(String),
    #[error("upstream HTTP {status}: {message}")]
    UpstreamStatus { status: u16, message: String },
    #[error("insufficient provider balance")]
    ProviderBalance,
    #[error("context length exceeded: {0}")]
    ContextLength(String),
    #[error("degenerate output (repetition loop)")]
    DegenerateOutput,
    #[error("fetch failed: {0}")]
    Fetch(String),
    #[error("search failed: {0}")]
    Search(String),
    #[error("llm failed: {0}")]
    Llm(String),
    #[error("not configured: {0}")]
    NotConfigured(String),
}

pub type Result<T> = std::result::Result<T, Error>;

impl Error {
    /// Upstream statuses worth another attempt; everything else is terminal.
    pub fn status_is_retryable(status: u16) -> bool {
        status >= 500 || matches!(status, 408 | 409 | 425 | 429)
    }
}

/// Providers word context-overflow errors differently; match the common
/// phrasings on the raw message.
pub fn is_context_length_message(message: &str) -> bool {
    let m = message.to_lowercase();
    m.contains("context length") || m.contains("longer than the model's context")
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChatRole {
    Main,
    Summary,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct ChatMessage {
    pub role: String,
    pub content: String,
}

impl ChatMessage {
    pub fn user(content: impl Into<String>) -> Self {
        Self {
            role: "user".to_string(),
            content: content.into(),
        }
    }
}

#[derive(Debug, Clone)]
pub struct ChatParams {
    pub role: ChatRole,
    pub temperature: f64,
    pub max_tokens: u64,
    pub max_retries: usize,
}

impl Default for ChatParams {
    fn default() -> Self {
        Self {
            role: ChatRole::Main,
            temperature: 0.7,
            max_tokens: 4000,
            max_retries: 5,
        }
    }
}

impl ChatParams {
    pub fn main(temperature: f64, max_tokens: u64) -> Self {
        Self {
            temperature,
            max_tokens,
            ..Self::default()
        }
    }

    pub fn summary(temperature: f64, max_tokens: u64) -> Self {
        Self {
            role: ChatRole::Summary,
            temperature,
            max_tokens,
            ..Self::default()
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SearchKind {
    Web,
    News,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct SearchHit {
    #[serde(default)]
    pub title: String,
    #[serde(default)]
    pub link: String,
    #[serde(default)]
    pub snippet: String,
}

/// Outcome of one fetch attempt. Counts are in characters/lines of the
/// decoded text, so downstream extraction can tell whether content was cut.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct FetchResult {
    pub success: bool,
    pub content: String,
    pub error: String,
    pub line_count: usize,
    pub char_count: usize,
    pub last_char_line: usize,
    pub all_content_displayed: bool,
}

impl FetchResult {
    pub fn failure(error: impl Into<String>) -> Self {
        Self {
            success: false,
            content: String::new(),
            error: error.into(),
            line_count: 0,
            char_count: 0,
            last_char_line: 0,
            all_content_displayed: false,
        }
    }

    /// Truncate `content` to `max_chars` characters, recording total vs
    /// displayed counts.
    pub fn from_content(content: &str, max_chars: usize) -> Self {
        let char_count = content.chars().count();
        let line_count = if content.is_empty() {
            0
        } else {
            content.matches('\n').count() + 1
        };
        let displayed: String = if char_count <= max_chars {
            content.to_string()
        } else {
            content.chars().take(max_chars).collect()
        };
        let last_char_line = if displayed.is_empty() {
            0
        } else {
            displayed.matches('\n').count() + 1
        };
        Self {
            success: true,
            all_content_displayed: char_count <= max_chars,
            content: displayed,
            error: String::new(),
            line_count,
            char_count,
            last_char_line,
        }
    }
}

/// Search queries planned for round 0. Absent or malformed keys parse to an
/// empty list; the orchestrator falls back to the raw topic.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct PlanResult {
    #[serde(default)]
    pub search_queries: Vec<String>,
}

/// Coverage analysis for rounds >= 1. Every field defaults so a partial or
/// repaired JSON object still yields a usable value.
#[derive(Debug, Clone, Default, Serialize, Deserialize)]
pub struct AnalysisResult {
    #[serde(default)]
    pub is_sufficient: bool,
    #[serde(default)]
    pub confidence: u32,
    #[serde(default)]
    pub covered_aspects: Vec<String>,
    #[serde(default)]
    pub missing_aspects: Vec<String>,
    #[serde(default)]
    pub contradictions: Vec<String>,
    #[serde(default)]
    pub further_search_queries: Vec<String>,
    #[serde(default)]
    pub urls_to_deep_read: Vec<String>,
}

/// A short attributed excerpt; raw material for synthesis. Append-only.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Finding {
    pub excerpt: String,
    pub source_url: String,
}

/// Full content read from one unique URL within a session.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Source {
    pub url: String,
    pub title: Option<String>,
    pub content: String,
}

impl Source {
    pub fn label(&self) -> &str {
        self.title.as_deref().unwrap_or(&self.url)
    }
}

/// Accumulated state of one research call. Owned by a single orchestrator
/// invocation; nothing here outlives the call.
#[derive(Debug, Clone, Default)]
pub struct ResearchSession {
    pub topic: String,
    pub rounds_executed: usize,
    pub max_rounds: usize,
    pub findings: Vec<Finding>,
    pub sources: Vec<Source>,
    /// Dedup guard: a URL is read at most once per session.
    pub visited_urls: std::collections::BTreeSet<String>,
    pub search_count: usize,
    pub read_count: usize,
}

impl ResearchSession {
    pub fn new(topic: impl Into<String>, max_rounds: usize) -> Self {
        Self {
            topic: topic.into(),
            max_rounds,
            ..Self::default()
        }
    }
}

#[async_trait::async_trait]
pub trait ChatBackend: Send + Sync {
    async fn chat(&self, messages: &[ChatMessage], params: &ChatParams) -> Result<String>;

    /// Structured-output variant; implementations must degrade to a
    /// best-effort value on malformed output rather than erroring.
    async fn chat_json(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<serde_json::Value>;

    async fn extract_info(&self, content: &str, focus: &str) -> Result<String>;
}

#[async_trait::async_trait]
pub trait SearchBackend: Send + Sync {
    async fn raw_search(
        &self,
        query: &str,
        num_results: usize,
        kind: SearchKind,
    ) -> Result<Vec<SearchHit>>;
}

#[async_trait::async_trait]
pub trait Reader: Send + Sync {
    async fn read(&self, url: &str, focus: Option<&str>) -> Result<String>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn fetch_result_records_truncation() {
        let content = "a\nb\nc\nd";
        let r = FetchResult::from_content(content, 3);
        assert!(r.success);
        assert_eq!(r.content, "a\nb");
        assert_eq!(r.char_count, 7);
        assert_eq!(r.line_count, 4);
        assert_eq!(r.last_char_line, 2);
        assert!(!r.all_content_displayed);
    }

    #[test]
    fn fetch_result_complete_content_is_flagged() {
        let r = FetchResult::from_content("hello", 100);
        assert!(r.all_content_displayed);
        assert_eq!(r.char_count, 5);
        assert_eq!(r.line_count, 1);
        assert_eq!(r.last_char_line, 1);
    }

    #[test]
    fn analysis_result_tolerates_missing_keys() {
        let v = serde_json::json!({ "is_sufficient": true, "confidence": 85 });
        let a: AnalysisResult = serde_json::from_value(v).unwrap();
        assert!(a.is_sufficient);
        assert_eq!(a.confidence, 85);
        assert!(a.further_search_queries.is_empty());
        assert!(a.urls_to_deep_read.is_empty());
    }

    #[test]
    fn plan_result_defaults_to_no_queries() {
        let a: PlanResult = serde_json::from_value(serde_json::json!({})).unwrap();
        assert!(a.search_queries.is_empty());
    }

    #[test]
    fn retryable_statuses() {
        for s in [500, 502, 503, 408, 409, 425, 429] {
            assert!(Error::status_is_retryable(s), "{s}");
        }
        for s in [400, 401, 403, 404, 410, 422] {
            assert!(!Error::status_is_retryable(s), "{s}");
        }
    }

    #[test]
    fn context_length_messages_are_recognized() {
        assert!(is_context_length_message(
            "This model's maximum context length is 8192 tokens"
        ));
        assert!(is_context_length_message(
            "the prompt is longer than the model's context"
        ));
        assert!(!is_context_length_message("rate limited"));
    }
}
