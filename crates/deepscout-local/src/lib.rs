pub mod fetch;
pub mod jsonfix;
pub mod llm;
pub mod read;
pub mod research;
pub mod search;
pub mod summarize;
pub mod urlnorm;

pub use fetch::ReaderFetcher;
pub use llm::LlmGateway;
pub use read::PageReader;
pub use research::Researcher;
pub use search::SerperClient;

/// First non-empty value among `keys`, trimmed. Empty/whitespace-only env
/// values behave the same as unset.
pub(crate) fn env_first(keys: &[&str]) -> Option<String> {
    for k in keys {
        if let Ok(v) = std::env::var(k) {
            let v = v.trim().to_string();
            if !v.is_empty() {
                return Some(v);
            }
        }
    }
    None
}
