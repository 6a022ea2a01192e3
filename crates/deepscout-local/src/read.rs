use std::sync::Arc;

use deepscout_core::{ChatBackend, Error, Reader, Result};

use crate::fetch::{ReaderFetcher, MAX_FETCH_CHARS};
use crate::urlnorm::is_hf_dataset_or_space_url;

/// Pages at or below this size are returned verbatim when no focus query was
/// given; an LLM pass would add cost and latency for nothing.
const SHORT_PAGE_CHARS: usize = 6000;
const TRUNCATION_MARKER: &str = "\n\n[...内容已截断...]";

const DEFAULT_FOCUS: &str = "主要内容和关键信息";

/// Web-page reading with LLM-backed extraction, composed from the fetch
/// pipeline and the chat gateway.
#[derive(Debug, Clone)]
pub struct PageReader<L> {
    llm: Arc<L>,
    fetcher: Arc<ReaderFetcher>,
}

impl<L: ChatBackend> PageReader<L> {
    pub fn new(llm: Arc<L>, fetcher: Arc<ReaderFetcher>) -> Self {
        Self { llm, fetcher }
    }
}

fn clip_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

fn degrade(content: &str) -> String {
    let mut out = clip_chars(content, SHORT_PAGE_CHARS);
    if content.chars().count() > SHORT_PAGE_CHARS {
        out.push_str(TRUNCATION_MARKER);
    }
    out
}

#[async_trait::async_trait]
impl<L: ChatBackend> Reader for PageReader<L> {
    async fn read(&self, url: &str, focus: Option<&str>) -> Result<String> {
        // Same check as the fetcher; cheap and keeps the contract obvious at
        // this layer too.
        if is_hf_dataset_or_space_url(url) {
            return Err(Error::DisallowedUrl(url.to_string()));
        }

        let fetched = self.fetcher.fetch(url, MAX_FETCH_CHARS).await;
        if !fetched.success {
            return Err(Error::Fetch(format!("scraping failed: {}", fetched.error)));
        }
        let content = fetched.content;

        if content.chars().count() <= SHORT_PAGE_CHARS && focus.is_none() {
            return Ok(format!("## 网页内容: {url}\n\n{content}"));
        }

        let focus = focus.filter(|f| !f.trim().is_empty()).unwrap_or(DEFAULT_FOCUS);
        let extracted = match self.llm.extract_info(&content, focus).await {
            Ok(text) => text,
            Err(e) => {
                tracing::warn!(url, error = %e, "LLM extraction failed, returning raw prefix");
                degrade(&content)
            }
        };

        Ok(format!("## 网页内容: {url}\n\n{extracted}"))
    }
}
