use std::time::Duration;

use deepscout_core::{Error, FetchResult, Result};

use crate::urlnorm::is_hf_dataset_or_space_url;

/// Cap on returned page text (characters), both proxy and direct paths.
pub const MAX_FETCH_CHARS: usize = 102_400 * 4;

const PRIMARY_RETRY_DELAYS_S: [u64; 4] = [1, 2, 4, 8];
const FALLBACK_RETRY_DELAYS_S: [u64; 3] = [1, 2, 4];
const FETCH_REQUEST_TIMEOUT: Duration = Duration::from_secs(60);

const BROWSER_USER_AGENT: &str = "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/91.0.4472.124 Safari/537.36";

/// Page-text retrieval through a reader proxy (renders the page into plain
/// text), with a direct-fetch fallback and size-capped results.
#[derive(Debug, Clone)]
pub struct ReaderFetcher {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

/// The reader proxy reports an exhausted account as a JSON error body on an
/// otherwise successful response.
fn is_balance_error_body(body: &str) -> bool {
    serde_json::from_str::<serde_json::Value>(body)
        .ok()
        .and_then(|v| {
            v.get("name")
                .and_then(|n| n.as_str())
                .map(|n| n == "InsufficientBalanceError")
        })
        .unwrap_or(false)
}

impl ReaderFetcher {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key =
            crate::env_first(&["DEEPSCOUT_READER_API_KEY", "JINA_API_KEY"]).ok_or_else(|| {
                Error::NotConfigured("missing DEEPSCOUT_READER_API_KEY (or JINA_API_KEY)".to_string())
            })?;
        let base_url = crate::env_first(&["DEEPSCOUT_READER_BASE_URL", "JINA_BASE_URL"])
            .unwrap_or_else(|| "https://r.jina.ai".to_string());
        Ok(Self {
            client,
            api_key,
            base_url,
        })
    }

    /// A URL already wrapped by the same proxy would get double-rendered;
    /// unwrap it before prefixing.
    fn unwrap_proxied_url<'a>(&self, url: &'a str) -> &'a str {
        let prefix = format!("{}/", self.base_url.trim_end_matches('/'));
        if url.matches("http").count() >= 2 {
            if let Some(inner) = url.strip_prefix(&prefix) {
                return inner;
            }
        }
        url
    }

    async fn get_with_retries(
        &self,
        url: &str,
        bearer: Option<&str>,
        user_agent: Option<&str>,
        delays: &[u64],
    ) -> Result<String> {
        let mut last_err: Option<Error> = None;

        for (attempt, delay) in delays.iter().enumerate() {
            let is_last = attempt + 1 == delays.len();
            let mut rb = self.client.get(url).timeout(FETCH_REQUEST_TIMEOUT);
            if let Some(k) = bearer {
                rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
            }
            if let Some(ua) = user_agent {
                rb = rb.header(reqwest::header::USER_AGENT, ua);
            }

            let resp = match rb.send().await {
                Ok(r) => r,
                Err(e) if e.is_connect() || e.is_timeout() => {
                    last_err = Some(Error::Transport(format!("connection error: {e}")));
                    if !is_last {
                        tokio::time::sleep(Duration::from_secs(*delay)).await;
                        continue;
                    }
                    break;
                }
                Err(e) => return Err(Error::Transport(format!("unexpected error: {e}"))),
            };

            let status = resp.status().as_u16();
            if !resp.status().is_success() {
                let err = Error::UpstreamStatus {
                    status,
                    message: format!("HTTP {status}"),
                };
                if Error::status_is_retryable(status) && !is_last {
                    last_err = Some(err);
                    tokio::time::sleep(Duration::from_secs(*delay)).await;
                    continue;
                }
                return Err(err);
            }

            return resp
                .text()
                .await
                .map_err(|e| Error::Transport(format!("body read error: {e}")));
        }

        Err(last_err.unwrap_or_else(|| Error::Fetch("fetch failed".to_string())))
    }

    async fn fetch_via_reader(&self, url: &str, max_chars: usize) -> FetchResult {
        let target = self.unwrap_proxied_url(url);
        let proxied = format!("{}/{}", self.base_url.trim_end_matches('/'), target);

        let body = match self
            .get_with_retries(&proxied, Some(&self.api_key), None, &PRIMARY_RETRY_DELAYS_S)
            .await
        {
            Ok(b) => b,
            Err(e) => return FetchResult::failure(e.to_string()),
        };

        if body.is_empty() {
            return FetchResult::failure("no content returned");
        }
        if is_balance_error_body(&body) {
            return FetchResult::failure(Error::ProviderBalance.to_string());
        }

        FetchResult::from_content(&body, max_chars)
    }

    async fn fetch_direct(&self, url: &str, max_chars: usize) -> FetchResult {
        let body = match self
            .get_with_retries(url, None, Some(BROWSER_USER_AGENT), &FALLBACK_RETRY_DELAYS_S)
            .await
        {
            Ok(b) => b,
            Err(e) => return FetchResult::failure(e.to_string()),
        };

        if body.is_empty() {
            return FetchResult::failure("no content returned");
        }

        FetchResult::from_content(&body, max_chars)
    }

    /// Retrieve page text: reader proxy first, direct fetch on any primary
    /// failure. Never errors; the result carries success and failure detail.
    pub async fn fetch(&self, url: &str, max_chars: usize) -> FetchResult {
        if url.trim().is_empty() {
            return FetchResult::failure("URL cannot be empty");
        }
        if url::Url::parse(url).is_err() {
            return FetchResult::failure(Error::InvalidUrl(url.to_string()).to_string());
        }
        if is_hf_dataset_or_space_url(url) {
            return FetchResult::failure(Error::DisallowedUrl(url.to_string()).to_string());
        }

        let primary = self.fetch_via_reader(url, max_chars).await;
        if primary.success {
            return primary;
        }

        tracing::warn!(url, error = %primary.error, "reader proxy failed, trying direct fetch");
        self.fetch_direct(url, max_chars).await
    }
}
