use std::time::Duration;

use serde::Deserialize;

use deepscout_core::{Error, Result, SearchBackend, SearchHit, SearchKind};

use crate::urlnorm::{decode_hit_urls, is_hf_dataset_or_space_url};

const SEARCH_RETRY_DELAYS_S: [u64; 3] = [4, 7, 10];
const SEARCH_REQUEST_TIMEOUT: Duration = Duration::from_secs(30);

/// Keyword search over the Serper API (Google results as JSON).
#[derive(Debug, Clone)]
pub struct SerperClient {
    client: reqwest::Client,
    api_key: String,
    base_url: String,
}

#[derive(Debug, Deserialize)]
struct SerperResponse {
    #[serde(default)]
    organic: Vec<SearchHit>,
}

impl SerperClient {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let api_key = crate::env_first(&["DEEPSCOUT_SERPER_API_KEY", "SERPER_API_KEY"])
            .ok_or_else(|| {
                Error::NotConfigured(
                    "missing DEEPSCOUT_SERPER_API_KEY (or SERPER_API_KEY)".to_string(),
                )
            })?;
        let base_url = crate::env_first(&["DEEPSCOUT_SERPER_BASE_URL", "SERPER_BASE_URL"])
            .unwrap_or_else(|| "https://google.serper.dev".to_string());
        Ok(Self {
            client,
            api_key,
            base_url,
        })
    }

    fn endpoint_search(&self) -> String {
        format!("{}/search", self.base_url.trim_end_matches('/'))
    }

    async fn search_once(
        &self,
        query: &str,
        num_results: usize,
        kind: SearchKind,
    ) -> Result<SerperResponse> {
        let mut payload = serde_json::json!({
            "q": query.trim(),
            "gl": "us",
            "hl": "en",
            "num": num_results,
        });
        if kind == SearchKind::News {
            // Recency filter: last week.
            payload["tbs"] = serde_json::json!("qdr:w");
        }

        let resp = self
            .client
            .post(self.endpoint_search())
            .header("X-API-KEY", &self.api_key)
            .header(reqwest::header::CONTENT_TYPE, "application/json")
            .json(&payload)
            .timeout(SEARCH_REQUEST_TIMEOUT)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        let status = resp.status();
        if !status.is_success() {
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                message: format!("serper search HTTP {status}"),
            });
        }

        resp.json().await.map_err(|e| Error::Search(e.to_string()))
    }

    /// Formatted search for the tool surface. Zero results never errors; when
    /// the query carried quotes and matched nothing, one retry with the
    /// quotes stripped is attempted.
    pub async fn search(
        &self,
        query: &str,
        num_results: usize,
        kind: SearchKind,
    ) -> Result<String> {
        let mut current = query.to_string();
        for attempt in 0..2 {
            let hits = self.raw_search(&current, num_results, kind).await?;
            if hits.is_empty() && attempt == 0 && current.contains('"') {
                tracing::info!(query = %current, "no results, retrying without quotes");
                current = current.replace('"', "");
                continue;
            }
            return Ok(format_hits(&current, &hits));
        }
        unreachable!("search loop always returns within two attempts");
    }
}

pub fn format_hits(query: &str, hits: &[SearchHit]) -> String {
    let mut out = Vec::with_capacity(hits.len() * 3 + 2);
    out.push(format!("## 搜索结果: \"{query}\""));
    out.push(format!("共找到 {} 条结果\n", hits.len()));
    for (i, hit) in hits.iter().enumerate() {
        out.push(format!("{}. **{}**", i + 1, hit.title));
        out.push(format!("   链接: {}", hit.link));
        out.push(format!("   摘要: {}\n", hit.snippet));
    }
    out.join("\n")
}

#[async_trait::async_trait]
impl SearchBackend for SerperClient {
    async fn raw_search(
        &self,
        query: &str,
        num_results: usize,
        kind: SearchKind,
    ) -> Result<Vec<SearchHit>> {
        let mut last_err: Option<Error> = None;

        for (attempt, delay) in SEARCH_RETRY_DELAYS_S.iter().enumerate() {
            match self.search_once(query, num_results, kind).await {
                Ok(parsed) => {
                    let mut hits: Vec<SearchHit> = parsed
                        .organic
                        .into_iter()
                        .filter(|h| !is_hf_dataset_or_space_url(&h.link))
                        .collect();
                    decode_hit_urls(&mut hits);
                    return Ok(hits);
                }
                // Connection problems and HTTP status errors get the fixed
                // backoff; anything else (e.g. a malformed body) propagates.
                Err(e @ (Error::Transport(_) | Error::UpstreamStatus { .. })) => {
                    tracing::info!(attempt = attempt + 1, error = %e, "search failed");
                    last_err = Some(e);
                    if attempt + 1 < SEARCH_RETRY_DELAYS_S.len() {
                        tokio::time::sleep(Duration::from_secs(*delay)).await;
                    }
                }
                Err(e) => return Err(e),
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Search("search failed".to_string())))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_minimal_serper_shape() {
        let js = r#"
        {
          "organic": [
            {"title":"Example","link":"https://example.com","snippet":"Hello"}
          ]
        }
        "#;
        let parsed: SerperResponse = serde_json::from_str(js).unwrap();
        assert_eq!(parsed.organic.len(), 1);
        assert_eq!(parsed.organic[0].link, "https://example.com");
        assert_eq!(parsed.organic[0].title, "Example");
        assert_eq!(parsed.organic[0].snippet, "Hello");
    }

    #[test]
    fn missing_organic_array_parses_to_empty() {
        let parsed: SerperResponse = serde_json::from_str("{}").unwrap();
        assert!(parsed.organic.is_empty());
    }

    #[test]
    fn formats_numbered_results() {
        let hits = vec![
            SearchHit {
                title: "A".to_string(),
                link: "https://a.com".to_string(),
                snippet: "sa".to_string(),
            },
            SearchHit {
                title: "B".to_string(),
                link: "https://b.com".to_string(),
                snippet: "sb".to_string(),
            },
        ];
        let text = format_hits("rust", &hits);
        assert!(text.starts_with("## 搜索结果: \"rust\""));
        assert!(text.contains("共找到 2 条结果"));
        assert!(text.contains("1. **A**"));
        assert!(text.contains("   链接: https://b.com"));
    }

    #[test]
    fn zero_results_still_formats() {
        let text = format_hits("nothing", &[]);
        assert!(text.contains("共找到 0 条结果"));
    }
}
