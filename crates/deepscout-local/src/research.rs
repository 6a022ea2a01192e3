use std::sync::Arc;
use std::time::Duration;

use deepscout_core::{
    AnalysisResult, ChatBackend, ChatMessage, ChatParams, Finding, PlanResult, Reader, Result,
    ResearchSession, SearchBackend, SearchKind, Source,
};

/// Queries taken from round-0 planning.
const MAX_PLANNED_QUERIES: usize = 5;
/// Queries actually issued per round.
const QUERIES_PER_ROUND: usize = 3;
/// Raw results requested per query.
const RESULTS_PER_QUERY: usize = 5;
/// Unseen result URLs read per query.
const READS_PER_QUERY: usize = 3;
/// Findings included in the analysis digest.
const DIGEST_FINDINGS: usize = 15;
const DIGEST_CLIP_CHARS: usize = 200;
const PREVIEW_CLIP_CHARS: usize = 300;
/// Early stop requires the model to call coverage sufficient at or above
/// this confidence; a bare "sufficient" is not enough.
const EARLY_STOP_CONFIDENCE: u32 = 70;
/// Courtesy pause between rounds for upstream providers.
const ROUND_PACING: Duration = Duration::from_secs(1);

const PLAN_PROMPT: &str = "你是一个研究助手。用户想研究以下话题：

研究话题: {question}

请规划一系列搜索查询来帮助研究这个话题。请以 JSON 格式返回搜索查询列表，格式如下：
{
  \"search_queries\": [
    \"第一个搜索查询\",
    \"第二个搜索查询\",
    \"第三个搜索查询\",
    \"第四个搜索查询\",
    \"第五个搜索查询\"
  ]
}

最多返回 5 个搜索查询，要从不同角度覆盖这个话题。";

const ANALYZE_PROMPT: &str = "你是一个研究助手。我们正在研究以下话题：

研究话题: {question}

已收集的信息摘要:
{findings_summary}

请分析这些信息，从以下维度评估：
1. 当前信息覆盖了哪些方面？（技术、商业、监管、案例等）
2. 还缺少哪些关键方面？
3. 已有信息之间是否有矛盾需要验证？
4. 请生成针对具体缺失方面的补充搜索词
5. 如果有特别有价值但摘要太短的 URL，请建议深入阅读

请以 JSON 格式返回：
{
  \"is_sufficient\": true/false,
  \"confidence\": 0-100,
  \"covered_aspects\": [\"已覆盖的方面1\", \"方面2\"],
  \"missing_aspects\": [\"缺失的方面1\", \"方面2\"],
  \"contradictions\": [\"矛盾点1\"],
  \"further_search_queries\": [\"针对缺失方面的搜索词1\", \"搜索词2\", \"搜索词3\"],
  \"urls_to_deep_read\": [\"需要深入阅读的URL1\"]
}

只返回 JSON，不要其他内容。";

const SYNTHESIZE_PROMPT: &str = "你是一个研究助手。请综合以下研究结果：

研究话题: {question}

收集到的信息:
{all_info}

请整理一个清晰的研究总结，格式请参考：
## 关键发现
1. [发现内容] — 来源: [URL]
2. ...

## 各信息源详情
### 来源: [标题] ([URL])
[内容]";

fn clip_chars(s: &str, max: usize) -> String {
    s.chars().take(max).collect()
}

/// Digest of collected findings for the analysis prompt; each entry clipped
/// so a long session still fits the model's context.
fn build_digest(findings: &[Finding]) -> String {
    findings
        .iter()
        .take(DIGEST_FINDINGS)
        .map(|f| {
            if f.excerpt.chars().count() > DIGEST_CLIP_CHARS {
                format!("- {}...", clip_chars(&f.excerpt, DIGEST_CLIP_CHARS))
            } else {
                format!("- {}", f.excerpt)
            }
        })
        .collect::<Vec<_>>()
        .join("\n")
}

fn finding_preview(content: &str) -> String {
    clip_chars(content, PREVIEW_CLIP_CHARS).replace('\n', " ")
}

/// Multi-round research engine: plan, search, read, analyze, synthesize.
///
/// One invocation owns one `ResearchSession`; the backends are shared,
/// stateless handles.
#[derive(Debug, Clone)]
pub struct Researcher<L, S, R> {
    llm: Arc<L>,
    search: Arc<S>,
    reader: Arc<R>,
}

impl<L, S, R> Researcher<L, S, R>
where
    L: ChatBackend,
    S: SearchBackend,
    R: Reader,
{
    pub fn new(llm: Arc<L>, search: Arc<S>, reader: Arc<R>) -> Self {
        Self { llm, search, reader }
    }

    /// Read one URL into the session, guarded by the visited set. Failures
    /// are logged and skipped; a bad source never aborts a round.
    async fn read_into(&self, session: &mut ResearchSession, url: &str, title: Option<String>) {
        if !session.visited_urls.insert(url.to_string()) {
            return;
        }
        session.read_count += 1;

        let focus = session.topic.clone();
        match self.reader.read(url, Some(focus.as_str())).await {
            Ok(content) => {
                session.findings.push(Finding {
                    excerpt: finding_preview(&content),
                    source_url: url.to_string(),
                });
                session.sources.push(Source {
                    url: url.to_string(),
                    title,
                    content,
                });
            }
            Err(e) => {
                tracing::warn!(url, error = %e, "failed to read source, skipping");
            }
        }
    }

    async fn plan_queries(&self, topic: &str) -> Result<Vec<String>> {
        let prompt = PLAN_PROMPT.replace("{question}", topic);
        let value = self
            .llm
            .chat_json(&[ChatMessage::user(prompt)], &ChatParams::main(0.7, 4000))
            .await?;
        let plan: PlanResult = serde_json::from_value(value).unwrap_or_default();

        let mut queries = plan.search_queries;
        queries.truncate(MAX_PLANNED_QUERIES);
        if queries.is_empty() {
            queries.push(topic.to_string());
        }
        Ok(queries)
    }

    async fn analyze_round(&self, session: &ResearchSession) -> Result<AnalysisResult> {
        let prompt = ANALYZE_PROMPT
            .replace("{question}", &session.topic)
            .replace("{findings_summary}", &build_digest(&session.findings));
        let value = self
            .llm
            .chat_json(&[ChatMessage::user(prompt)], &ChatParams::main(0.7, 4000))
            .await?;
        Ok(serde_json::from_value(value).unwrap_or_default())
    }

    /// Run the round loop and return the populated session (no synthesis).
    pub async fn collect(&self, question: &str, max_rounds: usize) -> Result<ResearchSession> {
        let mut session = ResearchSession::new(question, max_rounds);

        for round in 0..max_rounds {
            session.rounds_executed = round + 1;
            tracing::info!(round = round + 1, max_rounds, "research round");

            let mut deep_read_urls: Vec<String> = Vec::new();
            let queries = if round == 0 {
                self.plan_queries(question).await?
            } else {
                let analysis = self.analyze_round(&session).await?;
                if analysis.is_sufficient && analysis.confidence >= EARLY_STOP_CONFIDENCE {
                    tracing::info!(
                        confidence = analysis.confidence,
                        "coverage sufficient, stopping early"
                    );
                    break;
                }
                if !analysis.missing_aspects.is_empty() {
                    tracing::debug!(missing = ?analysis.missing_aspects, "coverage gaps");
                }
                deep_read_urls = analysis.urls_to_deep_read;

                if analysis.further_search_queries.is_empty() {
                    vec![format!("{question} 补充信息")]
                } else {
                    analysis.further_search_queries
                }
            };

            // Deep reads first: analysis judged these worth full content.
            for url in &deep_read_urls {
                self.read_into(&mut session, url, None).await;
            }

            for query in queries.iter().take(QUERIES_PER_ROUND) {
                session.search_count += 1;
                let hits = self
                    .search
                    .raw_search(query, RESULTS_PER_QUERY, SearchKind::Web)
                    .await?;

                let unseen: Vec<_> = hits
                    .into_iter()
                    .filter(|h| !h.link.is_empty() && !session.visited_urls.contains(&h.link))
                    .take(READS_PER_QUERY)
                    .collect();
                for hit in unseen {
                    let title = (!hit.title.is_empty()).then(|| hit.title.clone());
                    self.read_into(&mut session, &hit.link, title).await;
                }
            }

            tokio::time::sleep(ROUND_PACING).await;
        }

        Ok(session)
    }

    async fn synthesize(&self, session: &ResearchSession) -> Result<String> {
        let all_info = session
            .sources
            .iter()
            .enumerate()
            .map(|(i, s)| format!("来源 {}: {}\n{}", i + 1, s.label(), s.content))
            .collect::<Vec<_>>()
            .join("\n\n");

        let prompt = SYNTHESIZE_PROMPT
            .replace("{question}", &session.topic)
            .replace("{all_info}", &all_info);
        self.llm
            .chat(&[ChatMessage::user(prompt)], &ChatParams::main(0.3, 8192))
            .await
    }

    /// Full research call: bounded rounds, then synthesis (synthesis always
    /// runs; the engine never returns partial state without it).
    pub async fn run(&self, question: &str, max_rounds: usize) -> Result<String> {
        let session = self.collect(question, max_rounds).await?;

        tracing::info!(
            sources = session.sources.len(),
            reads = session.read_count,
            "synthesizing report"
        );
        let summary = self.synthesize(&session).await?;

        let mut stats = format!(
            "\n---\n### 查询过程统计\n- 搜索轮数: {}\n- 搜索关键词: {} 个\n- 访问网页: {} 个\n- 有效信息源: {} 个\n\n### 信息来源\n",
            session.rounds_executed,
            session.search_count,
            session.read_count,
            session.sources.len(),
        );
        for (i, s) in session.sources.iter().enumerate() {
            stats.push_str(&format!("{}. [{}]({})\n", i + 1, s.label(), s.url));
        }

        Ok(format!(
            "## 调查结果: {}\n\n{}\n{}",
            session.topic, summary, stats
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use deepscout_core::{Error, SearchHit};
    use std::sync::Mutex;

    #[test]
    fn digest_clips_long_findings() {
        let findings = vec![
            Finding {
                excerpt: "short".to_string(),
                source_url: "u1".to_string(),
            },
            Finding {
                excerpt: "y".repeat(250),
                source_url: "u2".to_string(),
            },
        ];
        let digest = build_digest(&findings);
        let lines: Vec<&str> = digest.lines().collect();
        assert_eq!(lines[0], "- short");
        assert!(lines[1].ends_with("..."));
        assert_eq!(lines[1].chars().count(), 2 + DIGEST_CLIP_CHARS + 3);
    }

    #[test]
    fn digest_is_bounded_to_first_fifteen() {
        let findings: Vec<Finding> = (0..40)
            .map(|i| Finding {
                excerpt: format!("f{i}"),
                source_url: format!("u{i}"),
            })
            .collect();
        assert_eq!(build_digest(&findings).lines().count(), DIGEST_FINDINGS);
    }

    #[test]
    fn preview_collapses_newlines_and_clips() {
        let content = format!("line1\nline2\n{}", "z".repeat(400));
        let p = finding_preview(&content);
        assert!(!p.contains('\n'));
        assert_eq!(p.chars().count(), PREVIEW_CLIP_CHARS);
        assert!(p.starts_with("line1 line2 "));
    }

    // Scripted backends: plan 2 queries, then report sufficient coverage at
    // high confidence so round 2 stops early.

    struct ScriptedChat;

    #[async_trait::async_trait]
    impl ChatBackend for ScriptedChat {
        async fn chat(&self, _m: &[ChatMessage], _p: &ChatParams) -> Result<String> {
            Ok("综合报告正文".to_string())
        }

        async fn chat_json(
            &self,
            messages: &[ChatMessage],
            _p: &ChatParams,
        ) -> Result<serde_json::Value> {
            // The analysis prompt mentions "further_search_queries", so the
            // sufficiency marker must be checked first.
            let prompt = &messages[0].content;
            if prompt.contains("is_sufficient") {
                Ok(serde_json::json!({ "is_sufficient": true, "confidence": 90 }))
            } else {
                Ok(serde_json::json!({ "search_queries": ["q1", "q2"] }))
            }
        }

        async fn extract_info(&self, _c: &str, _f: &str) -> Result<String> {
            unreachable!("scripted reader never delegates to the gateway")
        }
    }

    struct ScriptedSearch {
        calls: Mutex<Vec<String>>,
    }

    #[async_trait::async_trait]
    impl SearchBackend for ScriptedSearch {
        async fn raw_search(
            &self,
            query: &str,
            _n: usize,
            _k: SearchKind,
        ) -> Result<Vec<SearchHit>> {
            self.calls.lock().unwrap().push(query.to_string());
            // Same two URLs for every query: dedup must keep reads unique.
            Ok(vec![
                SearchHit {
                    title: "Page A".to_string(),
                    link: "https://a.example/1".to_string(),
                    snippet: "sa".to_string(),
                },
                SearchHit {
                    title: String::new(),
                    link: "https://b.example/2".to_string(),
                    snippet: "sb".to_string(),
                },
            ])
        }
    }

    struct ScriptedReader {
        fail_url: Option<String>,
    }

    #[async_trait::async_trait]
    impl Reader for ScriptedReader {
        async fn read(&self, url: &str, _focus: Option<&str>) -> Result<String> {
            if self.fail_url.as_deref() == Some(url) {
                return Err(Error::Fetch("scripted failure".to_string()));
            }
            Ok(format!("content of {url}"))
        }
    }

    fn researcher(
        fail_url: Option<String>,
    ) -> Researcher<ScriptedChat, ScriptedSearch, ScriptedReader> {
        Researcher::new(
            Arc::new(ScriptedChat),
            Arc::new(ScriptedSearch {
                calls: Mutex::new(Vec::new()),
            }),
            Arc::new(ScriptedReader { fail_url }),
        )
    }

    #[tokio::test(start_paused = true)]
    async fn session_invariants_hold() {
        let r = researcher(None);
        let session = r.collect("话题X", 2).await.unwrap();

        // Early stop in round 2: analysis said sufficient at 90.
        assert_eq!(session.rounds_executed, 2);
        assert!(session.rounds_executed <= session.max_rounds);
        // 2 planned queries issued, 2 unique URLs read once each.
        assert_eq!(session.search_count, 2);
        assert_eq!(session.visited_urls.len(), session.sources.len());
        assert_eq!(session.sources.len(), 2);
        assert_eq!(session.read_count, 2);
        assert_eq!(session.findings.len(), session.sources.len());
        for f in &session.findings {
            assert!(session.sources.iter().any(|s| s.url == f.source_url));
        }
    }

    #[tokio::test(start_paused = true)]
    async fn read_failures_are_skipped_not_fatal() {
        let r = researcher(Some("https://a.example/1".to_string()));
        let session = r.collect("话题X", 1).await.unwrap();

        // The failed URL still counts as visited/read, but produced no source.
        assert_eq!(session.read_count, 2);
        assert_eq!(session.visited_urls.len(), 2);
        assert_eq!(session.sources.len(), 1);
        assert_eq!(session.sources[0].url, "https://b.example/2");
    }

    #[tokio::test(start_paused = true)]
    async fn report_carries_stats_and_unique_sources() {
        let r = researcher(None);
        let report = r.run("话题X", 2).await.unwrap();

        assert!(report.starts_with("## 调查结果: 话题X"));
        assert!(report.contains("- 搜索轮数: 2"));
        assert!(report.contains("### 信息来源"));
        assert!(report.contains("1. [Page A](https://a.example/1)"));
        // Untitled source falls back to its URL as the label.
        assert!(report.contains("2. [https://b.example/2](https://b.example/2)"));
        // Each source is listed exactly once.
        assert_eq!(report.matches("https://a.example/1").count(), 1);
    }
}
