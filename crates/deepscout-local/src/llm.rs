use std::time::Duration;

use deepscout_core::{
    is_context_length_message, ChatBackend, ChatMessage, ChatParams, ChatRole, Error, Result,
};

use crate::jsonfix;

const CHAT_RETRY_DELAYS_S: [u64; 5] = [1, 2, 4, 8, 16];
const EXTRACT_RETRY_DELAYS_S: [u64; 3] = [1, 2, 4];
/// Tail chars dropped per extract attempt on a context-overflow error.
const EXTRACT_TRUNCATE_STEP: usize = 40_960;
const LLM_REQUEST_TIMEOUT: Duration = Duration::from_secs(300);

const EXTRACT_INFO_PROMPT: &str = "You are given a piece of content and the requirement of information to extract. Your task is to extract the information specifically requested. Be precise and focus exclusively on the requested information.

INFORMATION TO EXTRACT:
{focus}

INSTRUCTIONS:
1. Extract the information relevant to the focus above.
2. If the exact information is not found, extract the most closely related details.
3. Be specific and include exact details when available.
4. Clearly organize the extracted information for easy understanding.
5. Do not include general summaries or unrelated content.

CONTENT TO ANALYZE:
{content}

EXTRACTED INFORMATION:";

/// How a chat-completions endpoint is addressed.
///
/// Sdk mirrors the OpenAI SDK convention (base URL + `/chat/completions`);
/// Direct POSTs the configured URL as-is.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EndpointMode {
    Sdk,
    Direct,
}

#[derive(Debug, Clone)]
struct Endpoint {
    base_url: String,
    api_key: Option<String>,
    model: String,
    mode: EndpointMode,
}

impl Endpoint {
    fn chat_completions_url(&self) -> String {
        match self.mode {
            EndpointMode::Sdk => {
                format!("{}/chat/completions", self.base_url.trim_end_matches('/'))
            }
            EndpointMode::Direct => self.base_url.clone(),
        }
    }
}

/// Parameter quirks per model family, keyed by a case-insensitive substring
/// match on the model name. Quirks never change retry or error semantics.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ModelCaps {
    pub max_tokens_field: &'static str,
    pub service_tier: Option<&'static str>,
    pub reasoning_effort: Option<&'static str>,
}

pub fn caps_for_model(model: &str) -> ModelCaps {
    let m = model.to_lowercase();
    if m.contains("gpt") {
        let newer = m.contains("gpt-5") || m.contains("gpt5");
        ModelCaps {
            max_tokens_field: "max_completion_tokens",
            service_tier: newer.then_some("flex"),
            reasoning_effort: newer.then_some("minimal"),
        }
    } else {
        ModelCaps {
            max_tokens_field: "max_tokens",
            service_tier: None,
            reasoning_effort: None,
        }
    }
}

/// A response stuck in a repetition loop: the trailing 50-char window occurs
/// more than 5 times (non-overlapping) in the full text.
pub fn looks_degenerate(response: &str) -> bool {
    let chars: Vec<char> = response.chars().collect();
    if chars.len() < 50 {
        return false;
    }
    let tail: String = chars[chars.len() - 50..].iter().collect();
    response.matches(&tail).count() > 5
}

fn with_json_instruction(messages: &[ChatMessage]) -> Vec<ChatMessage> {
    let mut out = messages.to_vec();
    match out.last_mut() {
        Some(last) => {
            last.content
                .push_str("\n\nPlease respond in JSON format only, no other text.");
        }
        None => out.push(ChatMessage::user(
            "Please respond in JSON format only, no other text.",
        )),
    }
    out
}

/// Repair-parse model output; degrades to `{"raw_response": ...}` so callers
/// never crash on malformed structured output.
fn parse_json_response(text: &str) -> serde_json::Value {
    if let Some(v) = jsonfix::loads(text) {
        return v;
    }
    if let Some(v) = jsonfix::loads(&format!("{{{text}}}")) {
        return v;
    }
    serde_json::json!({ "raw_response": text })
}

/// Chat gateway over a primary ("main") endpoint and a secondary ("summary")
/// endpoint, with uniform retry/backoff and degenerate-output detection.
#[derive(Debug, Clone)]
pub struct LlmGateway {
    client: reqwest::Client,
    main: Endpoint,
    summary: Endpoint,
}

impl LlmGateway {
    pub fn from_env(client: reqwest::Client) -> Result<Self> {
        let main_api_key = crate::env_first(&["DEEPSCOUT_LLM_API_KEY", "LLM_API_KEY"])
            .ok_or_else(|| Error::NotConfigured("missing DEEPSCOUT_LLM_API_KEY".to_string()))?;
        let main_base_url = crate::env_first(&["DEEPSCOUT_LLM_BASE_URL", "LLM_BASE_URL"])
            .ok_or_else(|| Error::NotConfigured("missing DEEPSCOUT_LLM_BASE_URL".to_string()))?;
        let main_model = crate::env_first(&["DEEPSCOUT_LLM_MODEL", "LLM_MODEL"])
            .ok_or_else(|| Error::NotConfigured("missing DEEPSCOUT_LLM_MODEL".to_string()))?;

        let summary_api_key =
            crate::env_first(&["DEEPSCOUT_SUMMARY_LLM_API_KEY", "SUMMARY_LLM_API_KEY"])
                .unwrap_or_else(|| main_api_key.clone());
        let summary_base_url =
            crate::env_first(&["DEEPSCOUT_SUMMARY_LLM_BASE_URL", "SUMMARY_LLM_BASE_URL"])
                .unwrap_or_else(|| main_base_url.clone());
        let summary_model = crate::env_first(&["DEEPSCOUT_SUMMARY_LLM_MODEL", "SUMMARY_LLM_MODEL"])
            .unwrap_or_else(|| main_model.clone());

        // Mode is decided once at startup from the URL shape.
        let summary_mode = if summary_base_url.ends_with("/chat/completions") {
            EndpointMode::Direct
        } else {
            EndpointMode::Sdk
        };

        Ok(Self {
            client,
            main: Endpoint {
                base_url: main_base_url,
                api_key: Some(main_api_key),
                model: main_model,
                mode: EndpointMode::Sdk,
            },
            summary: Endpoint {
                base_url: summary_base_url,
                api_key: Some(summary_api_key).filter(|k| !k.is_empty()),
                model: summary_model,
                mode: summary_mode,
            },
        })
    }

    fn endpoint(&self, role: ChatRole) -> &Endpoint {
        match role {
            ChatRole::Main => &self.main,
            ChatRole::Summary => &self.summary,
        }
    }

    async fn chat_once(
        &self,
        endpoint: &Endpoint,
        messages: &[ChatMessage],
        temperature: f64,
        max_tokens: u64,
    ) -> Result<String> {
        let caps = caps_for_model(&endpoint.model);
        let mut payload = serde_json::json!({
            "model": endpoint.model,
            "messages": messages,
            "temperature": temperature,
            "stream": false,
        });
        payload[caps.max_tokens_field] = serde_json::json!(max_tokens);
        if let Some(tier) = caps.service_tier {
            payload["service_tier"] = serde_json::json!(tier);
        }
        if let Some(effort) = caps.reasoning_effort {
            payload["reasoning_effort"] = serde_json::json!(effort);
        }

        let mut rb = self
            .client
            .post(endpoint.chat_completions_url())
            .timeout(LLM_REQUEST_TIMEOUT)
            .header(reqwest::header::CONTENT_TYPE, "application/json");
        if let Some(k) = &endpoint.api_key {
            rb = rb.header(reqwest::header::AUTHORIZATION, format!("Bearer {k}"));
        }

        let resp = rb
            .json(&payload)
            .send()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;
        let status = resp.status();
        let body = resp
            .text()
            .await
            .map_err(|e| Error::Transport(e.to_string()))?;

        if !status.is_success() {
            if is_context_length_message(&body) {
                return Err(Error::ContextLength(body));
            }
            return Err(Error::UpstreamStatus {
                status: status.as_u16(),
                message: body,
            });
        }

        let parsed: serde_json::Value =
            serde_json::from_str(&body).map_err(|e| Error::Llm(e.to_string()))?;
        if let Some(content) = parsed
            .pointer("/choices/0/message/content")
            .and_then(|v| v.as_str())
        {
            return Ok(content.to_string());
        }
        if let Some(err) = parsed.get("error") {
            let msg = err.to_string();
            if is_context_length_message(&msg) {
                return Err(Error::ContextLength(msg));
            }
            return Err(Error::Llm(format!("LLM API error: {msg}")));
        }
        Err(Error::Llm(format!("no valid response from LLM API: {body}")))
    }
}

#[async_trait::async_trait]
impl ChatBackend for LlmGateway {
    async fn chat(&self, messages: &[ChatMessage], params: &ChatParams) -> Result<String> {
        let endpoint = self.endpoint(params.role);
        let delays = &CHAT_RETRY_DELAYS_S[..params.max_retries.min(CHAT_RETRY_DELAYS_S.len())];
        let mut last_err: Option<Error> = None;

        for (attempt, delay) in delays.iter().enumerate() {
            let is_last = attempt + 1 == delays.len();
            match self
                .chat_once(endpoint, messages, params.temperature, params.max_tokens)
                .await
            {
                Ok(response) => {
                    if looks_degenerate(&response) {
                        tracing::info!(attempt = attempt + 1, "repetition loop detected, retrying");
                        last_err = Some(Error::DegenerateOutput);
                        if !is_last {
                            tokio::time::sleep(Duration::from_secs(*delay)).await;
                        }
                        continue;
                    }
                    return Ok(response);
                }
                Err(e @ Error::ContextLength(_)) => {
                    // Retried with unchanged input here; shrinking the input
                    // is the caller's job (see extract_info).
                    tracing::info!(attempt = attempt + 1, "context length exceeded, retrying");
                    last_err = Some(e);
                    if !is_last {
                        tokio::time::sleep(Duration::from_secs(*delay)).await;
                    }
                }
                Err(e) => {
                    tracing::info!(attempt = attempt + 1, error = %e, "LLM call failed");
                    last_err = Some(e);
                    if !is_last {
                        tokio::time::sleep(Duration::from_secs(*delay)).await;
                    }
                }
            }
        }

        Err(last_err.unwrap_or_else(|| Error::Llm("LLM call failed after all retries".to_string())))
    }

    async fn chat_json(
        &self,
        messages: &[ChatMessage],
        params: &ChatParams,
    ) -> Result<serde_json::Value> {
        let messages = with_json_instruction(messages);
        let text = self.chat(&messages, params).await?;
        Ok(parse_json_response(&text))
    }

    async fn extract_info(&self, content: &str, focus: &str) -> Result<String> {
        let mut content = content.to_string();

        for (attempt, delay) in EXTRACT_RETRY_DELAYS_S.iter().enumerate() {
            let prompt = EXTRACT_INFO_PROMPT
                .replace("{focus}", focus)
                .replace("{content}", &content);
            let params = ChatParams {
                role: ChatRole::Summary,
                temperature: 1.0,
                max_tokens: 8192,
                max_retries: 2,
            };
            match self.chat(&[ChatMessage::user(prompt)], &params).await {
                Ok(result) => return Ok(result),
                Err(Error::ContextLength(_)) => {
                    let drop = EXTRACT_TRUNCATE_STEP * (attempt + 1);
                    let keep = content.chars().count().saturating_sub(drop);
                    content = content.chars().take(keep).collect();
                    content.push_str("[...truncated]");
                    tokio::time::sleep(Duration::from_secs(*delay)).await;
                }
                Err(e) => return Err(e),
            }
        }

        Err(Error::Llm(
            "failed to extract info after all retries".to_string(),
        ))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn degenerate_tail_repeated_six_times_is_detected() {
        // 60-char block repeated 6 times: the 50-char tail occurs 7 times
        // non-overlapping.
        let response = "x".repeat(360);
        assert!(looks_degenerate(&response));
    }

    #[test]
    fn short_or_varied_output_is_not_degenerate() {
        assert!(!looks_degenerate("short"));
        let varied: String = (0..200).map(|i| ((i % 26) as u8 + b'a') as char).collect();
        assert!(!looks_degenerate(&varied));
    }

    #[test]
    fn caps_gpt_family_uses_completion_tokens() {
        let caps = caps_for_model("GPT-4o-mini");
        assert_eq!(caps.max_tokens_field, "max_completion_tokens");
        assert_eq!(caps.service_tier, None);
        assert_eq!(caps.reasoning_effort, None);
    }

    #[test]
    fn caps_gpt5_family_gets_flex_tier() {
        for model in ["gpt-5", "Gpt5-turbo", "openai/GPT-5-mini"] {
            let caps = caps_for_model(model);
            assert_eq!(caps.max_tokens_field, "max_completion_tokens");
            assert_eq!(caps.service_tier, Some("flex"));
            assert_eq!(caps.reasoning_effort, Some("minimal"));
        }
    }

    #[test]
    fn caps_other_models_use_max_tokens() {
        let caps = caps_for_model("claude-sonnet-4");
        assert_eq!(caps.max_tokens_field, "max_tokens");
        assert_eq!(caps.service_tier, None);
    }

    #[test]
    fn json_instruction_appends_to_last_message() {
        let out = with_json_instruction(&[ChatMessage::user("plan queries")]);
        assert_eq!(out.len(), 1);
        assert!(out[0].content.starts_with("plan queries"));
        assert!(out[0].content.contains("JSON format only"));
    }

    #[test]
    fn json_instruction_on_empty_messages_adds_one() {
        let out = with_json_instruction(&[]);
        assert_eq!(out.len(), 1);
        assert!(out[0].content.contains("JSON format only"));
    }

    #[test]
    fn parse_json_response_repairs_and_degrades() {
        assert_eq!(parse_json_response(r#"{"a": 1}"#)["a"], 1);
        // Brace-wrapping rescue for bare key/value text.
        let v = parse_json_response(r#""is_sufficient": true"#);
        assert_eq!(v["is_sufficient"], true);
        // Hopeless text is preserved under the sentinel key.
        let v = parse_json_response("I could not produce JSON");
        assert_eq!(v["raw_response"], "I could not produce JSON");
    }

    #[test]
    fn sdk_mode_appends_chat_completions_path() {
        let ep = Endpoint {
            base_url: "https://api.example.com/v1/".to_string(),
            api_key: None,
            model: "m".to_string(),
            mode: EndpointMode::Sdk,
        };
        assert_eq!(
            ep.chat_completions_url(),
            "https://api.example.com/v1/chat/completions"
        );
    }

    #[test]
    fn direct_mode_uses_url_verbatim() {
        let ep = Endpoint {
            base_url: "https://api.example.com/v1/chat/completions".to_string(),
            api_key: None,
            model: "m".to_string(),
            mode: EndpointMode::Direct,
        };
        assert_eq!(
            ep.chat_completions_url(),
            "https://api.example.com/v1/chat/completions"
        );
    }
}
