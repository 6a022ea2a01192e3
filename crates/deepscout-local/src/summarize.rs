use deepscout_core::{ChatBackend, ChatMessage, ChatParams, Result};

pub const DEFAULT_INSTRUCTION: &str = "请总结这段内容";

const SUMMARIZE_PROMPT: &str = "你是一个信息整理专家。请根据用户的指令整理以下内容。

用户指令:
{instruction}

待整理的内容:
{content}

请按照用户的要求整理内容，保持信息的准确性和完整性。";

/// Instruction-driven summarization over the summary endpoint.
pub async fn summarize<L: ChatBackend>(
    llm: &L,
    content: &str,
    instruction: &str,
) -> Result<String> {
    let prompt = SUMMARIZE_PROMPT
        .replace("{instruction}", instruction)
        .replace("{content}", content);
    llm.chat(
        &[ChatMessage::user(prompt)],
        &ChatParams::summary(0.3, 8192),
    )
    .await
}
