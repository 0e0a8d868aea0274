//! 各角色的提示词构建
//!
//! 只负责拼装文本与 JSON 格式约定；解析见 `core::decision`。

use crate::core::submission::{Submission, Submitter};
use crate::memory::Corpus;

const SUBMITTER_SCHEMA: &str = r#"Respond with a single JSON object:
{
  "submission": "the new content to add (empty string if you have nothing valuable to add)",
  "reasoning": "why this content adds value that the accepted set does not already provide"
}"#;

const VALIDATOR_SCHEMA: &str = r#"Respond with JSON. For one submission:
{"decision": "accept" or "reject", "reasoning": "...", "summary": "short feedback for the submitter (empty when accepting)"}
For several submissions, respond with an array in submission order:
[{"submission_number": 1, "decision": "accept", "reasoning": "...", "summary": ""}, ...]"#;

const CLEANUP_SCHEMA: &str = r#"Respond with a single JSON object:
{
  "should_remove": true or false,
  "submission_number": the number of the ONE entry to remove, or null,
  "reasoning": "detailed explanation"
}"#;

const REMOVAL_SCHEMA: &str = r#"Respond with a single JSON object:
{"decision": "accept" (remove it) or "reject" (keep it), "reasoning": "...", "summary": ""}"#;

pub fn submitter_system_prompt(role_label: &str, phase: &str) -> String {
    format!(
        "You are {role_label}, one of several independent agents contributing to a shared body of work \
         (current phase: {phase}). Propose exactly one new, non-redundant contribution per turn, \
         or propose nothing if you cannot add value.\n\n{SUBMITTER_SCHEMA}"
    )
}

/// 提交者的用户提示：目标 + 当前语料 + 最近被拒的反馈
pub fn submitter_prompt(goal: &str, corpus: &Corpus, submitter: Option<&Submitter>) -> String {
    let mut prompt = format!("GOAL:\n{goal}\n\nACCEPTED SO FAR:\n{}\n", corpus.formatted());
    if let Some(submitter) = submitter {
        let feedback: Vec<&str> = submitter.recent_rejections().collect();
        if !feedback.is_empty() {
            prompt.push_str("\nYOUR RECENT REJECTIONS (avoid repeating these mistakes):\n");
            for (i, summary) in feedback.iter().enumerate() {
                prompt.push_str(&format!("{}. {summary}\n", i + 1));
            }
        }
    }
    prompt
}

pub fn validator_system_prompt(phase: &str) -> String {
    format!(
        "You are the single validator guarding the quality of a shared body of work (current phase: {phase}). \
         Accept a submission only if it is correct, relevant to the goal and not redundant with accepted content.\n\n\
         {VALIDATOR_SCHEMA}"
    )
}

pub fn validator_prompt(goal: &str, corpus: &Corpus, pending: &[Submission]) -> String {
    let mut prompt = format!("GOAL:\n{goal}\n\nACCEPTED SO FAR:\n{}\n\n", corpus.formatted());
    prompt.push_str(&format!("SUBMISSIONS TO VALIDATE ({}):\n", pending.len()));
    for (i, submission) in pending.iter().enumerate() {
        prompt.push_str(&format!(
            "\n=== SUBMISSION {} (from Submitter {}) ===\n{}\nSubmitter reasoning: {}\n",
            i + 1,
            submission.submitter_id,
            submission.content,
            submission.submitter_reasoning
        ));
    }
    prompt
}

pub fn cleanup_system_prompt() -> String {
    format!(
        "You are reviewing an accumulated set of accepted entries. Identify at most ONE entry that is \
         redundant, superseded or wrong. Propose removal only when the set is clearly better without it.\n\n\
         {CLEANUP_SCHEMA}"
    )
}

/// 清理审查只给出编号与内容，不含提交者理由等附加上下文
pub fn cleanup_prompt(goal: &str, corpus: &Corpus) -> String {
    format!("GOAL:\n{goal}\n\nACCEPTED ENTRIES:\n{}\n", corpus.formatted())
}

pub fn removal_system_prompt() -> String {
    format!(
        "A reviewer proposed removing one accepted entry. Confirm the removal only if the reasoning holds.\n\n\
         {REMOVAL_SCHEMA}"
    )
}

pub fn removal_prompt(goal: &str, number: u64, content: &str, reasoning: &str) -> String {
    format!(
        "GOAL:\n{goal}\n\nENTRY #{number}:\n{content}\n\nPROPOSED REMOVAL REASONING:\n{reasoning}\n"
    )
}

/// 恢复后的试用调用：要求模型输出固定 JSON
pub const PROBE_SYSTEM_PROMPT: &str = "You are being health-checked. Reply with the exact JSON requested and nothing else.";
pub const PROBE_PROMPT: &str = r#"Reply with: {"status": "ok"}"#;
