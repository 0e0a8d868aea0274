//! Agent 输出解析：把松散的 JSON 文本收敛为严格的决策类型
//!
//! 模型常在 JSON 外包裹 Markdown 代码块或说明文字，这里先抽取 JSON 片段再反序列化。
//! 提交者输出解析失败视为 `AgentCallError::Malformed`（计入健康）；
//! 验证者输出解析失败视为 `ValidationParseError`（降级为 decline）。

use std::sync::OnceLock;

use regex::Regex;
use serde::{Deserialize, Serialize};
use serde_json::Value;

use crate::core::error::ValidationParseError;

fn fence_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| {
        Regex::new(r"(?s)```(?:json|JSON)?\s*(.*?)```").expect("static regex")
    })
}

/// 从模型输出中抽取第一个 JSON 值（代码块优先，其次是首个 `{` / `[` 到配对的结束符）
pub fn extract_json(raw: &str) -> Option<Value> {
    let trimmed = raw.trim();
    if let Ok(value) = serde_json::from_str::<Value>(trimmed) {
        return Some(value);
    }
    for caps in fence_regex().captures_iter(trimmed) {
        if let Some(body) = caps.get(1) {
            if let Ok(value) = serde_json::from_str::<Value>(body.as_str().trim()) {
                return Some(value);
            }
        }
    }
    let start = trimmed.find(['{', '['])?;
    let candidate = &trimmed[start..];
    let mut stream = serde_json::Deserializer::from_str(candidate).into_iter::<Value>();
    match stream.next() {
        Some(Ok(value)) => Some(value),
        _ => None,
    }
}

/// 提交者（或 Compiler 的 High-Context / High-Param）的输出
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "action", rename_all = "snake_case")]
pub enum SubmitterOutput {
    Propose { content: String, reasoning: String },
    /// 没有值得提交的内容（不计惩罚）
    Decline { reasoning: String },
}

/// 解析提交者输出
///
/// 接受 `{"submission": .., "reasoning": ..}`、`{"content": .., ..}` 以及带
/// `needs_*` 布尔字段的 Compiler 格式；内容为空或 `needs_* = false` 视为 decline。
pub fn parse_submitter_output(raw: &str) -> Result<SubmitterOutput, String> {
    let value = extract_json(raw).ok_or_else(|| "no JSON object found in output".to_string())?;
    let obj = value
        .as_object()
        .ok_or_else(|| "submitter output must be a JSON object".to_string())?;

    let reasoning = obj
        .get("reasoning")
        .and_then(Value::as_str)
        .ok_or_else(|| "missing required field: reasoning".to_string())?
        .to_string();

    let declined_by_flag = obj
        .iter()
        .any(|(k, v)| k.starts_with("needs_") && v.as_bool() == Some(false));
    if declined_by_flag {
        return Ok(SubmitterOutput::Decline { reasoning });
    }

    let content = match obj.get("submission").or_else(|| obj.get("content")) {
        Some(Value::String(s)) => s.trim().to_string(),
        Some(Value::Null) | None => String::new(),
        Some(other) => return Err(format!("content must be a string, got {other}")),
    };
    if content.is_empty() {
        return Ok(SubmitterOutput::Decline { reasoning });
    }
    Ok(SubmitterOutput::Propose { content, reasoning })
}

/// 验证者对单个提交的裁决
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
#[serde(tag = "decision", rename_all = "snake_case")]
pub enum ValidatorDecision {
    Accept { reasoning: String },
    /// summary 会回馈给提交者作为改进依据
    Reject { reasoning: String, summary: String },
}

impl ValidatorDecision {
    pub fn is_accept(&self) -> bool {
        matches!(self, Self::Accept { .. })
    }

    pub fn reasoning(&self) -> &str {
        match self {
            Self::Accept { reasoning } | Self::Reject { reasoning, .. } => reasoning,
        }
    }
}

#[derive(Debug, Deserialize)]
struct RawDecision {
    decision: String,
    #[serde(default)]
    reasoning: String,
    #[serde(default)]
    summary: String,
    #[serde(default)]
    submission_number: Option<usize>,
}

impl RawDecision {
    fn into_decision(self, raw: &str) -> Result<ValidatorDecision, ValidationParseError> {
        match self.decision.trim().to_lowercase().as_str() {
            "accept" => Ok(ValidatorDecision::Accept {
                reasoning: self.reasoning,
            }),
            "reject" => Ok(ValidatorDecision::Reject {
                reasoning: self.reasoning,
                summary: self.summary,
            }),
            other => Err(ValidationParseError::new(
                format!("invalid decision value '{other}', expected accept or reject"),
                raw,
            )),
        }
    }
}

/// 解析验证者输出，期望恰好 `expected` 条裁决（按提交顺序）
///
/// 接受单个对象（仅 expected == 1）、数组、或 `{"decisions": [...]}`。
/// 数组项带 `submission_number`（从 1 开始）时按编号排序。
pub fn parse_decisions(raw: &str, expected: usize) -> Result<Vec<ValidatorDecision>, ValidationParseError> {
    let value = extract_json(raw).ok_or_else(|| ValidationParseError::new("no JSON found in output", raw))?;

    let items: Vec<Value> = match value {
        Value::Array(items) => items,
        Value::Object(mut obj) => match obj.remove("decisions") {
            Some(Value::Array(items)) => items,
            Some(_) => return Err(ValidationParseError::new("'decisions' must be an array", raw)),
            None => vec![Value::Object(obj)],
        },
        _ => return Err(ValidationParseError::new("expected a JSON object or array", raw)),
    };

    if items.len() != expected {
        return Err(ValidationParseError::new(
            format!("expected {expected} decision(s), got {}", items.len()),
            raw,
        ));
    }

    let mut parsed = items
        .into_iter()
        .map(|item| {
            serde_json::from_value::<RawDecision>(item)
                .map_err(|e| ValidationParseError::new(format!("invalid decision object: {e}"), raw))
        })
        .collect::<Result<Vec<_>, _>>()?;

    if parsed.iter().all(|d| d.submission_number.is_some()) {
        parsed.sort_by_key(|d| d.submission_number);
        let numbers_ok = parsed
            .iter()
            .enumerate()
            .all(|(i, d)| d.submission_number == Some(i + 1));
        if !numbers_ok {
            return Err(ValidationParseError::new(
                format!("submission numbers must cover 1..={expected}"),
                raw,
            ));
        }
    }

    parsed.into_iter().map(|d| d.into_decision(raw)).collect()
}

/// 清理审查第一阶段：验证者提议移除的条目
#[derive(Debug, Clone, PartialEq, Eq, Deserialize)]
pub struct CleanupProposal {
    pub should_remove: bool,
    #[serde(default)]
    pub submission_number: Option<u64>,
    #[serde(default)]
    pub reasoning: String,
}

pub fn parse_cleanup_proposal(raw: &str) -> Result<CleanupProposal, ValidationParseError> {
    let value = extract_json(raw).ok_or_else(|| ValidationParseError::new("no JSON found in output", raw))?;
    let proposal: CleanupProposal = serde_json::from_value(value)
        .map_err(|e| ValidationParseError::new(format!("invalid cleanup proposal: {e}"), raw))?;
    if proposal.should_remove && proposal.submission_number.is_none() {
        return Err(ValidationParseError::new(
            "should_remove is true but no submission_number given",
            raw,
        ));
    }
    Ok(proposal)
}

/// 清理审查第二阶段：确认移除（accept = 同意移除）
pub fn parse_removal_confirmation(raw: &str) -> Result<bool, ValidationParseError> {
    let decisions = parse_decisions(raw, 1)?;
    Ok(decisions.first().is_some_and(ValidatorDecision::is_accept))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_extract_json_from_fence_and_prose() {
        let raw = "Here you go:\n```json\n{\"a\": 1}\n```\nthanks";
        assert_eq!(extract_json(raw).unwrap()["a"], 1);

        let raw = "Sure. {\"b\": [1, 2]} trailing words {not json}";
        assert_eq!(extract_json(raw).unwrap()["b"][1], 2);

        assert!(extract_json("no json here").is_none());
    }

    #[test]
    fn test_submitter_propose_and_decline() {
        let out = parse_submitter_output(r#"{"submission": "pi is transcendental", "reasoning": "new"}"#).unwrap();
        assert_eq!(
            out,
            SubmitterOutput::Propose {
                content: "pi is transcendental".into(),
                reasoning: "new".into()
            }
        );

        let out = parse_submitter_output(r#"{"submission": "  ", "reasoning": "nothing new"}"#).unwrap();
        assert!(matches!(out, SubmitterOutput::Decline { .. }));

        let out = parse_submitter_output(
            r#"{"needs_construction": false, "content": "ignored", "reasoning": "section done"}"#,
        )
        .unwrap();
        assert!(matches!(out, SubmitterOutput::Decline { .. }));
    }

    #[test]
    fn test_submitter_missing_reasoning_is_error() {
        assert!(parse_submitter_output(r#"{"submission": "x"}"#).is_err());
        assert!(parse_submitter_output("garbage").is_err());
    }

    #[test]
    fn test_single_decision() {
        let d = parse_decisions(r#"{"decision": "Reject", "reasoning": "dup", "summary": "covered by #2"}"#, 1).unwrap();
        assert_eq!(
            d,
            vec![ValidatorDecision::Reject {
                reasoning: "dup".into(),
                summary: "covered by #2".into()
            }]
        );
    }

    #[test]
    fn test_batch_decisions_sorted_by_number() {
        let raw = r#"[
            {"submission_number": 2, "decision": "reject", "reasoning": "r2", "summary": "s2"},
            {"submission_number": 1, "decision": "accept", "reasoning": "r1", "summary": ""}
        ]"#;
        let d = parse_decisions(raw, 2).unwrap();
        assert!(d[0].is_accept());
        assert_eq!(d[1].reasoning(), "r2");

        let wrapped = r#"{"decisions": [{"decision": "accept", "reasoning": "ok"}]}"#;
        assert_eq!(parse_decisions(wrapped, 1).unwrap().len(), 1);
    }

    #[test]
    fn test_decision_count_and_value_checked() {
        assert!(parse_decisions(r#"{"decision": "accept", "reasoning": "x"}"#, 2).is_err());
        assert!(parse_decisions(r#"{"decision": "maybe", "reasoning": "x"}"#, 1).is_err());
        let bad_numbers = r#"[{"submission_number": 1, "decision": "accept"}, {"submission_number": 1, "decision": "accept"}]"#;
        assert!(parse_decisions(bad_numbers, 2).is_err());
    }

    #[test]
    fn test_cleanup_proposal() {
        let p = parse_cleanup_proposal(r#"{"should_remove": true, "submission_number": 4, "reasoning": "dup of 12"}"#).unwrap();
        assert_eq!(p.submission_number, Some(4));
        let p = parse_cleanup_proposal(r#"{"should_remove": false, "submission_number": null, "reasoning": "fine"}"#).unwrap();
        assert!(!p.should_remove);
        assert!(parse_cleanup_proposal(r#"{"should_remove": true, "reasoning": "?"}"#).is_err());
    }

    #[test]
    fn test_removal_confirmation() {
        assert!(parse_removal_confirmation(r#"{"decision": "accept", "reasoning": "agree"}"#).unwrap());
        assert!(!parse_removal_confirmation(r#"{"decision": "reject", "reasoning": "keep"}"#).unwrap());
    }
}
