//! 脚本化 Agent（用于测试与 `--mock` 离线运行，无需 API）
//!
//! 按 model id 排队预设的应答或错误；队列为空时：
//! - `ScriptedAgent::new()` 返回 Unavailable
//! - `ScriptedAgent::cooperative()` 按角色生成合法的默认应答（提交者提议、验证者全部接受、清理不移除）

use std::collections::{HashMap, VecDeque};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::{Mutex, MutexGuard, OnceLock, PoisonError};
use std::time::Duration;

use async_trait::async_trait;
use regex::Regex;

use crate::core::error::AgentCallError;
use crate::core::health::ModelKey;
use crate::llm::{AgentCall, AgentRequest, AgentResponse, ProviderConfig, TokenUsage};

enum Scripted {
    Reply(String, Option<Duration>),
    Fail(AgentCallError),
}

/// 一次被记录的调用
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RecordedCall {
    pub role: String,
    pub model: ModelKey,
}

#[derive(Default)]
pub struct ScriptedAgent {
    queues: Mutex<HashMap<String, VecDeque<Scripted>>>,
    calls: Mutex<Vec<RecordedCall>>,
    cooperative: bool,
    counter: AtomicU64,
}

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(PoisonError::into_inner)
}

fn pending_count_regex() -> &'static Regex {
    static RE: OnceLock<Regex> = OnceLock::new();
    RE.get_or_init(|| Regex::new(r"SUBMISSIONS TO VALIDATE \((\d+)\)").expect("static regex"))
}

impl ScriptedAgent {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn cooperative() -> Self {
        Self {
            cooperative: true,
            ..Self::default()
        }
    }

    fn push(&self, model_id: &str, step: Scripted) {
        lock(&self.queues)
            .entry(model_id.to_string())
            .or_default()
            .push_back(step);
    }

    pub fn push_ok(&self, model_id: &str, text: impl Into<String>) {
        self.push(model_id, Scripted::Reply(text.into(), None));
    }

    pub fn push_delayed(&self, model_id: &str, text: impl Into<String>, delay: Duration) {
        self.push(model_id, Scripted::Reply(text.into(), Some(delay)));
    }

    pub fn push_err(&self, model_id: &str, error: AgentCallError) {
        self.push(model_id, Scripted::Fail(error));
    }

    /// 连续 n 次失败
    pub fn push_failures(&self, model_id: &str, n: usize, error: AgentCallError) {
        for _ in 0..n {
            self.push_err(model_id, error.clone());
        }
    }

    pub fn calls(&self) -> Vec<RecordedCall> {
        lock(&self.calls).clone()
    }

    pub fn calls_for(&self, model_id: &str) -> usize {
        lock(&self.calls).iter().filter(|c| c.model.model_id == model_id).count()
    }

    fn default_reply(&self, request: &AgentRequest) -> Result<String, AgentCallError> {
        if !self.cooperative {
            return Err(AgentCallError::Unavailable(format!(
                "no scripted response for role {}",
                request.role
            )));
        }
        let n = self.counter.fetch_add(1, Ordering::Relaxed);
        let reply = match request.role.as_str() {
            "Probe" => r#"{"status": "ok"}"#.to_string(),
            "Cleanup Review" => {
                r#"{"should_remove": false, "submission_number": null, "reasoning": "all entries add value"}"#.to_string()
            }
            "Removal Confirmation" => r#"{"decision": "accept", "reasoning": "agreed", "summary": ""}"#.to_string(),
            "Validator" => {
                let pending = pending_count_regex()
                    .captures(&request.prompt)
                    .and_then(|c| c[1].parse::<usize>().ok())
                    .unwrap_or(1);
                let decisions: Vec<serde_json::Value> = (1..=pending)
                    .map(|i| {
                        serde_json::json!({
                            "submission_number": i,
                            "decision": "accept",
                            "reasoning": "adds value",
                            "summary": ""
                        })
                    })
                    .collect();
                serde_json::Value::Array(decisions).to_string()
            }
            role => serde_json::json!({
                "submission": format!("{role} contribution #{n}"),
                "reasoning": "extends the accepted set"
            })
            .to_string(),
        };
        Ok(reply)
    }
}

#[async_trait]
impl AgentCall for ScriptedAgent {
    async fn call(&self, request: &AgentRequest, provider: &ProviderConfig) -> Result<AgentResponse, AgentCallError> {
        lock(&self.calls).push(RecordedCall {
            role: request.role.clone(),
            model: provider.key(),
        });
        let step = lock(&self.queues)
            .get_mut(&provider.model_id)
            .and_then(VecDeque::pop_front);

        let text = match step {
            Some(Scripted::Reply(text, delay)) => {
                if let Some(delay) = delay {
                    tokio::time::sleep(delay).await;
                }
                text
            }
            Some(Scripted::Fail(error)) => return Err(error),
            None => self.default_reply(request)?,
        };
        let usage = TokenUsage {
            prompt_tokens: (request.prompt.len() / 4) as u64,
            completion_tokens: (text.len() / 4) as u64,
        };
        Ok(AgentResponse { text, usage })
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn test_scripted_queue_then_unavailable() {
        let agent = ScriptedAgent::new();
        agent.push_ok("m", "first");
        agent.push_err("m", AgentCallError::Timeout(1));
        let p = ProviderConfig::local("m");
        let req = AgentRequest::new("Submitter 1", "s", "p");
        assert_eq!(agent.call(&req, &p).await.unwrap().text, "first");
        assert_eq!(agent.call(&req, &p).await.unwrap_err(), AgentCallError::Timeout(1));
        assert!(matches!(agent.call(&req, &p).await, Err(AgentCallError::Unavailable(_))));
        assert_eq!(agent.calls_for("m"), 3);
    }

    #[tokio::test]
    async fn test_cooperative_validator_matches_pending_count() {
        let agent = ScriptedAgent::cooperative();
        let req = AgentRequest::new("Validator", "s", "SUBMISSIONS TO VALIDATE (3):\n...");
        let text = agent.call(&req, &ProviderConfig::local("v")).await.unwrap().text;
        let decisions = crate::core::decision::parse_decisions(&text, 3).unwrap();
        assert!(decisions.iter().all(|d| d.is_accept()));
    }
}
