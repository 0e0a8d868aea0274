//! 共享语料：已接受提交的有序集合
//!
//! 条目编号从 1 开始单调递增，移除后编号不复用；清理审查按编号引用条目。

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use uuid::Uuid;

use crate::core::submission::Submission;

/// 语料中的一条已接受内容
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct CorpusEntry {
    pub number: u64,
    pub submission_id: Uuid,
    pub submitter_id: u32,
    pub content: String,
    pub accepted_at: DateTime<Utc>,
}

/// 追加日志中的一条记录；移除以墓碑形式追加
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "op", rename_all = "snake_case")]
pub enum CorpusRecord {
    Added(CorpusEntry),
    Removed { number: u64, removed_at: DateTime<Utc> },
}

#[derive(Debug, Clone)]
pub struct Corpus {
    entries: Vec<CorpusEntry>,
    next_number: u64,
}

impl Default for Corpus {
    fn default() -> Self {
        Self::new()
    }
}

impl Corpus {
    pub fn new() -> Self {
        Self {
            entries: Vec::new(),
            next_number: 1,
        }
    }

    /// 按日志顺序重放
    pub fn replay(records: impl IntoIterator<Item = CorpusRecord>) -> Self {
        let mut corpus = Self::new();
        for record in records {
            match record {
                CorpusRecord::Added(entry) => {
                    corpus.next_number = corpus.next_number.max(entry.number + 1);
                    corpus.entries.push(entry);
                }
                CorpusRecord::Removed { number, .. } => {
                    corpus.entries.retain(|e| e.number != number);
                }
            }
        }
        corpus
    }

    /// 追加一条已接受的提交，返回写入日志用的记录
    pub fn append(&mut self, submission: &Submission) -> CorpusRecord {
        let entry = CorpusEntry {
            number: self.next_number,
            submission_id: submission.id,
            submitter_id: submission.submitter_id,
            content: submission.content.clone(),
            accepted_at: Utc::now(),
        };
        self.next_number += 1;
        self.entries.push(entry.clone());
        CorpusRecord::Added(entry)
    }

    /// 移除指定编号；不存在时返回 None
    pub fn remove(&mut self, number: u64) -> Option<(CorpusEntry, CorpusRecord)> {
        let idx = self.entries.iter().position(|e| e.number == number)?;
        let entry = self.entries.remove(idx);
        let record = CorpusRecord::Removed {
            number,
            removed_at: Utc::now(),
        };
        Some((entry, record))
    }

    pub fn get(&self, number: u64) -> Option<&CorpusEntry> {
        self.entries.iter().find(|e| e.number == number)
    }

    pub fn entries(&self) -> &[CorpusEntry] {
        &self.entries
    }

    pub fn len(&self) -> usize {
        self.entries.len()
    }

    pub fn is_empty(&self) -> bool {
        self.entries.is_empty()
    }

    /// 供提示词使用的带编号文本
    pub fn formatted(&self) -> String {
        if self.entries.is_empty() {
            return "(no accepted submissions yet)".to_string();
        }
        self.entries
            .iter()
            .map(|e| format!("=== SUBMISSION #{} (Submitter {}) ===\n{}", e.number, e.submitter_id, e.content))
            .collect::<Vec<_>>()
            .join("\n\n")
    }
}
