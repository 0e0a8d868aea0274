//! 引擎状态持久化
//!
//! 语料写入追加式 JSONL（移除以墓碑追加）；健康记录、Boost 配置与统计各一个 JSON 文件，
//! 启动时加载，变更时整体覆盖写入。测试使用 InMemoryStore。

use std::fs::OpenOptions;
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::{Mutex, PoisonError};

use anyhow::Context;
use serde::de::DeserializeOwned;
use serde::Serialize;

use crate::core::boost::BoostState;
use crate::core::health::ModelHealthRecord;
use crate::core::state::EngineStats;
use crate::memory::corpus::CorpusRecord;

const CORPUS_FILE: &str = "corpus.jsonl";
const HEALTH_FILE: &str = "health.json";
const BOOST_FILE: &str = "boost.json";
const STATS_FILE: &str = "stats.json";

/// 持久化接口（同步；单次写入量很小）
pub trait StateStore: Send + Sync {
    fn append_corpus(&self, record: &CorpusRecord) -> anyhow::Result<()>;
    fn load_corpus(&self) -> anyhow::Result<Vec<CorpusRecord>>;
    fn save_health(&self, records: &[ModelHealthRecord]) -> anyhow::Result<()>;
    fn load_health(&self) -> anyhow::Result<Vec<ModelHealthRecord>>;
    fn save_boost(&self, state: &BoostState) -> anyhow::Result<()>;
    fn load_boost(&self) -> anyhow::Result<Option<BoostState>>;
    fn save_stats(&self, stats: &EngineStats) -> anyhow::Result<()>;
    fn load_stats(&self) -> anyhow::Result<Option<EngineStats>>;
}

/// 基于目录的 JSON 文件存储
#[derive(Debug)]
pub struct JsonFileStore {
    dir: PathBuf,
}

impl JsonFileStore {
    /// 目录不存在时自动创建
    pub fn new(dir: impl AsRef<Path>) -> anyhow::Result<Self> {
        let dir = dir.as_ref().to_path_buf();
        std::fs::create_dir_all(&dir)
            .with_context(|| format!("failed to create data dir {}", dir.display()))?;
        Ok(Self { dir })
    }

    fn path(&self, name: &str) -> PathBuf {
        self.dir.join(name)
    }

    fn write_json<T: Serialize + ?Sized>(&self, name: &str, value: &T) -> anyhow::Result<()> {
        let path = self.path(name);
        let tmp = path.with_extension("json.tmp");
        std::fs::write(&tmp, serde_json::to_string_pretty(value)?)
            .with_context(|| format!("failed to write {}", tmp.display()))?;
        std::fs::rename(&tmp, &path).with_context(|| format!("failed to replace {}", path.display()))?;
        Ok(())
    }

    fn read_json<T: DeserializeOwned>(&self, name: &str) -> anyhow::Result<Option<T>> {
        let path = self.path(name);
        if !path.exists() {
            return Ok(None);
        }
        let data = std::fs::read_to_string(&path).with_context(|| format!("failed to read {}", path.display()))?;
        let value = serde_json::from_str(&data).with_context(|| format!("invalid JSON in {}", path.display()))?;
        Ok(Some(value))
    }
}

impl StateStore for JsonFileStore {
    fn append_corpus(&self, record: &CorpusRecord) -> anyhow::Result<()> {
        let path = self.path(CORPUS_FILE);
        let mut file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&path)
            .with_context(|| format!("failed to open {}", path.display()))?;
        let line = serde_json::to_string(record)?;
        writeln!(file, "{line}")?;
        Ok(())
    }

    /// 逐行读取；损坏的行跳过并告警，不影响其余记录
    fn load_corpus(&self) -> anyhow::Result<Vec<CorpusRecord>> {
        let path = self.path(CORPUS_FILE);
        if !path.exists() {
            return Ok(Vec::new());
        }
        let file = std::fs::File::open(&path).with_context(|| format!("failed to open {}", path.display()))?;
        let mut records = Vec::new();
        for (idx, line) in BufReader::new(file).lines().enumerate() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<CorpusRecord>(&line) {
                Ok(record) => records.push(record),
                Err(e) => tracing::warn!(line = idx + 1, error = %e, "skipping corrupt corpus record"),
            }
        }
        Ok(records)
    }

    fn save_health(&self, records: &[ModelHealthRecord]) -> anyhow::Result<()> {
        self.write_json(HEALTH_FILE, records)
    }

    fn load_health(&self) -> anyhow::Result<Vec<ModelHealthRecord>> {
        Ok(self.read_json(HEALTH_FILE)?.unwrap_or_default())
    }

    fn save_boost(&self, state: &BoostState) -> anyhow::Result<()> {
        self.write_json(BOOST_FILE, state)
    }

    fn load_boost(&self) -> anyhow::Result<Option<BoostState>> {
        self.read_json(BOOST_FILE)
    }

    fn save_stats(&self, stats: &EngineStats) -> anyhow::Result<()> {
        self.write_json(STATS_FILE, stats)
    }

    fn load_stats(&self) -> anyhow::Result<Option<EngineStats>> {
        self.read_json(STATS_FILE)
    }
}

#[derive(Debug, Default)]
struct MemoryInner {
    corpus: Vec<CorpusRecord>,
    health: Vec<ModelHealthRecord>,
    boost: Option<BoostState>,
    stats: Option<EngineStats>,
}

/// 内存存储（测试与 `--mock` 运行使用）
#[derive(Debug, Default)]
pub struct InMemoryStore {
    inner: Mutex<MemoryInner>,
}

impl InMemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    fn lock(&self) -> std::sync::MutexGuard<'_, MemoryInner> {
        self.inner.lock().unwrap_or_else(PoisonError::into_inner)
    }

    pub fn corpus_records(&self) -> Vec<CorpusRecord> {
        self.lock().corpus.clone()
    }
}

impl StateStore for InMemoryStore {
    fn append_corpus(&self, record: &CorpusRecord) -> anyhow::Result<()> {
        self.lock().corpus.push(record.clone());
        Ok(())
    }

    fn load_corpus(&self) -> anyhow::Result<Vec<CorpusRecord>> {
        Ok(self.lock().corpus.clone())
    }

    fn save_health(&self, records: &[ModelHealthRecord]) -> anyhow::Result<()> {
        self.lock().health = records.to_vec();
        Ok(())
    }

    fn load_health(&self) -> anyhow::Result<Vec<ModelHealthRecord>> {
        Ok(self.lock().health.clone())
    }

    fn save_boost(&self, state: &BoostState) -> anyhow::Result<()> {
        self.lock().boost = Some(state.clone());
        Ok(())
    }

    fn load_boost(&self) -> anyhow::Result<Option<BoostState>> {
        Ok(self.lock().boost.clone())
    }

    fn save_stats(&self, stats: &EngineStats) -> anyhow::Result<()> {
        self.lock().stats = Some(stats.clone());
        Ok(())
    }

    fn load_stats(&self) -> anyhow::Result<Option<EngineStats>> {
        Ok(self.lock().stats.clone())
    }
}
