//! 管道注册表
//!
//! 从 [`PipelineSource`] 读取 `[[pipelines]]` 目录，校验后形成不可变的
//! [`PipelineSnapshot`]。热加载按内容哈希判断是否变化；校验失败时保留上一份
//! 有效快照，同一份错误内容只记录一次错误日志。

use std::collections::{BTreeMap, HashMap, VecDeque};
use std::path::{Path, PathBuf};
use std::sync::{Arc, Mutex, RwLock};

use async_trait::async_trait;
use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use tracing::{error, info};

use scheduler_core::{SchedulerError, SchedulerResult};
use scheduler_domain::entities::PipelineConfig;

/// 配置文件的顶层结构
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PipelineCatalog {
    #[serde(default)]
    pub pipelines: Vec<PipelineConfig>,
}

impl PipelineCatalog {
    pub fn from_toml(text: &str) -> SchedulerResult<Self> {
        Ok(toml::from_str(text)?)
    }
}

/// 数据源返回的原始内容
#[derive(Debug, Clone)]
pub enum SourceContent {
    Toml(String),
    Configs(Vec<PipelineConfig>),
}

#[derive(Debug, Clone)]
pub struct FetchedSource {
    pub content: SourceContent,
    pub hash: String,
}

impl FetchedSource {
    pub fn parse(self) -> SchedulerResult<Vec<PipelineConfig>> {
        match self.content {
            SourceContent::Toml(text) => Ok(PipelineCatalog::from_toml(&text)?.pipelines),
            SourceContent::Configs(configs) => Ok(configs),
        }
    }
}

pub fn content_hash(bytes: &[u8]) -> String {
    hex::encode(Sha256::digest(bytes))
}

#[async_trait]
pub trait PipelineSource: Send + Sync {
    async fn fetch(&self) -> SchedulerResult<FetchedSource>;
    fn describe(&self) -> String;
}

/// TOML 文件数据源
#[derive(Debug, Clone)]
pub struct FilePipelineSource {
    path: PathBuf,
}

impl FilePipelineSource {
    pub fn new(path: impl AsRef<Path>) -> Self {
        Self {
            path: path.as_ref().to_path_buf(),
        }
    }
}

#[async_trait]
impl PipelineSource for FilePipelineSource {
    async fn fetch(&self) -> SchedulerResult<FetchedSource> {
        let text = tokio::fs::read_to_string(&self.path).await.map_err(|e| {
            SchedulerError::Configuration(format!(
                "读取管道配置文件 {} 失败: {}",
                self.path.display(),
                e
            ))
        })?;
        Ok(FetchedSource {
            hash: content_hash(text.as_bytes()),
            content: SourceContent::Toml(text),
        })
    }

    fn describe(&self) -> String {
        format!("file:{}", self.path.display())
    }
}

/// 内存数据源，内容可在运行时替换
#[derive(Debug, Default)]
pub struct StaticPipelineSource {
    configs: Mutex<Vec<PipelineConfig>>,
}

impl StaticPipelineSource {
    pub fn new(configs: Vec<PipelineConfig>) -> Self {
        Self {
            configs: Mutex::new(configs),
        }
    }

    pub fn replace(&self, configs: Vec<PipelineConfig>) {
        if let Ok(mut current) = self.configs.lock() {
            *current = configs;
        }
    }
}

#[async_trait]
impl PipelineSource for StaticPipelineSource {
    async fn fetch(&self) -> SchedulerResult<FetchedSource> {
        let configs = self
            .configs
            .lock()
            .map_err(|_| SchedulerError::Internal("管道数据源锁已损坏".to_string()))?
            .clone();
        let hash = content_hash(&serde_json::to_vec(&configs)?);
        Ok(FetchedSource {
            content: SourceContent::Configs(configs),
            hash,
        })
    }

    fn describe(&self) -> String {
        "static".to_string()
    }
}

/// 一份通过校验的管道配置
#[derive(Debug, Clone, Default)]
pub struct PipelineSnapshot {
    pub configs: BTreeMap<String, PipelineConfig>,
    pub hash: String,
    pub loaded_at: Option<DateTime<Utc>>,
}

impl PipelineSnapshot {
    pub fn get(&self, name: &str) -> Option<&PipelineConfig> {
        self.configs.get(name)
    }

    pub fn names(&self) -> Vec<String> {
        self.configs.keys().cloned().collect()
    }

    pub fn enabled(&self) -> impl Iterator<Item = &PipelineConfig> {
        self.configs.values().filter(|config| config.enabled)
    }

    pub fn len(&self) -> usize {
        self.configs.len()
    }

    pub fn is_empty(&self) -> bool {
        self.configs.is_empty()
    }

    /// 与 `name` 互斥的管道，互斥关系是对称的
    pub fn conflicts_of(&self, name: &str) -> Vec<String> {
        let mut conflicts: Vec<String> = self
            .get(name)
            .map(|config| config.conflicts_with.iter().cloned().collect())
            .unwrap_or_default();
        for other in self.configs.values() {
            if other.conflicts_with.contains(name) && !conflicts.contains(&other.name) {
                conflicts.push(other.name.clone());
            }
        }
        conflicts.sort();
        conflicts
    }
}

#[derive(Debug, Clone, PartialEq)]
pub enum RegistryEvent {
    Added(PipelineConfig),
    Removed(String),
    Updated(PipelineConfig),
}

#[derive(Debug, Clone, Default, PartialEq)]
pub struct RegistryDiff {
    pub added: Vec<PipelineConfig>,
    pub removed: Vec<String>,
    pub modified: Vec<PipelineConfig>,
}

impl RegistryDiff {
    pub fn between(old: &PipelineSnapshot, new: &PipelineSnapshot) -> Self {
        let mut diff = RegistryDiff::default();
        for (name, config) in &new.configs {
            match old.get(name) {
                None => diff.added.push(config.clone()),
                Some(previous) if previous != config => diff.modified.push(config.clone()),
                Some(_) => {}
            }
        }
        for name in old.configs.keys() {
            if !new.configs.contains_key(name) {
                diff.removed.push(name.clone());
            }
        }
        diff
    }

    pub fn is_empty(&self) -> bool {
        self.added.is_empty() && self.removed.is_empty() && self.modified.is_empty()
    }

    pub fn events(&self) -> Vec<RegistryEvent> {
        self.added
            .iter()
            .cloned()
            .map(RegistryEvent::Added)
            .chain(self.removed.iter().cloned().map(RegistryEvent::Removed))
            .chain(self.modified.iter().cloned().map(RegistryEvent::Updated))
            .collect()
    }
}

/// 校验整份目录：单个管道的字段、重名、未知引用和依赖环
pub fn validate_catalog(
    configs: Vec<PipelineConfig>,
) -> SchedulerResult<BTreeMap<String, PipelineConfig>> {
    let mut by_name = BTreeMap::new();
    for config in configs {
        config.validate()?;
        if by_name.contains_key(&config.name) {
            return Err(SchedulerError::DuplicatePipeline { name: config.name });
        }
        by_name.insert(config.name.clone(), config);
    }

    for config in by_name.values() {
        for (field, targets) in [
            ("depends_on", &config.depends_on),
            ("conflicts_with", &config.conflicts_with),
        ] {
            if let Some(target) = targets.iter().find(|t| !by_name.contains_key(*t)) {
                return Err(SchedulerError::UnknownReference {
                    name: config.name.clone(),
                    field: field.to_string(),
                    target: target.clone(),
                });
            }
        }
    }

    detect_cycle(&by_name)?;
    Ok(by_name)
}

/// 拓扑排序检测依赖环，返回环上（及被环阻塞）的管道
fn detect_cycle(configs: &BTreeMap<String, PipelineConfig>) -> SchedulerResult<()> {
    let mut in_degree: HashMap<&str, usize> = configs
        .values()
        .map(|config| (config.name.as_str(), config.depends_on.len()))
        .collect();
    let mut dependents: HashMap<&str, Vec<&str>> = HashMap::new();
    for config in configs.values() {
        for dep in &config.depends_on {
            dependents
                .entry(dep.as_str())
                .or_default()
                .push(config.name.as_str());
        }
    }

    let mut queue: VecDeque<&str> = in_degree
        .iter()
        .filter(|(_, degree)| **degree == 0)
        .map(|(name, _)| *name)
        .collect();
    let mut visited = 0;

    while let Some(node) = queue.pop_front() {
        visited += 1;
        for dependent in dependents.get(node).into_iter().flatten() {
            if let Some(degree) = in_degree.get_mut(dependent) {
                *degree -= 1;
                if *degree == 0 {
                    queue.push_back(*dependent);
                }
            }
        }
    }

    if visited == configs.len() {
        return Ok(());
    }

    let mut blocked: Vec<&str> = in_degree
        .into_iter()
        .filter(|(_, degree)| *degree > 0)
        .map(|(name, _)| name)
        .collect();
    blocked.sort_unstable();
    Err(SchedulerError::CircularDependency(blocked.join(" -> ")))
}

pub struct PipelineRegistry {
    source: Arc<dyn PipelineSource>,
    current: RwLock<Arc<PipelineSnapshot>>,
    last_rejected_hash: Mutex<Option<String>>,
}

impl PipelineRegistry {
    /// 启动时加载，任何错误都直接返回
    pub async fn load(source: Arc<dyn PipelineSource>) -> SchedulerResult<Self> {
        let fetched = source.fetch().await?;
        let hash = fetched.hash.clone();
        let configs = validate_catalog(fetched.parse()?)?;
        info!(
            "从 {} 加载 {} 个管道配置",
            source.describe(),
            configs.len()
        );

        Ok(Self {
            source,
            current: RwLock::new(Arc::new(PipelineSnapshot {
                configs,
                hash,
                loaded_at: Some(Utc::now()),
            })),
            last_rejected_hash: Mutex::new(None),
        })
    }

    pub fn snapshot(&self) -> Arc<PipelineSnapshot> {
        match self.current.read() {
            Ok(guard) => guard.clone(),
            Err(poisoned) => poisoned.into_inner().clone(),
        }
    }

    pub fn configs(&self) -> Vec<PipelineConfig> {
        self.snapshot().configs.values().cloned().collect()
    }

    pub fn get(&self, name: &str) -> SchedulerResult<PipelineConfig> {
        self.snapshot()
            .get(name)
            .cloned()
            .ok_or_else(|| SchedulerError::PipelineNotFound {
                name: name.to_string(),
            })
    }

    pub fn hash(&self) -> String {
        self.snapshot().hash.clone()
    }

    /// 内容哈希变化时重新加载并立即提交，返回新旧快照的差异
    pub async fn reload_if_changed(&self) -> SchedulerResult<RegistryDiff> {
        match self.prepare_reload().await? {
            Some(pending) => Ok(self.commit(pending)),
            None => Ok(RegistryDiff::default()),
        }
    }

    /// 读取并校验新内容，但不替换当前快照
    ///
    /// 内容未变化（或是已报告过的错误内容）时返回 `None`。调用方把差异应用到
    /// 作业存储成功后再调用 [`PipelineRegistry::commit`]；未提交的变更会在下一次
    /// 加载时重新计算。
    pub async fn prepare_reload(&self) -> SchedulerResult<Option<PendingReload>> {
        let fetched = self.source.fetch().await?;
        let current = self.snapshot();
        if fetched.hash == current.hash {
            return Ok(None);
        }

        let already_rejected = self
            .last_rejected_hash
            .lock()
            .map(|guard| guard.as_deref() == Some(fetched.hash.as_str()))
            .unwrap_or(false);
        if already_rejected {
            return Ok(None);
        }

        let hash = fetched.hash.clone();
        let configs = match fetched.parse().and_then(validate_catalog) {
            Ok(configs) => configs,
            Err(e) => {
                error!(
                    "管道配置 {} 校验失败，继续使用上一份有效配置: {}",
                    self.source.describe(),
                    e
                );
                if let Ok(mut rejected) = self.last_rejected_hash.lock() {
                    *rejected = Some(hash);
                }
                return Err(e);
            }
        };

        let next = Arc::new(PipelineSnapshot {
            configs,
            hash,
            loaded_at: Some(Utc::now()),
        });
        Ok(Some(PendingReload {
            diff: RegistryDiff::between(&current, &next),
            base_hash: current.hash.clone(),
            next,
        }))
    }

    /// 提交一次已准备好的加载
    ///
    /// 若期间快照已被其他加载替换，放弃本次提交并返回空差异。
    pub fn commit(&self, pending: PendingReload) -> RegistryDiff {
        {
            let mut guard = match self.current.write() {
                Ok(guard) => guard,
                Err(poisoned) => poisoned.into_inner(),
            };
            if guard.hash != pending.base_hash {
                return RegistryDiff::default();
            }
            *guard = pending.next;
        }
        if let Ok(mut rejected) = self.last_rejected_hash.lock() {
            *rejected = None;
        }

        let diff = pending.diff;
        info!(
            "管道配置已重新加载: 新增 {}, 删除 {}, 修改 {}",
            diff.added.len(),
            diff.removed.len(),
            diff.modified.len()
        );
        diff
    }
}

/// 已校验但尚未提交的新快照
#[derive(Debug, Clone)]
pub struct PendingReload {
    pub diff: RegistryDiff,
    base_hash: String,
    next: Arc<PipelineSnapshot>,
}

impl PendingReload {
    pub fn hash(&self) -> &str {
        &self.next.hash
    }
}
