//! Registries for targets, channels and check results.
//!
//! Targets and channels live in the persisted [`AppConfig`] document and are
//! written back on every mutation. Results are kept in memory per target,
//! newest first, and snapshotted to a cache file on shutdown.

use crate::config::{self, AppConfig};
use crate::model::{
    ChannelInput, CheckResult, NewCheckResult, NotificationChannel, Target, TargetInput,
    TargetStatus, ValidationError,
};
use crate::notify::channel::{ChannelConfig, ChannelConfigError};
use chrono::Utc;
use dashmap::DashMap;
use std::collections::VecDeque;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::RwLock;
use thiserror::Error;
use tokio::sync::Mutex;

/// Smallest history kept per target; dashboards read windows of up to 200.
pub const MIN_RESULTS_PER_TARGET: usize = 200;

#[derive(Debug, Error)]
pub enum StoreError {
    #[error("target {0} not found")]
    TargetNotFound(u64),
    #[error("channel {0} not found")]
    ChannelNotFound(u64),
    #[error(transparent)]
    InvalidTarget(#[from] ValidationError),
    #[error(transparent)]
    InvalidChannel(#[from] ChannelConfigError),
    #[error("persistence failed: {0:#}")]
    Persistence(anyhow::Error),
}

#[async_trait::async_trait]
pub trait TargetRegistry: Send + Sync {
    async fn list_enabled(&self) -> Result<Vec<Target>, StoreError>;

    /// Up to `n` results for the target, newest first.
    async fn last_results(&self, target_id: u64, n: usize) -> Result<Vec<CheckResult>, StoreError>;

    async fn append_result(&self, result: NewCheckResult) -> Result<CheckResult, StoreError>;
}

#[async_trait::async_trait]
pub trait ChannelRegistry: Send + Sync {
    async fn list_enabled(&self) -> Result<Vec<NotificationChannel>, StoreError>;
}

pub struct Store {
    path: Option<PathBuf>,
    config: RwLock<AppConfig>,
    // Serializes mutate-then-save so the file always matches memory.
    write_lock: Mutex<()>,
    results: DashMap<u64, VecDeque<CheckResult>>,
    next_result_id: AtomicU64,
    results_per_target: usize,
}

impl Store {
    /// A store that persists its document to `path` after every mutation.
    pub fn open(path: impl Into<PathBuf>) -> anyhow::Result<Self> {
        let path = path.into();
        let config = config::load_config(&path)?;
        Ok(Self::build(Some(path), config))
    }

    /// A store that never touches the file system.
    pub fn in_memory(config: AppConfig) -> Self {
        Self::build(None, config)
    }

    fn build(path: Option<PathBuf>, config: AppConfig) -> Self {
        let results_per_target = config.settings.results_per_target.max(MIN_RESULTS_PER_TARGET);
        Self {
            path,
            config: RwLock::new(config),
            write_lock: Mutex::new(()),
            results: DashMap::new(),
            next_result_id: AtomicU64::new(1),
            results_per_target,
        }
    }

    pub fn settings(&self) -> config::Settings {
        self.read().settings.clone()
    }

    fn read(&self) -> std::sync::RwLockReadGuard<'_, AppConfig> {
        self.config.read().unwrap_or_else(|poisoned| poisoned.into_inner())
    }

    /// Applies `f` to a copy of the document, persists it, then publishes it.
    async fn mutate<T>(
        &self,
        f: impl FnOnce(&mut AppConfig) -> Result<T, StoreError>,
    ) -> Result<T, StoreError> {
        let _guard = self.write_lock.lock().await;
        let mut next = self.read().clone();
        let out = f(&mut next)?;
        if let Some(path) = &self.path {
            config::save_config(path, &next).map_err(StoreError::Persistence)?;
        }
        *self.config.write().unwrap_or_else(|poisoned| poisoned.into_inner()) = next;
        Ok(out)
    }

    // ---- targets ----

    /// All targets, newest id first.
    pub fn list_targets(&self) -> Vec<Target> {
        let mut targets = self.read().targets.clone();
        targets.sort_by(|a, b| b.id.cmp(&a.id));
        targets
    }

    pub fn get_target(&self, id: u64) -> Option<Target> {
        self.read().targets.iter().find(|t| t.id == id).cloned()
    }

    pub async fn create_target(&self, input: TargetInput) -> Result<Target, StoreError> {
        let input = input.validate()?;
        self.mutate(|config| {
            let id = config.allocate_target_id();
            let target = input.into_target(id, Utc::now());
            config.targets.push(target.clone());
            Ok(target)
        })
        .await
    }

    pub async fn update_target(&self, id: u64, input: TargetInput) -> Result<Target, StoreError> {
        let input = input.validate()?;
        self.mutate(|config| {
            let slot = config
                .targets
                .iter_mut()
                .find(|t| t.id == id)
                .ok_or(StoreError::TargetNotFound(id))?;
            *slot = input.into_target(id, slot.created_at);
            Ok(slot.clone())
        })
        .await
    }

    /// Removes the target and every result it owns.
    pub async fn delete_target(&self, id: u64) -> Result<(), StoreError> {
        self.mutate(|config| {
            let before = config.targets.len();
            config.targets.retain(|t| t.id != id);
            if config.targets.len() == before {
                return Err(StoreError::TargetNotFound(id));
            }
            Ok(())
        })
        .await?;
        self.results.remove(&id);
        Ok(())
    }

    // ---- channels ----

    pub fn list_channels(&self) -> Vec<NotificationChannel> {
        let mut channels = self.read().channels.clone();
        channels.sort_by(|a, b| b.id.cmp(&a.id));
        channels
    }

    pub fn get_channel(&self, id: u64) -> Option<NotificationChannel> {
        self.read().channels.iter().find(|c| c.id == id).cloned()
    }

    pub async fn create_channel(&self, input: ChannelInput) -> Result<NotificationChannel, StoreError> {
        let input = validate_channel(input)?;
        self.mutate(|config| {
            let id = config.allocate_channel_id();
            let channel = NotificationChannel {
                id,
                name: input.name,
                kind: input.kind,
                enabled: input.enabled,
                config: input.config,
                created_at: Utc::now(),
            };
            config.channels.push(channel.clone());
            Ok(channel)
        })
        .await
    }

    pub async fn update_channel(
        &self,
        id: u64,
        input: ChannelInput,
    ) -> Result<NotificationChannel, StoreError> {
        let input = validate_channel(input)?;
        self.mutate(|config| {
            let slot = config
                .channels
                .iter_mut()
                .find(|c| c.id == id)
                .ok_or(StoreError::ChannelNotFound(id))?;
            slot.name = input.name;
            slot.kind = input.kind;
            slot.enabled = input.enabled;
            slot.config = input.config;
            Ok(slot.clone())
        })
        .await
    }

    pub async fn delete_channel(&self, id: u64) -> Result<(), StoreError> {
        self.mutate(|config| {
            let before = config.channels.len();
            config.channels.retain(|c| c.id != id);
            if config.channels.len() == before {
                return Err(StoreError::ChannelNotFound(id));
            }
            Ok(())
        })
        .await
    }

    // ---- results ----

    pub fn results_for(&self, target_id: u64, limit: usize) -> Vec<CheckResult> {
        self.results
            .get(&target_id)
            .map(|r| r.iter().take(limit).cloned().collect())
            .unwrap_or_default()
    }

    /// Every target with its latest result, in listing order.
    pub fn status_snapshot(&self) -> Vec<TargetStatus> {
        self.list_targets()
            .into_iter()
            .map(|target| {
                let latest = self.results.get(&target.id).and_then(|r| r.front().cloned());
                TargetStatus { target, latest }
            })
            .collect()
    }

    pub fn save_results_cache(&self, path: &Path) -> anyhow::Result<()> {
        let items: Vec<CheckResult> = self
            .results
            .iter()
            .flat_map(|entry| entry.value().iter().cloned().collect::<Vec<_>>())
            .collect();
        let json = serde_json::to_string(&items)?;
        std::fs::write(path, json)?;
        tracing::info!("Saved {} results to {}", items.len(), path.display());
        Ok(())
    }

    /// Restores results for targets that still exist. Returns how many were kept.
    pub fn load_results_cache(&self, path: &Path) -> anyhow::Result<usize> {
        if !path.exists() {
            return Ok(0);
        }
        let content = std::fs::read_to_string(path)?;
        let mut items: Vec<CheckResult> = serde_json::from_str(&content)?;
        items.sort_by(|a, b| b.id.cmp(&a.id));

        let known: std::collections::HashSet<u64> =
            self.read().targets.iter().map(|t| t.id).collect();
        let mut restored = 0;
        for item in items {
            if !known.contains(&item.target_id) {
                continue;
            }
            self.next_result_id.fetch_max(item.id + 1, Ordering::SeqCst);
            let mut history = self.results.entry(item.target_id).or_default();
            if history.len() < self.results_per_target {
                history.push_back(item);
                restored += 1;
            }
        }
        Ok(restored)
    }
}

fn validate_channel(mut input: ChannelInput) -> Result<ChannelInput, StoreError> {
    input.name = input.name.trim().to_string();
    if input.name.is_empty() {
        return Err(ChannelConfigError::EmptyName.into());
    }
    ChannelConfig::parse(input.kind, &input.config)?;
    Ok(input)
}

#[async_trait::async_trait]
impl TargetRegistry for Store {
    async fn list_enabled(&self) -> Result<Vec<Target>, StoreError> {
        Ok(self.read().targets.iter().filter(|t| t.enabled).cloned().collect())
    }

    async fn last_results(&self, target_id: u64, n: usize) -> Result<Vec<CheckResult>, StoreError> {
        Ok(self.results_for(target_id, n))
    }

    async fn append_result(&self, result: NewCheckResult) -> Result<CheckResult, StoreError> {
        // Checked while holding the shard lock: delete_target removes the
        // history after unpublishing the target, so it can't leave an orphan.
        let entry = self.results.entry(result.target_id);
        if !self.read().targets.iter().any(|t| t.id == result.target_id) {
            return Err(StoreError::TargetNotFound(result.target_id));
        }
        let stored = CheckResult {
            id: self.next_result_id.fetch_add(1, Ordering::SeqCst),
            target_id: result.target_id,
            status: result.status,
            latency_ms: result.latency_ms,
            code: result.code,
            message: result.message,
            created_at: Utc::now(),
        };
        let mut history = entry.or_default();
        history.push_front(stored.clone());
        history.truncate(self.results_per_target);
        Ok(stored)
    }
}

#[async_trait::async_trait]
impl ChannelRegistry for Store {
    async fn list_enabled(&self) -> Result<Vec<NotificationChannel>, StoreError> {
        Ok(self.read().channels.iter().filter(|c| c.enabled).cloned().collect())
    }
}
