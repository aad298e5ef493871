use crate::core::MinerInfo;
use anyhow::Context;
use async_trait::async_trait;
use std::collections::HashSet;
use std::path::PathBuf;

/// Source of the currently registered miners.
#[async_trait]
pub trait MinerDirectory: Send + Sync {
    async fn miners(&self) -> anyhow::Result<Vec<MinerInfo>>;
}

/// Roster kept in a JSON file `[{uid, hotkey, endpoint}]`, re-read on every call so the operator
/// can edit it without a restart.
pub struct JsonRosterDirectory {
    path: PathBuf,
}

impl JsonRosterDirectory {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }
}

/// Drops entries without an endpoint and keeps the first entry for each uid.
pub fn normalize_roster(entries: Vec<MinerInfo>) -> Vec<MinerInfo> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|m| !m.endpoint.trim().is_empty())
        .filter(|m| seen.insert(m.uid))
        .collect()
}

#[async_trait]
impl MinerDirectory for JsonRosterDirectory {
    async fn miners(&self) -> anyhow::Result<Vec<MinerInfo>> {
        let raw = tokio::fs::read_to_string(&self.path)
            .await
            .with_context(|| format!("read peer roster {}", self.path.display()))?;
        let entries: Vec<MinerInfo> = serde_json::from_str(&raw)
            .with_context(|| format!("parse peer roster {}", self.path.display()))?;
        Ok(normalize_roster(entries))
    }
}

/// Fixed in-memory roster.
pub struct StaticDirectory(pub Vec<MinerInfo>);

#[async_trait]
impl MinerDirectory for StaticDirectory {
    async fn miners(&self) -> anyhow::Result<Vec<MinerInfo>> {
        Ok(self.0.clone())
    }
}
