//! Mount tables for secret engines, credential backends and audit devices.
//!
//! Each table maps path prefixes to a backend type and is persisted through
//! the barrier. The node loads all three during activation and instantiates
//! a backend per entry; what the backends do is not the node's concern.
//!
//! Backends see storage through a [`BarrierView`], a prefix-scoped window
//! onto the barrier keyed by the entry's UUID, so unmounting and remounting
//! at another path keeps data separate.

use std::sync::Arc;

use serde::{Deserialize, Serialize};
use tracing::info;

use crate::barrier::Barrier;
use crate::error::{BarrierError, MountError};

/// Which mount table an entry belongs to.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum TableKind {
    /// Secret engines.
    Secrets,
    /// Credential (auth) backends.
    Credentials,
    /// Audit devices.
    Audit,
}

impl TableKind {
    /// Barrier path of the persisted table.
    #[must_use]
    pub fn storage_path(self) -> &'static str {
        match self {
            Self::Secrets => "core/mounts",
            Self::Credentials => "core/auth",
            Self::Audit => "core/audit",
        }
    }

    /// Prefix under which entries of this table keep their data.
    #[must_use]
    pub fn view_prefix(self) -> &'static str {
        match self {
            Self::Secrets => "logical/",
            Self::Credentials => "auth/",
            Self::Audit => "audit/",
        }
    }
}

/// A single mount entry.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountEntry {
    /// The mount path, always ending in `/` (e.g. `secret/`).
    pub path: String,
    /// The backend type (e.g. `kv`, `token`, `file`).
    #[serde(rename = "type")]
    pub mount_type: String,
    /// Optional description.
    #[serde(default)]
    pub description: String,
    /// Stable identifier, used for the storage view.
    pub uuid: String,
    /// Backend-specific configuration.
    #[serde(default)]
    pub config: serde_json::Value,
}

impl MountEntry {
    /// Build an entry with a fresh UUID.
    #[must_use]
    pub fn new(path: impl Into<String>, mount_type: impl Into<String>) -> Self {
        Self {
            path: path.into(),
            mount_type: mount_type.into(),
            description: String::new(),
            uuid: uuid::Uuid::new_v4().to_string(),
            config: serde_json::Value::Null,
        }
    }
}

/// One mount table.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct MountTable {
    /// Entries in mount order.
    pub entries: Vec<MountEntry>,
}

impl MountTable {
    /// Load a table from the barrier. A missing table is persisted empty.
    ///
    /// # Errors
    ///
    /// - [`MountError::Serialization`] if the stored table is malformed.
    /// - [`MountError::Barrier`] if storage access fails.
    pub async fn load(barrier: &Barrier, kind: TableKind) -> Result<Self, MountError> {
        let path = kind.storage_path();
        match barrier.get(path).await? {
            Some(bytes) => serde_json::from_slice(&bytes).map_err(|e| MountError::Serialization {
                key: path.to_owned(),
                reason: e.to_string(),
            }),
            None => {
                let table = Self::default();
                table.persist(barrier, kind).await?;
                Ok(table)
            }
        }
    }

    /// Persist the table through the barrier.
    ///
    /// # Errors
    ///
    /// Returns [`MountError::Barrier`] if the write fails.
    pub async fn persist(&self, barrier: &Barrier, kind: TableKind) -> Result<(), MountError> {
        let path = kind.storage_path();
        let bytes = serde_json::to_vec(self).map_err(|e| MountError::Serialization {
            key: path.to_owned(),
            reason: e.to_string(),
        })?;
        barrier.put(path, &bytes).await?;
        Ok(())
    }

    /// Add an entry, normalizing its path to end with `/`.
    ///
    /// # Errors
    ///
    /// - [`MountError::InvalidPath`] if the path is empty.
    /// - [`MountError::AlreadyMounted`] if the path is taken.
    pub fn insert(&mut self, mut entry: MountEntry) -> Result<MountEntry, MountError> {
        entry.path = normalize(&entry.path)?;
        if self.entries.iter().any(|e| e.path == entry.path) {
            return Err(MountError::AlreadyMounted { path: entry.path });
        }
        self.entries.push(entry.clone());
        Ok(entry)
    }

    /// Remove the entry mounted at `path`.
    ///
    /// # Errors
    ///
    /// - [`MountError::InvalidPath`] if the path is empty.
    /// - [`MountError::NotFound`] if nothing is mounted there.
    pub fn remove(&mut self, path: &str) -> Result<MountEntry, MountError> {
        let path = normalize(path)?;
        let index = self
            .entries
            .iter()
            .position(|e| e.path == path)
            .ok_or(MountError::NotFound { path })?;
        Ok(self.entries.remove(index))
    }

    /// Find the entry handling `path` (longest prefix) and the remainder.
    #[must_use]
    pub fn resolve<'a>(&'a self, path: &'a str) -> Option<(&'a MountEntry, &'a str)> {
        self.entries
            .iter()
            .filter(|e| path.starts_with(e.path.as_str()))
            .max_by_key(|e| e.path.len())
            .map(|e| (e, path.strip_prefix(e.path.as_str()).unwrap_or(path)))
    }
}

fn normalize(path: &str) -> Result<String, MountError> {
    let trimmed = path.trim_start_matches('/');
    if trimmed.is_empty() {
        return Err(MountError::InvalidPath {
            reason: "mount path cannot be empty".to_owned(),
        });
    }
    if trimmed.ends_with('/') {
        Ok(trimmed.to_owned())
    } else {
        Ok(format!("{trimmed}/"))
    }
}

/// The part of the barrier a single backend may touch.
#[derive(Clone)]
pub struct BarrierView {
    barrier: Arc<Barrier>,
    prefix: String,
}

impl BarrierView {
    /// A view rooted at `prefix`.
    #[must_use]
    pub fn new(barrier: Arc<Barrier>, prefix: impl Into<String>) -> Self {
        Self {
            barrier,
            prefix: prefix.into(),
        }
    }

    /// The view for a mount entry of the given table.
    #[must_use]
    pub fn for_entry(barrier: Arc<Barrier>, kind: TableKind, entry: &MountEntry) -> Self {
        Self::new(barrier, format!("{}{}/", kind.view_prefix(), entry.uuid))
    }

    /// The prefix every key is placed under.
    #[must_use]
    pub fn prefix(&self) -> &str {
        &self.prefix
    }

    /// Read a key relative to the view.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] from the underlying barrier.
    pub async fn get(&self, key: &str) -> Result<Option<Vec<u8>>, BarrierError> {
        self.barrier.get(&self.full(key)).await
    }

    /// Write a key relative to the view.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] from the underlying barrier.
    pub async fn put(&self, key: &str, value: &[u8]) -> Result<(), BarrierError> {
        self.barrier.put(&self.full(key), value).await
    }

    /// Delete a key relative to the view.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] from the underlying barrier.
    pub async fn delete(&self, key: &str) -> Result<(), BarrierError> {
        self.barrier.delete(&self.full(key)).await
    }

    /// List keys under `prefix`, relative to the view.
    ///
    /// # Errors
    ///
    /// Returns [`BarrierError`] from the underlying barrier.
    pub async fn list(&self, prefix: &str) -> Result<Vec<String>, BarrierError> {
        let keys = self.barrier.list(&self.full(prefix)).await?;
        Ok(keys
            .into_iter()
            .filter_map(|k| k.strip_prefix(self.prefix.as_str()).map(str::to_owned))
            .collect())
    }

    fn full(&self, key: &str) -> String {
        format!("{}{key}", self.prefix)
    }
}

impl std::fmt::Debug for BarrierView {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("BarrierView")
            .field("prefix", &self.prefix)
            .finish_non_exhaustive()
    }
}

/// Log a table change.
pub(crate) fn log_change(kind: TableKind, action: &'static str, entry: &MountEntry) {
    info!(table = ?kind, path = %entry.path, mount_type = %entry.mount_type, action, "mount table changed");
}

#[cfg(test)]
#[allow(clippy::unwrap_used)]
mod tests {
    use strongroom_storage::MemoryBackend;

    use super::*;
    use crate::crypto::EncryptionKey;

    async fn unsealed_barrier() -> Arc<Barrier> {
        let barrier = Arc::new(Barrier::new(Arc::new(MemoryBackend::new())));
        let root = EncryptionKey::generate();
        barrier.initialize(&root).await.unwrap();
        barrier.unseal(&root).await.unwrap();
        barrier
    }

    #[test]
    fn insert_normalizes_and_rejects_duplicates() {
        let mut table = MountTable::default();
        let entry = table.insert(MountEntry::new("/secret", "kv")).unwrap();
        assert_eq!(entry.path, "secret/");
        assert!(matches!(
            table.insert(MountEntry::new("secret/", "kv")),
            Err(MountError::AlreadyMounted { .. })
        ));
        assert!(matches!(
            table.insert(MountEntry::new("", "kv")),
            Err(MountError::InvalidPath { .. })
        ));
    }

    #[test]
    fn resolve_picks_longest_prefix() {
        let mut table = MountTable::default();
        table.insert(MountEntry::new("secret/", "kv")).unwrap();
        table.insert(MountEntry::new("secret/team/", "kv")).unwrap();

        let (entry, rest) = table.resolve("secret/team/db").unwrap();
        assert_eq!(entry.path, "secret/team/");
        assert_eq!(rest, "db");
        assert!(table.resolve("other/x").is_none());
    }

    #[test]
    fn remove_missing_is_not_found() {
        let mut table = MountTable::default();
        assert!(matches!(table.remove("nope"), Err(MountError::NotFound { .. })));
    }

    #[tokio::test]
    async fn missing_table_is_created_empty() {
        let barrier = unsealed_barrier().await;
        let table = MountTable::load(&barrier, TableKind::Audit).await.unwrap();
        assert!(table.entries.is_empty());
        assert!(barrier.exists("core/audit").await.unwrap());
    }

    #[tokio::test]
    async fn table_persists_through_barrier() {
        let barrier = unsealed_barrier().await;
        let mut table = MountTable::default();
        table.insert(MountEntry::new("secret", "kv")).unwrap();
        table.persist(&barrier, TableKind::Secrets).await.unwrap();

        let loaded = MountTable::load(&barrier, TableKind::Secrets).await.unwrap();
        assert_eq!(loaded, table);
    }

    #[tokio::test]
    async fn views_are_isolated_by_uuid() {
        let barrier = unsealed_barrier().await;
        let a = MountEntry::new("a/", "kv");
        let b = MountEntry::new("b/", "kv");
        let view_a = BarrierView::for_entry(Arc::clone(&barrier), TableKind::Secrets, &a);
        let view_b = BarrierView::for_entry(Arc::clone(&barrier), TableKind::Secrets, &b);

        view_a.put("config", b"1").await.unwrap();
        assert_eq!(view_b.get("config").await.unwrap(), None);
        assert_eq!(view_a.list("").await.unwrap(), vec!["config"]);
    }
}
