use std::collections::BTreeMap;
use std::fs::{self, File};
use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use anyhow::{Context, bail};
use parking_lot::Mutex;
use rocksdb::{DB, Direction, IteratorMode, Options, WriteBatch, WriteOptions};
use serde::{Deserialize, Serialize};
use tracing::debug;

use common::constants::CLUSTER_KEY;
use common::error::{StoreError, StoreResult};
use common::key_utils::{meta_key_for, name_from_meta_key};

use crate::core::catalog::FileEntry;
use crate::core::ledger::ClusterSnapshot;

const MAX_OPEN_FILES: i32 = 512;
const META_SCAN_START: &[u8] = b"meta:";

/// Everything that survives a restart: the ledger image and the catalog.
#[derive(Clone, Debug, Serialize, Deserialize, PartialEq)]
pub struct PersistedState {
    pub cluster: ClusterSnapshot,
    pub files: BTreeMap<String, FileEntry>,
}

/// Durable home of the persisted state. `save` replaces the previous state
/// as a whole or not at all.
pub trait MetadataStore: Send + Sync {
    fn load(&self) -> StoreResult<Option<PersistedState>>;

    fn save(&self, state: &PersistedState) -> StoreResult<()>;
}

/// RocksDB index. The snapshot lives under `cluster`, one `meta:<name>`
/// key per file.
#[derive(Clone)]
pub struct KvDb {
    inner: Arc<DB>,
}

impl KvDb {
    pub fn open(path: &Path) -> anyhow::Result<Self> {
        let mut opts = Options::default();
        opts.create_if_missing(true);
        opts.set_level_compaction_dynamic_level_bytes(true);
        opts.set_max_open_files(MAX_OPEN_FILES);
        opts.set_compression_type(rocksdb::DBCompressionType::Zstd);
        opts.set_bytes_per_sync(1024 * 1024);

        let db = DB::open(&opts, path)
            .with_context(|| format!("opening index at {}", path.display()))?;
        Ok(Self {
            inner: Arc::new(db),
        })
    }

    fn load_inner(&self) -> anyhow::Result<Option<PersistedState>> {
        let Some(raw) = self.inner.get(CLUSTER_KEY.as_bytes())? else {
            return Ok(None);
        };
        let cluster: ClusterSnapshot = serde_json::from_slice(&raw)?;

        let mut files = BTreeMap::new();
        for kv in self.meta_iter() {
            let (k, v) = kv?;
            let key = std::str::from_utf8(&k)?;
            let Some(name) = name_from_meta_key(key) else {
                break;
            };
            files.insert(name.to_string(), serde_json::from_slice(&v)?);
        }
        Ok(Some(PersistedState { cluster, files }))
    }

    fn save_inner(&self, state: &PersistedState) -> anyhow::Result<()> {
        let mut batch = WriteBatch::default();

        // drop records of files that are gone
        for kv in self.meta_iter() {
            let (k, _) = kv?;
            let key = std::str::from_utf8(&k)?;
            match name_from_meta_key(key) {
                Some(name) if !state.files.contains_key(name) => batch.delete(&k),
                Some(_) => {}
                None => break,
            }
        }

        batch.put(CLUSTER_KEY.as_bytes(), serde_json::to_vec(&state.cluster)?);
        for (name, entry) in &state.files {
            batch.put(meta_key_for(name).as_bytes(), serde_json::to_vec(entry)?);
        }

        let mut write_opts = WriteOptions::default();
        write_opts.set_sync(true);
        self.inner.write_opt(batch, &write_opts)?;
        debug!(files = state.files.len(), "saved index");
        Ok(())
    }

    /// Iterates `meta:` keys in order, starting at the prefix. Callers stop
    /// at the first key outside it.
    fn meta_iter(&self) -> rocksdb::DBIterator<'_> {
        self.inner
            .iterator(IteratorMode::From(META_SCAN_START, Direction::Forward))
    }
}

impl MetadataStore for KvDb {
    fn load(&self) -> StoreResult<Option<PersistedState>> {
        self.load_inner().map_err(StoreError::persistence)
    }

    fn save(&self, state: &PersistedState) -> StoreResult<()> {
        self.save_inner(state).map_err(StoreError::persistence)
    }
}

#[derive(Serialize, Deserialize)]
struct Envelope {
    checksum: String,
    // serialized `PersistedState`, hashed as stored
    state: String,
}

/// Single JSON file, replaced atomically on every save and checked against
/// a blake3 digest of its state on load.
#[derive(Debug, Clone)]
pub struct JsonFileStore {
    path: PathBuf,
}

impl JsonFileStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    fn tmp_path(&self) -> PathBuf {
        let mut name = self.path.file_name().unwrap_or_default().to_os_string();
        name.push(".tmp");
        self.path.with_file_name(name)
    }

    fn load_inner(&self) -> anyhow::Result<Option<PersistedState>> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok(None),
            Err(e) => return Err(e.into()),
        };
        let envelope: Envelope = serde_json::from_slice(&raw)
            .with_context(|| format!("parsing {}", self.path.display()))?;

        let actual = checksum(&envelope.state);
        if actual != envelope.checksum {
            bail!(
                "checksum mismatch in {}: stored {}, computed {}",
                self.path.display(),
                envelope.checksum,
                actual
            );
        }
        Ok(Some(serde_json::from_str(&envelope.state)?))
    }

    fn save_inner(&self, state: &PersistedState) -> anyhow::Result<()> {
        let body = serde_json::to_string(state)?;
        let envelope = Envelope {
            checksum: checksum(&body),
            state: body,
        };

        let tmp = self.tmp_path();
        {
            let mut f = File::create(&tmp)
                .with_context(|| format!("creating {}", tmp.display()))?;
            f.write_all(&serde_json::to_vec_pretty(&envelope)?)?;
            f.sync_all()?;
        }
        fs::rename(&tmp, &self.path)?;

        if let Some(dir) = self.path.parent().filter(|d| !d.as_os_str().is_empty()) {
            File::open(dir)?.sync_all()?;
        }
        debug!(path = %self.path.display(), files = state.files.len(), "saved snapshot");
        Ok(())
    }
}

fn checksum(body: &str) -> String {
    blake3::hash(body.as_bytes()).to_hex().to_string()
}

impl MetadataStore for JsonFileStore {
    fn load(&self) -> StoreResult<Option<PersistedState>> {
        self.load_inner().map_err(StoreError::persistence)
    }

    fn save(&self, state: &PersistedState) -> StoreResult<()> {
        self.save_inner(state).map_err(StoreError::persistence)
    }
}

/// Keeps the last saved state in memory. Nothing survives the process.
#[derive(Debug, Default)]
pub struct MemoryStore {
    state: Mutex<Option<PersistedState>>,
}

impl MemoryStore {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn last_saved(&self) -> Option<PersistedState> {
        self.state.lock().clone()
    }
}

impl MetadataStore for MemoryStore {
    fn load(&self) -> StoreResult<Option<PersistedState>> {
        Ok(self.state.lock().clone())
    }

    fn save(&self, state: &PersistedState) -> StoreResult<()> {
        *self.state.lock() = Some(state.clone());
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::core::node::Priority;

    fn sample_state() -> PersistedState {
        let cluster = ClusterSnapshot {
            block_size: 4,
            hosts: vec!["a".into(), "b".into()],
            capacity: vec![40, 80],
            available: vec![36, 80],
            latency: vec![1.0, 2.5],
            effective: vec![0.0125, 0.025],
            placed_blocks: [0, 1, 0],
        };
        let mut files = BTreeMap::new();
        files.insert(
            "dir/x.psl".to_string(),
            FileEntry {
                node_id: 0,
                priority: Priority::Medium,
                size: 4,
                created_at: 1_700_000_000_000,
                modified_at: 1_700_000_000_500,
            },
        );
        PersistedState { cluster, files }
    }

    #[test]
    fn test_json_store_missing_file_is_none() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state.json"));
        assert!(store.load().unwrap().is_none());
    }

    #[test]
    fn test_json_store_leaves_no_temp_file() {
        let dir = tempfile::tempdir().unwrap();
        let store = JsonFileStore::new(dir.path().join("state.json"));
        store.save(&sample_state()).unwrap();
        assert!(store.path().exists());
        assert!(!store.tmp_path().exists());
    }

    #[test]
    fn test_memory_store_keeps_last_save() {
        let store = MemoryStore::new();
        assert!(store.load().unwrap().is_none());
        let state = sample_state();
        store.save(&state).unwrap();
        assert_eq!(store.last_saved(), Some(state));
    }
}
