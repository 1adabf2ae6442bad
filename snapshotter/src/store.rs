//! Transactional metadata store for snapshot records.
//!
//! Records live in an in-memory table persisted as JSON to `metadata.db`
//! under the snapshotter root. A [`Transaction`] holds the store's single
//! async mutex for its lifetime, so transactions are serializable: writers
//! mutate a working copy that becomes visible (and durable) only on commit;
//! rollback discards it.

use std::collections::{BTreeMap, HashMap};
use std::path::{Path, PathBuf};

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use tokio::sync::{Mutex, MutexGuard};
use tracing::debug;

use crate::error::{Error, Result};

/// Snapshot lifecycle kind.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub enum Kind {
    /// Read-only view of a committed parent.
    View,
    /// Writable working snapshot.
    Active,
    /// Immutable snapshot usable as a parent.
    Committed,
}

/// Externally visible snapshot record.
#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Info {
    /// Snapshot key (or committed name).
    pub name: String,
    /// Key of the parent snapshot, if any.
    pub parent: Option<String>,
    pub kind: Kind,
    #[serde(default)]
    pub labels: HashMap<String, String>,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Identity of a snapshot plus the device ancestry needed to use it.
#[derive(Debug, Clone)]
pub struct Snapshot {
    /// Store-assigned id, stable across commit. Forms the device name.
    pub id: String,
    pub kind: Kind,
    /// Ids of ancestor snapshots, nearest parent first.
    pub parent_ids: Vec<String>,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
struct Record {
    id: u64,
    info: Info,
}

#[derive(Debug, Clone, Default, Serialize, Deserialize)]
struct StoreState {
    next_id: u64,
    records: BTreeMap<String, Record>,
}

/// The metadata store. One per snapshotter root.
pub struct MetaStore {
    path: PathBuf,
    state: Mutex<StoreState>,
    closed: std::sync::atomic::AtomicBool,
}

impl MetaStore {
    /// Open (or initialize) the store at the given path.
    pub async fn open(path: &Path) -> Result<Self> {
        let state = match tokio::fs::read_to_string(path).await {
            Ok(data) => serde_json::from_str(&data)
                .map_err(|e| Error::Internal(format!("parsing {}: {}", path.display(), e)))?,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => StoreState {
                next_id: 1,
                records: BTreeMap::new(),
            },
            Err(e) => {
                return Err(Error::io(&format!("reading {}", path.display()), e));
            }
        };

        debug!(path = %path.display(), "metadata store opened");

        Ok(Self {
            path: path.to_path_buf(),
            state: Mutex::new(state),
            closed: std::sync::atomic::AtomicBool::new(false),
        })
    }

    /// Begin a transaction. Blocks until any in-flight transaction finishes.
    pub async fn transaction(&self, writable: bool) -> Result<Transaction<'_>> {
        if self.closed.load(std::sync::atomic::Ordering::SeqCst) {
            return Err(Error::FailedPrecondition(
                "metadata store is closed".into(),
            ));
        }
        let shared = self.state.lock().await;
        let working = shared.clone();
        Ok(Transaction {
            shared,
            working,
            writable,
            path: &self.path,
        })
    }

    /// Mark the store closed. Subsequent transactions fail; in-flight ones
    /// finish normally.
    pub fn close(&self) -> Result<()> {
        self.closed
            .store(true, std::sync::atomic::Ordering::SeqCst);
        Ok(())
    }
}

/// A serializable transaction over the store.
pub struct Transaction<'a> {
    shared: MutexGuard<'a, StoreState>,
    working: StoreState,
    writable: bool,
    path: &'a Path,
}

impl Transaction<'_> {
    fn require_writable(&self) -> Result<()> {
        if self.writable {
            Ok(())
        } else {
            Err(Error::FailedPrecondition(
                "transaction is read-only".into(),
            ))
        }
    }

    /// Fetch the info record for a snapshot key.
    pub fn get_info(&self, key: &str) -> Result<Info> {
        self.working
            .records
            .get(key)
            .map(|r| r.info.clone())
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", key)))
    }

    /// Update mutable fields of a record. Only labels may change; with no
    /// field paths the label set is replaced wholesale, otherwise each
    /// `labels.<key>` path copies (or clears) a single label.
    pub fn update_info(&mut self, info: &Info, fieldpaths: &[String]) -> Result<Info> {
        self.require_writable()?;
        let record = self
            .working
            .records
            .get_mut(&info.name)
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", info.name)))?;

        if fieldpaths.is_empty() {
            record.info.labels = info.labels.clone();
        } else {
            for path in fieldpaths {
                if path == "labels" {
                    record.info.labels = info.labels.clone();
                } else if let Some(label) = path.strip_prefix("labels.") {
                    match info.labels.get(label) {
                        Some(value) => {
                            record.info.labels.insert(label.to_string(), value.clone());
                        }
                        None => {
                            record.info.labels.remove(label);
                        }
                    }
                } else {
                    return Err(Error::InvalidArgument(format!(
                        "cannot update field '{}' on snapshot {}",
                        path, info.name
                    )));
                }
            }
        }

        record.info.updated_at = Utc::now();
        Ok(record.info.clone())
    }

    /// Resolve a key to its id, kind, and ancestor device chain.
    pub fn get_snapshot(&self, key: &str) -> Result<Snapshot> {
        let record = self
            .working
            .records
            .get(key)
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", key)))?;
        Ok(Snapshot {
            id: record.id.to_string(),
            kind: record.info.kind,
            parent_ids: self.parent_chain(&record.info),
        })
    }

    fn parent_chain(&self, info: &Info) -> Vec<String> {
        let mut ids = Vec::new();
        let mut parent = info.parent.clone();
        while let Some(key) = parent {
            match self.working.records.get(&key) {
                Some(record) => {
                    ids.push(record.id.to_string());
                    parent = record.info.parent.clone();
                }
                None => break,
            }
        }
        ids
    }

    /// Create a new Active or View snapshot record under `key`.
    pub fn create_snapshot(
        &mut self,
        kind: Kind,
        key: &str,
        parent: &str,
        labels: HashMap<String, String>,
    ) -> Result<Snapshot> {
        self.require_writable()?;

        if key.is_empty() {
            return Err(Error::InvalidArgument("snapshot key is empty".into()));
        }
        if kind == Kind::Committed {
            return Err(Error::InvalidArgument(
                "snapshot kind must be Active or View".into(),
            ));
        }
        if self.working.records.contains_key(key) {
            return Err(Error::AlreadyExists(format!("snapshot {}", key)));
        }

        let parent_field = if parent.is_empty() {
            None
        } else {
            let record = self
                .working
                .records
                .get(parent)
                .ok_or_else(|| Error::NotFound(format!("parent snapshot {}", parent)))?;
            if record.info.kind != Kind::Committed {
                return Err(Error::FailedPrecondition(format!(
                    "parent snapshot {} is not committed",
                    parent
                )));
            }
            Some(parent.to_string())
        };

        let id = self.working.next_id;
        self.working.next_id += 1;

        let now = Utc::now();
        let info = Info {
            name: key.to_string(),
            parent: parent_field,
            kind,
            labels,
            created_at: now,
            updated_at: now,
        };
        let parent_ids = self.parent_chain(&info);
        self.working
            .records
            .insert(key.to_string(), Record { id, info });

        Ok(Snapshot {
            id: id.to_string(),
            kind,
            parent_ids,
        })
    }

    /// Transition an Active snapshot at `key` to Committed under `name`.
    /// The id (and thus the backing device) is unchanged.
    pub fn commit_active(
        &mut self,
        key: &str,
        name: &str,
        labels: HashMap<String, String>,
    ) -> Result<String> {
        self.require_writable()?;

        if self.working.records.contains_key(name) {
            return Err(Error::AlreadyExists(format!("snapshot {}", name)));
        }
        let mut record = self
            .working
            .records
            .remove(key)
            .ok_or_else(|| Error::NotFound(format!("snapshot {}", key)))?;
        if record.info.kind != Kind::Active {
            // Put the record back untouched before failing.
            let err = Error::FailedPrecondition(format!("snapshot {} is not active", key));
            self.working.records.insert(key.to_string(), record);
            return Err(err);
        }

        record.info.name = name.to_string();
        record.info.kind = Kind::Committed;
        record.info.labels.extend(labels);
        record.info.updated_at = Utc::now();
        let id = record.id;
        self.working.records.insert(name.to_string(), record);

        Ok(id.to_string())
    }

    /// Remove a snapshot record, returning its id and final info.
    pub fn remove(&mut self, key: &str) -> Result<(String, Info)> {
        self.require_writable()?;

        if !self.working.records.contains_key(key) {
            return Err(Error::NotFound(format!("snapshot {}", key)));
        }
        let has_children = self
            .working
            .records
            .values()
            .any(|r| r.info.parent.as_deref() == Some(key));
        if has_children {
            return Err(Error::FailedPrecondition(format!(
                "snapshot {} has children",
                key
            )));
        }

        let record = self.working.records.remove(key).unwrap();
        Ok((record.id.to_string(), record.info))
    }

    /// Visit every record in key order.
    pub fn walk_info<F>(&self, mut f: F) -> Result<()>
    where
        F: FnMut(&Info) -> Result<()>,
    {
        for record in self.working.records.values() {
            f(&record.info)?;
        }
        Ok(())
    }

    /// Persist the working state and make it visible to later transactions.
    pub async fn commit(mut self) -> Result<()> {
        self.require_writable()?;

        let data = serde_json::to_string_pretty(&self.working)
            .map_err(|e| Error::Internal(format!("serializing metadata: {}", e)))?;
        tokio::fs::write(self.path, data)
            .await
            .map_err(|e| Error::io(&format!("writing {}", self.path.display()), e))?;

        *self.shared = self.working;
        Ok(())
    }

    /// Discard the working state.
    pub fn rollback(self) -> Result<()> {
        Ok(())
    }
}
