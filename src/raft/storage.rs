//! On-disk persistence for one node's consensus state.
//!
//! Layout under the data directory:
//!
//! ```text
//! node-id.json          identity of the node owning this directory
//! raft/hard_state.json  current term, vote and voter set
//! raft/log.jsonl        one JSON log entry per line, after the snapshot point
//! raft/snapshot.json    snapshot metadata
//! raft/snapshot.bin     serialized state machine
//! ```

use std::collections::BTreeMap;
use std::fs::{self, File, OpenOptions};
use std::io::{BufRead, BufReader, Write};
use std::path::{Path, PathBuf};
use std::sync::Mutex;

use serde::de::DeserializeOwned;
use serde::{Deserialize, Serialize};

use crate::error::{Result, StevedoreError};
use crate::raft::log::{LogChange, LogEntry, ReplicatedLog};
use crate::raft::state::Snapshot;

#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct HardState {
    pub current_term: u64,
    pub voted_for: Option<u64>,
    pub voters: BTreeMap<u64, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
struct SnapshotMeta {
    last_included_index: u64,
    last_included_term: u64,
    voters: BTreeMap<u64, String>,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct NodeIdentity {
    pub node_id: u64,
    pub node_name: String,
    pub created_at: chrono::DateTime<chrono::Utc>,
}

/// Everything needed to resume after a restart.
#[derive(Debug, Default)]
pub struct Recovered {
    pub hard_state: HardState,
    pub log: ReplicatedLog,
    pub snapshot: Option<Snapshot>,
}

pub struct RaftStorage {
    dir: PathBuf,
    last_hard_state: Mutex<Option<HardState>>,
}

impl RaftStorage {
    /// Open (or initialise) the data directory for `node_id`.
    ///
    /// A directory created by a different node refuses to open.
    pub fn open(data_dir: &Path, node_id: u64, node_name: &str) -> Result<Self> {
        fs::create_dir_all(data_dir.join("raft"))?;

        let identity_path = data_dir.join("node-id.json");
        match read_json_optional::<NodeIdentity>(&identity_path)? {
            Some(identity) if identity.node_id != node_id => {
                return Err(StevedoreError::Raft(format!(
                    "data dir {} belongs to node {}, not {}",
                    data_dir.display(),
                    identity.node_id,
                    node_id
                )));
            }
            Some(_) => {}
            None => {
                write_json_atomic(
                    &identity_path,
                    &NodeIdentity {
                        node_id,
                        node_name: node_name.to_string(),
                        created_at: chrono::Utc::now(),
                    },
                )?;
            }
        }

        Ok(Self {
            dir: data_dir.join("raft"),
            last_hard_state: Mutex::new(None),
        })
    }

    pub fn load(&self) -> Result<Recovered> {
        let hard_state: HardState =
            read_json_optional(&self.dir.join("hard_state.json"))?.unwrap_or_default();

        let snapshot = match read_json_optional::<SnapshotMeta>(&self.dir.join("snapshot.json"))? {
            Some(meta) => Some(Snapshot {
                last_included_index: meta.last_included_index,
                last_included_term: meta.last_included_term,
                voters: meta.voters,
                data: fs::read(self.dir.join("snapshot.bin"))?,
            }),
            None => None,
        };

        let (entries, torn) = self.read_log()?;
        let (offset, offset_term) = snapshot
            .as_ref()
            .map(|s| (s.last_included_index, s.last_included_term))
            .unwrap_or((0, 0));

        if let Ok(mut last) = self.last_hard_state.lock() {
            *last = Some(hard_state.clone());
        }

        let log = ReplicatedLog::restore(offset, offset_term, entries);
        if torn {
            self.save_log(&log, LogChange::Rewrite)?;
        }

        Ok(Recovered {
            hard_state,
            log,
            snapshot,
        })
    }

    /// Persist term, vote and voters if they changed since the last save.
    pub fn save_hard_state(&self, hard_state: &HardState) -> Result<()> {
        let mut last = self
            .last_hard_state
            .lock()
            .map_err(|_| StevedoreError::Internal("hard state lock poisoned".into()))?;
        if last.as_ref() == Some(hard_state) {
            return Ok(());
        }
        write_json_atomic(&self.dir.join("hard_state.json"), hard_state)?;
        *last = Some(hard_state.clone());
        Ok(())
    }

    /// Bring `log.jsonl` in line with the in-memory log.
    pub fn save_log(&self, log: &ReplicatedLog, change: LogChange) -> Result<()> {
        let path = self.dir.join("log.jsonl");
        match change {
            LogChange::None => Ok(()),
            LogChange::AppendedFrom(from) => {
                let mut file = OpenOptions::new().create(true).append(true).open(&path)?;
                for entry in log.entries_from(from, usize::MAX) {
                    serde_json::to_writer(&mut file, &entry)?;
                    file.write_all(b"\n")?;
                }
                file.sync_data()?;
                Ok(())
            }
            LogChange::Rewrite => {
                let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
                for entry in log.entries() {
                    serde_json::to_writer(tmp.as_file_mut(), entry)?;
                    tmp.as_file_mut().write_all(b"\n")?;
                }
                tmp.as_file_mut().sync_all()?;
                tmp.persist(&path).map_err(|e| StevedoreError::Storage(e.error))?;
                Ok(())
            }
        }
    }

    pub fn save_snapshot(&self, snapshot: &Snapshot) -> Result<()> {
        let mut tmp = tempfile::NamedTempFile::new_in(&self.dir)?;
        tmp.as_file_mut().write_all(&snapshot.data)?;
        tmp.as_file_mut().sync_all()?;
        tmp.persist(self.dir.join("snapshot.bin"))
            .map_err(|e| StevedoreError::Storage(e.error))?;

        write_json_atomic(
            &self.dir.join("snapshot.json"),
            &SnapshotMeta {
                last_included_index: snapshot.last_included_index,
                last_included_term: snapshot.last_included_term,
                voters: snapshot.voters.clone(),
            },
        )
    }

    /// Entries in file order, and whether a torn tail was dropped.
    fn read_log(&self) -> Result<(Vec<LogEntry>, bool)> {
        let file = match File::open(self.dir.join("log.jsonl")) {
            Ok(file) => file,
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => return Ok((Vec::new(), false)),
            Err(e) => return Err(e.into()),
        };

        let mut entries = Vec::new();
        for line in BufReader::new(file).lines() {
            let line = line?;
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<LogEntry>(&line) {
                Ok(entry) => entries.push(entry),
                Err(e) => {
                    // A crash mid-append leaves a torn final line.
                    tracing::warn!(error = %e, "Ignoring unreadable log tail");
                    return Ok((entries, true));
                }
            }
        }
        Ok((entries, false))
    }
}

fn write_json_atomic<T: Serialize>(path: &Path, value: &T) -> Result<()> {
    let parent = path
        .parent()
        .ok_or_else(|| StevedoreError::Internal(format!("path has no parent: {}", path.display())))?;
    let mut tmp = tempfile::NamedTempFile::new_in(parent)?;
    serde_json::to_writer_pretty(tmp.as_file_mut(), value)?;
    tmp.as_file_mut().flush()?;
    tmp.as_file_mut().sync_all()?;
    tmp.persist(path).map_err(|e| StevedoreError::Storage(e.error))?;
    Ok(())
}

fn read_json_optional<T: DeserializeOwned>(path: &Path) -> Result<Option<T>> {
    match fs::read(path) {
        Ok(bytes) => Ok(Some(serde_json::from_slice(&bytes)?)),
        Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(None),
        Err(e) => Err(e.into()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::Command;

    #[test]
    fn test_round_trip_after_restart() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RaftStorage::open(dir.path(), 1, "node-1").unwrap();

        let mut log = ReplicatedLog::new();
        log.append(1, Some("req-1".into()), Command::Noop);
        log.append(1, None, Command::Noop);
        let change = log.take_change();
        storage.save_log(&log, change).unwrap();

        let hard = HardState {
            current_term: 1,
            voted_for: Some(1),
            voters: BTreeMap::from([(1, "127.0.0.1:7001".to_string())]),
        };
        storage.save_hard_state(&hard).unwrap();

        let reopened = RaftStorage::open(dir.path(), 1, "node-1").unwrap();
        let recovered = reopened.load().unwrap();
        assert_eq!(recovered.hard_state, hard);
        assert_eq!(recovered.log.last_index(), 2);
        assert_eq!(
            recovered.log.get(1).unwrap().request_id.as_deref(),
            Some("req-1")
        );
    }

    #[test]
    fn test_compaction_rewrites_log_and_keeps_snapshot() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RaftStorage::open(dir.path(), 2, "node-2").unwrap();

        let mut log = ReplicatedLog::new();
        for _ in 0..5 {
            log.append(3, None, Command::Noop);
        }
        let change = log.take_change();
        storage.save_log(&log, change).unwrap();

        storage
            .save_snapshot(&Snapshot {
                last_included_index: 4,
                last_included_term: 3,
                voters: BTreeMap::new(),
                data: b"{}".to_vec(),
            })
            .unwrap();
        log.compact_to(4);
        let change = log.take_change();
        storage.save_log(&log, change).unwrap();

        let recovered = storage.load().unwrap();
        let snapshot = recovered.snapshot.unwrap();
        assert_eq!(snapshot.last_included_index, 4);
        assert_eq!(snapshot.data, b"{}".to_vec());
        assert_eq!(recovered.log.offset(), 4);
        assert_eq!(recovered.log.last_index(), 5);
    }

    #[test]
    fn test_torn_tail_is_ignored() {
        let dir = tempfile::tempdir().unwrap();
        let storage = RaftStorage::open(dir.path(), 1, "node-1").unwrap();
        let mut log = ReplicatedLog::new();
        log.append(1, None, Command::Noop);
        let change = log.take_change();
        storage.save_log(&log, change).unwrap();

        let mut file = OpenOptions::new()
            .append(true)
            .open(dir.path().join("raft/log.jsonl"))
            .unwrap();
        file.write_all(b"{\"term\":1,\"ind").unwrap();

        assert_eq!(storage.load().unwrap().log.last_index(), 1);

        // The torn bytes are gone, so later appends stay readable.
        let mut log = storage.load().unwrap().log;
        log.append(1, None, Command::Noop);
        let change = log.take_change();
        storage.save_log(&log, change).unwrap();
        assert_eq!(storage.load().unwrap().log.last_index(), 2);
    }

    #[test]
    fn test_foreign_data_dir_is_refused() {
        let dir = tempfile::tempdir().unwrap();
        RaftStorage::open(dir.path(), 1, "node-1").unwrap();
        assert!(RaftStorage::open(dir.path(), 2, "node-2").is_err());
    }
}
