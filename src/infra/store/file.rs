//! File-backed allocation store using a JSON-lines journal.
//!
//! Every [`AllocationStore::apply`] call is appended as one line holding both
//! the ownership changes and the record mutations, so a crash never leaves a
//! grant half-written. Opening the store replays the journal and compacts it
//! into a snapshot written to a temporary file and renamed into place. Only
//! the final line may be unreadable (a torn write); anything earlier refuses
//! to open.

use std::fs::{create_dir_all, File, OpenOptions};
use std::io::{BufRead, BufReader, BufWriter, Write};
use std::path::{Path, PathBuf};

use serde::{Deserialize, Serialize};

use crate::core::{Allocation, AllocationStore, BrokerError, OwnerChange, RecordOp};
use crate::infra::store::StoreTables;
use crate::util::{AllocId, TargetId};

/// Journal entries written before the journal is compacted again.
pub const DEFAULT_COMPACT_EVERY: usize = 4096;

#[derive(Debug, Serialize, Deserialize)]
struct JournalEntry {
    #[serde(default)]
    owners: Vec<OwnerChange>,
    #[serde(default)]
    records: Vec<RecordOp>,
}

/// Durable store persisted under a directory.
pub struct FileStore {
    dir: PathBuf,
    tables: StoreTables,
    journal: File,
    entries_since_compact: usize,
    compact_every: usize,
}

impl FileStore {
    /// Open (or create) the store in `dir`, replaying any existing journal.
    pub fn open(dir: impl AsRef<Path>) -> Result<Self, BrokerError> {
        Self::open_with_compaction(dir, DEFAULT_COMPACT_EVERY)
    }

    /// Like [`FileStore::open`], compacting after `compact_every` entries.
    pub fn open_with_compaction(
        dir: impl AsRef<Path>,
        compact_every: usize,
    ) -> Result<Self, BrokerError> {
        let dir = dir.as_ref().to_path_buf();
        create_dir_all(&dir).map_err(backend)?;
        let tables = Self::replay(&journal_path(&dir))?;
        Self::write_snapshot(&dir, &tables)?;
        let journal = open_append(&journal_path(&dir))?;
        tracing::info!(
            path = %dir.display(),
            allocations = tables.len(),
            "allocation store opened"
        );
        Ok(Self {
            dir,
            tables,
            journal,
            entries_since_compact: 0,
            compact_every: compact_every.max(1),
        })
    }

    fn replay(path: &Path) -> Result<StoreTables, BrokerError> {
        let mut tables = StoreTables::default();
        if !path.exists() {
            return Ok(tables);
        }
        let file = OpenOptions::new().read(true).open(path).map_err(backend)?;
        let mut lines = Vec::new();
        for (lineno, line) in BufReader::new(file).lines().enumerate() {
            let line = line.map_err(backend)?;
            if !line.trim().is_empty() {
                lines.push((lineno + 1, line));
            }
        }
        let last = lines.len();
        for (idx, (lineno, line)) in lines.into_iter().enumerate() {
            let entry: JournalEntry = match serde_json::from_str(&line) {
                Ok(entry) => entry,
                Err(e) if idx + 1 == last => {
                    // Only the final write can be torn.
                    tracing::warn!(line = lineno, error = %e, "dropping torn journal tail");
                    break;
                }
                Err(e) => {
                    return Err(BrokerError::Backend(format!(
                        "journal entry {lineno} is unreadable: {e}"
                    )));
                }
            };
            if !tables.expectations_hold(&entry.owners) {
                return Err(BrokerError::Backend(format!(
                    "journal entry {lineno} does not apply to replayed state"
                )));
            }
            tables.apply_unchecked(&entry.owners, entry.records);
        }
        Ok(tables)
    }

    fn write_snapshot(dir: &Path, tables: &StoreTables) -> Result<(), BrokerError> {
        let snapshot = JournalEntry {
            owners: tables
                .owners()
                .into_iter()
                .map(|(target, owner)| OwnerChange::claim(target, &owner))
                .collect(),
            records: tables
                .allocations()
                .into_iter()
                .cloned()
                .map(RecordOp::Put)
                .collect(),
        };
        let tmp = dir.join("allocations.jsonl.tmp");
        {
            let file = File::create(&tmp).map_err(backend)?;
            let mut writer = BufWriter::new(file);
            let line = serde_json::to_string(&snapshot).map_err(backend)?;
            writeln!(writer, "{line}").map_err(backend)?;
            writer.flush().map_err(backend)?;
            writer.get_ref().sync_all().map_err(backend)?;
        }
        std::fs::rename(&tmp, journal_path(dir)).map_err(backend)
    }

    fn compact(&mut self) -> Result<(), BrokerError> {
        Self::write_snapshot(&self.dir, &self.tables)?;
        self.journal = open_append(&journal_path(&self.dir))?;
        self.entries_since_compact = 0;
        tracing::debug!(path = %self.dir.display(), "allocation journal compacted");
        Ok(())
    }

    fn append(&mut self, entry: &JournalEntry) -> Result<(), BrokerError> {
        let line = serde_json::to_string(entry).map_err(backend)? + "\n";
        let prev_len = self.journal.metadata().map_err(backend)?.len();
        let written = self
            .journal
            .write_all(line.as_bytes())
            .and_then(|()| self.journal.sync_data());
        if let Err(e) = written {
            // A partial line would sit in front of the next entry; cut it off.
            if let Err(cut) = self.journal.set_len(prev_len) {
                tracing::warn!(error = %cut, "journal truncate failed, compacting");
                if let Err(compact) = self.compact() {
                    tracing::error!(error = %compact, "journal compaction failed");
                }
            }
            return Err(backend(e));
        }
        Ok(())
    }

    /// Directory holding the journal.
    #[must_use]
    pub fn dir(&self) -> &Path {
        &self.dir
    }
}

impl AllocationStore for FileStore {
    fn apply(
        &mut self,
        owners: &[OwnerChange],
        records: Vec<RecordOp>,
    ) -> Result<bool, BrokerError> {
        if !self.tables.expectations_hold(owners) {
            return Ok(false);
        }
        let entry = JournalEntry {
            owners: owners.to_vec(),
            records,
        };
        self.append(&entry)?;
        self.tables.apply_unchecked(&entry.owners, entry.records);
        self.entries_since_compact += 1;
        if self.entries_since_compact >= self.compact_every {
            self.compact()?;
        }
        Ok(true)
    }

    fn get(&self, id: &AllocId) -> Option<&Allocation> {
        self.tables.get(id)
    }

    fn allocations(&self) -> Vec<&Allocation> {
        self.tables.allocations()
    }

    fn owner_of(&self, target: &str) -> Option<&AllocId> {
        self.tables.owner_of(target)
    }

    fn owners(&self) -> Vec<(TargetId, AllocId)> {
        self.tables.owners()
    }
}

fn journal_path(dir: &Path) -> PathBuf {
    dir.join("allocations.jsonl")
}

fn open_append(path: &Path) -> Result<File, BrokerError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(backend)
}

fn backend(e: impl std::fmt::Display) -> BrokerError {
    BrokerError::Backend(e.to_string())
}
