//! Checkpoint store backed by the built-in table and an optional append-only file.
//!
//! File format: one `<height> <hash-hex>` record per line, display-order hash, heights
//! strictly increasing. Blank lines and `#` comments are ignored.

use std::collections::BTreeMap;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use std::sync::atomic::{AtomicUsize, Ordering};
use std::sync::{Mutex, MutexGuard, PoisonError, RwLock};
use std::time::SystemTime;

use schilling_consensus::{hash256_from_hex, hash256_to_hex, Checkpoint, ConsensusParams, Hash256};
use thiserror::Error;
use tracing::{debug, warn};

use crate::stored_block::StoredBlock;

#[derive(Debug, Error)]
pub enum ValidHashError {
    #[error("failed to read checkpoint file {path}: {source}")]
    Io { path: PathBuf, source: io::Error },
}

/// Size and modification time of the checkpoint file as of the last read.
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
struct FileStamp {
    len: u64,
    modified: Option<SystemTime>,
}

impl FileStamp {
    fn of(path: &Path) -> Option<Self> {
        let metadata = fs::metadata(path).ok()?;
        Some(Self {
            len: metadata.len(),
            modified: metadata.modified().ok(),
        })
    }
}

pub struct ValidHashStore {
    path: Option<PathBuf>,
    entries: RwLock<BTreeMap<i32, Hash256>>,
    stamp: Mutex<Option<FileStamp>>,
    file_reads: AtomicUsize,
}

impl ValidHashStore {
    /// Loads the built-in checkpoints plus `path`. A missing file is an empty set.
    pub fn open(path: Option<&Path>, params: &ConsensusParams) -> Result<Self, ValidHashError> {
        let mut entries = BTreeMap::new();
        for checkpoint in &params.checkpoints {
            entries.insert(checkpoint.height, checkpoint.hash);
        }
        let store = Self {
            path: path.map(Path::to_path_buf),
            entries: RwLock::new(entries),
            stamp: Mutex::new(None),
            file_reads: AtomicUsize::new(0),
        };
        {
            let mut entries = store.entries.write().unwrap_or_else(PoisonError::into_inner);
            let added = store.load_file(&mut entries)?;
            if added > 0 {
                debug!(added, "loaded checkpoint file");
            }
        }
        Ok(store)
    }

    /// A store holding only `checkpoints`, with no backing file.
    pub fn from_checkpoints(checkpoints: &[Checkpoint]) -> Self {
        Self {
            path: None,
            entries: RwLock::new(
                checkpoints
                    .iter()
                    .map(|checkpoint| (checkpoint.height, checkpoint.hash))
                    .collect(),
            ),
            stamp: Mutex::new(None),
            file_reads: AtomicUsize::new(0),
        }
    }

    /// Whether `hash` may sit at the height following `parent` (`None` means height 0).
    ///
    /// Heights without a checkpoint are always valid. For blocks from untrusted peers above
    /// the highest known checkpoint the backing file is re-read first, if it changed.
    pub fn is_valid_hash(
        &self,
        hash: &Hash256,
        parent: Option<&StoredBlock>,
        from_untrusted_peer: bool,
    ) -> bool {
        let height = parent.map_or(0, |parent| parent.height + 1);

        if from_untrusted_peer && self.path.is_some() {
            let above_highest = self
                .highest_checkpoint()
                .map_or(true, |checkpoint| height > checkpoint.height);
            if above_highest {
                self.reload_if_behind(height);
            }
        }

        let entries = self.entries.read().unwrap_or_else(PoisonError::into_inner);
        match entries.get(&height) {
            Some(expected) => expected == hash,
            None => true,
        }
    }

    pub fn checkpoint(&self, height: i32) -> Option<Hash256> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .get(&height)
            .copied()
    }

    pub fn highest_checkpoint(&self) -> Option<Checkpoint> {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .iter()
            .next_back()
            .map(|(height, hash)| Checkpoint {
                height: *height,
                hash: *hash,
            })
    }

    pub fn len(&self) -> usize {
        self.entries
            .read()
            .unwrap_or_else(PoisonError::into_inner)
            .len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    fn reload_if_behind(&self, height: i32) {
        let Some(path) = self.path.as_deref() else {
            return;
        };
        let current = FileStamp::of(path);
        if current.is_none() || *self.lock_stamp() == current {
            return;
        }
        let mut entries = self.entries.write().unwrap_or_else(PoisonError::into_inner);
        let still_behind = entries
            .keys()
            .next_back()
            .map_or(true, |highest| height > *highest);
        if !still_behind {
            return;
        }
        match self.load_file(&mut entries) {
            Ok(0) => {}
            Ok(added) => debug!(added, "checkpoint file grew"),
            Err(err) => warn!(%err, "checkpoint file reload failed"),
        }
    }

    fn load_file(&self, entries: &mut BTreeMap<i32, Hash256>) -> Result<usize, ValidHashError> {
        let Some(path) = self.path.as_deref() else {
            return Ok(0);
        };
        let stamp = FileStamp::of(path);
        let contents = match fs::read_to_string(path) {
            Ok(contents) => contents,
            Err(err) if err.kind() == io::ErrorKind::NotFound => return Ok(0),
            Err(source) => {
                return Err(ValidHashError::Io {
                    path: path.to_path_buf(),
                    source,
                })
            }
        };
        self.file_reads.fetch_add(1, Ordering::Relaxed);
        *self.lock_stamp() = stamp;
        Ok(merge_records(&contents, entries))
    }

    fn lock_stamp(&self) -> MutexGuard<'_, Option<FileStamp>> {
        self.stamp.lock().unwrap_or_else(PoisonError::into_inner)
    }
}

/// Merges file records into `entries`, returning how many new heights were added.
fn merge_records(contents: &str, entries: &mut BTreeMap<i32, Hash256>) -> usize {
    let mut added = 0;
    let mut last_height: Option<i32> = None;
    for (index, line) in contents.lines().enumerate() {
        let line = line.trim();
        if line.is_empty() || line.starts_with('#') {
            continue;
        }
        let Some((height, hash)) = parse_record(line) else {
            warn!(line = index + 1, "skipping malformed checkpoint record");
            continue;
        };
        if last_height.is_some_and(|last| height <= last) {
            warn!(line = index + 1, height, "skipping out-of-order checkpoint record");
            continue;
        }
        last_height = Some(height);
        match entries.get(&height) {
            Some(existing) if *existing == hash => {}
            Some(existing) => warn!(
                height,
                kept = %hash256_to_hex(existing),
                ignored = %hash256_to_hex(&hash),
                "skipping conflicting checkpoint record"
            ),
            None => {
                entries.insert(height, hash);
                added += 1;
            }
        }
    }
    added
}

fn parse_record(line: &str) -> Option<(i32, Hash256)> {
    let mut fields = line.split_whitespace();
    let height = fields.next()?.parse::<i32>().ok()?;
    let hash = hash256_from_hex(fields.next()?).ok()?;
    if height < 0 || fields.next().is_some() {
        return None;
    }
    Some((height, hash))
}
