//! Durable storage for the drawing history map.
//!
//! One JSON document at a fixed file name inside a configurable directory.
//! Loading is synchronous at construction; saving is synchronous after every
//! mutation and goes through a temp file + rename so a crash mid-write can
//! never destroy the previous copy.

use crate::drawing::history::HistoryEntry;
use crate::error::ChartError;
use fnv::FnvHashMap;
use smol_str::SmolStr;
use std::fs;
use std::path::PathBuf;
use tracing::{debug, warn};

const FILE_NAME: &str = "drawings.json";

#[derive(Clone, Debug)]
pub struct DrawingStore {
    path: PathBuf,
}

impl DrawingStore {
    /// Store rooted at `dir`; the file name inside it is fixed.
    pub fn new(dir: impl Into<PathBuf>) -> Self {
        Self {
            path: dir.into().join(FILE_NAME),
        }
    }

    pub fn path(&self) -> &PathBuf {
        &self.path
    }

    /// Read the persisted map. Absence is a normal first run; a corrupt file
    /// is logged and treated as empty rather than refusing to start.
    pub fn load(&self) -> FnvHashMap<SmolStr, HistoryEntry> {
        let raw = match fs::read(&self.path) {
            Ok(raw) => raw,
            Err(err) if err.kind() == std::io::ErrorKind::NotFound => {
                debug!(path = %self.path.display(), "no drawing history yet");
                return FnvHashMap::default();
            }
            Err(err) => {
                warn!(%err, path = %self.path.display(), "failed to read drawing history");
                return FnvHashMap::default();
            }
        };
        match serde_json::from_slice(&raw) {
            Ok(entries) => entries,
            Err(err) => {
                warn!(%err, path = %self.path.display(), "drawing history is corrupt, starting empty");
                FnvHashMap::default()
            }
        }
    }

    /// Write the full map atomically.
    pub fn save(&self, entries: &FnvHashMap<SmolStr, HistoryEntry>) -> Result<(), ChartError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent)?;
        }
        let json = serde_json::to_vec(entries)?;
        let tmp = self.path.with_extension("json.tmp");
        fs::write(&tmp, &json)?;
        fs::rename(&tmp, &self.path)?;
        Ok(())
    }
}
