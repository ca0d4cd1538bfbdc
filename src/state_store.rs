use chrono::NaiveDateTime;
use serde_derive::{Deserialize, Serialize};
use std::collections::BTreeMap;
use std::fs;
use std::io::{self, Write};
use std::path::{Path, PathBuf};

use crate::error::PersistenceError;
use crate::meter::MeterBaselines;
use crate::period_counter::Granularity;

/// Persisted period baselines of every meter.
///
/// On disk this is one JSON object: a `file_date` marker plus one record per meter name,
/// each record holding `hour`, `day`, `week`, `month` and `year`.
#[derive(Debug, Default, Clone, PartialEq, Serialize, Deserialize)]
pub struct Snapshot {
    /// When the snapshot was taken. Informational only.
    #[serde(rename = "file_date", default)]
    pub saved_at: Option<NaiveDateTime>,
    #[serde(flatten)]
    pub meters: BTreeMap<String, MeterBaselines>,
}

impl Snapshot {
    pub fn new(saved_at: NaiveDateTime) -> Self {
        Self {
            saved_at: Some(saved_at),
            meters: BTreeMap::new(),
        }
    }

    pub fn meter(&self, name: &str) -> Option<&MeterBaselines> {
        self.meters.get(name)
    }

    pub fn set_meter(&mut self, name: &str, baselines: MeterBaselines) {
        self.meters.insert(name.to_string(), baselines);
    }

    /// Baseline of one meter and period, 0 when the snapshot has no such key.
    pub fn baseline(&self, name: &str, granularity: Granularity) -> f64 {
        self.meter(name)
            .map(|b| b.get(granularity))
            .unwrap_or_default()
    }
}

/// Whole-file JSON persistence of a [`Snapshot`].
#[derive(Debug, Clone)]
pub struct StateStore {
    path: PathBuf,
}

impl StateStore {
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self { path: path.into() }
    }

    pub fn path(&self) -> &Path {
        &self.path
    }

    pub fn load(&self) -> Result<Snapshot, PersistenceError> {
        let json = fs::read_to_string(&self.path).map_err(|source| {
            if source.kind() == io::ErrorKind::NotFound {
                PersistenceError::Missing {
                    path: self.path.clone(),
                }
            } else {
                PersistenceError::Read {
                    path: self.path.clone(),
                    source,
                }
            }
        })?;
        serde_json::from_str(&json).map_err(|source| PersistenceError::Corrupt {
            path: self.path.clone(),
            source,
        })
    }

    /// Replaces the state file. The snapshot is written next to it first and renamed into
    /// place, so a crash never leaves a half-written file behind.
    pub fn save(&self, snapshot: &Snapshot) -> Result<(), PersistenceError> {
        let json = serde_json::to_string_pretty(snapshot)?;
        let write_err = |source| PersistenceError::Write {
            path: self.path.clone(),
            source,
        };

        if let Some(parent) = self.path.parent().filter(|p| !p.as_os_str().is_empty()) {
            fs::create_dir_all(parent).map_err(write_err)?;
        }
        let temp_path = self.path.with_extension("json.tmp");
        write_synced(&temp_path, json.as_bytes()).map_err(write_err)?;
        fs::rename(&temp_path, &self.path).map_err(write_err)?;

        tracing::debug!(path = %self.path.display(), "saved meter baselines");
        Ok(())
    }
}

/// Writes `contents` and flushes them to disk, so the rename that follows never exposes
/// a file whose data is still in the page cache.
fn write_synced(path: &Path, contents: &[u8]) -> io::Result<()> {
    let mut file = fs::File::create(path)?;
    file.write_all(contents)?;
    file.sync_all()
}
