//! The buildings table: resume-time dedup index and lock-serialized append log.
//!
//! Both roles live on one CSV file. Startup reads the `coord` column once;
//! workers only ever append. Appends from separate worker processes are
//! serialized by an advisory `flock` on a sidecar `<table>.lock` file, held
//! for exactly one batch.

use crate::error::{CollectError, CollectResult};
use crate::record::{PolygonRecord, COLUMNS, COORD_COLUMN};
use crate::seed::SeedPoint;
use nix::fcntl::{Flock, FlockArg};
use std::collections::HashSet;
use std::fs::{File, OpenOptions};
use std::io::{self, Write};
use std::path::{Path, PathBuf};

pub const DEFAULT_TABLE: &str = "buildings.csv";

#[derive(Clone, Debug)]
pub struct CheckpointStore {
    table: PathBuf,
    lock: PathBuf,
}

impl CheckpointStore {
    /// Attaches to `table` without touching it. Used by workers.
    pub fn attach(table: impl Into<PathBuf>) -> Self {
        let table = table.into();
        let mut lock = table.clone().into_os_string();
        lock.push(".lock");
        Self {
            table,
            lock: PathBuf::from(lock),
        }
    }

    /// Prepares the table for a run. A missing table is created with just the
    /// header; `force` truncates an existing one back to the header.
    pub fn open(table: impl Into<PathBuf>, force: bool) -> CollectResult<Self> {
        let store = Self::attach(table);
        if force || !store.table.exists() {
            let mut file = File::create(&store.table)?;
            writeln!(file, "{}", COLUMNS.join(","))?;
            file.sync_all()?;
            tracing::info!(table = %store.table.display(), force, "Initialized empty buildings table");
        }
        Ok(store)
    }

    pub fn table(&self) -> &Path {
        &self.table
    }

    /// Every `coord` value already persisted.
    pub fn load_keys(&self) -> CollectResult<HashSet<String>> {
        if !self.table.exists() {
            return Ok(HashSet::new());
        }
        let mut reader = csv::ReaderBuilder::new()
            .flexible(true)
            .from_path(&self.table)?;
        let headers = reader.headers()?.clone();
        if headers.is_empty() {
            return Ok(HashSet::new());
        }
        let idx = headers
            .iter()
            .position(|h| h == COORD_COLUMN)
            .ok_or_else(|| {
                CollectError::InvalidConfig(format!(
                    "{} has no '{COORD_COLUMN}' column",
                    self.table.display()
                ))
            })?;

        let mut keys = HashSet::new();
        for record in reader.records() {
            let record = record?;
            if let Some(key) = record.get(idx).filter(|k| !k.is_empty()) {
                keys.insert(key.to_owned());
            }
        }
        Ok(keys)
    }

    /// Appends `batch` under the cross-process lock. Returns the number of
    /// rows written; an empty batch writes nothing and takes no lock.
    pub fn append(&self, batch: &[PolygonRecord]) -> CollectResult<usize> {
        if batch.is_empty() {
            return Ok(0);
        }
        self.append_locked(batch)
            .map_err(|source| CollectError::Persist {
                path: self.table.clone(),
                source,
            })
    }

    fn append_locked(&self, batch: &[PolygonRecord]) -> io::Result<usize> {
        let lock_file = OpenOptions::new()
            .create(true)
            .truncate(false)
            .write(true)
            .open(&self.lock)?;
        let _guard = Flock::lock(lock_file, FlockArg::LockExclusive)
            .map_err(|(_, errno)| io::Error::from(errno))?;

        let file = OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.table)?;
        let needs_header = file.metadata()?.len() == 0;

        let mut writer = csv::WriterBuilder::new()
            .has_headers(needs_header)
            .from_writer(file);
        for record in batch {
            writer.serialize(record)?;
        }
        writer.flush()?;
        let file = writer.into_inner().map_err(|e| e.into_error())?;
        file.sync_data()?;

        Ok(batch.len())
    }
}

/// Seeds whose dedup key is not yet in `persisted`, in input order.
pub fn pending(seeds: Vec<SeedPoint>, persisted: &HashSet<String>) -> Vec<SeedPoint> {
    seeds
        .into_iter()
        .filter(|seed| !persisted.contains(&seed.dedup_key()))
        .collect()
}
