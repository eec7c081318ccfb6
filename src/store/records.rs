//! Typed record and table persistence over a [`KvBackend`].
//!
//! Key layout:
//!
//! ```text
//! rn_record:<issue_number>       JSON object of record fields
//! <table_name>_data              JSON list of rows (column index -> cell)
//! <table_name>_merged_cells      JSON list of merge regions
//! permissions_<username>         decimal permission bitmask
//! kpi_username                   JSON object, username -> display name
//! ```

use super::backend::{KvBackend, MemoryBackend};
use crate::error::{Result, SyncError};
use crate::types::{validate_merges, MergeRegion, Permission, Record, Table, TableRow};
use serde::de::DeserializeOwned;
use std::collections::BTreeMap;
use std::sync::Arc;

const RECORD_PREFIX: &str = "rn_record:";
const DISPLAY_NAMES_KEY: &str = "kpi_username";
const PERMISSIONS_PREFIX: &str = "permissions_";

fn record_key(issue_number: &str) -> String {
    format!("{}{}", RECORD_PREFIX, issue_number)
}

fn rows_key(table: &str) -> String {
    format!("{}_data", table)
}

fn merges_key(table: &str) -> String {
    format!("{}_merged_cells", table)
}

fn permissions_key(username: &str) -> String {
    format!("{}{}", PERMISSIONS_PREFIX, username)
}

/// Backend I/O failures surface as `StoreUnavailable`; everything else passes
/// through unchanged.
fn unavailable(err: SyncError) -> SyncError {
    match err {
        SyncError::Io(e) => SyncError::StoreUnavailable(e.to_string()),
        other => other,
    }
}

fn check_table_name(name: &str) -> Result<()> {
    if name.trim().is_empty() {
        return Err(SyncError::InvalidTable("table name is empty".to_string()));
    }
    Ok(())
}

/// Authoritative storage for records, tables, permissions and display names.
///
/// The store does no locking of its own beyond what the backend needs;
/// callers serialize access through the `ConcurrencyGuard`.
#[derive(Clone)]
pub struct RecordStore {
    backend: Arc<dyn KvBackend>,
}

impl RecordStore {
    pub fn new(backend: Arc<dyn KvBackend>) -> Self {
        Self { backend }
    }

    /// Store over a fresh [`MemoryBackend`].
    pub fn in_memory() -> Self {
        Self::new(Arc::new(MemoryBackend::new()))
    }

    fn read_raw(&self, key: &str) -> Result<Option<Vec<u8>>> {
        self.backend.get(key).map_err(unavailable)
    }

    fn write_raw(&self, key: &str, value: &[u8]) -> Result<()> {
        tracing::debug!(key, bytes = value.len(), "store write");
        self.backend.set(key, value).map_err(unavailable)
    }

    fn read_json<T: DeserializeOwned>(&self, key: &str) -> Result<Option<T>> {
        match self.read_raw(key)? {
            Some(bytes) => serde_json::from_slice(&bytes)
                .map(Some)
                .map_err(|e| SyncError::Deserialization(format!("{}: {}", key, e))),
            None => Ok(None),
        }
    }

    // --- Records ---

    pub fn exists(&self, issue_number: &str) -> Result<bool> {
        self.backend
            .exists(&record_key(issue_number))
            .map_err(unavailable)
    }

    /// Load a record, failing with `NotFound` if absent.
    pub fn get(&self, issue_number: &str) -> Result<Record> {
        self.find(issue_number)?
            .ok_or_else(|| SyncError::NotFound(issue_number.to_string()))
    }

    pub fn find(&self, issue_number: &str) -> Result<Option<Record>> {
        self.read_json(&record_key(issue_number))
    }

    /// Overwrite the record stored under `issue_number`.
    pub fn put(&self, issue_number: &str, record: &Record) -> Result<()> {
        let bytes = serde_json::to_vec(record)?;
        self.write_raw(&record_key(issue_number), &bytes)
    }

    pub fn delete(&self, issue_number: &str) -> Result<()> {
        let existed = self
            .backend
            .delete(&record_key(issue_number))
            .map_err(unavailable)?;
        if !existed {
            return Err(SyncError::NotFound(issue_number.to_string()));
        }
        tracing::debug!(issue_number, "store delete");
        Ok(())
    }

    /// Every stored record, in key order.
    pub fn list_all(&self) -> Result<Vec<Record>> {
        let keys = self
            .backend
            .keys_with_prefix(RECORD_PREFIX)
            .map_err(unavailable)?;

        let mut records = Vec::with_capacity(keys.len());
        for key in keys {
            if let Some(record) = self.read_json::<Record>(&key)? {
                records.push(record);
            }
        }
        Ok(records)
    }

    // --- Tables ---

    /// Rows and merge regions of `name`. An unknown table is empty.
    pub fn get_table(&self, name: &str) -> Result<Table> {
        Ok(Table::new(
            self.get_table_rows(name)?,
            self.get_merged_cells(name)?,
        ))
    }

    /// Write rows and merge regions together. If the merge write fails the
    /// previous rows are put back.
    pub fn put_table(&self, name: &str, table: &Table) -> Result<()> {
        check_table_name(name)?;
        table.validate()?;
        let rows = serde_json::to_vec(&table.rows)?;
        let merges = serde_json::to_vec(&table.merged_cells)?;

        let rows_key = rows_key(name);
        let previous = self.read_raw(&rows_key)?;
        self.write_raw(&rows_key, &rows)?;
        if let Err(err) = self.write_raw(&merges_key(name), &merges) {
            tracing::warn!(table = name, error = %err, "table write failed, restoring rows");
            let restored = match &previous {
                Some(bytes) => self.write_raw(&rows_key, bytes),
                None => self.backend.delete(&rows_key).map(|_| ()).map_err(unavailable),
            };
            if let Err(rollback) = restored {
                tracing::warn!(table = name, error = %rollback, "row restore failed");
            }
            return Err(err);
        }
        Ok(())
    }

    pub fn get_table_rows(&self, name: &str) -> Result<Vec<TableRow>> {
        check_table_name(name)?;
        Ok(self.read_json(&rows_key(name))?.unwrap_or_default())
    }

    pub fn put_table_rows(&self, name: &str, rows: &[TableRow]) -> Result<()> {
        check_table_name(name)?;
        self.write_raw(&rows_key(name), &serde_json::to_vec(rows)?)
    }

    pub fn get_merged_cells(&self, name: &str) -> Result<Vec<MergeRegion>> {
        check_table_name(name)?;
        Ok(self.read_json(&merges_key(name))?.unwrap_or_default())
    }

    pub fn put_merged_cells(&self, name: &str, regions: &[MergeRegion]) -> Result<()> {
        check_table_name(name)?;
        validate_merges(regions)?;
        self.write_raw(&merges_key(name), &serde_json::to_vec(regions)?)
    }

    // --- Users ---

    /// Permission bitmask of `username`, if one was ever assigned.
    pub fn permissions(&self, username: &str) -> Result<Option<Permission>> {
        let key = permissions_key(username);
        let Some(bytes) = self.read_raw(&key)? else {
            return Ok(None);
        };
        let text = String::from_utf8_lossy(&bytes);
        text.trim()
            .parse::<u32>()
            .map(|bits| Some(Permission(bits)))
            .map_err(|e| SyncError::Deserialization(format!("{}: {}", key, e)))
    }

    pub fn set_permissions(&self, username: &str, permission: Permission) -> Result<()> {
        self.write_raw(&permissions_key(username), permission.0.to_string().as_bytes())
    }

    /// Remove the permission entry. Returns whether one existed.
    pub fn clear_permissions(&self, username: &str) -> Result<bool> {
        self.backend
            .delete(&permissions_key(username))
            .map_err(unavailable)
    }

    pub fn display_name(&self, username: &str) -> Result<Option<String>> {
        let mut names: BTreeMap<String, String> =
            self.read_json(DISPLAY_NAMES_KEY)?.unwrap_or_default();
        Ok(names.remove(username))
    }

    /// Merge entries into the display-name table.
    pub fn set_display_names<I, U, D>(&self, entries: I) -> Result<()>
    where
        I: IntoIterator<Item = (U, D)>,
        U: Into<String>,
        D: Into<String>,
    {
        let mut names: BTreeMap<String, String> =
            self.read_json(DISPLAY_NAMES_KEY)?.unwrap_or_default();
        names.extend(entries.into_iter().map(|(u, d)| (u.into(), d.into())));
        self.write_raw(DISPLAY_NAMES_KEY, &serde_json::to_vec(&names)?)
    }
}
