//! Record service: validated, serialized mutations with change broadcasts.

use crate::api::{RecordApi, SaveOutcome};
use crate::bus::ChangeBus;
use crate::diff;
use crate::error::{Result, SyncError};
use crate::filter::SearchFilter;
use crate::guard::{ConcurrencyGuard, GuardStats};
use crate::store::RecordStore;
use crate::types::{
    Actor, ChangeEvent, ClientId, MergeRegion, Operation, Permission, Record, Table, TableChange,
    TableRow,
};
use std::sync::Arc;

/// Message carried by `table_updates` after a whole-table save.
pub const TABLE_UPDATED_MESSAGE: &str = "table data updated";

/// Owns the store, the process-wide guard and the bus handle.
///
/// Every mutation runs inside one exclusive section: read the pre-image,
/// diff, persist, publish. Reads share the guard.
pub struct RecordService {
    store: RecordStore,
    guard: ConcurrencyGuard,
    bus: Arc<ChangeBus>,
}

impl RecordService {
    pub fn new(store: RecordStore, bus: Arc<ChangeBus>) -> Self {
        Self {
            store,
            guard: ConcurrencyGuard::new(),
            bus,
        }
    }

    /// Service over an in-memory store with a private bus.
    pub fn in_memory() -> Self {
        Self::new(RecordStore::in_memory(), Arc::new(ChangeBus::new()))
    }

    pub fn bus(&self) -> &Arc<ChangeBus> {
        &self.bus
    }

    pub fn store(&self) -> &RecordStore {
        &self.store
    }

    pub fn guard_stats(&self) -> GuardStats {
        self.guard.stats()
    }

    /// Display name for events. Users missing from the lookup table are
    /// shown by username.
    fn display_name_of(&self, username: &str) -> Result<String> {
        Ok(self
            .store
            .display_name(username)?
            .unwrap_or_else(|| username.to_string()))
    }

    // --- Reads ---

    pub fn exists(&self, issue_number: &str) -> Result<bool> {
        let _lock = self.guard.read();
        self.store.exists(issue_number)
    }

    pub fn get(&self, issue_number: &str) -> Result<Record> {
        let _lock = self.guard.read();
        self.store.get(issue_number)
    }

    pub fn list(&self) -> Result<Vec<Record>> {
        let _lock = self.guard.read();
        self.store.list_all()
    }

    pub fn search(&self, filter: &SearchFilter) -> Result<Vec<Record>> {
        let records = self.list()?;
        Ok(filter.apply(&records))
    }

    // --- Record mutations ---

    /// Create, update, or rename-and-update `record`.
    ///
    /// With `old_key` equal to the record's issue number the record must
    /// exist. With a different `old_key` the record moves: the old key must
    /// exist and the new one must be free. Without `old_key` the save
    /// creates or updates by the record's own issue number.
    pub fn save(&self, actor: &Actor, record: Record, old_key: Option<&str>) -> Result<SaveOutcome> {
        let record = record.without_transport_fields();
        let new_key = record
            .issue_number()
            .ok_or(SyncError::MissingIdentity)?
            .to_string();
        let old_key = old_key.filter(|key| !key.trim().is_empty());

        let _lock = self.guard.write();

        let (operation, before) = match old_key {
            Some(old) if old == new_key => (Operation::Update, self.store.get(old)?),
            Some(old) => {
                let before = self.store.get(old)?;
                if self.store.exists(&new_key)? {
                    return Err(SyncError::AlreadyExists(new_key));
                }
                (Operation::UpdateWithRename, before)
            }
            None => match self.store.find(&new_key)? {
                Some(before) => (Operation::Update, before),
                None => (Operation::Post, Record::new()),
            },
        };
        let summary = diff::summarize(&before, &record);
        let display_name = self.display_name_of(&actor.username)?;

        self.store.put(&new_key, &record)?;
        if operation == Operation::UpdateWithRename {
            if let Some(old) = old_key {
                self.finish_rename(old, &new_key)?;
            }
        }

        tracing::info!(
            issue_number = %new_key,
            operation = %operation,
            client_id = %actor.client_id,
            "record saved"
        );

        self.bus.publish_record(ChangeEvent {
            actor_client_id: actor.client_id,
            operation,
            old_key: old_key.map(str::to_string),
            new_key: Some(new_key.clone()),
            record: Some(record),
            actor_display_name: display_name,
            summary: summary.clone(),
        });

        Ok(SaveOutcome {
            issue_number: new_key,
            operation,
            summary,
        })
    }

    /// Drop the renamed-away key. On failure the freshly written key is
    /// removed again so the store is left as it was.
    fn finish_rename(&self, old_key: &str, new_key: &str) -> Result<()> {
        if let Err(err) = self.store.delete(old_key) {
            tracing::warn!(old_key, new_key, error = %err, "rename failed, rolling back");
            if let Err(rollback) = self.store.delete(new_key) {
                tracing::warn!(new_key, error = %rollback, "rollback failed");
            }
            return Err(err);
        }
        Ok(())
    }

    /// Delete a record. Returns the change summary that was broadcast.
    pub fn delete(&self, actor: &Actor, issue_number: &str) -> Result<String> {
        let _lock = self.guard.write();

        let before = self.store.get(issue_number)?;
        let summary = diff::summarize(&before, &Record::new());
        let display_name = self.display_name_of(&actor.username)?;

        self.store.delete(issue_number)?;

        tracing::info!(issue_number, client_id = %actor.client_id, "record deleted");

        self.bus.publish_record(ChangeEvent {
            actor_client_id: actor.client_id,
            operation: Operation::Delete,
            old_key: Some(issue_number.to_string()),
            new_key: None,
            record: None,
            actor_display_name: display_name,
            summary: summary.clone(),
        });

        Ok(summary)
    }

    // --- Tables ---

    pub fn get_table(&self, table_name: &str) -> Result<Table> {
        let _lock = self.guard.read();
        self.store.get_table(table_name)
    }

    pub fn get_table_rows(&self, table_name: &str) -> Result<Vec<TableRow>> {
        let _lock = self.guard.read();
        self.store.get_table_rows(table_name)
    }

    pub fn get_merged_cells(&self, table_name: &str) -> Result<Vec<MergeRegion>> {
        let _lock = self.guard.read();
        self.store.get_merged_cells(table_name)
    }

    pub fn save_table_rows(&self, table_name: &str, rows: &[TableRow]) -> Result<()> {
        let _lock = self.guard.write();
        self.store.put_table_rows(table_name, rows)?;
        tracing::info!(table = table_name, rows = rows.len(), "table rows saved");
        Ok(())
    }

    pub fn save_merged_cells(&self, table_name: &str, regions: &[MergeRegion]) -> Result<()> {
        let _lock = self.guard.write();
        self.store.put_merged_cells(table_name, regions)?;
        tracing::info!(table = table_name, regions = regions.len(), "merged cells saved");
        Ok(())
    }

    /// Replace rows and merge regions together and announce it on
    /// `table_updates`.
    pub fn save_all(&self, client_id: Option<ClientId>, table_name: &str, table: &Table) -> Result<()> {
        let _lock = self.guard.write();
        self.store.put_table(table_name, table)?;

        tracing::info!(table = table_name, rows = table.rows.len(), "table saved");

        self.bus.publish_table(TableChange {
            table_name: table_name.to_string(),
            client_id,
            message: TABLE_UPDATED_MESSAGE.to_string(),
        });
        Ok(())
    }

    // --- Users ---

    pub fn permissions(&self, username: &str) -> Result<Permission> {
        let _lock = self.guard.read();
        self.store
            .permissions(username)?
            .ok_or_else(|| SyncError::NotFound(format!("permissions for {}", username)))
    }

    /// Register a user's display name and permission bits.
    pub fn seed_user(&self, username: &str, display_name: &str, permission: Permission) -> Result<()> {
        let _lock = self.guard.write();
        self.store.set_display_names([(username, display_name)])?;
        self.store.set_permissions(username, permission)?;
        tracing::debug!(username, bits = permission.0, "user seeded");
        Ok(())
    }

    /// Remove a user's permission entry. Returns whether one existed.
    pub fn revoke_user(&self, username: &str) -> Result<bool> {
        let _lock = self.guard.write();
        self.store.clear_permissions(username)
    }
}

impl RecordApi for RecordService {
    fn exists(&self, issue_number: &str) -> Result<bool> {
        RecordService::exists(self, issue_number)
    }

    fn get(&self, issue_number: &str) -> Result<Record> {
        RecordService::get(self, issue_number)
    }

    fn list(&self) -> Result<Vec<Record>> {
        RecordService::list(self)
    }

    fn save(&self, actor: &Actor, record: Record, old_key: Option<&str>) -> Result<SaveOutcome> {
        RecordService::save(self, actor, record, old_key)
    }

    fn delete(&self, actor: &Actor, issue_number: &str) -> Result<()> {
        RecordService::delete(self, actor, issue_number).map(|_| ())
    }

    fn permissions(&self, username: &str) -> Result<Permission> {
        RecordService::permissions(self, username)
    }

    fn get_table(&self, table_name: &str) -> Result<Table> {
        RecordService::get_table(self, table_name)
    }

    fn save_all(&self, actor: &Actor, table_name: &str, table: &Table) -> Result<()> {
        RecordService::save_all(self, Some(actor.client_id), table_name, table)
    }
}
