//! Spreadsheet window session for one named table.

use crate::api::RecordApi;
use crate::bus::BusMessage;
use crate::error::{Result, SyncError};
use crate::types::{validate_merges, Actor, CellRecord, MergeRegion, Permission, Table, TableRow};
use std::sync::Arc;

/// Outcome of handling a bus message in a [`TableSession`].
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableUpdate {
    /// Not about this table, or caused by this client.
    Ignored,
    /// Another client saved this table; it was reloaded.
    Reloaded { message: String, discarded_edits: bool },
    /// Another client saved this table but reloading failed.
    ReloadFailed(String),
}

pub struct TableSession {
    api: Arc<dyn RecordApi>,
    actor: Actor,
    permission: Permission,
    table_name: String,
    table: Table,
    dirty: bool,
}

impl TableSession {
    pub fn new(
        api: Arc<dyn RecordApi>,
        actor: Actor,
        permission: Permission,
        table_name: impl Into<String>,
    ) -> Self {
        Self {
            api,
            actor,
            permission,
            table_name: table_name.into(),
            table: Table::default(),
            dirty: false,
        }
    }

    pub fn table_name(&self) -> &str {
        &self.table_name
    }

    pub fn table(&self) -> &Table {
        &self.table
    }

    pub fn is_dirty(&self) -> bool {
        self.dirty
    }

    pub fn can_edit(&self) -> bool {
        self.permission.can_edit()
    }

    /// Fetch the table; gaps in rows are filled with default-styled cells.
    pub fn load(&mut self) -> Result<&Table> {
        self.table = self.api.get_table(&self.table_name)?.normalized();
        self.dirty = false;
        Ok(&self.table)
    }

    /// Cell shown at `(row, col)`, resolving merged areas.
    pub fn cell_at(&self, row: usize, col: usize) -> Option<&CellRecord> {
        self.table.cell_at(row, col)
    }

    fn require_edit(&self) -> Result<()> {
        if !self.can_edit() {
            return Err(SyncError::PermissionDenied(format!(
                "{} may not edit table {}",
                self.actor.username, self.table_name
            )));
        }
        Ok(())
    }

    /// Set one cell, growing the table as needed.
    pub fn set_cell(&mut self, row: usize, col: usize, cell: CellRecord) -> Result<()> {
        self.require_edit()?;
        if self.table.rows.len() <= row {
            self.table.rows.resize_with(row + 1, TableRow::new);
        }
        self.table.rows[row].insert(col, cell);
        self.table = std::mem::take(&mut self.table).normalized();
        self.dirty = true;
        Ok(())
    }

    pub fn set_merges(&mut self, regions: Vec<MergeRegion>) -> Result<()> {
        self.require_edit()?;
        validate_merges(&regions)?;
        self.table.merged_cells = regions;
        self.dirty = true;
        Ok(())
    }

    /// Send the whole table; other clients are told to reload.
    pub fn save(&mut self) -> Result<()> {
        self.require_edit()?;
        self.table.validate()?;
        self.api.save_all(&self.actor, &self.table_name, &self.table)?;
        self.dirty = false;
        tracing::info!(table = %self.table_name, "table saved");
        Ok(())
    }

    /// React to `table_updates`: reload when another client saved this
    /// table.
    pub fn handle(&mut self, message: &BusMessage) -> TableUpdate {
        let BusMessage::TableChanged { change } = message else {
            return TableUpdate::Ignored;
        };
        if change.table_name != self.table_name || change.client_id == Some(self.actor.client_id) {
            return TableUpdate::Ignored;
        }

        let discarded_edits = self.dirty;
        match self.load() {
            Ok(_) => TableUpdate::Reloaded {
                message: change.message.clone(),
                discarded_edits,
            },
            Err(err) => {
                tracing::warn!(table = %self.table_name, error = %err, "table reload failed");
                TableUpdate::ReloadFailed(err.to_string())
            }
        }
    }
}
