//! The operations a client window needs from the record service.
//!
//! Implemented in-process by [`crate::service::RecordService`] and over HTTP
//! by [`crate::client::HttpClient`], so sessions and caches can run against
//! either.

use crate::error::Result;
use crate::types::{Actor, Operation, Permission, Record, Table};
use serde::{Deserialize, Serialize};

/// Result of a successful save.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct SaveOutcome {
    pub issue_number: String,
    pub operation: Operation,
    pub summary: String,
}

pub trait RecordApi: Send + Sync {
    fn exists(&self, issue_number: &str) -> Result<bool>;

    fn get(&self, issue_number: &str) -> Result<Record>;

    fn list(&self) -> Result<Vec<Record>>;

    /// Create, update, or rename-and-update a record. `old_key` names the
    /// key being edited; `None` means create-or-update by the record's own
    /// issue number.
    fn save(&self, actor: &Actor, record: Record, old_key: Option<&str>) -> Result<SaveOutcome>;

    fn delete(&self, actor: &Actor, issue_number: &str) -> Result<()>;

    /// Permission bits of `username`; `NotFound` if none were assigned.
    fn permissions(&self, username: &str) -> Result<Permission>;

    fn get_table(&self, table_name: &str) -> Result<Table>;

    /// Replace a whole table and notify the other clients.
    fn save_all(&self, actor: &Actor, table_name: &str, table: &Table) -> Result<()>;
}
