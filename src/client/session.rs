//! Record window session: permission-gated mutations over a local cache.

use super::cache::{ClientCache, Reconciliation};
use crate::api::{RecordApi, SaveOutcome};
use crate::bus::BusMessage;
use crate::error::{Result, SyncError};
use crate::filter::SearchFilter;
use crate::types::{Actor, Permission, Record};
use std::sync::Arc;

/// One record window: the actor, its permission bits, and its cache.
///
/// Mutations check permission and identity collisions before any request is
/// sent, then mirror the change locally without waiting for the broadcast.
pub struct RecordSession {
    api: Arc<dyn RecordApi>,
    actor: Actor,
    permission: Permission,
    cache: ClientCache,
}

impl RecordSession {
    /// Look up the actor's permissions (none means read-only) and load all
    /// rows.
    pub fn open(api: Arc<dyn RecordApi>, actor: Actor) -> Result<Self> {
        let permission = match api.permissions(&actor.username) {
            Ok(permission) => permission,
            Err(SyncError::NotFound(_)) => Permission::NONE,
            Err(err) => return Err(err),
        };
        let mut session = Self::with_permission(api, actor, permission);
        session.refresh()?;
        Ok(session)
    }

    /// Session with known permission bits and an empty cache.
    pub fn with_permission(api: Arc<dyn RecordApi>, actor: Actor, permission: Permission) -> Self {
        let cache = ClientCache::new(actor.client_id);
        Self {
            api,
            actor,
            permission,
            cache,
        }
    }

    pub fn actor(&self) -> &Actor {
        &self.actor
    }

    pub fn permission(&self) -> Permission {
        self.permission
    }

    pub fn can_edit(&self) -> bool {
        self.permission.can_edit()
    }

    pub fn cache(&self) -> &ClientCache {
        &self.cache
    }

    /// Reload every row from the service.
    pub fn refresh(&mut self) -> Result<usize> {
        let records = self.api.list()?;
        Ok(self.cache.replace_all(records))
    }

    fn require_edit(&self) -> Result<()> {
        if !self.can_edit() {
            return Err(SyncError::PermissionDenied(format!(
                "{} may not edit records",
                self.actor.username
            )));
        }
        Ok(())
    }

    /// Create a new record. Fails before sending if the issue number is
    /// missing or already taken.
    pub fn create(&mut self, record: Record) -> Result<(SaveOutcome, Reconciliation)> {
        self.require_edit()?;
        let key = record
            .issue_number()
            .ok_or(SyncError::MissingIdentity)?
            .to_string();
        if self.api.exists(&key)? {
            return Err(SyncError::AlreadyExists(key));
        }

        let outcome = self.api.save(&self.actor, record.clone(), None)?;
        let effects = self.cache.apply_local_save(None, record);
        Ok((outcome, effects))
    }

    /// Save edits to the record currently known as `old_key`. A changed
    /// issue number renames it; the new number must be free.
    pub fn edit(&mut self, old_key: &str, record: Record) -> Result<(SaveOutcome, Reconciliation)> {
        self.require_edit()?;
        let key = record
            .issue_number()
            .ok_or(SyncError::MissingIdentity)?
            .to_string();
        if key != old_key && self.api.exists(&key)? {
            return Err(SyncError::AlreadyExists(key));
        }

        let outcome = self.api.save(&self.actor, record.clone(), Some(old_key))?;
        let effects = self.cache.apply_local_save(Some(old_key), record);
        Ok((outcome, effects))
    }

    pub fn delete(&mut self, issue_number: &str) -> Result<Reconciliation> {
        self.require_edit()?;
        self.api.delete(&self.actor, issue_number)?;
        Ok(self.cache.apply_local_delete(issue_number))
    }

    /// Fetch the current record and mark its detail view open.
    pub fn open_detail(&mut self, issue_number: &str) -> Result<Record> {
        let record = self.api.get(issue_number)?;
        self.cache.open_detail(issue_number);
        Ok(record)
    }

    pub fn close_detail(&mut self, issue_number: &str) -> bool {
        self.cache.close_detail(issue_number)
    }

    /// Filter the cached rows.
    pub fn search(&self, query: &str) -> Result<Vec<Record>> {
        let filter = SearchFilter::parse(query)?;
        Ok(self.cache.search(&filter))
    }

    /// Apply a message from the listener.
    pub fn handle(&mut self, message: &BusMessage) -> Reconciliation {
        self.cache.handle_message(message, self.api.as_ref())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::service::RecordService;
    use crate::types::ClientId;

    fn service_with_editor() -> Arc<RecordService> {
        let service = RecordService::in_memory();
        service.seed_user("ann", "Ann", Permission::EDIT).unwrap();
        Arc::new(service)
    }

    #[test]
    fn test_read_only_without_permissions() {
        let service = service_with_editor();
        let mut session = RecordSession::open(service, Actor::new(ClientId::random(), "guest")).unwrap();
        assert!(!session.can_edit());
        assert!(matches!(
            session.create(Record::with_issue_number("1")),
            Err(SyncError::PermissionDenied(_))
        ));
        assert!(matches!(session.delete("1"), Err(SyncError::PermissionDenied(_))));
    }

    #[test]
    fn test_create_checks_existing_key() {
        let service = service_with_editor();
        let mut session =
            RecordSession::open(service.clone(), Actor::new(ClientId::random(), "ann")).unwrap();

        session.create(Record::with_issue_number("1")).unwrap();
        assert!(session.cache().contains("1"));
        assert!(matches!(
            session.create(Record::with_issue_number("1")),
            Err(SyncError::AlreadyExists(_))
        ));
        assert!(matches!(
            session.create(Record::new().with("title", "x")),
            Err(SyncError::MissingIdentity)
        ));
    }

    #[test]
    fn test_edit_rename_and_delete() {
        let service = service_with_editor();
        let mut session =
            RecordSession::open(service.clone(), Actor::new(ClientId::random(), "ann")).unwrap();
        session.create(Record::with_issue_number("1")).unwrap();
        session.create(Record::with_issue_number("2")).unwrap();

        assert!(matches!(
            session.edit("1", Record::with_issue_number("2")),
            Err(SyncError::AlreadyExists(_))
        ));

        session.open_detail("1").unwrap();
        let (outcome, _) = session
            .edit("1", Record::with_issue_number("3").with("title", "t"))
            .unwrap();
        assert_eq!(outcome.issue_number, "3");
        assert!(session.cache().is_detail_open("3"));
        assert!(!service.exists("1").unwrap());

        session.delete("3").unwrap();
        assert!(!session.cache().contains("3"));
        assert!(!session.cache().is_detail_open("3"));
    }

    #[test]
    fn test_search_over_cache() {
        let service = service_with_editor();
        let mut session =
            RecordSession::open(service, Actor::new(ClientId::random(), "ann")).unwrap();
        session
            .create(Record::with_issue_number("1").with("owner", "ann"))
            .unwrap();
        session
            .create(Record::with_issue_number("2").with("owner", "bob"))
            .unwrap();

        let hits = session.search("[owner=bob]").unwrap();
        assert_eq!(hits.len(), 1);
        assert!(session.search("[owner=bob").is_err());
    }
}
