//! Per-client mirror of the record set, reconciled from change events.

use crate::api::RecordApi;
use crate::bus::BusMessage;
use crate::filter::SearchFilter;
use crate::types::{ChangeEvent, ClientId, Operation, Record};
use std::collections::{BTreeMap, BTreeSet};

/// Something the UI has to do after the cache changed.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Effect {
    RowUpserted(String),
    RowRemoved(String),
    DetailOpened(String),
    DetailClosed(String),
    /// An open detail view must show fresh content.
    DetailReloaded(String),
    /// Rows were replaced by a fresh listing.
    Resynced { rows: usize },
    /// The listing failed; the patched rows stay.
    ResyncFailed(String),
    /// Message for the user.
    Notice(String),
}

/// Effects produced by one reconciliation, in the order they happened.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct Reconciliation {
    pub effects: Vec<Effect>,
}

impl Reconciliation {
    pub fn is_empty(&self) -> bool {
        self.effects.is_empty()
    }

    pub fn contains(&self, effect: &Effect) -> bool {
        self.effects.contains(effect)
    }

    pub fn notice(&self) -> Option<&str> {
        self.effects.iter().find_map(|effect| match effect {
            Effect::Notice(text) => Some(text.as_str()),
            _ => None,
        })
    }

    fn push(&mut self, effect: Effect) {
        self.effects.push(effect);
    }
}

/// Rows keyed by issue number plus the set of open detail views.
pub struct ClientCache {
    client_id: ClientId,
    rows: BTreeMap<String, Record>,
    open_details: BTreeSet<String>,
}

impl ClientCache {
    pub fn new(client_id: ClientId) -> Self {
        Self {
            client_id,
            rows: BTreeMap::new(),
            open_details: BTreeSet::new(),
        }
    }

    pub fn client_id(&self) -> ClientId {
        self.client_id
    }

    pub fn get(&self, issue_number: &str) -> Option<&Record> {
        self.rows.get(issue_number)
    }

    pub fn contains(&self, issue_number: &str) -> bool {
        self.rows.contains_key(issue_number)
    }

    pub fn rows(&self) -> impl Iterator<Item = &Record> {
        self.rows.values()
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.rows.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.rows.len()
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    pub fn search(&self, filter: &SearchFilter) -> Vec<Record> {
        filter.apply(self.rows.values())
    }

    // --- Detail views ---

    pub fn is_detail_open(&self, issue_number: &str) -> bool {
        self.open_details.contains(issue_number)
    }

    pub fn open_detail(&mut self, issue_number: &str) {
        self.open_details.insert(issue_number.to_string());
    }

    pub fn close_detail(&mut self, issue_number: &str) -> bool {
        self.open_details.remove(issue_number)
    }

    pub fn open_details(&self) -> impl Iterator<Item = &str> {
        self.open_details.iter().map(String::as_str)
    }

    // --- Bulk loading ---

    /// Replace every row. Records without an issue number are skipped.
    pub fn replace_all(&mut self, records: Vec<Record>) -> usize {
        self.rows = records
            .into_iter()
            .filter_map(|record| {
                let key = record.issue_number()?.to_string();
                Some((key, record))
            })
            .collect();
        self.rows.len()
    }

    /// Re-fetch the full row set.
    pub fn resync(&mut self, api: &dyn RecordApi) -> Effect {
        match api.list() {
            Ok(records) => Effect::Resynced {
                rows: self.replace_all(records),
            },
            Err(err) => {
                tracing::warn!(error = %err, "resync failed, keeping patched rows");
                Effect::ResyncFailed(err.to_string())
            }
        }
    }

    // --- Local (optimistic) mutations ---

    /// Mirror a save this client just made. Detail views follow a rename.
    pub fn apply_local_save(&mut self, old_key: Option<&str>, record: Record) -> Reconciliation {
        let mut result = Reconciliation::default();
        let Some(new_key) = record.issue_number().map(str::to_string) else {
            return result;
        };
        let record = record.without_transport_fields();

        if let Some(old) = old_key.filter(|old| *old != new_key) {
            self.remove_row(old, &mut result);
            if self.close_detail(old) {
                result.push(Effect::DetailClosed(old.to_string()));
                self.open_detail(&new_key);
                result.push(Effect::DetailOpened(new_key.clone()));
            }
        } else if self.is_detail_open(&new_key) {
            result.push(Effect::DetailReloaded(new_key.clone()));
        }
        self.rows.insert(new_key.clone(), record);
        result.effects.insert(0, Effect::RowUpserted(new_key));
        result
    }

    /// Mirror a delete this client just made.
    pub fn apply_local_delete(&mut self, issue_number: &str) -> Reconciliation {
        let mut result = Reconciliation::default();
        self.remove_row(issue_number, &mut result);
        if self.close_detail(issue_number) {
            result.push(Effect::DetailClosed(issue_number.to_string()));
        }
        result
    }

    fn remove_row(&mut self, key: &str, result: &mut Reconciliation) {
        if self.rows.remove(key).is_some() {
            result.push(Effect::RowRemoved(key.to_string()));
        }
    }

    // --- Remote events ---

    /// Patch rows and detail views for a remote event, without resyncing.
    /// Returns `None` for this client's own events.
    pub fn apply_event(&mut self, event: &ChangeEvent) -> Option<Reconciliation> {
        if event.actor_client_id == self.client_id {
            return None;
        }

        let mut result = Reconciliation::default();
        match event.operation {
            Operation::Delete => {
                if let Some(key) = event.old_key.as_deref() {
                    self.remove_row(key, &mut result);
                    if self.close_detail(key) {
                        result.push(Effect::DetailClosed(key.to_string()));
                    }
                }
            }
            Operation::UpdateWithRename => {
                if let Some(old) = event.old_key.as_deref() {
                    self.remove_row(old, &mut result);
                }
                if let Some(new) = event.new_key.as_deref() {
                    self.insert_from_event(new, event, &mut result);
                    if let Some(old) = event.old_key.as_deref() {
                        if self.close_detail(old) {
                            result.push(Effect::DetailClosed(old.to_string()));
                            self.open_detail(new);
                            result.push(Effect::DetailOpened(new.to_string()));
                        }
                    }
                }
            }
            Operation::Update => {
                if let Some(key) = event.new_key.as_deref() {
                    self.rows.remove(key);
                    self.insert_from_event(key, event, &mut result);
                    if self.is_detail_open(key) {
                        result.push(Effect::DetailReloaded(key.to_string()));
                    }
                }
            }
            Operation::Post => {
                if let Some(key) = event.new_key.as_deref() {
                    self.insert_from_event(key, event, &mut result);
                    // only an already open view follows; remote creations never open one
                    if self.is_detail_open(key) {
                        result.push(Effect::DetailReloaded(key.to_string()));
                    }
                }
            }
        }
        Some(result)
    }

    fn insert_from_event(&mut self, key: &str, event: &ChangeEvent, result: &mut Reconciliation) {
        if let Some(record) = &event.record {
            self.rows.insert(key.to_string(), record.clone());
            result.push(Effect::RowUpserted(key.to_string()));
        }
    }

    /// Full reconciliation of a remote event: patch, then resync from `api`,
    /// then describe the change for the user. This client's own events yield
    /// an empty result.
    pub fn reconcile(&mut self, event: &ChangeEvent, api: &dyn RecordApi) -> Reconciliation {
        let Some(mut result) = self.apply_event(event) else {
            return Reconciliation::default();
        };
        result.push(self.resync(api));
        result.push(Effect::Notice(notice_for(event)));
        result
    }

    /// Route a bus message. Record events reconcile; a dropped subscription
    /// forces a resync because events may have been missed.
    pub fn handle_message(&mut self, message: &BusMessage, api: &dyn RecordApi) -> Reconciliation {
        match message {
            BusMessage::RecordChanged { event } => self.reconcile(event, api),
            BusMessage::Dropped { reason } => {
                tracing::warn!(?reason, "subscription dropped, resyncing");
                Reconciliation {
                    effects: vec![self.resync(api)],
                }
            }
            BusMessage::TableChanged { .. } => Reconciliation::default(),
        }
    }
}

/// User-facing description of a remote change.
pub fn notice_for(event: &ChangeEvent) -> String {
    let key = event.subject_key().unwrap_or("?");
    let action = match event.operation {
        Operation::Post => format!("created issue {}", key),
        Operation::Update => format!("updated issue {}", key),
        Operation::UpdateWithRename => format!(
            "renamed issue {} to {}",
            event.old_key.as_deref().unwrap_or("?"),
            key
        ),
        Operation::Delete => format!("deleted issue {}", key),
    };
    format!("{} {}\n{}", event.actor_display_name, action, event.summary)
}
