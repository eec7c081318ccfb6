//! Field-level change summaries between two versions of a record.
//!
//! The summary is an audit trail attached to every change event. It is never
//! consulted for conflict resolution.

use crate::types::{Record, ISSUE_NUMBER_FIELD, TRANSPORT_FIELDS};
use std::collections::BTreeSet;
use std::fmt;

/// Header line preceding the change lines of a non-empty summary.
pub const CHANGES_HEADER: &str = "Detected the following changes:";

/// Summary emitted when no tracked field differs.
pub const NO_CHANGES: &str = "No changes detected.";

/// One differing field.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum FieldChange {
    /// Field did not exist before.
    Gained { field: String, value: String },
    /// Field is gone or was emptied.
    Removed { field: String, was: String },
    /// Field existed but was empty, and now has a value.
    Set { field: String, value: String },
    Changed {
        field: String,
        from: String,
        to: String,
    },
}

impl fmt::Display for FieldChange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            FieldChange::Gained { field, value } => {
                write!(f, "'{}' gained value '{}'.", field, value)
            }
            FieldChange::Removed { field, was } => {
                write!(f, "'{}' removed, was '{}'.", field, was)
            }
            FieldChange::Set { field, value } => write!(f, "'{}' set to '{}'.", field, value),
            FieldChange::Changed { field, from, to } => {
                write!(f, "'{}' changed from '{}' to '{}'.", field, from, to)
            }
        }
    }
}

fn is_tracked(field: &str) -> bool {
    field != ISSUE_NUMBER_FIELD && !TRANSPORT_FIELDS.contains(&field)
}

/// Compute the tracked field changes from `before` to `after`, in field order.
///
/// An absent field and an empty field are equivalent, so a field that goes
/// from absent to empty produces no change.
pub fn diff(before: &Record, after: &Record) -> Vec<FieldChange> {
    let fields: BTreeSet<&str> = before
        .field_names()
        .chain(after.field_names())
        .filter(|f| is_tracked(f))
        .collect();

    let mut changes = Vec::new();
    for field in fields {
        let old = before.get(field);
        let new = after.get(field);
        if old.unwrap_or("") == new.unwrap_or("") {
            continue;
        }

        let change = match (old, new) {
            (None, Some(value)) => FieldChange::Gained {
                field: field.to_string(),
                value: value.to_string(),
            },
            (Some(was), None) | (Some(was), Some("")) => FieldChange::Removed {
                field: field.to_string(),
                was: was.to_string(),
            },
            (Some(""), Some(value)) => FieldChange::Set {
                field: field.to_string(),
                value: value.to_string(),
            },
            (Some(from), Some(to)) => FieldChange::Changed {
                field: field.to_string(),
                from: from.to_string(),
                to: to.to_string(),
            },
            // both sides empty-equivalent, filtered above
            (None, None) => continue,
        };
        changes.push(change);
    }
    changes
}

/// Render the change summary attached to a change event.
pub fn summarize(before: &Record, after: &Record) -> String {
    let changes = diff(before, after);
    if changes.is_empty() {
        return NO_CHANGES.to_string();
    }

    let mut summary = String::from(CHANGES_HEADER);
    for change in &changes {
        summary.push('\n');
        summary.push_str(&change.to_string());
    }
    summary
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    fn record(pairs: &[(&str, &str)]) -> Record {
        pairs.iter().copied().collect()
    }

    #[test]
    fn test_new_field_gained_and_empty_ignored() {
        let summary = summarize(&Record::new(), &record(&[("a", "1"), ("b", "")]));
        assert!(summary.contains("'a' gained value '1'"));
        assert!(!summary.contains("'b'"));
    }

    #[test]
    fn test_identical_records_yield_sentinel() {
        let r = record(&[("a", "1")]);
        assert_eq!(summarize(&r, &r), NO_CHANGES);
    }

    #[test]
    fn test_each_change_kind() {
        let before = record(&[("gone", "x"), ("emptied", "y"), ("filled", ""), ("edited", "u")]);
        let after = record(&[("emptied", ""), ("filled", "v"), ("edited", "w"), ("fresh", "z")]);
        let changes = diff(&before, &after);
        assert_eq!(
            changes,
            vec![
                FieldChange::Changed {
                    field: "edited".into(),
                    from: "u".into(),
                    to: "w".into()
                },
                FieldChange::Removed {
                    field: "emptied".into(),
                    was: "y".into()
                },
                FieldChange::Set {
                    field: "filled".into(),
                    value: "v".into()
                },
                FieldChange::Gained {
                    field: "fresh".into(),
                    value: "z".into()
                },
                FieldChange::Removed {
                    field: "gone".into(),
                    was: "x".into()
                },
            ]
        );
    }

    #[test]
    fn test_bookkeeping_fields_ignored() {
        let before = record(&[("issue_number", "1"), ("client_id", "a"), ("username", "x")]);
        let after = record(&[("issue_number", "2"), ("client_id", "b"), ("old_issue_number", "1")]);
        assert_eq!(summarize(&before, &after), NO_CHANGES);
    }

    #[test]
    fn test_delete_summary_lists_removed_fields() {
        let summary = summarize(&record(&[("title", "crash")]), &Record::new());
        assert!(summary.starts_with(CHANGES_HEADER));
        assert!(summary.contains("'title' removed, was 'crash'"));
    }

    proptest! {
        #[test]
        fn prop_self_diff_is_empty(fields in proptest::collection::btree_map("[a-z]{1,6}", "[a-z0-9]{0,4}", 0..8)) {
            let r: Record = fields.into_iter().collect();
            prop_assert!(diff(&r, &r).is_empty());
        }

        #[test]
        fn prop_one_line_per_change(
            before in proptest::collection::btree_map("[a-z]{1,4}", "[a-z]{0,3}", 0..6),
            after in proptest::collection::btree_map("[a-z]{1,4}", "[a-z]{0,3}", 0..6),
        ) {
            let b: Record = before.into_iter().collect();
            let a: Record = after.into_iter().collect();
            let changes = diff(&b, &a);
            let summary = summarize(&b, &a);
            if changes.is_empty() {
                prop_assert_eq!(summary, NO_CHANGES);
            } else {
                prop_assert_eq!(summary.lines().count(), changes.len() + 1);
            }
        }
    }
}
