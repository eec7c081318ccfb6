//! Search filters over records.
//!
//! Grammar:
//!
//! ```text
//! [field=value, field2=value2]   exact match on each pair
//! {field=keyword, ...}           case-insensitive substring match
//! word another                   case-insensitive match against any field value
//! ```
//!
//! Groups and words may be mixed; all clauses must hold.

use crate::error::{Result, SyncError};
use crate::types::Record;
use std::str::FromStr;

/// One predicate of a search filter.
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum Clause {
    Exact { field: String, value: String },
    Contains { field: String, value: String },
    FreeText(String),
}

impl Clause {
    pub fn matches(&self, record: &Record) -> bool {
        match self {
            Clause::Exact { field, value } => record.get(field) == Some(value.as_str()),
            Clause::Contains { field, value } => record
                .get(field)
                .is_some_and(|v| contains_ignore_case(v, value)),
            Clause::FreeText(word) => record.fields().any(|(_, v)| contains_ignore_case(v, word)),
        }
    }
}

fn contains_ignore_case(haystack: &str, needle: &str) -> bool {
    haystack.to_lowercase().contains(&needle.to_lowercase())
}

/// A conjunction of clauses. The empty filter matches everything.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct SearchFilter {
    clauses: Vec<Clause>,
}

impl SearchFilter {
    pub fn new(clauses: Vec<Clause>) -> Self {
        Self { clauses }
    }

    /// Parse the bracket/brace search syntax.
    pub fn parse(input: &str) -> Result<Self> {
        let mut clauses = Vec::new();
        let mut free = String::new();
        let mut rest = input;

        while let Some(start) = rest.find(|c: char| c == '[' || c == '{') {
            free.push_str(&rest[..start]);
            free.push(' ');

            let open = rest.as_bytes()[start];
            let close = if open == b'[' { ']' } else { '}' };
            let body_start = start + 1;
            let end = rest[body_start..].find(close).ok_or_else(|| {
                SyncError::InvalidFilter(format!("unterminated '{}' group", open as char))
            })?;

            let body = &rest[body_start..body_start + end];
            for (field, value) in pairs(body) {
                clauses.push(if open == b'[' {
                    Clause::Exact { field, value }
                } else {
                    Clause::Contains { field, value }
                });
            }
            rest = &rest[body_start + end + 1..];
        }
        free.push_str(rest);

        clauses.extend(
            free.split_whitespace()
                .map(|word| Clause::FreeText(word.to_string())),
        );
        Ok(Self { clauses })
    }

    pub fn clauses(&self) -> &[Clause] {
        &self.clauses
    }

    pub fn is_empty(&self) -> bool {
        self.clauses.is_empty()
    }

    pub fn matches(&self, record: &Record) -> bool {
        self.clauses.iter().all(|clause| clause.matches(record))
    }

    /// Keep the records that match, preserving order.
    pub fn apply<'a>(&self, records: impl IntoIterator<Item = &'a Record>) -> Vec<Record> {
        records
            .into_iter()
            .filter(|r| self.matches(r))
            .cloned()
            .collect()
    }
}

impl FromStr for SearchFilter {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self> {
        SearchFilter::parse(s)
    }
}

/// Split `k=v, k2=v2` into trimmed pairs; entries without `=` or with an empty
/// field name are skipped.
fn pairs(body: &str) -> impl Iterator<Item = (String, String)> + '_ {
    body.split(',').filter_map(|pair| {
        let (field, value) = pair.split_once('=')?;
        let field = field.trim();
        if field.is_empty() {
            return None;
        }
        Some((field.to_string(), value.trim().to_string()))
    })
}

#[cfg(test)]
mod tests {
    use super::*;

    fn sample() -> Record {
        Record::with_issue_number("DTS2024")
            .with("title", "Crash on Startup")
            .with("owner", "ann")
    }

    #[test]
    fn test_parse_mixed_syntax() {
        let filter = SearchFilter::parse("[owner=ann, issue_number = DTS2024] {title=crash} boot").unwrap();
        assert_eq!(
            filter.clauses(),
            &[
                Clause::Exact {
                    field: "owner".into(),
                    value: "ann".into()
                },
                Clause::Exact {
                    field: "issue_number".into(),
                    value: "DTS2024".into()
                },
                Clause::Contains {
                    field: "title".into(),
                    value: "crash".into()
                },
                Clause::FreeText("boot".into()),
            ]
        );
    }

    #[test]
    fn test_exact_is_case_sensitive() {
        let record = sample();
        assert!(SearchFilter::parse("[owner=ann]").unwrap().matches(&record));
        assert!(!SearchFilter::parse("[owner=Ann]").unwrap().matches(&record));
        assert!(!SearchFilter::parse("[missing=ann]").unwrap().matches(&record));
    }

    #[test]
    fn test_contains_and_free_text_ignore_case() {
        let record = sample();
        assert!(SearchFilter::parse("{title=STARTUP}").unwrap().matches(&record));
        assert!(SearchFilter::parse("startup dts").unwrap().matches(&record));
        assert!(!SearchFilter::parse("startup nothing").unwrap().matches(&record));
    }

    #[test]
    fn test_empty_filter_matches_all() {
        let filter = SearchFilter::parse("   ").unwrap();
        assert!(filter.is_empty());
        assert!(filter.matches(&Record::new()));
    }

    #[test]
    fn test_pairs_without_equals_are_skipped() {
        let filter = SearchFilter::parse("[owner, =x, title=a]").unwrap();
        assert_eq!(filter.clauses().len(), 1);
    }

    #[test]
    fn test_unterminated_group_is_an_error() {
        assert!(matches!(
            SearchFilter::parse("[owner=ann"),
            Err(SyncError::InvalidFilter(_))
        ));
        assert!(SearchFilter::parse("{title=x").is_err());
    }

    #[test]
    fn test_apply_keeps_order() {
        let records = vec![
            Record::with_issue_number("1").with("owner", "ann"),
            Record::with_issue_number("2").with("owner", "bob"),
            Record::with_issue_number("3").with("owner", "ann"),
        ];
        let hits = SearchFilter::parse("[owner=ann]").unwrap().apply(&records);
        let ids: Vec<_> = hits.iter().filter_map(|r| r.issue_number()).collect();
        assert_eq!(ids, vec!["1", "3"]);
    }
}
