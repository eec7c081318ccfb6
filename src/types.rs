//! Core types shared by the store, the service and the clients.

use crate::error::SyncError;
use serde::{Deserialize, Serialize};
use sha2::{Digest, Sha256};
use std::collections::BTreeMap;
use std::fmt;
use std::str::FromStr;
use uuid::Uuid;

/// Field that carries a record's identity.
pub const ISSUE_NUMBER_FIELD: &str = "issue_number";

/// Fields that ride along with a save request but are never persisted.
pub const TRANSPORT_FIELDS: &[&str] = &["client_id", "username", "old_issue_number"];

/// Identifier of one connected client process (one per window set).
#[derive(Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct ClientId(pub Uuid);

impl ClientId {
    /// Fresh random id.
    pub fn random() -> Self {
        ClientId(Uuid::new_v4())
    }
}

impl FromStr for ClientId {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Uuid::parse_str(s.trim())
            .map(ClientId)
            .map_err(|_| SyncError::InvalidClientId(s.to_string()))
    }
}

impl fmt::Debug for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "ClientId({})", self.0)
    }
}

impl fmt::Display for ClientId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

/// Who performed a mutation.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Actor {
    pub client_id: ClientId,
    pub username: String,
}

impl Actor {
    pub fn new(client_id: ClientId, username: impl Into<String>) -> Self {
        Self {
            client_id,
            username: username.into(),
        }
    }
}

/// Content hash (SHA-256), used to derive on-disk names for store keys.
#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct Hash(pub [u8; 32]);

impl Hash {
    /// Compute hash from bytes.
    pub fn from_bytes(data: &[u8]) -> Self {
        let mut hasher = Sha256::new();
        hasher.update(data);
        Hash(hasher.finalize().into())
    }

    /// Convert to hex string.
    pub fn to_hex(&self) -> String {
        hex::encode(self.0)
    }

    /// Get the first two characters of the hex (for sharding).
    pub fn shard_prefix(&self) -> String {
        hex::encode(&self.0[0..1])
    }
}

impl fmt::Debug for Hash {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Hash({}...)", &self.to_hex()[..8])
    }
}

/// A release-note record: field name to field value.
///
/// Identity is the `issue_number` field; every other field is free-form.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Record(BTreeMap<String, String>);

impl Record {
    pub fn new() -> Self {
        Self(BTreeMap::new())
    }

    /// Record holding only its identity field.
    pub fn with_issue_number(issue_number: impl Into<String>) -> Self {
        Self::new().with(ISSUE_NUMBER_FIELD, issue_number)
    }

    /// Builder-style field setter.
    pub fn with(mut self, field: impl Into<String>, value: impl Into<String>) -> Self {
        self.0.insert(field.into(), value.into());
        self
    }

    /// Build a record from a JSON object. Strings are kept verbatim, nulls are
    /// dropped and other scalars are rendered to text.
    pub fn from_json_object(object: serde_json::Map<String, serde_json::Value>) -> Self {
        object
            .into_iter()
            .filter_map(|(field, value)| match value {
                serde_json::Value::Null => None,
                serde_json::Value::String(s) => Some((field, s)),
                other => Some((field, other.to_string())),
            })
            .collect()
    }

    pub fn get(&self, field: &str) -> Option<&str> {
        self.0.get(field).map(String::as_str)
    }

    pub fn set(&mut self, field: impl Into<String>, value: impl Into<String>) -> Option<String> {
        self.0.insert(field.into(), value.into())
    }

    pub fn remove(&mut self, field: &str) -> Option<String> {
        self.0.remove(field)
    }

    /// The identity value, if present and not blank.
    pub fn issue_number(&self) -> Option<&str> {
        self.get(ISSUE_NUMBER_FIELD)
            .filter(|value| !value.trim().is_empty())
    }

    pub fn fields(&self) -> impl Iterator<Item = (&str, &str)> {
        self.0.iter().map(|(k, v)| (k.as_str(), v.as_str()))
    }

    pub fn field_names(&self) -> impl Iterator<Item = &str> {
        self.0.keys().map(String::as_str)
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    /// Drop the request-only bookkeeping fields.
    pub fn without_transport_fields(mut self) -> Self {
        for field in TRANSPORT_FIELDS {
            self.0.remove(*field);
        }
        self
    }
}

impl<K: Into<String>, V: Into<String>> FromIterator<(K, V)> for Record {
    fn from_iter<I: IntoIterator<Item = (K, V)>>(iter: I) -> Self {
        Record(
            iter.into_iter()
                .map(|(k, v)| (k.into(), v.into()))
                .collect(),
        )
    }
}

/// Kind of mutation carried by a [`ChangeEvent`].
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum Operation {
    Post,
    Update,
    UpdateWithRename,
    Delete,
}

impl Operation {
    pub fn as_str(&self) -> &'static str {
        match self {
            Operation::Post => "post",
            Operation::Update => "update",
            Operation::UpdateWithRename => "update_with_rename",
            Operation::Delete => "delete",
        }
    }
}

impl fmt::Display for Operation {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Broadcast describing one committed record mutation.
///
/// Field names on the wire follow the `rn_channel` payload layout.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct ChangeEvent {
    #[serde(rename = "client_id")]
    pub actor_client_id: ClientId,

    pub operation: Operation,

    /// Previous key: the renamed-away key, or the deleted key.
    #[serde(
        rename = "old_issue_number",
        alias = "issue_number",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub old_key: Option<String>,

    #[serde(
        rename = "new_issue_number",
        default,
        skip_serializing_if = "Option::is_none"
    )]
    pub new_key: Option<String>,

    #[serde(rename = "rn_record", default, skip_serializing_if = "Option::is_none")]
    pub record: Option<Record>,

    #[serde(rename = "username")]
    pub actor_display_name: String,

    pub summary: String,
}

impl ChangeEvent {
    /// The key whose row the event is about after it is applied.
    pub fn subject_key(&self) -> Option<&str> {
        match self.operation {
            Operation::Delete => self.old_key.as_deref(),
            _ => self.new_key.as_deref(),
        }
    }
}

/// Broadcast sent after a whole-table snapshot is saved.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
pub struct TableChange {
    pub table_name: String,
    #[serde(default)]
    pub client_id: Option<ClientId>,
    pub message: String,
}

/// A `#rrggbb` color.
#[derive(Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "String", into = "String")]
pub struct Color(String);

impl Color {
    pub fn rgb(r: u8, g: u8, b: u8) -> Self {
        Color(format!("#{:02x}{:02x}{:02x}", r, g, b))
    }

    pub fn black() -> Self {
        Color::rgb(0, 0, 0)
    }

    pub fn white() -> Self {
        Color::rgb(0xff, 0xff, 0xff)
    }

    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl FromStr for Color {
    type Err = SyncError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let digits = s
            .strip_prefix('#')
            .filter(|d| d.len() == 6 && d.chars().all(|c| c.is_ascii_hexdigit()))
            .ok_or_else(|| SyncError::InvalidTable(format!("invalid color: {}", s)))?;
        Ok(Color(format!("#{}", digits.to_ascii_lowercase())))
    }
}

impl TryFrom<String> for Color {
    type Error = SyncError;

    fn try_from(value: String) -> Result<Self, Self::Error> {
        value.parse()
    }
}

impl From<Color> for String {
    fn from(color: Color) -> Self {
        color.0
    }
}

impl fmt::Debug for Color {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Color({})", self.0)
    }
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum HorizontalAlign {
    #[default]
    Left,
    Center,
    Right,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum VerticalAlign {
    Top,
    #[default]
    Center,
    Bottom,
}

#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Alignment {
    pub horizontal: HorizontalAlign,
    pub vertical: VerticalAlign,
}

#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct Font {
    pub bold: bool,
    pub size: u32,
}

impl Default for Font {
    fn default() -> Self {
        Self {
            bold: false,
            size: 10,
        }
    }
}

/// Contents and styling of one spreadsheet cell.
///
/// Missing fields deserialize to the default styling, so partial cells from
/// older clients still load.
#[derive(Clone, Debug, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct CellRecord {
    pub text: String,
    pub foreground: Color,
    pub background: Color,
    pub alignment: Alignment,
    pub font: Font,
    pub row_height: u32,
    pub column_width: u32,
}

impl CellRecord {
    /// Default-styled cell holding `text`.
    pub fn text(text: impl Into<String>) -> Self {
        Self {
            text: text.into(),
            ..Default::default()
        }
    }
}

impl Default for CellRecord {
    fn default() -> Self {
        Self {
            text: String::new(),
            foreground: Color::black(),
            background: Color::white(),
            alignment: Alignment::default(),
            font: Font::default(),
            row_height: 20,
            column_width: 100,
        }
    }
}

/// One table row: column index to cell.
pub type TableRow = BTreeMap<usize, CellRecord>;

/// A rectangular merged area anchored at its top-left cell.
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct MergeRegion {
    pub row: usize,
    pub col: usize,
    pub row_span: usize,
    pub col_span: usize,
}

impl MergeRegion {
    pub fn new(row: usize, col: usize, row_span: usize, col_span: usize) -> Self {
        Self {
            row,
            col,
            row_span,
            col_span,
        }
    }

    /// Whether `(row, col)` lies inside the region.
    pub fn contains(&self, row: usize, col: usize) -> bool {
        row >= self.row
            && row < self.row_end()
            && col >= self.col
            && col < self.col_end()
    }

    pub fn overlaps(&self, other: &MergeRegion) -> bool {
        self.row < other.row_end()
            && other.row < self.row_end()
            && self.col < other.col_end()
            && other.col < self.col_end()
    }

    fn row_end(&self) -> usize {
        self.row.saturating_add(self.row_span)
    }

    fn col_end(&self) -> usize {
        self.col.saturating_add(self.col_span)
    }

    /// Whether the region's far edge is representable.
    fn in_bounds(&self) -> bool {
        self.row.checked_add(self.row_span).is_some() && self.col.checked_add(self.col_span).is_some()
    }
}

/// A whole-table snapshot: rows plus merge regions.
#[derive(Clone, Debug, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct Table {
    #[serde(rename = "table_data", default)]
    pub rows: Vec<TableRow>,
    #[serde(default)]
    pub merged_cells: Vec<MergeRegion>,
}

impl Table {
    pub fn new(rows: Vec<TableRow>, merged_cells: Vec<MergeRegion>) -> Self {
        Self { rows, merged_cells }
    }

    pub fn is_empty(&self) -> bool {
        self.rows.is_empty()
    }

    /// Number of columns implied by the widest row.
    pub fn column_count(&self) -> usize {
        self.rows
            .iter()
            .filter_map(|row| row.keys().next_back())
            .map(|last| last + 1)
            .max()
            .unwrap_or(0)
    }

    /// Fill every gap in every row with a default-styled cell.
    pub fn normalized(mut self) -> Self {
        let columns = self.column_count();
        for row in &mut self.rows {
            for col in 0..columns {
                row.entry(col).or_default();
            }
        }
        self
    }

    /// Cell shown at `(row, col)`. Cells covered by a merge region resolve
    /// to the region's top-left cell.
    pub fn cell_at(&self, row: usize, col: usize) -> Option<&CellRecord> {
        let (row, col) = self
            .merged_cells
            .iter()
            .find(|region| region.contains(row, col))
            .map(|region| (region.row, region.col))
            .unwrap_or((row, col));
        self.rows.get(row).and_then(|cells| cells.get(&col))
    }

    pub fn validate(&self) -> Result<(), SyncError> {
        validate_merges(&self.merged_cells)
    }
}

/// Reject zero-sized, unaddressable or overlapping merge regions.
pub fn validate_merges(regions: &[MergeRegion]) -> Result<(), SyncError> {
    for (i, region) in regions.iter().enumerate() {
        if region.row_span == 0 || region.col_span == 0 {
            return Err(SyncError::InvalidTable(format!(
                "merge region at ({}, {}) has zero span",
                region.row, region.col
            )));
        }
        if !region.in_bounds() {
            return Err(SyncError::InvalidTable(format!(
                "merge region at ({}, {}) extends past the addressable grid",
                region.row, region.col
            )));
        }
        if let Some(other) = regions[i + 1..].iter().find(|o| region.overlaps(o)) {
            return Err(SyncError::InvalidTable(format!(
                "merge regions at ({}, {}) and ({}, {}) overlap",
                region.row, region.col, other.row, other.col
            )));
        }
    }
    Ok(())
}

/// Per-user permission bitmask.
#[derive(Clone, Copy, Debug, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Permission(pub u32);

impl Permission {
    pub const NONE: Permission = Permission(0);
    /// Bit 1: may save and delete.
    pub const EDIT: Permission = Permission(1);

    /// Test the `n`-th bit, counting from 1.
    pub fn check_bit(self, n: u32) -> bool {
        n >= 1 && n <= 32 && self.0 & (1 << (n - 1)) != 0
    }

    pub fn contains(self, other: Permission) -> bool {
        self.0 & other.0 == other.0
    }

    pub fn can_edit(self) -> bool {
        self.contains(Permission::EDIT)
    }
}
