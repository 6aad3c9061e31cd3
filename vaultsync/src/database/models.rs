//! Database models
//!
//! Rust structs representing database entities and the request structs the
//! repositories accept. Rows map one-to-one onto these structs through
//! `FromRow`; large text fields are filled from the content store by the
//! repositories.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use sqlx::FromRow;

/// Sync action recorded on vault entities
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize, sqlx::Type)]
#[sqlx(rename_all = "lowercase")]
#[serde(rename_all = "lowercase")]
pub enum EntityAction {
    Create,
    Modify,
    Delete,
}

/// Registered user (global registry)
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct User {
    pub uid: i64,
    pub username: String,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Named root scope inside a user space
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Vault {
    pub id: i64,
    pub name: String,
    pub note_count: i64,
    pub note_size: i64,
    pub file_count: i64,
    pub file_size: i64,
    pub is_deleted: bool,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// A synchronized note.
///
/// `content` and `content_last_snapshot` are read from the content store;
/// the same-named columns only hold legacy inline values.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Note {
    pub id: i64,
    pub vault_id: i64,
    pub fid: i64,
    pub action: EntityAction,
    pub rename: bool,
    pub path: String,
    pub path_hash: String,
    pub content: String,
    pub content_hash: String,
    pub content_last_snapshot: String,
    pub content_last_snapshot_hash: String,
    pub version: i64,
    pub client_name: String,
    pub size: i64,
    /// Client creation time (ms)
    pub ctime: i64,
    /// Client modification time (ms)
    pub mtime: i64,
    /// Server write time (ms), drives incremental pull
    pub updated_timestamp: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

/// Create note request
#[derive(Debug, Clone, Default)]
pub struct NewNote {
    pub vault_id: i64,
    pub fid: i64,
    pub path: String,
    pub content: String,
    pub version: i64,
    pub client_name: String,
    pub ctime: i64,
    pub mtime: i64,
}

/// Partial note update. `None` leaves a column untouched.
///
/// Setting `content` also rewrites `content_hash` and `size`.
#[derive(Debug, Clone, Default)]
pub struct NoteUpdate {
    pub fid: Option<i64>,
    pub action: Option<EntityAction>,
    pub rename: Option<bool>,
    pub path: Option<String>,
    pub content: Option<String>,
    pub version: Option<i64>,
    pub client_name: Option<String>,
    pub ctime: Option<i64>,
    pub mtime: Option<i64>,
}

/// Immutable record of one committed note version
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NoteHistory {
    pub id: i64,
    pub note_id: i64,
    pub vault_id: i64,
    pub path: String,
    /// JSON-encoded patch from the previous snapshot
    pub diffs: String,
    pub content: String,
    pub content_hash: String,
    pub client_name: String,
    pub version: i64,
    pub created_at: DateTime<Utc>,
}

#[derive(Debug, Clone)]
pub struct NewNoteHistory {
    pub note_id: i64,
    pub vault_id: i64,
    pub path: String,
    pub diffs: String,
    pub content: String,
    pub client_name: String,
    pub version: i64,
}

/// Derived wiki-link edge
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct NoteLink {
    pub id: i64,
    pub source_note_id: i64,
    pub target_path: String,
    pub target_path_hash: String,
    pub link_text: String,
    pub is_embed: bool,
    pub vault_id: i64,
    pub created_at: DateTime<Utc>,
}

/// Link parsed out of note content
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct NewNoteLink {
    pub target_path: String,
    pub link_text: String,
    pub is_embed: bool,
}

#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Folder {
    pub id: i64,
    pub vault_id: i64,
    pub action: EntityAction,
    pub path: String,
    pub path_hash: String,
    pub level: i64,
    pub fid: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub updated_timestamp: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewFolder {
    pub vault_id: i64,
    pub path: String,
    pub fid: i64,
    pub ctime: i64,
    pub mtime: i64,
}

#[derive(Debug, Clone, Default)]
pub struct FolderUpdate {
    pub action: Option<EntityAction>,
    pub path: Option<String>,
    pub fid: Option<i64>,
    pub mtime: Option<i64>,
}

/// Binary attachment metadata. The blob itself lives at `file.dat`.
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct VaultFile {
    pub id: i64,
    pub vault_id: i64,
    pub action: EntityAction,
    pub rename: bool,
    pub path: String,
    pub path_hash: String,
    pub content_hash: String,
    /// Legacy blob location, empty once relocated
    pub save_path: String,
    pub size: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub updated_timestamp: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewFile {
    pub vault_id: i64,
    pub path: String,
    pub content_hash: String,
    pub size: i64,
    pub ctime: i64,
    pub mtime: i64,
}

#[derive(Debug, Clone, Default)]
pub struct FileUpdate {
    pub action: Option<EntityAction>,
    pub rename: Option<bool>,
    pub path: Option<String>,
    pub content_hash: Option<String>,
    pub save_path: Option<String>,
    pub size: Option<i64>,
    pub ctime: Option<i64>,
    pub mtime: Option<i64>,
}

/// Per-vault client setting, stored like a note without history
#[derive(Debug, Clone, Serialize, Deserialize, FromRow)]
pub struct Setting {
    pub id: i64,
    pub vault_id: i64,
    pub action: EntityAction,
    pub path: String,
    pub path_hash: String,
    pub content: String,
    pub content_hash: String,
    pub size: i64,
    pub ctime: i64,
    pub mtime: i64,
    pub updated_timestamp: i64,
    pub created_at: DateTime<Utc>,
    pub updated_at: DateTime<Utc>,
}

#[derive(Debug, Clone, Default)]
pub struct NewSetting {
    pub vault_id: i64,
    pub path: String,
    pub content: String,
    pub ctime: i64,
    pub mtime: i64,
}

#[derive(Debug, Clone, Default)]
pub struct SettingUpdate {
    pub action: Option<EntityAction>,
    pub path: Option<String>,
    pub content: Option<String>,
    pub ctime: Option<i64>,
    pub mtime: Option<i64>,
}

/// Sort column for paged listings
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortField {
    #[default]
    Mtime,
    Ctime,
    Path,
}

impl SortField {
    pub fn column(&self) -> &'static str {
        match self {
            SortField::Mtime => "mtime",
            SortField::Ctime => "ctime",
            SortField::Path => "path",
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum SortOrder {
    Asc,
    #[default]
    Desc,
}

impl SortOrder {
    pub fn keyword(&self) -> &'static str {
        match self {
            SortOrder::Asc => "ASC",
            SortOrder::Desc => "DESC",
        }
    }
}

/// Filter, page and sort for `list_paged`
#[derive(Debug, Clone)]
pub struct ListQuery {
    pub vault_id: i64,
    /// Only entries whose path starts with this prefix
    pub path_prefix: Option<String>,
    pub include_deleted: bool,
    /// 1-based
    pub page: u32,
    pub page_size: u32,
    pub sort: SortField,
    pub order: SortOrder,
}

impl ListQuery {
    pub fn for_vault(vault_id: i64) -> Self {
        Self {
            vault_id,
            path_prefix: None,
            include_deleted: false,
            page: 1,
            page_size: crate::config::DEFAULT_PAGE_SIZE,
            sort: SortField::default(),
            order: SortOrder::default(),
        }
    }
}

/// One page of a listing
#[derive(Debug, Clone, Serialize)]
pub struct Page<T> {
    pub items: Vec<T>,
    pub total: i64,
    pub page: u32,
    pub page_size: u32,
}
