//! Repository layer for database operations
//!
//! One repository per entity kind, each behind a small async trait
//! (`NoteQueries`, `FileQueries`, ...). Every call takes the owning uid and
//! resolves that user's database through the `SpaceRouter`.

pub mod file;
pub mod folder;
pub mod note;
pub mod note_history;
pub mod note_link;
pub mod setting;
pub mod user;
pub mod vault;

pub use file::{FileQueries, FileRepository};
pub use folder::{FolderQueries, FolderRepository};
pub use note::{NoteQueries, NoteRepository};
pub use note_history::{NoteHistoryQueries, NoteHistoryRepository};
pub use note_link::{NoteLinkQueries, NoteLinkRepository};
pub use setting::{SettingQueries, SettingRepository};
pub use user::UserRepository;
pub use vault::{VaultQueries, VaultRepository, VaultStats};

use super::models::{ListQuery, Page};
use crate::config::MAX_PAGE_SIZE;
use crate::error::Result;
use crate::search::escape_like;
use chrono::Utc;
use sqlx::sqlite::SqliteRow;
use sqlx::{FromRow, QueryBuilder, Sqlite, SqlitePool};

/// Server clock in milliseconds, the unit of `updated_timestamp`
pub(crate) fn now_millis() -> i64 {
    Utc::now().timestamp_millis()
}

fn push_list_filters(qb: &mut QueryBuilder<'_, Sqlite>, query: &ListQuery) {
    qb.push("vault_id = ").push_bind(query.vault_id);

    if !query.include_deleted {
        qb.push(" AND action != 'delete'");
    }

    if let Some(prefix) = query.path_prefix.as_deref().filter(|p| !p.is_empty()) {
        qb.push(" AND path LIKE ")
            .push_bind(format!("{}%", escape_like(prefix)))
            .push(" ESCAPE '\\'");
    }
}

/// Shared `list_paged` for the path-addressed entity tables.
pub(crate) async fn fetch_page<T>(
    pool: &SqlitePool,
    table: &'static str,
    query: &ListQuery,
) -> Result<Page<T>>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let page = query.page.max(1);
    let page_size = query.page_size.clamp(1, MAX_PAGE_SIZE);
    let offset = i64::from(page - 1) * i64::from(page_size);

    let mut count = QueryBuilder::<Sqlite>::new(format!("SELECT COUNT(*) FROM {} WHERE ", table));
    push_list_filters(&mut count, query);
    let total: i64 = count.build_query_scalar().fetch_one(pool).await?;

    let mut select = QueryBuilder::<Sqlite>::new(format!("SELECT * FROM {} WHERE ", table));
    push_list_filters(&mut select, query);
    select.push(format!(
        " ORDER BY {col} {dir}, id {dir} LIMIT ",
        col = query.sort.column(),
        dir = query.order.keyword()
    ));
    select.push_bind(i64::from(page_size));
    select.push(" OFFSET ").push_bind(offset);

    let items = select.build_query_as::<T>().fetch_all(pool).await?;

    Ok(Page {
        items,
        total,
        page,
        page_size,
    })
}

/// Shared incremental pull: everything written after `since`, deletes included.
pub(crate) async fn fetch_updated_since<T>(
    pool: &SqlitePool,
    table: &'static str,
    vault_id: i64,
    since: i64,
) -> Result<Vec<T>>
where
    T: for<'r> FromRow<'r, SqliteRow> + Send + Unpin,
{
    let rows = sqlx::query_as::<_, T>(&format!(
        "SELECT * FROM {} WHERE vault_id = ? AND updated_timestamp > ? ORDER BY updated_timestamp ASC, id ASC",
        table
    ))
    .bind(vault_id)
    .bind(since)
    .fetch_all(pool)
    .await?;

    Ok(rows)
}

/// Hard delete soft-deleted rows older than `cutoff` (ms), returning their ids.
pub(crate) async fn purge_deleted_before(
    pool: &SqlitePool,
    table: &'static str,
    cutoff: i64,
) -> Result<Vec<i64>> {
    let ids: Vec<i64> = sqlx::query_scalar(&format!(
        "DELETE FROM {} WHERE action = 'delete' AND updated_timestamp < ? RETURNING id",
        table
    ))
    .bind(cutoff)
    .fetch_all(pool)
    .await?;

    Ok(ids)
}

/// Bump only the server timestamp so clients pull the row again.
pub(crate) async fn touch_timestamp(
    pool: &SqlitePool,
    table: &'static str,
    id: i64,
    updated_timestamp: i64,
) -> Result<u64> {
    let rows = sqlx::query(&format!(
        "UPDATE {} SET updated_timestamp = ?, updated_at = ? WHERE id = ?",
        table
    ))
    .bind(updated_timestamp)
    .bind(Utc::now())
    .bind(id)
    .execute(pool)
    .await?
    .rows_affected();

    Ok(rows)
}
