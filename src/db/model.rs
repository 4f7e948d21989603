//! Database entity models used by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

/// Links an import to one record it created. Never mutated; removed only by undo.
#[derive(Debug, Clone, Copy, PartialEq, Eq, sqlx::FromRow)]
pub struct LedgerEntry {
    pub import_id: i64,
    pub item_id: i64,
}
