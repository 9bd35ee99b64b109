//! Database schema definitions using sea-query.
//!
//! These define the table and column identifiers for type-safe query
//! building, plus the DDL for the event-log table and the lazily
//! created per-collection document tables.

use sea_query::Iden;

/// Event-log table schema.
#[derive(Iden)]
pub enum Events {
    Table,
    #[iden = "id"]
    Id,
    #[iden = "timestamp"]
    Timestamp,
    #[iden = "type"]
    Type,
    #[iden = "payload"]
    Payload,
    #[iden = "meta"]
    Meta,
}

/// Document-table columns shared by every business collection.
#[derive(Iden)]
pub enum Docs {
    #[iden = "id"]
    Id,
    #[iden = "doc"]
    Doc,
}

/// SQL for creating the event-log table.
pub const CREATE_EVENTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS events (
    id TEXT PRIMARY KEY,
    timestamp TEXT NOT NULL,
    type TEXT NOT NULL,
    payload TEXT NOT NULL,
    meta TEXT
)
"#;

/// SQL for the event-log timestamp index.
pub const CREATE_EVENTS_INDEX: &str =
    "CREATE INDEX IF NOT EXISTS idx_events_timestamp ON events(timestamp)";

/// Table name backing a business collection.
///
/// The `c_` prefix keeps application collection names from colliding
/// with the event log or SQL keywords. Callers must have validated the
/// collection name first.
pub fn collection_table(collection: &str) -> String {
    format!("c_{collection}")
}

/// DDL for a business collection's document table.
pub fn create_collection_table_sql(table: &str) -> String {
    format!(
        "CREATE TABLE IF NOT EXISTS \"{table}\" (id TEXT PRIMARY KEY, doc TEXT NOT NULL)"
    )
}
