//! SQLite implementation of the storage adapter.

use std::collections::HashSet;

use async_trait::async_trait;
use sea_query::{Alias, Expr, Order, Query, SqliteQueryBuilder};
use sqlx::sqlite::SqlitePoolOptions;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};

use crate::changeset::{Changeset, Operation};
use crate::collection::{self, Document, EVENT_LOG};

use super::schema::{
    collection_table, create_collection_table_sql, Docs, Events, CREATE_EVENTS_INDEX,
    CREATE_EVENTS_TABLE,
};
use super::{shallow_merge, EventRow, Result, StorageAdapter, StorageError, StorageSession};

/// SQLite implementation of `StorageAdapter`.
pub struct SqliteAdapter {
    pool: SqlitePool,
}

impl SqliteAdapter {
    /// Create an adapter over an existing pool. Call [`init`] before
    /// first use.
    ///
    /// [`init`]: SqliteAdapter::init
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Connect to a SQLite database at `path` (`:memory:` for an
    /// in-memory database) and initialize the schema.
    pub async fn connect(path: &str) -> Result<Self> {
        let in_memory = path.contains(":memory:");
        let url = if in_memory {
            "sqlite::memory:".to_string()
        } else {
            if let Some(parent) = std::path::Path::new(path).parent() {
                std::fs::create_dir_all(parent)
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
            }
            format!("sqlite:{path}?mode=rwc")
        };

        // An in-memory database exists per connection; a pool larger
        // than one would see distinct databases.
        let max_connections = if in_memory { 1 } else { 5 };
        let pool = SqlitePoolOptions::new()
            .max_connections(max_connections)
            .connect(&url)
            .await?;

        let adapter = Self::new(pool);
        adapter.init().await?;
        Ok(adapter)
    }

    /// Initialize the event-log schema.
    pub async fn init(&self) -> Result<()> {
        sqlx::query(CREATE_EVENTS_TABLE).execute(&self.pool).await?;
        sqlx::query(CREATE_EVENTS_INDEX).execute(&self.pool).await?;
        Ok(())
    }

    /// The underlying connection pool.
    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl StorageAdapter for SqliteAdapter {
    async fn begin(&self) -> Result<Box<dyn StorageSession>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteSession {
            tx,
            created: HashSet::new(),
        }))
    }
}

/// One open SQLite transaction.
pub struct SqliteSession {
    tx: Transaction<'static, Sqlite>,
    /// Collections whose tables were already ensured in this session.
    created: HashSet<String>,
}

impl SqliteSession {
    async fn ensure_collection(&mut self, name: &str) -> Result<()> {
        if !collection::is_valid_name(name) {
            return Err(StorageError::Constraint(format!(
                "invalid collection name '{name}'"
            )));
        }
        if self.created.contains(name) {
            return Ok(());
        }
        let ddl = create_collection_table_sql(&collection_table(name));
        sqlx::query(&ddl).execute(&mut *self.tx).await?;
        self.created.insert(name.to_string());
        Ok(())
    }

    async fn find_events(&mut self, key: Option<&str>) -> Result<Vec<Document>> {
        // Statements hold non-Send idents; build the SQL before awaiting.
        let sql = {
            let mut select = Query::select();
            select
                .columns([
                    Events::Id,
                    Events::Timestamp,
                    Events::Type,
                    Events::Payload,
                    Events::Meta,
                ])
                .from(Events::Table)
                .order_by(Events::Timestamp, Order::Asc)
                .order_by(Events::Id, Order::Asc);
            if let Some(key) = key {
                select.and_where(Expr::col(Events::Id).eq(key));
            }
            select.to_string(SqliteQueryBuilder)
        };

        let rows = sqlx::query(&sql).fetch_all(&mut *self.tx).await?;
        let mut docs = Vec::with_capacity(rows.len());
        for row in rows {
            let event = EventRow {
                id: row.get("id"),
                timestamp: row.get("timestamp"),
                event_type: row.get("type"),
                payload: row.get("payload"),
                meta: row.get("meta"),
            };
            docs.push(event.into_doc()?);
        }
        Ok(docs)
    }

    async fn append_event(&mut self, data: &Document) -> Result<()> {
        let event = EventRow::from_doc(data)?;
        let sql = Query::insert()
            .into_table(Events::Table)
            .columns([
                Events::Id,
                Events::Timestamp,
                Events::Type,
                Events::Payload,
                Events::Meta,
            ])
            .values_panic([
                event.id.into(),
                event.timestamp.into(),
                event.event_type.into(),
                event.payload.into(),
                event.meta.into(),
            ])
            .to_string(SqliteQueryBuilder);
        sqlx::query(&sql).execute(&mut *self.tx).await?;
        Ok(())
    }

    fn parse_doc(text: String) -> Result<Document> {
        serde_json::from_str(&text)
            .map_err(|e| StorageError::Backend(format!("corrupt document: {e}")))
    }
}

#[async_trait]
impl StorageSession for SqliteSession {
    async fn find_all(&mut self, collection: &str) -> Result<Vec<Document>> {
        if collection == EVENT_LOG {
            return self.find_events(None).await;
        }
        self.ensure_collection(collection).await?;

        let sql = Query::select()
            .column(Docs::Doc)
            .from(Alias::new(collection_table(collection)))
            .order_by(Docs::Id, Order::Asc)
            .to_string(SqliteQueryBuilder);

        let rows = sqlx::query(&sql).fetch_all(&mut *self.tx).await?;
        rows.into_iter()
            .map(|row| Self::parse_doc(row.get("doc")))
            .collect()
    }

    async fn find_one(&mut self, collection: &str, key: &str) -> Result<Option<Document>> {
        if collection == EVENT_LOG {
            return Ok(self.find_events(Some(key)).await?.into_iter().next());
        }
        self.ensure_collection(collection).await?;

        let sql = Query::select()
            .column(Docs::Doc)
            .from(Alias::new(collection_table(collection)))
            .and_where(Expr::col(Docs::Id).eq(key))
            .to_string(SqliteQueryBuilder);

        let row = sqlx::query(&sql).fetch_optional(&mut *self.tx).await?;
        row.map(|row| Self::parse_doc(row.get("doc"))).transpose()
    }

    async fn apply(&mut self, changeset: &Changeset) -> Result<()> {
        if changeset.collection == EVENT_LOG {
            return match &changeset.operation {
                Operation::Create { data } => self.append_event(data).await,
                Operation::NoChange => Ok(()),
                _ => Err(StorageError::Constraint(
                    "the event log is append-only".into(),
                )),
            };
        }
        self.ensure_collection(&changeset.collection).await?;
        let table = Alias::new(collection_table(&changeset.collection));

        match &changeset.operation {
            Operation::Create { data } => {
                let key = data
                    .get("id")
                    .and_then(serde_json::Value::as_str)
                    .ok_or_else(|| StorageError::Constraint("create without 'id'".into()))?;
                let text = serde_json::to_string(data)
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                let sql = Query::insert()
                    .into_table(table)
                    .columns([Docs::Id, Docs::Doc])
                    .values_panic([key.into(), text.into()])
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&sql).execute(&mut *self.tx).await?;
                Ok(())
            }
            Operation::Update { key, patch } => {
                let existing = self.find_one(&changeset.collection, key).await?;
                let mut doc = existing.ok_or_else(|| {
                    StorageError::Constraint(format!(
                        "update of missing key '{key}' in collection '{}'",
                        changeset.collection
                    ))
                })?;
                shallow_merge(&mut doc, patch);
                let text = serde_json::to_string(&doc)
                    .map_err(|e| StorageError::Backend(e.to_string()))?;
                let sql = Query::update()
                    .table(Alias::new(collection_table(&changeset.collection)))
                    .value(Docs::Doc, text)
                    .and_where(Expr::col(Docs::Id).eq(key.as_str()))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&sql).execute(&mut *self.tx).await?;
                Ok(())
            }
            Operation::Delete { key } => {
                let sql = Query::delete()
                    .from_table(table)
                    .and_where(Expr::col(Docs::Id).eq(key.as_str()))
                    .to_string(SqliteQueryBuilder);
                sqlx::query(&sql).execute(&mut *self.tx).await?;
                Ok(())
            }
            Operation::NoChange => Ok(()),
        }
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await.map_err(Into::into)
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await.map_err(Into::into)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    async fn adapter() -> SqliteAdapter {
        SqliteAdapter::connect(":memory:")
            .await
            .expect("in-memory sqlite")
    }

    #[tokio::test]
    async fn document_round_trip() {
        let adapter = adapter().await;

        let mut session = adapter.begin().await.unwrap();
        session
            .apply(&Changeset::create("issues", json!({"id": "x", "title": "T"})))
            .await
            .unwrap();
        session
            .apply(&Changeset::update("issues", "x", json!({"title": "U"})))
            .await
            .unwrap();
        session.commit().await.unwrap();

        let mut session = adapter.begin().await.unwrap();
        let doc = session.find_one("issues", "x").await.unwrap().unwrap();
        assert_eq!(doc, json!({"id": "x", "title": "U"}));
        let all = session.find_all("issues").await.unwrap();
        assert_eq!(all.len(), 1);
        session.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn rollback_discards_writes() {
        let adapter = adapter().await;

        let mut session = adapter.begin().await.unwrap();
        session
            .apply(&Changeset::create("issues", json!({"id": "x"})))
            .await
            .unwrap();
        session.rollback().await.unwrap();

        let mut session = adapter.begin().await.unwrap();
        assert!(session.find_all("issues").await.unwrap().is_empty());
        session.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn event_log_appends_and_reads_in_order() {
        let adapter = adapter().await;

        let mut session = adapter.begin().await.unwrap();
        for n in 0..3 {
            let doc = json!({
                "id": format!("00000000-0000-4000-8000-00000000000{n}"),
                "timestamp": format!("2026-08-27T10:00:0{n}.000000+00:00"),
                "type": "addIssue",
                "payload": {"n": n},
            });
            session
                .apply(&Changeset::create(EVENT_LOG, doc))
                .await
                .unwrap();
        }
        session.commit().await.unwrap();

        let mut session = adapter.begin().await.unwrap();
        let events = session.find_all(EVENT_LOG).await.unwrap();
        assert_eq!(events.len(), 3);
        assert_eq!(events[0]["payload"], json!({"n": 0}));
        assert_eq!(events[2]["payload"], json!({"n": 2}));
        assert!(events[0].get("meta").is_none());
        session.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn event_log_rejects_updates() {
        let adapter = adapter().await;
        let mut session = adapter.begin().await.unwrap();
        let err = session
            .apply(&Changeset::update(EVENT_LOG, "x", json!({})))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)));
        session.rollback().await.unwrap();
    }

    #[tokio::test]
    async fn duplicate_create_maps_to_constraint() {
        let adapter = adapter().await;
        let mut session = adapter.begin().await.unwrap();
        session
            .apply(&Changeset::create("issues", json!({"id": "x"})))
            .await
            .unwrap();
        let err = session
            .apply(&Changeset::create("issues", json!({"id": "x"})))
            .await
            .unwrap_err();
        assert!(matches!(err, StorageError::Constraint(_)));
        session.rollback().await.unwrap();
    }
}
