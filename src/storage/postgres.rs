//! PostgreSQL implementation of the storage adapter.

use std::collections::HashSet;

use async_trait::async_trait;
use sea_query::{Alias, Expr, Order, PostgresQueryBuilder, Query};
use sqlx::postgres::PgPoolOptions;
use sqlx::{PgPool, Postgres, Row, Transaction};

use crate::changeset::{Changeset, Operation};
use crate::collection::{self, Document, EVENT_LOG};

use super::schema::{
    collection_table, create_collection_table_sql, Docs, Events, CREATE_EVENTS_INDEX,
    CREATE_EVENTS_TABLE,
};
use super::{shallow_merge, EventRow, Result, StorageAdapter, StorageError, StorageSession};

/// PostgreSQL implementation of `StorageAdapter`.
pub struct PostgresAdapter {
    pool: PgPool,
}

impl PostgresAdapter {
    /// Create an adapter over an existing pool. Call [`init`] before
    /// first use.
    ///
    /// [`init`]: PostgresAdapter::init
    pub fn new(pool: PgPool) -> Self {
        Self { pool }
    }

    /// Connect to PostgreSQL at `uri` and initialize the schema.
    pub async fn connect(uri: &str) -> Result<Self> {
        let pool = PgPoolOptions::new().max_connections(5).connect(uri).await?;
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
    pub fn pool(&self) -> &PgPool {
        &self.pool
    }
}

#[async_trait]
impl StorageAdapter for PostgresAdapter {
    async fn begin(&self) -> Result<Box<dyn StorageSession>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(PostgresSession {
            tx,
            created: HashSet::new(),
        }))
    }
}

/// One open PostgreSQL transaction.
pub struct PostgresSession {
    tx: Transaction<'static, Postgres>,
    created: HashSet<String>,
}

impl PostgresSession {
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
            select.to_string(PostgresQueryBuilder)
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
            .to_string(PostgresQueryBuilder);
        sqlx::query(&sql).execute(&mut *self.tx).await?;
        Ok(())
    }

    fn parse_doc(text: String) -> Result<Document> {
        serde_json::from_str(&text)
            .map_err(|e| StorageError::Backend(format!("corrupt document: {e}")))
    }
}

#[async_trait]
impl StorageSession for PostgresSession {
    async fn find_all(&mut self, collection: &str) -> Result<Vec<Document>> {
        if collection == EVENT_LOG {
            return self.find_events(None).await;
        }
        self.ensure_collection(collection).await?;

        let sql = Query::select()
            .column(Docs::Doc)
            .from(Alias::new(collection_table(collection)))
            .order_by(Docs::Id, Order::Asc)
            .to_string(PostgresQueryBuilder);

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
            .to_string(PostgresQueryBuilder);

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
                    .to_string(PostgresQueryBuilder);
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
                    .to_string(PostgresQueryBuilder);
                sqlx::query(&sql).execute(&mut *self.tx).await?;
                Ok(())
            }
            Operation::Delete { key } => {
                let sql = Query::delete()
                    .from_table(table)
                    .and_where(Expr::col(Docs::Id).eq(key.as_str()))
                    .to_string(PostgresQueryBuilder);
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
