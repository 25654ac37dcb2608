use async_trait::async_trait;
use chrono::{DateTime, Utc};
use futures_util::stream::{self, BoxStream, StreamExt};
use sqlx::postgres::{PgListener, PgPoolOptions, PgRow};
use sqlx::{PgPool, Row};
use std::time::Duration;

use crate::error::StoreError;
use crate::models::{EntityKey, EntityKind};
use crate::services::store::{BackingStore, Document};

const CHANGE_CHANNEL: &str = "document_changes";

/// PostgreSQL backing store
///
/// All entities live in one `documents` table keyed by entity key. Versioned
/// writes are single conditional statements, so the database serializes
/// writers per key. A trigger publishes every commit on the
/// `document_changes` channel, which feeds `subscribe`.
pub struct PostgresStore {
    pool: PgPool,
}

impl PostgresStore {
    /// Connect and run migrations
    pub async fn connect(
        database_url: &str,
        max_connections: u32,
        min_connections: u32,
        acquire_timeout: Duration,
    ) -> Result<Self, StoreError> {
        let pool = PgPoolOptions::new()
            .max_connections(max_connections)
            .min_connections(min_connections)
            .acquire_timeout(acquire_timeout)
            .idle_timeout(Duration::from_secs(600))
            .test_before_acquire(true)
            .connect(database_url)
            .await?;

        sqlx::migrate!("./migrations")
            .run(&pool)
            .await
            .map_err(|e| StoreError::Unavailable(format!("migration failed: {}", e)))?;

        tracing::info!("PostgreSQL store ready (max {} connections)", max_connections);

        Ok(Self { pool })
    }

    pub fn from_pool(pool: PgPool) -> Self {
        Self { pool }
    }

    async fn current_version(&self, key: &EntityKey) -> Result<u64, StoreError> {
        let row = sqlx::query("SELECT version FROM documents WHERE key = $1")
            .bind(key.to_string())
            .fetch_optional(&self.pool)
            .await?;
        match row {
            Some(row) => to_u64(row.try_get::<i64, _>("version")?, key),
            None => Ok(0),
        }
    }
}

fn to_u64(value: i64, key: &EntityKey) -> Result<u64, StoreError> {
    u64::try_from(value).map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("negative counter {}", value),
    })
}

fn to_i64(value: u64, key: &EntityKey) -> Result<i64, StoreError> {
    i64::try_from(value).map_err(|_| StoreError::Corrupt {
        key: key.to_string(),
        reason: format!("counter {} out of range", value),
    })
}

fn row_to_document(row: &PgRow) -> Result<Document, StoreError> {
    let raw_key: String = row.try_get("key")?;
    let key: EntityKey = raw_key.parse().map_err(|reason| StoreError::Corrupt {
        key: raw_key.clone(),
        reason,
    })?;
    let version = to_u64(row.try_get("version")?, &key)?;
    let sequence = to_u64(row.try_get("sequence")?, &key)?;
    let payload: serde_json::Value = row.try_get("payload")?;
    let updated_at: DateTime<Utc> = row.try_get("updated_at")?;

    Ok(Document {
        key,
        version,
        sequence,
        payload,
        updated_at,
    })
}

async fn fetch_document(pool: &PgPool, key: &EntityKey) -> Result<Option<Document>, StoreError> {
    let row = sqlx::query(
        r#"
        SELECT key, version, sequence, payload, updated_at
        FROM documents
        WHERE key = $1
        "#,
    )
    .bind(key.to_string())
    .fetch_optional(pool)
    .await?;

    row.as_ref().map(row_to_document).transpose()
}

#[async_trait]
impl BackingStore for PostgresStore {
    async fn get(&self, key: &EntityKey) -> Result<Option<Document>, StoreError> {
        fetch_document(&self.pool, key).await
    }

    async fn list(&self, kind: EntityKind) -> Result<Vec<Document>, StoreError> {
        let rows = sqlx::query(
            r#"
            SELECT key, version, sequence, payload, updated_at
            FROM documents
            WHERE kind = $1
            ORDER BY sequence
            "#,
        )
        .bind(kind.prefix())
        .fetch_all(&self.pool)
        .await?;

        rows.iter().map(row_to_document).collect()
    }

    async fn put_if_version(
        &self,
        key: &EntityKey,
        expected_version: u64,
        payload: serde_json::Value,
    ) -> Result<Document, StoreError> {
        let row = if expected_version == 0 {
            sqlx::query(
                r#"
                INSERT INTO documents (key, kind, version, sequence, payload, updated_at)
                VALUES ($1, $2, 1, nextval('document_sequence'), $3, NOW())
                ON CONFLICT (key) DO NOTHING
                RETURNING key, version, sequence, payload, updated_at
                "#,
            )
            .bind(key.to_string())
            .bind(key.kind().prefix())
            .bind(&payload)
            .fetch_optional(&self.pool)
            .await?
        } else {
            sqlx::query(
                r#"
                UPDATE documents
                SET version = version + 1,
                    sequence = nextval('document_sequence'),
                    payload = $3,
                    updated_at = NOW()
                WHERE key = $1 AND version = $2
                RETURNING key, version, sequence, payload, updated_at
                "#,
            )
            .bind(key.to_string())
            .bind(to_i64(expected_version, key)?)
            .bind(&payload)
            .fetch_optional(&self.pool)
            .await?
        };

        match row {
            Some(row) => {
                let document = row_to_document(&row)?;
                tracing::debug!("Committed {} at version {}", key, document.version);
                Ok(document)
            }
            None => Err(StoreError::VersionMismatch {
                key: key.clone(),
                expected: expected_version,
                actual: self.current_version(key).await?,
            }),
        }
    }

    fn subscribe(&self) -> BoxStream<'static, Document> {
        let pool = self.pool.clone();
        stream::unfold(None::<PgListener>, move |listener| {
            let pool = pool.clone();
            async move {
                let mut listener = match listener {
                    Some(listener) => listener,
                    None => {
                        let mut listener = match PgListener::connect_with(&pool).await {
                            Ok(listener) => listener,
                            Err(e) => {
                                tracing::warn!("Failed to open change listener: {}", e);
                                return None;
                            }
                        };
                        if let Err(e) = listener.listen(CHANGE_CHANNEL).await {
                            tracing::warn!("Failed to LISTEN on {}: {}", CHANGE_CHANNEL, e);
                            return None;
                        }
                        listener
                    }
                };

                loop {
                    let notification = match listener.recv().await {
                        Ok(notification) => notification,
                        Err(e) => {
                            tracing::warn!("Change listener closed: {}", e);
                            return None;
                        }
                    };
                    let key: EntityKey = match notification.payload().parse() {
                        Ok(key) => key,
                        Err(reason) => {
                            tracing::warn!("Ignoring change for unknown key: {}", reason);
                            continue;
                        }
                    };
                    match fetch_document(&pool, &key).await {
                        Ok(Some(document)) => return Some((document, Some(listener))),
                        Ok(None) => continue,
                        Err(e) => {
                            tracing::warn!("Failed to load changed document {}: {}", key, e);
                            continue;
                        }
                    }
                }
            }
        })
        .boxed()
    }

    async fn ping(&self) -> Result<(), StoreError> {
        sqlx::query("SELECT 1").fetch_one(&self.pool).await?;
        Ok(())
    }
}
