//! Durable local queue on SQLite.
//!
//! Each claim is a single `UPDATE ... RETURNING` statement, so concurrent
//! receivers (in this process or another) never hand out the same delivery twice.

use std::{collections::HashMap, path::Path, time::Duration};

use chrono::{DateTime, Utc};
use futures_util::future::BoxFuture;
use rand::{distributions::Alphanumeric, Rng};
use sqlx::{
    sqlite::{
        SqliteAutoVacuum, SqliteConnectOptions, SqliteJournalMode, SqliteLockingMode,
        SqlitePoolOptions,
    },
    types::Json,
    FromRow, SqlitePool,
};

use super::{BrokerError, MessageSource};
use crate::{
    config::Config,
    error::Error,
    message::{ReceiptHandle, SensorMessage, DEAD_LETTER_REASON_ATTRIBUTE},
};

const POLL_INTERVAL: Duration = Duration::from_millis(50);

#[derive(FromRow)]
struct Row {
    message_id: String,
    body: String,
    attributes: Json<HashMap<String, String>>,
    delivery_count: i64,
    enqueued_at: i64,
}

/// A message moved to the `dead_letters` table.
#[derive(Debug, Clone, FromRow)]
pub struct DeadLetter {
    pub message_id: String,
    pub body: String,
    pub attributes: Json<HashMap<String, String>>,
    pub delivery_count: i64,
    pub reason: String,
}

pub struct SqliteSource {
    db: SqlitePool,
    visibility_timeout: Duration,
}

impl SqliteSource {
    pub async fn connect_with(config: &Config) -> Result<Self, Error> {
        Self::open(config.db_path(), config.visibility_timeout()).await
    }

    pub async fn open(path: impl AsRef<Path>, visibility_timeout: Duration) -> Result<Self, Error> {
        let opts = SqliteConnectOptions::new()
            .filename(path)
            .create_if_missing(true)
            .journal_mode(SqliteJournalMode::Wal)
            .locking_mode(SqliteLockingMode::Normal)
            .optimize_on_close(true, None)
            .auto_vacuum(SqliteAutoVacuum::Full);

        let db = SqlitePoolOptions::new().connect_with(opts).await?;

        sqlx::migrate!("./migrations").run(&db).await?;

        Ok(Self {
            db,
            visibility_timeout,
        })
    }

    /// Enqueues a raw body. Returns the new message id.
    pub async fn enqueue(
        &self,
        body: impl AsRef<str>,
        attributes: HashMap<String, String>,
    ) -> Result<String, Error> {
        let message_id = token(20);
        let now = Utc::now().timestamp_millis();

        sqlx::query(
            "INSERT INTO messages (message_id, body, attributes, visible_at, enqueued_at) VALUES ($1, $2, $3, $4, $4)",
        )
        .bind(&message_id)
        .bind(body.as_ref())
        .bind(Json(attributes))
        .bind(now)
        .execute(&self.db)
        .await?;

        Ok(message_id)
    }

    /// Messages on the live queue, visible or in flight.
    pub async fn depth(&self) -> Result<u64, Error> {
        let depth: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM messages")
            .fetch_one(&self.db)
            .await?;

        Ok(depth as u64)
    }

    pub async fn dead_letters(&self) -> Result<Vec<DeadLetter>, Error> {
        Ok(sqlx::query_as(
            "SELECT message_id, body, attributes, delivery_count, reason FROM dead_letters ORDER BY id",
        )
        .fetch_all(&self.db)
        .await?)
    }

    async fn claim_one(&self) -> Result<Option<SensorMessage>, sqlx::Error> {
        let now = Utc::now().timestamp_millis();
        let visible_at = now + self.visibility_timeout.as_millis() as i64;
        let receipt = token(32);

        let row: Option<Row> = sqlx::query_as(
            "UPDATE messages SET delivery_count = delivery_count + 1, visible_at = $1, receipt_handle = $2
             WHERE id = (SELECT id FROM messages WHERE visible_at <= $3 ORDER BY id LIMIT 1)
             RETURNING message_id, body, attributes, delivery_count, enqueued_at",
        )
        .bind(visible_at)
        .bind(&receipt)
        .bind(now)
        .fetch_optional(&self.db)
        .await?;

        Ok(row.map(|row| SensorMessage {
            message_id: row.message_id,
            receipt: ReceiptHandle::new(receipt),
            body: row.body,
            attributes: row.attributes.0,
            delivery_count: row.delivery_count as u32,
            enqueued_at: DateTime::from_timestamp_millis(row.enqueued_at).unwrap_or_default(),
        }))
    }

    async fn claim(&self, max_messages: usize) -> Result<Vec<SensorMessage>, sqlx::Error> {
        let mut batch = Vec::new();
        while batch.len() < max_messages {
            match self.claim_one().await? {
                Some(message) => batch.push(message),
                None => break,
            }
        }
        Ok(batch)
    }

    /// Sets `visible_at` for the delivery held by `receipt`. Returns whether the
    /// receipt was still current.
    async fn set_visible_at(
        &self,
        receipt: &ReceiptHandle,
        delay: Duration,
        keep_receipt: bool,
    ) -> Result<bool, sqlx::Error> {
        let visible_at = Utc::now().timestamp_millis() + delay.as_millis() as i64;

        let query = if keep_receipt {
            "UPDATE messages SET visible_at = $1 WHERE receipt_handle = $2"
        } else {
            "UPDATE messages SET visible_at = $1, receipt_handle = NULL WHERE receipt_handle = $2"
        };

        let result = sqlx::query(query)
            .bind(visible_at)
            .bind(receipt.as_str())
            .execute(&self.db)
            .await?;

        Ok(result.rows_affected() > 0)
    }
}

fn token(len: usize) -> String {
    rand::thread_rng()
        .sample_iter(&Alphanumeric)
        .take(len)
        .map(char::from)
        .collect()
}

fn classify(operation: &'static str, e: sqlx::Error) -> BrokerError {
    match e {
        sqlx::Error::ColumnDecode { .. }
        | sqlx::Error::Decode(_)
        | sqlx::Error::ColumnNotFound(_)
        | sqlx::Error::TypeNotFound { .. } => BrokerError::rejected(operation, e),
        e => BrokerError::unavailable(operation, e),
    }
}

impl MessageSource for SqliteSource {
    fn receive(
        &self,
        max_messages: usize,
        wait_time: Duration,
    ) -> BoxFuture<'_, Result<Vec<SensorMessage>, BrokerError>> {
        Box::pin(async move {
            let deadline = tokio::time::Instant::now() + wait_time;
            loop {
                let batch = self
                    .claim(max_messages)
                    .await
                    .map_err(|e| classify("receive", e))?;

                if !batch.is_empty() || tokio::time::Instant::now() >= deadline {
                    return Ok(batch);
                }

                tokio::time::sleep_until(deadline.min(tokio::time::Instant::now() + POLL_INTERVAL))
                    .await;
            }
        })
    }

    fn extend_visibility<'a>(
        &'a self,
        message: &'a SensorMessage,
        duration: Duration,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let extended = self
                .set_visible_at(&message.receipt, duration, true)
                .await
                .map_err(|e| classify("extend_visibility", e))?;

            if extended {
                Ok(())
            } else {
                Err(BrokerError::rejected(
                    "extend_visibility",
                    format!("receipt handle {} is no longer in flight", message.receipt),
                ))
            }
        })
    }

    fn delete<'a>(&'a self, message: &'a SensorMessage) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let result = sqlx::query("DELETE FROM messages WHERE receipt_handle = $1")
                .bind(message.receipt.as_str())
                .execute(&self.db)
                .await
                .map_err(|e| classify("delete", e))?;

            if result.rows_affected() == 0 {
                tracing::warn!(
                    message_id = %message.message_id,
                    receipt = %message.receipt,
                    "Delete of stale or unknown receipt handle ignored"
                );
            }

            Ok(())
        })
    }

    fn dead_letter<'a>(
        &'a self,
        message: &'a SensorMessage,
        reason: &'a str,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            let operation = "dead_letter";

            let mut tx = self.db.begin().await.map_err(|e| classify(operation, e))?;

            let row: Option<Row> = sqlx::query_as(
                "DELETE FROM messages WHERE receipt_handle = $1
                 RETURNING message_id, body, attributes, delivery_count, enqueued_at",
            )
            .bind(message.receipt.as_str())
            .fetch_optional(&mut *tx)
            .await
            .map_err(|e| classify(operation, e))?;

            let Some(row) = row else {
                tracing::warn!(
                    message_id = %message.message_id,
                    receipt = %message.receipt,
                    "Dead-letter of stale or unknown receipt handle ignored"
                );
                return Ok(());
            };

            let mut attributes = row.attributes.0;
            attributes.insert(DEAD_LETTER_REASON_ATTRIBUTE.to_owned(), reason.to_owned());

            sqlx::query(
                "INSERT INTO dead_letters (message_id, body, attributes, delivery_count, reason, dead_lettered_at)
                 VALUES ($1, $2, $3, $4, $5, $6)",
            )
            .bind(&row.message_id)
            .bind(&row.body)
            .bind(Json(attributes))
            .bind(row.delivery_count)
            .bind(reason)
            .bind(Utc::now().timestamp_millis())
            .execute(&mut *tx)
            .await
            .map_err(|e| classify(operation, e))?;

            tx.commit().await.map_err(|e| classify(operation, e))?;

            Ok(())
        })
    }

    fn release<'a>(
        &'a self,
        message: &'a SensorMessage,
        delay: Duration,
    ) -> BoxFuture<'a, Result<(), BrokerError>> {
        Box::pin(async move {
            self.set_visible_at(&message.receipt, delay, false)
                .await
                .map_err(|e| classify("release", e))?;

            Ok(())
        })
    }

    fn name(&self) -> &'static str {
        "sqlite"
    }
}
