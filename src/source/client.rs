use async_trait::async_trait;
use bson::{doc, Bson, Document};
use chrono::{DateTime, TimeZone, Utc};
use futures::StreamExt;
use mongodb::options::{ClientOptions, FindOneOptions, FindOptions};
use mongodb::{Client, Collection};
use std::time::Duration;

use super::timestamp::{objectid_after, parse_timestamp};
use super::{DocumentStream, SourceAdapter, SourceError, SourceResult};
use crate::config::MongoConfig;

/// Production source adapter over the official MongoDB driver
pub struct MongoSource {
    client: Client,
    database: String,
    timeout: Duration,
}

impl MongoSource {
    /// Connect and verify the source with a ping.
    pub async fn connect(cfg: &MongoConfig) -> SourceResult<Self> {
        let mut options = ClientOptions::parse(cfg.connection_uri())
            .await
            .map_err(|e| SourceError::Unavailable(format!("invalid connection URI: {}", e)))?;

        let timeout = Duration::from_secs(cfg.timeout);
        options.connect_timeout = Some(timeout);
        options.server_selection_timeout = Some(timeout);

        let client = Client::with_options(options)
            .map_err(|e| SourceError::Unavailable(format!("failed to build client: {}", e)))?;

        client
            .database(&cfg.database)
            .run_command(doc! { "ping": 1 }, None)
            .await
            .map_err(|e| SourceError::Unavailable(format!("ping failed: {}", e)))?;

        tracing::info!(database = %cfg.database, "Connected to source database");

        Ok(Self {
            client,
            database: cfg.database.clone(),
            timeout,
        })
    }

    fn collection(&self, name: &str) -> Collection<Document> {
        self.client.database(&self.database).collection(name)
    }

    /// Bound a driver call by the configured operation timeout.
    async fn bounded<T, F>(&self, operation: &str, future: F) -> SourceResult<T>
    where
        F: std::future::Future<Output = std::result::Result<T, mongodb::error::Error>>,
    {
        match tokio::time::timeout(self.timeout, future).await {
            Ok(result) => result.map_err(SourceError::from),
            Err(_) => Err(SourceError::QueryFailed(format!(
                "{} timed out after {:?}",
                operation, self.timeout
            ))),
        }
    }

    fn boxed_stream(cursor: mongodb::Cursor<Document>) -> DocumentStream {
        Box::pin(cursor.map(|item| item.map_err(SourceError::from)))
    }
}

#[async_trait]
impl SourceAdapter for MongoSource {
    async fn find_all(&self, collection: &str, limit: Option<i64>) -> SourceResult<DocumentStream> {
        let options = FindOptions::builder()
            .batch_size(1000u32)
            .no_cursor_timeout(true)
            .limit(limit)
            .build();

        let cursor = self
            .bounded("find_all", self.collection(collection).find(doc! {}, options))
            .await?;
        Ok(Self::boxed_stream(cursor))
    }

    async fn find_since(
        &self,
        collection: &str,
        timestamp_field: &str,
        since: DateTime<Utc>,
        limit: Option<i64>,
    ) -> SourceResult<DocumentStream> {
        let (filter, sort_field) = if timestamp_field.is_empty() || timestamp_field == "_id" {
            let boundary = objectid_after(since);
            (doc! { "_id": { "$gt": boundary } }, "_id")
        } else {
            (
                doc! { timestamp_field: { "$gt": bson::DateTime::from_chrono(since) } },
                timestamp_field,
            )
        };

        let options = FindOptions::builder()
            .sort(doc! { sort_field: 1 })
            .batch_size(500u32)
            .no_cursor_timeout(true)
            .limit(limit)
            .build();

        let cursor = self
            .bounded("find_since", self.collection(collection).find(filter, options))
            .await?;
        Ok(Self::boxed_stream(cursor))
    }

    async fn max_timestamp(
        &self,
        collection: &str,
        timestamp_field: &str,
    ) -> SourceResult<DateTime<Utc>> {
        let sort_field = if timestamp_field.is_empty() || timestamp_field == "_id" {
            "_id"
        } else {
            timestamp_field
        };

        let options = FindOneOptions::builder()
            .sort(doc! { sort_field: -1 })
            .build();

        let newest = self
            .bounded(
                "max_timestamp",
                self.collection(collection).find_one(doc! {}, options),
            )
            .await?;

        let Some(newest) = newest else {
            return Ok(Utc.timestamp_opt(0, 0).single().unwrap_or_default());
        };

        if sort_field == "_id" {
            match newest.get("_id") {
                Some(Bson::ObjectId(oid)) => Ok(oid.timestamp().to_chrono()),
                Some(other) => Err(SourceError::UnsupportedTimestamp(format!(
                    "_id is not an intrinsic identifier: {:?}",
                    other.element_type()
                ))),
                None => Err(SourceError::MissingField("_id".to_string())),
            }
        } else {
            let value = newest
                .get(sort_field)
                .ok_or_else(|| SourceError::MissingField(sort_field.to_string()))?;
            parse_timestamp(value)
        }
    }

    async fn count(&self, collection: &str) -> SourceResult<u64> {
        let count = self
            .bounded(
                "count",
                self.collection(collection).count_documents(doc! {}, None),
            )
            .await?;
        Ok(count)
    }

    async fn has_field(&self, collection: &str, field: &str) -> SourceResult<bool> {
        if field.is_empty() || field == "_id" {
            return Ok(true);
        }

        let count = self
            .bounded(
                "has_field",
                self.collection(collection)
                    .count_documents(doc! { field: { "$exists": true } }, None),
            )
            .await?;
        Ok(count > 0)
    }

    async fn backfill_field(&self, collection: &str, field: &str) -> SourceResult<u64> {
        if field.is_empty() || field == "_id" {
            return Ok(0);
        }

        let result = self
            .bounded(
                "backfill_field",
                self.collection(collection).update_many(
                    doc! { field: { "$exists": false } },
                    doc! { "$set": { field: bson::DateTime::now() } },
                    None,
                ),
            )
            .await?;

        if result.modified_count > 0 {
            tracing::info!(
                collection = collection,
                field = field,
                documents = result.modified_count,
                "Backfilled timestamp field"
            );
        }

        Ok(result.modified_count)
    }
}
