//! Applies change events to local replica tables.
//!
//! Delivery is at-least-once and unordered across reconnects, so every
//! operation is idempotent:
//! - `created` inserts, or leaves an existing row untouched
//! - `updated` overwrites only the fields present, or no-ops for unknown keys
//! - `deleted` removes the row, or no-ops for unknown keys

use std::sync::Arc;

use async_trait::async_trait;
use serde_json::{Map, Value};
use tracing::{debug, info, warn};

use crate::envelope::{Action, EntityKind, KeyError};
use crate::storage::{
    FieldError, FieldValue, Record, ReplicaSchema, ReplicaStore, ReplicaTx, StorageError,
};

/// Errors that make a message unprocessable. The subscriber rejects the
/// message without requeue.
#[derive(Debug, thiserror::Error)]
pub enum ApplyError {
    #[error(transparent)]
    Key(#[from] KeyError),

    #[error("Invalid field: {0}")]
    InvalidField(#[from] FieldError),

    #[error("Storage error: {0}")]
    Store(#[from] StorageError),
}

/// What applying one event did to the replica.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ApplyOutcome {
    Inserted,
    /// `created` for a key that already exists.
    AlreadyPresent,
    Updated,
    Deleted,
    /// `updated` or `deleted` for a key never seen (or already deleted).
    NotFound,
}

/// Applies events for one entity kind.
#[async_trait]
pub trait ReplicaHandler: Send + Sync {
    fn entity(&self) -> EntityKind;

    async fn apply(
        &self,
        action: Action,
        data: &Map<String, Value>,
    ) -> Result<ApplyOutcome, ApplyError>;
}

/// Replica handler backed by a `ReplicaStore`.
pub struct ReplicaApplier {
    schema: ReplicaSchema,
    store: Arc<dyn ReplicaStore>,
}

impl ReplicaApplier {
    pub fn new(schema: ReplicaSchema, store: Arc<dyn ReplicaStore>) -> Self {
        Self { schema, store }
    }

    pub fn schema(&self) -> &ReplicaSchema {
        &self.schema
    }

    /// Full row for `created`: payload fields, then column defaults.
    fn record_for_insert(&self, data: &Map<String, Value>) -> Result<Record, FieldError> {
        let mut record = Record::new();
        for column in &self.schema.columns {
            let value = match data.get(column.name) {
                Some(value) => column.kind.coerce(column.name, value)?,
                None => column.default.clone().unwrap_or(FieldValue::Null),
            };
            record.insert(column.name.to_string(), value);
        }
        Ok(record)
    }

    /// Only the known columns present in the payload.
    fn record_for_update(&self, data: &Map<String, Value>) -> Result<Record, FieldError> {
        let mut record = Record::new();
        for column in &self.schema.columns {
            if let Some(value) = data.get(column.name) {
                record.insert(column.name.to_string(), column.kind.coerce(column.name, value)?);
            }
        }
        Ok(record)
    }

    async fn apply_in(
        &self,
        tx: &mut dyn ReplicaTx,
        action: Action,
        key: i64,
        data: &Map<String, Value>,
    ) -> Result<ApplyOutcome, ApplyError> {
        let entity = self.schema.entity;

        match action {
            Action::Created => {
                let record = self.record_for_insert(data)?;
                if tx.insert_or_ignore(&self.schema, key, &record).await? {
                    info!(entity = %entity, key = key, "Replica created");
                    Ok(ApplyOutcome::Inserted)
                } else {
                    debug!(entity = %entity, key = key, "Replica already present, ignoring create");
                    Ok(ApplyOutcome::AlreadyPresent)
                }
            }
            Action::Updated => {
                let fields = self.record_for_update(data)?;
                if tx.update_fields(&self.schema, key, &fields).await? {
                    info!(entity = %entity, key = key, fields = fields.len(), "Replica updated");
                    Ok(ApplyOutcome::Updated)
                } else {
                    warn!(entity = %entity, key = key, "Replica not found for update");
                    Ok(ApplyOutcome::NotFound)
                }
            }
            Action::Deleted => {
                if tx.delete(&self.schema, key).await? {
                    info!(entity = %entity, key = key, "Replica deleted");
                    Ok(ApplyOutcome::Deleted)
                } else {
                    warn!(entity = %entity, key = key, "Replica not found for delete");
                    Ok(ApplyOutcome::NotFound)
                }
            }
        }
    }
}

#[async_trait]
impl ReplicaHandler for ReplicaApplier {
    fn entity(&self) -> EntityKind {
        self.schema.entity
    }

    async fn apply(
        &self,
        action: Action,
        data: &Map<String, Value>,
    ) -> Result<ApplyOutcome, ApplyError> {
        let key = self.schema.entity.primary_key(data)?;

        let mut tx = self.store.begin().await?;
        match self.apply_in(tx.as_mut(), action, key, data).await {
            Ok(outcome) => {
                tx.commit().await?;
                Ok(outcome)
            }
            Err(e) => {
                if let Err(rollback) = tx.rollback().await {
                    warn!(error = %rollback, "Rollback failed");
                }
                Err(e)
            }
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::StorageConfig;
    use crate::storage::{open_pool, SqliteReplicaStore};
    use serde_json::json;

    async fn applier(schema: ReplicaSchema) -> (ReplicaApplier, SqliteReplicaStore) {
        let pool = open_pool(&StorageConfig::in_memory()).await.unwrap();
        let store = SqliteReplicaStore::new(pool);
        store.init(&[schema.clone()]).await.unwrap();
        (ReplicaApplier::new(schema, Arc::new(store.clone())), store)
    }

    fn data(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {}", other),
        }
    }

    async fn read(store: &SqliteReplicaStore, schema: &ReplicaSchema, key: i64) -> Option<Record> {
        let mut tx = store.begin().await.unwrap();
        tx.find(schema, key).await.unwrap()
    }

    #[tokio::test]
    async fn test_created_applies_defaults() {
        let (applier, store) = applier(ReplicaSchema::customers()).await;

        let outcome = applier
            .apply(Action::Created, &data(json!({"id": 1, "email": "a@example.com"})))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Inserted);

        let row = read(&store, applier.schema(), 1).await.unwrap();
        assert_eq!(row["actif"], FieldValue::Bool(true));
        assert_eq!(row["email"], FieldValue::Text("a@example.com".to_string()));
        assert_eq!(row["city"], FieldValue::Null);
    }

    #[tokio::test]
    async fn test_duplicate_created_is_ignored() {
        let (applier, store) = applier(ReplicaSchema::products()).await;
        let event = data(json!({"id": 7, "name": "A", "price": 3.5}));

        assert_eq!(
            applier.apply(Action::Created, &event).await.unwrap(),
            ApplyOutcome::Inserted
        );
        assert_eq!(
            applier.apply(Action::Created, &event).await.unwrap(),
            ApplyOutcome::AlreadyPresent
        );

        let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM products WHERE id = 7")
            .fetch_one(store.pool())
            .await
            .unwrap();
        assert_eq!(count, 1);
    }

    #[tokio::test]
    async fn test_update_for_unknown_key_is_noop() {
        let (applier, store) = applier(ReplicaSchema::products()).await;

        let outcome = applier
            .apply(Action::Updated, &data(json!({"id": 42, "name": "B"})))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::NotFound);
        assert!(read(&store, applier.schema(), 42).await.is_none());
    }

    #[tokio::test]
    async fn test_update_and_delete_accept_legacy_key_names() {
        let (applier, store) = applier(ReplicaSchema::products()).await;
        applier
            .apply(Action::Created, &data(json!({"product_id": 4, "name": "Lamp", "stock": 2})))
            .await
            .unwrap();

        let outcome = applier
            .apply(Action::Updated, &data(json!({"product_id": "4", "stock": 9})))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Updated);
        let row = read(&store, applier.schema(), 4).await.unwrap();
        assert_eq!(row["stock"], FieldValue::Integer(9));
        assert_eq!(row["name"], FieldValue::Text("Lamp".to_string()));

        let outcome = applier
            .apply(Action::Deleted, &data(json!({"product_id": 4})))
            .await
            .unwrap();
        assert_eq!(outcome, ApplyOutcome::Deleted);
        assert!(read(&store, applier.schema(), 4).await.is_none());
    }

    #[tokio::test]
    async fn test_delete_twice_is_noop() {
        let (applier, _store) = applier(ReplicaSchema::orders()).await;
        applier
            .apply(Action::Created, &data(json!({"order_id": 1, "customer_id": 3})))
            .await
            .unwrap();

        let deleted = data(json!({"order_id": 1}));
        assert_eq!(
            applier.apply(Action::Deleted, &deleted).await.unwrap(),
            ApplyOutcome::Deleted
        );
        assert_eq!(
            applier.apply(Action::Deleted, &deleted).await.unwrap(),
            ApplyOutcome::NotFound
        );
    }

    #[tokio::test]
    async fn test_missing_key_is_an_error() {
        let (applier, _store) = applier(ReplicaSchema::customers()).await;
        let result = applier
            .apply(Action::Created, &data(json!({"email": "nokey@example.com"})))
            .await;
        assert!(matches!(result, Err(ApplyError::Key(KeyError::Missing { .. }))));
    }

    #[tokio::test]
    async fn test_invalid_field_rolls_back() {
        let (applier, store) = applier(ReplicaSchema::products()).await;
        let result = applier
            .apply(Action::Created, &data(json!({"id": 8, "stock": "lots"})))
            .await;
        assert!(matches!(result, Err(ApplyError::InvalidField(_))));
        assert!(read(&store, applier.schema(), 8).await.is_none());
    }
}
