//! SQLite ReplicaStore implementation.

use async_trait::async_trait;
use sea_query::{Alias, Expr, OnConflict, Query, SimpleExpr, SqliteQueryBuilder, Value};
use sqlx::sqlite::SqliteRow;
use sqlx::{Row, Sqlite, SqlitePool, Transaction};
use tracing::debug;

use crate::storage::{
    ColumnKind, FieldValue, Record, ReplicaSchema, ReplicaStore, ReplicaTx, Result, StorageError,
};

/// SQLite implementation of ReplicaStore.
#[derive(Clone)]
pub struct SqliteReplicaStore {
    pool: SqlitePool,
}

impl SqliteReplicaStore {
    /// Create a new SQLite replica store.
    pub fn new(pool: SqlitePool) -> Self {
        Self { pool }
    }

    /// Create the replica tables if they do not exist.
    pub async fn init(&self, schemas: &[ReplicaSchema]) -> Result<()> {
        for schema in schemas {
            sqlx::query(schema.ddl).execute(&self.pool).await?;
            debug!(table = %schema.table, "Replica table ready");
        }
        Ok(())
    }

    pub fn pool(&self) -> &SqlitePool {
        &self.pool
    }
}

#[async_trait]
impl ReplicaStore for SqliteReplicaStore {
    async fn begin(&self) -> Result<Box<dyn ReplicaTx>> {
        let tx = self.pool.begin().await?;
        Ok(Box::new(SqliteReplicaTx { tx }))
    }
}

/// Transaction over the replica tables.
pub struct SqliteReplicaTx {
    tx: Transaction<'static, Sqlite>,
}

fn sea_value(value: &FieldValue, kind: ColumnKind) -> Value {
    match (value, kind) {
        (FieldValue::Text(s), _) => s.clone().into(),
        (FieldValue::Integer(i), _) => (*i).into(),
        (FieldValue::Real(f), _) => (*f).into(),
        (FieldValue::Bool(b), _) => (*b).into(),
        (FieldValue::Null, ColumnKind::Text) => Option::<String>::None.into(),
        (FieldValue::Null, ColumnKind::Integer) => Option::<i64>::None.into(),
        (FieldValue::Null, ColumnKind::Real) => Option::<f64>::None.into(),
        (FieldValue::Null, ColumnKind::Bool) => Option::<bool>::None.into(),
    }
}

fn read_column(row: &SqliteRow, name: &str, kind: ColumnKind) -> Result<FieldValue> {
    let value = match kind {
        ColumnKind::Text => row.try_get::<Option<String>, _>(name)?.map(FieldValue::Text),
        ColumnKind::Integer => row.try_get::<Option<i64>, _>(name)?.map(FieldValue::Integer),
        ColumnKind::Real => row.try_get::<Option<f64>, _>(name)?.map(FieldValue::Real),
        ColumnKind::Bool => row.try_get::<Option<bool>, _>(name)?.map(FieldValue::Bool),
    };
    Ok(value.unwrap_or(FieldValue::Null))
}

/// Known, non-key columns of `record` paired with their SQL values.
fn assignments(schema: &ReplicaSchema, record: &Record) -> Vec<(Alias, SimpleExpr)> {
    schema
        .columns
        .iter()
        .filter_map(|column| {
            record
                .get(column.name)
                .map(|value| (Alias::new(column.name), sea_value(value, column.kind).into()))
        })
        .collect()
}

#[async_trait]
impl ReplicaTx for SqliteReplicaTx {
    async fn insert_or_ignore(
        &mut self,
        schema: &ReplicaSchema,
        key: i64,
        record: &Record,
    ) -> Result<bool> {
        let query = {
            let (columns, values): (Vec<Alias>, Vec<SimpleExpr>) =
                std::iter::once((Alias::new(schema.key_column), SimpleExpr::from(key)))
                    .chain(assignments(schema, record))
                    .unzip();

            Query::insert()
                .into_table(Alias::new(schema.table))
                .columns(columns)
                .values(values)
                .map_err(|e| StorageError::Query(e.to_string()))?
                .on_conflict(
                    OnConflict::column(Alias::new(schema.key_column))
                        .do_nothing()
                        .to_owned(),
                )
                .to_string(SqliteQueryBuilder)
        };

        let result = sqlx::query(&query).execute(&mut *self.tx).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn find(&mut self, schema: &ReplicaSchema, key: i64) -> Result<Option<Record>> {
        let query = {
            let mut select = Query::select();
            select.column(Alias::new(schema.key_column));
            for column in &schema.columns {
                select.column(Alias::new(column.name));
            }
            select
                .from(Alias::new(schema.table))
                .and_where(Expr::col(Alias::new(schema.key_column)).eq(key))
                .to_string(SqliteQueryBuilder)
        };

        let Some(row) = sqlx::query(&query).fetch_optional(&mut *self.tx).await? else {
            return Ok(None);
        };

        let mut record = Record::new();
        record.insert(
            schema.key_column.to_string(),
            read_column(&row, schema.key_column, ColumnKind::Integer)?,
        );
        for column in &schema.columns {
            record.insert(
                column.name.to_string(),
                read_column(&row, column.name, column.kind)?,
            );
        }
        Ok(Some(record))
    }

    async fn update_fields(
        &mut self,
        schema: &ReplicaSchema,
        key: i64,
        fields: &Record,
    ) -> Result<bool> {
        if schema.columns.iter().all(|c| !fields.contains_key(c.name)) {
            return Ok(self.find(schema, key).await?.is_some());
        }

        let query = Query::update()
            .table(Alias::new(schema.table))
            .values(assignments(schema, fields))
            .and_where(Expr::col(Alias::new(schema.key_column)).eq(key))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *self.tx).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn delete(&mut self, schema: &ReplicaSchema, key: i64) -> Result<bool> {
        let query = Query::delete()
            .from_table(Alias::new(schema.table))
            .and_where(Expr::col(Alias::new(schema.key_column)).eq(key))
            .to_string(SqliteQueryBuilder);

        let result = sqlx::query(&query).execute(&mut *self.tx).await?;
        Ok(result.rows_affected() > 0)
    }

    async fn commit(self: Box<Self>) -> Result<()> {
        self.tx.commit().await?;
        Ok(())
    }

    async fn rollback(self: Box<Self>) -> Result<()> {
        self.tx.rollback().await?;
        Ok(())
    }
}
