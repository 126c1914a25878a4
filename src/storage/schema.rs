//! Replica table definitions.
//!
//! Each replica mirrors a subset of the owning service's fields. The primary
//! key is the identifier assigned by the owning service, never a local one.

use serde_json::Value;

use super::FieldValue;
use crate::envelope::{whole_number, EntityKind};

/// Storage type of a replicated column.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ColumnKind {
    Text,
    Integer,
    Real,
    Bool,
}

/// A payload value does not fit its column.
#[derive(Debug, Clone, PartialEq, thiserror::Error)]
#[error("field '{column}' expects {expected:?}, got {value}")]
pub struct FieldError {
    pub column: String,
    pub expected: ColumnKind,
    pub value: String,
}

impl ColumnKind {
    /// Convert a JSON payload value into a column value.
    ///
    /// Producers are loose about types (prices as strings, flags as 0/1), so
    /// lossless cross-type conversions are accepted.
    pub fn coerce(&self, column: &str, value: &Value) -> Result<FieldValue, FieldError> {
        let converted = match (self, value) {
            (_, Value::Null) => Some(FieldValue::Null),

            (ColumnKind::Text, Value::String(s)) => Some(FieldValue::Text(s.clone())),
            (ColumnKind::Text, Value::Number(n)) => Some(FieldValue::Text(n.to_string())),
            (ColumnKind::Text, Value::Bool(b)) => Some(FieldValue::Text(b.to_string())),

            (ColumnKind::Integer, Value::Number(n)) => whole_number(n).map(FieldValue::Integer),
            (ColumnKind::Integer, Value::String(s)) => {
                s.trim().parse::<i64>().ok().map(FieldValue::Integer)
            }

            (ColumnKind::Real, Value::Number(n)) => n.as_f64().map(FieldValue::Real),
            (ColumnKind::Real, Value::String(s)) => s.trim().parse::<f64>().ok().map(FieldValue::Real),

            (ColumnKind::Bool, Value::Bool(b)) => Some(FieldValue::Bool(*b)),
            (ColumnKind::Bool, Value::Number(n)) => match n.as_i64() {
                Some(0) => Some(FieldValue::Bool(false)),
                Some(1) => Some(FieldValue::Bool(true)),
                _ => None,
            },
            (ColumnKind::Bool, Value::String(s)) => match s.trim() {
                "true" | "1" => Some(FieldValue::Bool(true)),
                "false" | "0" => Some(FieldValue::Bool(false)),
                _ => None,
            },

            _ => None,
        };

        converted.ok_or_else(|| FieldError {
            column: column.to_string(),
            expected: *self,
            value: value.to_string(),
        })
    }
}

/// One replicated column.
#[derive(Debug, Clone, PartialEq)]
pub struct Column {
    pub name: &'static str,
    pub kind: ColumnKind,
    /// Value written by `created` when the payload omits the field.
    pub default: Option<FieldValue>,
}

impl Column {
    const fn new(name: &'static str, kind: ColumnKind) -> Self {
        Self {
            name,
            kind,
            default: None,
        }
    }

    fn with_default(mut self, default: FieldValue) -> Self {
        self.default = Some(default);
        self
    }
}

/// A replica table for one foreign entity kind.
#[derive(Debug, Clone, PartialEq)]
pub struct ReplicaSchema {
    pub entity: EntityKind,
    pub table: &'static str,
    pub key_column: &'static str,
    /// Non-key columns.
    pub columns: Vec<Column>,
    pub ddl: &'static str,
}

impl ReplicaSchema {
    /// Customer replica, owned by the customers service.
    pub fn customers() -> Self {
        use ColumnKind::*;
        Self {
            entity: EntityKind::Client,
            table: "customers",
            key_column: "id",
            columns: vec![
                Column::new("username", Text),
                Column::new("name", Text),
                Column::new("first_name", Text),
                Column::new("last_name", Text),
                Column::new("postal_code", Text),
                Column::new("city", Text),
                Column::new("profile_first_name", Text),
                Column::new("profile_last_name", Text),
                Column::new("company_name", Text),
                Column::new("phone", Text),
                Column::new("email", Text),
                Column::new("actif", Bool).with_default(FieldValue::Bool(true)),
            ],
            ddl: CREATE_CUSTOMERS_TABLE,
        }
    }

    /// Product replica, owned by the products service.
    pub fn products() -> Self {
        use ColumnKind::*;
        Self {
            entity: EntityKind::Product,
            table: "products",
            key_column: "id",
            columns: vec![
                Column::new("name", Text),
                Column::new("stock", Integer),
                Column::new("price", Real),
                Column::new("description", Text),
                Column::new("color", Text).with_default(FieldValue::Text(String::new())),
            ],
            ddl: CREATE_PRODUCTS_TABLE,
        }
    }

    /// Order replica, owned by the orders service.
    pub fn orders() -> Self {
        Self {
            entity: EntityKind::Order,
            table: "orders",
            key_column: "order_id",
            columns: vec![Column::new("customer_id", ColumnKind::Integer)],
            ddl: CREATE_ORDERS_TABLE,
        }
    }

    pub fn for_entity(entity: EntityKind) -> Self {
        match entity {
            EntityKind::Client => Self::customers(),
            EntityKind::Product => Self::products(),
            EntityKind::Order => Self::orders(),
        }
    }

    pub fn column(&self, name: &str) -> Option<&Column> {
        self.columns.iter().find(|c| c.name == name)
    }
}

/// SQL for creating the customers replica table.
pub const CREATE_CUSTOMERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS customers (
    id INTEGER PRIMARY KEY NOT NULL,
    username TEXT,
    name TEXT,
    first_name TEXT,
    last_name TEXT,
    postal_code TEXT,
    city TEXT,
    profile_first_name TEXT,
    profile_last_name TEXT,
    company_name TEXT,
    phone TEXT,
    email TEXT,
    actif BOOLEAN DEFAULT 1,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

/// SQL for creating the products replica table.
pub const CREATE_PRODUCTS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS products (
    id INTEGER PRIMARY KEY NOT NULL,
    name TEXT,
    stock INTEGER,
    price REAL,
    description TEXT,
    color TEXT DEFAULT '',
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

/// SQL for creating the orders replica table.
pub const CREATE_ORDERS_TABLE: &str = r#"
CREATE TABLE IF NOT EXISTS orders (
    order_id INTEGER PRIMARY KEY NOT NULL,
    customer_id INTEGER,
    created_at TEXT NOT NULL DEFAULT CURRENT_TIMESTAMP
)
"#;

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn test_coerce_accepts_loose_producer_types() {
        assert_eq!(
            ColumnKind::Real.coerce("price", &json!("19.90")),
            Ok(FieldValue::Real(19.9))
        );
        assert_eq!(
            ColumnKind::Integer.coerce("stock", &json!(4.0)),
            Ok(FieldValue::Integer(4))
        );
        assert_eq!(
            ColumnKind::Bool.coerce("actif", &json!(0)),
            Ok(FieldValue::Bool(false))
        );
        assert_eq!(
            ColumnKind::Text.coerce("postal_code", &json!(75001)),
            Ok(FieldValue::Text("75001".to_string()))
        );
        assert_eq!(ColumnKind::Text.coerce("city", &json!(null)), Ok(FieldValue::Null));
    }

    #[test]
    fn test_coerce_rejects_mismatches() {
        assert!(ColumnKind::Integer.coerce("stock", &json!("many")).is_err());
        assert!(ColumnKind::Integer.coerce("stock", &json!(1.5)).is_err());
        assert!(ColumnKind::Integer.coerce("stock", &json!(1e20)).is_err());
        assert!(ColumnKind::Integer.coerce("stock", &json!(u64::MAX)).is_err());
        assert!(ColumnKind::Integer.coerce("stock", &json!(-1e19)).is_err());
        assert!(ColumnKind::Bool.coerce("actif", &json!(2)).is_err());
        assert!(ColumnKind::Text.coerce("name", &json!({"first": "A"})).is_err());
    }

    #[test]
    fn test_builtin_schemas_key_on_owner_identifier() {
        assert_eq!(ReplicaSchema::customers().key_column, "id");
        assert_eq!(ReplicaSchema::products().key_column, "id");
        assert_eq!(ReplicaSchema::orders().key_column, "order_id");
        for entity in EntityKind::ALL {
            let schema = ReplicaSchema::for_entity(entity);
            assert_eq!(schema.entity, entity);
            assert_eq!(schema.key_column, entity.key_field());
            assert!(schema.column(schema.key_column).is_none());
        }
    }

    #[test]
    fn test_documented_defaults() {
        let customers = ReplicaSchema::customers();
        assert_eq!(
            customers.column("actif").unwrap().default,
            Some(FieldValue::Bool(true))
        );
        let products = ReplicaSchema::products();
        assert_eq!(
            products.column("color").unwrap().default,
            Some(FieldValue::Text(String::new()))
        );
    }
}
