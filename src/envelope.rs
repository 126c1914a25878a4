//! Change-notification envelope and routing keys.
//!
//! Every message on the broker is a UTF-8 JSON document of the form
//! `{"event": "<entity>.<action>", "data": {...}}`. The `event` field doubles
//! as the AMQP routing key.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use serde_json::{Map, Number, Value};

/// Entity kinds exchanged between services.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum EntityKind {
    Client,
    Product,
    Order,
}

impl EntityKind {
    pub const ALL: [EntityKind; 3] = [EntityKind::Client, EntityKind::Product, EntityKind::Order];

    pub fn as_str(&self) -> &'static str {
        match self {
            EntityKind::Client => "client",
            EntityKind::Product => "product",
            EntityKind::Order => "order",
        }
    }

    /// Canonical name of the primary-key field in event payloads.
    pub fn key_field(&self) -> &'static str {
        match self {
            EntityKind::Client | EntityKind::Product => "id",
            EntityKind::Order => "order_id",
        }
    }

    /// Legacy key name some producers still emit. Read-side only.
    pub fn key_alias(&self) -> &'static str {
        match self {
            EntityKind::Client => "client_id",
            EntityKind::Product => "product_id",
            EntityKind::Order => "id",
        }
    }

    /// Routing pattern matching every action on this entity (`client.*`).
    pub fn binding_pattern(&self) -> String {
        format!("{}.*", self.as_str())
    }

    /// Resolve the primary key from an event payload.
    ///
    /// The canonical field wins over the alias when both are present.
    /// Integers and numeric strings are accepted.
    pub fn primary_key(&self, data: &Map<String, Value>) -> Result<i64, KeyError> {
        let (field, value) = [self.key_field(), self.key_alias()]
            .into_iter()
            .find_map(|field| match data.get(field) {
                Some(Value::Null) | None => None,
                Some(value) => Some((field, value)),
            })
            .ok_or(KeyError::Missing { entity: *self })?;

        let parsed = match value {
            Value::Number(n) => whole_number(n),
            Value::String(s) => s.trim().parse::<i64>().ok(),
            _ => None,
        };

        parsed.ok_or_else(|| KeyError::Invalid {
            field: field.to_string(),
            value: value.to_string(),
        })
    }
}

/// A JSON number as `i64` when it is whole and in range.
///
/// Floats like `7.0` are accepted; fractions and anything outside the `i64`
/// range are not.
pub fn whole_number(n: &Number) -> Option<i64> {
    n.as_i64().or_else(|| {
        n.as_f64()
            .filter(|f| f.fract() == 0.0 && *f >= i64::MIN as f64 && *f < i64::MAX as f64)
            .map(|f| f as i64)
    })
}

impl fmt::Display for EntityKind {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for EntityKind {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "client" => Ok(EntityKind::Client),
            "product" => Ok(EntityKind::Product),
            "order" => Ok(EntityKind::Order),
            other => Err(format!("unknown entity: {}", other)),
        }
    }
}

/// Change applied to an entity.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum Action {
    Created,
    Updated,
    Deleted,
}

impl Action {
    pub fn as_str(&self) -> &'static str {
        match self {
            Action::Created => "created",
            Action::Updated => "updated",
            Action::Deleted => "deleted",
        }
    }
}

impl fmt::Display for Action {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

impl FromStr for Action {
    type Err = String;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        match s {
            "created" => Ok(Action::Created),
            "updated" => Ok(Action::Updated),
            "deleted" => Ok(Action::Deleted),
            other => Err(format!("unknown action: {}", other)),
        }
    }
}

/// A well-formed `<entity>.<action>` routing key.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct RoutingKey {
    pub entity: EntityKind,
    pub action: Action,
}

/// Result of parsing an arbitrary routing key string.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum ParsedKey {
    Known(RoutingKey),
    /// Entity prefix matched, suffix did not.
    UnknownAction { entity: EntityKind, action: String },
    UnknownEntity(String),
}

impl RoutingKey {
    pub fn new(entity: EntityKind, action: Action) -> Self {
        Self { entity, action }
    }

    pub fn parse(key: &str) -> ParsedKey {
        let Some((prefix, suffix)) = key.split_once('.') else {
            return ParsedKey::UnknownEntity(key.to_string());
        };

        let Ok(entity) = prefix.parse::<EntityKind>() else {
            return ParsedKey::UnknownEntity(prefix.to_string());
        };

        match suffix.parse::<Action>() {
            Ok(action) => ParsedKey::Known(RoutingKey { entity, action }),
            Err(_) => ParsedKey::UnknownAction {
                entity,
                action: suffix.to_string(),
            },
        }
    }
}

impl fmt::Display for RoutingKey {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}.{}", self.entity, self.action)
    }
}

/// Primary key could not be resolved from a payload.
#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
pub enum KeyError {
    #[error("{entity} event carries no primary key")]
    Missing { entity: EntityKind },

    #[error("primary key field '{field}' is not an integer: {value}")]
    Invalid { field: String, value: String },
}

/// Envelope decode failure.
#[derive(Debug, thiserror::Error)]
#[error("malformed envelope: {0}")]
pub struct DecodeError(#[from] serde_json::Error);

/// Wire model for a single change notification.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventEnvelope {
    /// Routing key, `<entity>.<action>`.
    pub event: String,
    /// Entity field set at the time of the change.
    pub data: Map<String, Value>,
}

impl EventEnvelope {
    pub fn new(key: RoutingKey, data: Map<String, Value>) -> Self {
        Self {
            event: key.to_string(),
            data,
        }
    }

    /// Deletion notice carrying only the canonical primary key.
    pub fn deleted(entity: EntityKind, id: i64) -> Self {
        let mut data = Map::new();
        data.insert(entity.key_field().to_string(), Value::from(id));
        Self::new(RoutingKey::new(entity, Action::Deleted), data)
    }

    pub fn routing_key(&self) -> ParsedKey {
        RoutingKey::parse(&self.event)
    }

    pub fn to_bytes(&self) -> Result<Vec<u8>, serde_json::Error> {
        serde_json::to_vec(self)
    }

    pub fn from_slice(body: &[u8]) -> Result<Self, DecodeError> {
        Ok(serde_json::from_slice(body)?)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            other => panic!("expected object, got {}", other),
        }
    }

    #[test]
    fn test_parse_known_key() {
        assert_eq!(
            RoutingKey::parse("client.updated"),
            ParsedKey::Known(RoutingKey::new(EntityKind::Client, Action::Updated))
        );
        assert_eq!(
            RoutingKey::new(EntityKind::Product, Action::Deleted).to_string(),
            "product.deleted"
        );
    }

    #[test]
    fn test_parse_unknown_parts() {
        assert_eq!(
            RoutingKey::parse("order.shipped"),
            ParsedKey::UnknownAction {
                entity: EntityKind::Order,
                action: "shipped".to_string()
            }
        );
        assert_eq!(
            RoutingKey::parse("invoice.created"),
            ParsedKey::UnknownEntity("invoice".to_string())
        );
        // Underscore-separated keys never match an entity prefix.
        assert_eq!(
            RoutingKey::parse("order_created"),
            ParsedKey::UnknownEntity("order_created".to_string())
        );
    }

    #[test]
    fn test_primary_key_prefers_canonical_field() {
        let data = object(json!({"id": 7, "client_id": 9}));
        assert_eq!(EntityKind::Client.primary_key(&data), Ok(7));

        let data = object(json!({"client_id": "9"}));
        assert_eq!(EntityKind::Client.primary_key(&data), Ok(9));

        let data = object(json!({"id": 3}));
        assert_eq!(EntityKind::Order.primary_key(&data), Ok(3));
    }

    #[test]
    fn test_primary_key_errors() {
        let data = object(json!({"name": "A"}));
        assert_eq!(
            EntityKind::Product.primary_key(&data),
            Err(KeyError::Missing {
                entity: EntityKind::Product
            })
        );

        for bad in [json!("abc"), json!(7.5), json!(1e20), json!(u64::MAX)] {
            let data = object(json!({"id": bad}));
            assert!(matches!(
                EntityKind::Product.primary_key(&data),
                Err(KeyError::Invalid { .. })
            ));
        }
    }

    #[test]
    fn test_primary_key_accepts_whole_floats() {
        let data = object(json!({"order_id": 7.0}));
        assert_eq!(EntityKind::Order.primary_key(&data), Ok(7));
        assert_eq!(whole_number(&Number::from(-3)), Some(-3));
    }

    #[test]
    fn test_envelope_wire_shape() {
        let envelope = EventEnvelope::deleted(EntityKind::Order, 12);
        let wire: Value = serde_json::from_slice(&envelope.to_bytes().unwrap()).unwrap();
        assert_eq!(wire, json!({"event": "order.deleted", "data": {"order_id": 12}}));
    }

    #[test]
    fn test_from_slice_rejects_malformed_bodies() {
        assert!(EventEnvelope::from_slice(b"not json").is_err());
        assert!(EventEnvelope::from_slice(br#"{"event": "client.created"}"#).is_err());
        assert!(EventEnvelope::from_slice(br#"{"event": 1, "data": {}}"#).is_err());
        assert!(EventEnvelope::from_slice(br#"{"event": "client.created", "data": []}"#).is_err());
    }
}
