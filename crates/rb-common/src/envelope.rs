//! Event envelope: the canonical wrapper every message on the bus carries.
//!
//! The idempotency key is a pure function of `(event_type, payload)`: volatile
//! keys are stripped and object keys sorted at every depth before hashing, so
//! two publishes of the same logical event always produce the same key.

use chrono::{DateTime, Utc};
use serde::{Deserialize, Serialize};
use serde_json::Value;
use sha2::{Digest, Sha256};
use thiserror::Error;
use tracing::warn;
use uuid::Uuid;

/// Envelope schema version stamped on every publish
pub const ENVELOPE_VERSION: &str = "1.0";

/// Fields that must be present on every received envelope
pub const REQUIRED_FIELDS: &[&str] = &[
    "event_type",
    "service",
    "payload",
    "idempotency_key",
    "trace_id",
    "timestamp",
    "version",
];

/// Keys excluded from the canonical payload at every nesting depth
const VOLATILE_KEYS: &[&str] = &[
    "timestamp",
    "created_at",
    "updated_at",
    "deleted_at",
    "trace_id",
];

#[derive(Debug, Error)]
pub enum EnvelopeError {
    #[error("message body is not valid JSON: {0}")]
    Malformed(#[from] serde_json::Error),

    #[error("envelope is missing required field: {0}")]
    MissingField(&'static str),

    #[error("envelope is not a JSON object")]
    NotAnObject,
}

#[derive(Debug, Clone, Serialize, Deserialize)]
pub struct Envelope {
    pub event_type: String,
    pub service: String,
    pub payload: Value,
    /// 64-char lowercase hex SHA-256 over `event_type + "|" + canonical(payload)`
    pub idempotency_key: String,
    pub trace_id: String,
    pub timestamp: DateTime<Utc>,
    pub version: String,
}

impl Envelope {
    /// Wrap a payload, filling all envelope fields.
    pub fn wrap(event_type: &str, payload: Value, service: &str) -> Self {
        let idempotency_key = idempotency_key(event_type, &payload);
        Self {
            event_type: event_type.to_string(),
            service: service.to_string(),
            payload,
            idempotency_key,
            trace_id: Uuid::new_v4().to_string(),
            timestamp: Utc::now(),
            version: ENVELOPE_VERSION.to_string(),
        }
    }

    /// Return the payload, consuming the envelope.
    pub fn unwrap(self) -> Value {
        self.payload
    }

    pub fn event_type(&self) -> &str {
        &self.event_type
    }

    pub fn trace_id(&self) -> &str {
        &self.trace_id
    }

    /// Check a decoded body for envelope shape: all required fields present,
    /// `event_type` and `service` non-empty. Logs the first problem found.
    pub fn validate(value: &Value) -> bool {
        let Some(map) = value.as_object() else {
            warn!("envelope body is not a JSON object");
            return false;
        };

        for field in REQUIRED_FIELDS {
            if !map.contains_key(*field) {
                warn!(field = *field, "envelope missing required field");
                return false;
            }
        }

        for field in ["event_type", "service"] {
            match map.get(field).and_then(Value::as_str) {
                Some(s) if !s.is_empty() => {}
                _ => {
                    warn!(field = field, "envelope field must be a non-empty string");
                    return false;
                }
            }
        }

        true
    }

    /// Decode a validated body into an envelope.
    pub fn from_value(value: Value) -> Result<Self, EnvelopeError> {
        Ok(serde_json::from_value(value)?)
    }

    /// Parse a raw wire body: JSON decode, shape validation, field decode.
    pub fn from_body(body: &str) -> Result<Self, EnvelopeError> {
        let value: Value = serde_json::from_str(body)?;
        if !Self::validate(&value) {
            let missing = value.as_object().map(|map| {
                REQUIRED_FIELDS
                    .iter()
                    .copied()
                    .find(|f| !map.contains_key(*f))
            });
            return match missing {
                None => Err(EnvelopeError::NotAnObject),
                Some(Some(field)) => Err(EnvelopeError::MissingField(field)),
                // present but empty event_type/service
                Some(None) => Err(EnvelopeError::MissingField("event_type")),
            };
        }
        Self::from_value(value)
    }
}

/// Compute the deterministic idempotency key for an event.
pub fn idempotency_key(event_type: &str, payload: &Value) -> String {
    let mut hasher = Sha256::new();
    hasher.update(event_type.as_bytes());
    hasher.update(b"|");
    hasher.update(canonical_payload(payload).as_bytes());
    hex::encode(hasher.finalize())
}

/// Serialize a payload into its canonical form: volatile keys removed and
/// object keys sorted lexicographically at every depth, arrays in order,
/// compact separators.
pub fn canonical_payload(payload: &Value) -> String {
    let mut out = String::new();
    write_canonical(payload, &mut out);
    out
}

fn write_canonical(value: &Value, out: &mut String) {
    match value {
        Value::Object(map) => {
            out.push('{');
            let mut keys: Vec<&String> = map
                .keys()
                .filter(|k| !VOLATILE_KEYS.contains(&k.as_str()))
                .collect();
            keys.sort();
            for (i, key) in keys.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                // Display on a JSON string value handles quoting and escapes
                out.push_str(&Value::String((*key).clone()).to_string());
                out.push(':');
                write_canonical(&map[key.as_str()], out);
            }
            out.push('}');
        }
        Value::Array(items) => {
            out.push('[');
            for (i, item) in items.iter().enumerate() {
                if i > 0 {
                    out.push(',');
                }
                write_canonical(item, out);
            }
            out.push(']');
        }
        scalar => out.push_str(&scalar.to_string()),
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    #[test]
    fn wrap_fills_all_fields() {
        let env = Envelope::wrap("payment.paid", json!({"amount": 500}), "payment");

        assert_eq!(env.event_type, "payment.paid");
        assert_eq!(env.service, "payment");
        assert_eq!(env.version, ENVELOPE_VERSION);
        assert_eq!(env.idempotency_key.len(), 64);
        assert!(Uuid::parse_str(&env.trace_id).is_ok());
    }

    #[test]
    fn wrap_then_validate_holds() {
        let env = Envelope::wrap("payment.paid", json!({"amount": 500}), "payment");
        let value = serde_json::to_value(&env).unwrap();
        assert!(Envelope::validate(&value));
    }

    #[test]
    fn unwrap_returns_payload_structurally() {
        let payload = json!({"student_id": 42, "nested": {"a": [1, 2, 3]}});
        let env = Envelope::wrap("enrollment.created", payload.clone(), "admission");
        assert_eq!(env.unwrap(), payload);
    }

    #[test]
    fn canonical_sorts_keys_at_every_depth() {
        let payload = json!({"b": {"z": 1, "a": 2}, "a": 3});
        assert_eq!(canonical_payload(&payload), r#"{"a":3,"b":{"a":2,"z":1}}"#);
    }

    #[test]
    fn canonical_strips_volatile_keys_at_every_depth() {
        let payload = json!({
            "amount": 500,
            "timestamp": "2024-01-01T00:00:00Z",
            "meta": {"trace_id": "x", "created_at": "y", "kept": true}
        });
        assert_eq!(
            canonical_payload(&payload),
            r#"{"amount":500,"meta":{"kept":true}}"#
        );
    }

    #[test]
    fn canonical_keeps_array_order() {
        let payload = json!({"items": [3, 1, 2]});
        assert_eq!(canonical_payload(&payload), r#"{"items":[3,1,2]}"#);
    }

    #[test]
    fn key_is_invariant_under_volatile_fields_and_ordering() {
        let a = json!({"student_id": 42, "amount": 500});
        let b = json!({
            "amount": 500,
            "student_id": 42,
            "updated_at": "2024-06-01T00:00:00Z",
            "trace_id": "abc"
        });
        assert_eq!(
            idempotency_key("payment.paid", &a),
            idempotency_key("payment.paid", &b)
        );
    }

    #[test]
    fn key_differs_across_event_types() {
        let payload = json!({"amount": 500});
        assert_ne!(
            idempotency_key("payment.paid", &payload),
            idempotency_key("payment.refunded", &payload)
        );
    }

    #[test]
    fn key_matches_reference_digest() {
        // sha256("payment.paid|{\"amount\":500,\"student_id\":42}")
        let payload = json!({"student_id": 42, "amount": 500});
        let mut hasher = Sha256::new();
        hasher.update(b"payment.paid|{\"amount\":500,\"student_id\":42}");
        let expected = hex::encode(hasher.finalize());

        assert_eq!(idempotency_key("payment.paid", &payload), expected);
    }

    #[test]
    fn validate_rejects_missing_field() {
        let env = Envelope::wrap("payment.paid", json!({}), "payment");
        let mut value = serde_json::to_value(&env).unwrap();
        value.as_object_mut().unwrap().remove("idempotency_key");
        assert!(!Envelope::validate(&value));
    }

    #[test]
    fn validate_rejects_empty_event_type() {
        let env = Envelope::wrap("payment.paid", json!({}), "payment");
        let mut value = serde_json::to_value(&env).unwrap();
        value["event_type"] = json!("");
        assert!(!Envelope::validate(&value));
    }

    #[test]
    fn validate_rejects_non_object() {
        assert!(!Envelope::validate(&json!([1, 2, 3])));
        assert!(!Envelope::validate(&json!("body")));
    }

    #[test]
    fn from_body_round_trip() {
        let env = Envelope::wrap("payment.paid", json!({"amount": 500}), "payment");
        let body = serde_json::to_string(&env).unwrap();
        let decoded = Envelope::from_body(&body).unwrap();

        assert_eq!(decoded.event_type, env.event_type);
        assert_eq!(decoded.idempotency_key, env.idempotency_key);
        assert_eq!(decoded.payload, env.payload);
    }

    #[test]
    fn from_body_rejects_malformed_json() {
        assert!(matches!(
            Envelope::from_body("{not json"),
            Err(EnvelopeError::Malformed(_))
        ));
    }

    #[test]
    fn from_body_reports_missing_field() {
        let body = r#"{"event_type":"payment.paid","service":"payment","payload":{}}"#;
        assert!(matches!(
            Envelope::from_body(body),
            Err(EnvelopeError::MissingField("idempotency_key"))
        ));
    }
}
