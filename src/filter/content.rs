//! Typed view of a message payload for filter evaluation

use serde_json::{Map, Value};

/// What filters can see of a payload.
///
/// Only a JSON object is `Structured`; anything else (binary, text, JSON
/// arrays or scalars) is `Opaque`. The well-known fields are pulled out with
/// their expected types, and a field of the wrong type reads as absent.
#[derive(Debug, Clone, PartialEq)]
pub enum EvaluableContent {
    Structured {
        priority: Option<String>,
        kind: Option<String>,
        /// Epoch seconds
        timestamp: Option<f64>,
        fields: Map<String, Value>,
    },
    Opaque,
}

impl EvaluableContent {
    pub fn decode(payload: &[u8]) -> Self {
        let fields = match serde_json::from_slice::<Value>(payload) {
            Ok(Value::Object(map)) => map,
            _ => return EvaluableContent::Opaque,
        };

        let priority = fields
            .get("priority")
            .and_then(Value::as_str)
            .map(str::to_string);
        let kind = fields.get("type").and_then(Value::as_str).map(str::to_string);
        let timestamp = fields.get("timestamp").and_then(Value::as_f64);

        EvaluableContent::Structured {
            priority,
            kind,
            timestamp,
            fields,
        }
    }

    /// Field exists and is not JSON `null`
    pub fn has_field(&self, name: &str) -> bool {
        match self {
            EvaluableContent::Structured { fields, .. } => {
                fields.get(name).is_some_and(|v| !v.is_null())
            }
            EvaluableContent::Opaque => false,
        }
    }
}
