//! Lenient mapping from loosely-typed key/value input to a [`TaskObservation`].
//!
//! The workflow engine hands events over as string maps. A malformed numeric
//! value never fails the mapping: integers fall back to 0, floats are left
//! unset, and a [`FieldWarning`] is recorded for each.

use chrono::{SecondsFormat, Utc};
use serde_json::{Map, Value};
use tracing::warn;
use uuid::Uuid;

use crate::model::TaskObservation;
use crate::telemetry::metrics;

/// How absent fields are filled in.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum FieldDefaults {
    /// Client side: a missing `event_id` gets a fresh UUID and a missing
    /// `timestamp_iso` gets the current time.
    Client,
    /// Server side: missing values stay empty so an uncorrelatable event
    /// is visible as an empty id.
    Passthrough,
}

/// A value that could not be parsed for a numeric field.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct FieldWarning {
    pub field: &'static str,
    pub value: String,
}

impl std::fmt::Display for FieldWarning {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "could not convert {} '{}'", self.field, self.value)
    }
}

/// Result of coercing a field map.
#[derive(Debug, Clone)]
pub struct Coerced {
    pub observation: TaskObservation,
    pub warnings: Vec<FieldWarning>,
}

/// Coerce a JSON object of event fields into an observation.
pub fn coerce(fields: &Map<String, Value>, defaults: FieldDefaults) -> Coerced {
    let mut warnings = Vec::new();
    let text = |key: &str| fields.get(key).map(value_text).unwrap_or_default();

    let event_id = match fields.get("event_id") {
        Some(v) => value_text(v),
        None if defaults == FieldDefaults::Client => Uuid::new_v4().to_string(),
        None => String::new(),
    };
    let timestamp_iso = match fields.get("timestamp_iso") {
        Some(v) => value_text(v),
        None if defaults == FieldDefaults::Client => {
            Utc::now().to_rfc3339_opts(SecondsFormat::Micros, true)
        }
        None => String::new(),
    };

    // exit_code is int32 on the wire; out-of-range values are malformed too.
    let exit_code = int_field(fields, "exit_code", &mut warnings).map(|code| {
        i32::try_from(code).unwrap_or_else(|_| {
            warnings.push(FieldWarning {
                field: "exit_code",
                value: code.to_string(),
            });
            0
        })
    });

    let observation = TaskObservation {
        event_id,
        event_type: text("event_type"),
        timestamp_iso,
        pipeline_name: text("pipeline_name"),
        process_name: text("process_name"),
        task_id_num: int_field(fields, "task_id_num", &mut warnings).unwrap_or(0),
        task_hash: text("task_hash"),
        task_name: text("task_name"),
        native_id: text("native_id"),
        status: text("status"),
        exit_code,
        duration_ms: int_field(fields, "duration_ms", &mut warnings),
        peak_rss_bytes: int_field(fields, "peak_rss_bytes", &mut warnings),
        cpu_time_seconds: float_field(fields, "cpu_time_seconds", &mut warnings),
        error_message: text("error_message"),
        work_dir: text("work_dir"),
        container_id: text("container_id"),
        container_engine: text("container_engine"),
        script_id: text("script_id"),
        script_hash: text("script_hash"),
    };

    for warning in &warnings {
        warn!(field = warning.field, value = %warning.value, "malformed numeric field, using default");
        metrics::field_coercions().add(1, &[opentelemetry::KeyValue::new("field", warning.field)]);
    }

    Coerced {
        observation,
        warnings,
    }
}

fn value_text(value: &Value) -> String {
    match value {
        Value::String(s) => s.clone(),
        Value::Null => String::new(),
        other => other.to_string(),
    }
}

/// Absent → `None`; malformed → `Some(0)` plus a warning.
fn int_field(
    fields: &Map<String, Value>,
    field: &'static str,
    warnings: &mut Vec<FieldWarning>,
) -> Option<i64> {
    let value = fields.get(field)?;
    let parsed = match value {
        Value::Number(n) => n.as_i64(),
        Value::String(s) => s.trim().parse::<i64>().ok(),
        _ => None,
    };
    Some(parsed.unwrap_or_else(|| {
        warnings.push(FieldWarning {
            field,
            value: value_text(value),
        });
        0
    }))
}

/// Absent or malformed → `None`; malformed also records a warning.
fn float_field(
    fields: &Map<String, Value>,
    field: &'static str,
    warnings: &mut Vec<FieldWarning>,
) -> Option<f64> {
    let value = fields.get(field)?;
    let parsed = match value {
        Value::Number(n) => n.as_f64(),
        Value::String(s) => s.trim().parse::<f64>().ok(),
        _ => None,
    };
    if parsed.is_none() {
        warnings.push(FieldWarning {
            field,
            value: value_text(value),
        });
    }
    parsed
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn object(value: Value) -> Map<String, Value> {
        match value {
            Value::Object(map) => map,
            _ => panic!("expected a JSON object"),
        }
    }

    #[test]
    fn numeric_strings_are_parsed() {
        let fields = object(json!({"task_id_num": "98765", "exit_code": "0", "duration_ms": 12}));
        let coerced = coerce(&fields, FieldDefaults::Passthrough);
        assert_eq!(coerced.observation.task_id_num, 98765);
        assert_eq!(coerced.observation.exit_code, Some(0));
        assert_eq!(coerced.observation.duration_ms, Some(12));
        assert!(coerced.warnings.is_empty());
    }

    #[test]
    fn malformed_integers_default_to_zero_with_warning() {
        let fields = object(json!({"task_id_num": "abc", "peak_rss_bytes": "lots"}));
        let coerced = coerce(&fields, FieldDefaults::Passthrough);
        assert_eq!(coerced.observation.task_id_num, 0);
        assert_eq!(coerced.observation.peak_rss_bytes, Some(0));
        assert_eq!(coerced.warnings.len(), 2);
    }

    #[test]
    fn malformed_float_is_left_unset() {
        let fields = object(json!({"cpu_time_seconds": "fast"}));
        let coerced = coerce(&fields, FieldDefaults::Passthrough);
        assert_eq!(coerced.observation.cpu_time_seconds, None);
        assert_eq!(coerced.warnings[0].field, "cpu_time_seconds");
    }

    #[test]
    fn absent_optional_fields_stay_unset() {
        let coerced = coerce(&Map::new(), FieldDefaults::Passthrough);
        assert_eq!(coerced.observation.exit_code, None);
        assert_eq!(coerced.observation.duration_ms, None);
        assert_eq!(coerced.observation.task_id_num, 0);
        assert!(coerced.observation.event_id.is_empty());
        assert!(coerced.observation.timestamp_iso.is_empty());
    }

    #[test]
    fn client_defaults_fill_id_and_timestamp() {
        let coerced = coerce(&Map::new(), FieldDefaults::Client);
        assert!(Uuid::parse_str(&coerced.observation.event_id).is_ok());
        assert!(coerced.observation.timestamp_iso.ends_with('Z'));
    }

    #[test]
    fn out_of_range_exit_code_falls_back_to_zero_with_warning() {
        let fields = object(json!({"exit_code": "3000000000"}));
        let coerced = coerce(&fields, FieldDefaults::Client);
        assert_eq!(coerced.observation.exit_code, Some(0));
        assert_eq!(
            coerced.warnings,
            vec![FieldWarning {
                field: "exit_code",
                value: "3000000000".to_string(),
            }]
        );
    }
}
