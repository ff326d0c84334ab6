//! Telemetry event wire shape and line validation.
//!
//! One line of the ingest feed is one JSON object. Validation is strict on the
//! four mandatory fields and lenient on the optional ones: an empty optional
//! string is treated as absent, matching how emitters leave fields blank.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

use crate::error::EventError;

/// Kind that opens a call.
pub const CALL_START: &str = "call_start";
/// Kind that closes a call opened for the same span.
pub const CALL_END: &str = "call_end";
/// Kind that marks the end of the whole run.
pub const RUN_END: &str = "run_end";

/// One emitted instrumentation point.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct TelemetryEvent {
    /// Partition key.
    pub run_id: String,
    /// Emitter-assigned, strictly increasing within a run.
    pub seq: u64,
    /// Wall clock at emission, milliseconds.
    pub ts: i64,
    pub kind: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub parent_span: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub node_key: Option<String>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub data: Option<Value>,
    /// Source snippet attached by some emitters.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub code: Option<String>,
}

impl TelemetryEvent {
    /// Minimal event, mostly for tests and adapters.
    #[must_use]
    pub fn new(run_id: impl Into<String>, seq: u64, ts: i64, kind: impl Into<String>) -> Self {
        Self {
            run_id: run_id.into(),
            seq,
            ts,
            kind: kind.into(),
            span: None,
            parent_span: None,
            node_key: None,
            data: None,
            code: None,
        }
    }

    #[must_use]
    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    #[must_use]
    pub fn with_parent(mut self, parent_span: impl Into<String>) -> Self {
        self.parent_span = Some(parent_span.into());
        self
    }

    #[must_use]
    pub fn with_node_key(mut self, node_key: impl Into<String>) -> Self {
        self.node_key = Some(node_key.into());
        self
    }

    #[must_use]
    pub fn with_data(mut self, data: Value) -> Self {
        self.data = Some(data);
        self
    }

    /// The payload as an object, if it is one.
    #[must_use]
    pub fn data_object(&self) -> Option<&Map<String, Value>> {
        self.data.as_ref().and_then(Value::as_object)
    }

    /// A string field of the payload.
    #[must_use]
    pub fn data_str(&self, key: &str) -> Option<&str> {
        self.data_object()?.get(key)?.as_str()
    }

    /// A numeric field of the payload, as integer milliseconds.
    #[must_use]
    pub fn data_millis(&self, key: &str) -> Option<i64> {
        let value = self.data_object()?.get(key)?;
        value
            .as_i64()
            .or_else(|| value.as_f64().map(|f| f.round() as i64))
    }
}

/// Durable log key for a run.
#[must_use]
pub fn stream_key(prefix: &str, run_id: &str) -> String {
    format!("{prefix}:{run_id}")
}

/// Inverse of [`stream_key`].
#[must_use]
pub fn run_id_from_stream<'a>(prefix: &str, stream: &'a str) -> Option<&'a str> {
    stream
        .strip_prefix(prefix)?
        .strip_prefix(':')
        .filter(|run| !run.is_empty())
}

/// Parse and validate one feed line.
pub fn parse_line(line: &str) -> Result<TelemetryEvent, EventError> {
    let value: Value =
        serde_json::from_str(line).map_err(|e| EventError::NotJson(e.to_string()))?;
    let Value::Object(mut obj) = value else {
        return Err(EventError::NotObject);
    };

    let run_id = required_string(&obj, "runId")?;
    let kind = required_string(&obj, "kind")?;
    let seq = parse_seq(obj.get("seq"))?;
    let ts = parse_ts(obj.get("ts"))?;

    Ok(TelemetryEvent {
        run_id,
        seq,
        ts,
        kind,
        span: optional_string(&obj, "span")?,
        parent_span: optional_string(&obj, "parentSpan")?,
        node_key: optional_string(&obj, "nodeKey")?,
        data: obj.remove("data").filter(|v| !v.is_null()),
        code: optional_string(&obj, "code")?,
    })
}

fn required_string(obj: &Map<String, Value>, field: &'static str) -> Result<String, EventError> {
    match obj.get(field) {
        None | Some(Value::Null) => Err(EventError::MissingField(field)),
        Some(Value::String(s)) if !s.is_empty() => Ok(s.clone()),
        Some(Value::String(_)) => Err(EventError::InvalidField {
            field,
            reason: "must not be empty".to_string(),
        }),
        Some(other) => Err(EventError::InvalidField {
            field,
            reason: format!("expected a string, got {}", type_name(other)),
        }),
    }
}

fn optional_string(
    obj: &Map<String, Value>,
    field: &'static str,
) -> Result<Option<String>, EventError> {
    match obj.get(field) {
        None | Some(Value::Null) => Ok(None),
        Some(Value::String(s)) if s.is_empty() => Ok(None),
        Some(Value::String(s)) => Ok(Some(s.clone())),
        Some(other) => Err(EventError::InvalidField {
            field,
            reason: format!("expected a string, got {}", type_name(other)),
        }),
    }
}

fn parse_seq(value: Option<&Value>) -> Result<u64, EventError> {
    let invalid = || EventError::InvalidField {
        field: "seq",
        reason: "must be a non-negative integer".to_string(),
    };
    match value {
        None | Some(Value::Null) => Err(EventError::MissingField("seq")),
        Some(Value::Number(n)) => {
            if let Some(u) = n.as_u64() {
                Ok(u)
            } else {
                // 3.0 is an integer to emitters whose numbers are all doubles.
                match n.as_f64() {
                    Some(f) if f >= 0.0 && f.fract() == 0.0 && f <= MAX_SAFE_INTEGER => {
                        Ok(f as u64)
                    }
                    _ => Err(invalid()),
                }
            }
        }
        Some(_) => Err(invalid()),
    }
}

/// Largest integer a double represents exactly.
const MAX_SAFE_INTEGER: f64 = 9_007_199_254_740_991.0;

/// `ts` accepts a JSON integer, an integral double, or a decimal string (the
/// extended-precision form some emitters use for 64-bit clocks).
fn parse_ts(value: Option<&Value>) -> Result<i64, EventError> {
    let invalid = |reason: &str| EventError::InvalidField {
        field: "ts",
        reason: reason.to_string(),
    };
    match value {
        None | Some(Value::Null) => Err(EventError::MissingField("ts")),
        Some(Value::Number(n)) => {
            if let Some(i) = n.as_i64() {
                Ok(i)
            } else if n.as_u64().is_some() {
                Err(invalid("out of range"))
            } else {
                match n.as_f64() {
                    Some(f) if f.fract() == 0.0 && f.abs() <= MAX_SAFE_INTEGER => Ok(f as i64),
                    _ => Err(invalid("must be an integer")),
                }
            }
        }
        Some(Value::String(s)) => {
            let digits = s.strip_suffix('n').unwrap_or(s);
            digits
                .trim()
                .parse::<i64>()
                .map_err(|_| invalid("must be an integer or an integer string"))
        }
        Some(other) => Err(invalid(&format!("expected a number, got {}", type_name(other)))),
    }
}

fn type_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "boolean",
        Value::Number(_) => "number",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
