use crate::{QueueError, Result};
use serde_json::{Map, Value};

/// Decoded job payload: a JSON object keyed by field name
pub type Payload = Map<String, Value>;

/// Reserved payload field carrying the per-job retry delay.
/// Added on enqueue and stripped before the payload reaches an executor.
pub const RETRY_DELAY_FIELD: &str = "__rescheduleTime";

/// Retry delay used when a job does not carry its own
pub const DEFAULT_RETRY_DELAY: &str = "10min";

/// Serialize a payload to the bytes stored in the transport
pub fn encode(payload: &Payload) -> Result<Vec<u8>> {
    serde_json::to_vec(payload).map_err(QueueError::from)
}

/// Decode stored bytes into a payload. Anything but a JSON object is rejected.
pub fn decode(data: &[u8]) -> Result<Payload> {
    match serde_json::from_slice::<Value>(data)? {
        Value::Object(map) => Ok(map),
        other => Err(QueueError::InvalidArgument(format!(
            "Job payload must be a JSON object, got {}",
            kind_name(&other)
        ))),
    }
}

/// Remove the reserved retry field, returning its value if it holds a string
pub fn take_retry_delay(payload: &mut Payload) -> Option<String> {
    match payload.remove(RETRY_DELAY_FIELD) {
        Some(Value::String(expr)) => Some(expr),
        _ => None,
    }
}

pub(crate) fn kind_name(value: &Value) -> &'static str {
    match value {
        Value::Null => "null",
        Value::Bool(_) => "bool",
        Value::Number(n) if n.is_f64() => "float",
        Value::Number(_) => "int",
        Value::String(_) => "string",
        Value::Array(_) => "array",
        Value::Object(_) => "object",
    }
}
