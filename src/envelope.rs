//! Wire envelope for correlated messages
//!
//! Both directions speak JSON objects. An outbound request carries the
//! correlation id and send timestamp merged into the application fields;
//! a reply echoes `correlationId` so it can be matched to its caller.

use crate::error::{Result, WirecallError};

use serde_json::Value;
use std::time::{SystemTime, UNIX_EPOCH};

/// Field carrying the correlation id, both directions.
pub const CORRELATION_FIELD: &str = "correlationId";

/// Field carrying the send timestamp (epoch milliseconds), outbound only.
pub const SENT_FIELD: &str = "sent";

/// Merge the correlation id and send timestamp into a payload and serialize
/// it for the wire. The id and timestamp win over application fields of the
/// same name.
pub fn seal(payload: Value, correlation_id: u64, sent_ms: u64) -> Result<String> {
    let Value::Object(mut fields) = payload else {
        return Err(WirecallError::Payload(
            "correlated payload must be a JSON object".to_string(),
        ));
    };

    fields.insert(CORRELATION_FIELD.to_string(), correlation_id.into());
    fields.insert(SENT_FIELD.to_string(), sent_ms.into());

    serde_json::to_string(&Value::Object(fields)).map_err(WirecallError::Serialization)
}

/// Extract the correlation id from an inbound envelope, if it carries one.
pub fn correlation_id(envelope: &Value) -> Option<u64> {
    envelope.get(CORRELATION_FIELD)?.as_u64()
}

/// Current wall-clock time as epoch milliseconds.
pub fn epoch_ms() -> u64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_millis() as u64)
        .unwrap_or(0)
}
