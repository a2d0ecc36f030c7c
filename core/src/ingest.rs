use serde_json::Value;
use time::format_description::well_known::{Iso8601, Rfc3339};
use time::{OffsetDateTime, PrimitiveDateTime};
use tracing::trace;

use crate::error::IngestError;
use crate::store::{DuckDbStore, epoch_nanos};
use crate::types::{FieldValue, Point};

/// Parses a reading timestamp. Values without an offset are taken as UTC.
pub fn parse_timestamp(raw: &str) -> Option<OffsetDateTime> {
    let raw = raw.trim();
    if let Ok(ts) = OffsetDateTime::parse(raw, &Rfc3339) {
        return Some(ts);
    }
    if let Ok(ts) = OffsetDateTime::parse(raw, &Iso8601::DEFAULT) {
        return Some(ts);
    }
    PrimitiveDateTime::parse(raw, &Iso8601::DEFAULT)
        .ok()
        .map(PrimitiveDateTime::assume_utc)
}

/// Flattens a JSON object into a point.
///
/// Numbers and strings become fields; nulls, booleans and nested values are
/// dropped. The point is indexed by its own `timestamp` field when that
/// parses to a storable time, otherwise by `received_at`.
pub fn point_from_payload(
    payload: &[u8],
    received_at: OffsetDateTime,
) -> Result<Point, IngestError> {
    let Value::Object(map) = serde_json::from_slice::<Value>(payload)? else {
        return Err(IngestError::NotAnObject);
    };

    let time = map
        .get("timestamp")
        .and_then(Value::as_str)
        .and_then(parse_timestamp)
        .filter(|ts| epoch_nanos(*ts).is_some())
        .unwrap_or(received_at);

    let mut point = Point::new(time);
    for (name, value) in map {
        let field = match value {
            Value::Number(n) => match n.as_f64() {
                Some(v) => FieldValue::Number(v),
                None => continue,
            },
            Value::String(s) => FieldValue::Text(s),
            other => {
                trace!(field = %name, kind = ?other, "dropping non-scalar field");
                continue;
            }
        };
        point.fields.insert(name, field);
    }
    Ok(point)
}

/// Decodes one message and appends it under `measurement`.
pub fn ingest_payload(
    store: &DuckDbStore,
    measurement: &str,
    payload: &[u8],
    received_at: OffsetDateTime,
) -> Result<Point, IngestError> {
    let point = point_from_payload(payload, received_at)?;
    store.write_point(measurement, &point)?;
    Ok(point)
}
