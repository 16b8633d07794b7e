use serde::{Deserialize, Deserializer};

use crate::error::{Error, Result};
use crate::event_sourcing::{deserialize, Metadata};

// ============================================================================
// Stream Envelope - Change Records of the `event` Table
// ============================================================================
//
// The CDC connector publishes one change record per inserted event row:
//
//   {"schema": {...}, "payload": {"before": null, "after": {<row>}, ...}}
//
// or, with schemas disabled, the inner object on its own. The row carries:
//
//   class_name           event type name
//   global_sequence      integer (some converters emit it as a string)
//   aggregate_global_id  integer (same)
//   payload              serialized event, a JSON string
//   metadata             serialized metadata map, a JSON string
//
// A change record whose `after` image is null (a delete) carries no event.
//
// ============================================================================

/// One stored event as it arrives from the broker.
#[derive(Debug, Clone, PartialEq)]
pub struct Envelope {
    pub type_name: String,
    pub global_sequence: i64,
    pub aggregate_global_id: i64,
    pub payload: String,
    pub metadata: Metadata,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum ChangeRecord {
    Wrapped { payload: ChangeBody },
    Bare(ChangeBody),
}

#[derive(Deserialize)]
struct ChangeBody {
    #[serde(deserialize_with = "Option::deserialize")]
    after: Option<EventRow>,
}

#[derive(Deserialize)]
struct EventRow {
    class_name: String,
    #[serde(deserialize_with = "lenient_i64")]
    global_sequence: i64,
    #[serde(deserialize_with = "lenient_i64")]
    aggregate_global_id: i64,
    payload: String,
    metadata: String,
}

#[derive(Deserialize)]
#[serde(untagged)]
enum NumberOrText {
    Number(i64),
    Text(String),
}

fn lenient_i64<'de, D: Deserializer<'de>>(deserializer: D) -> std::result::Result<i64, D::Error> {
    match NumberOrText::deserialize(deserializer)? {
        NumberOrText::Number(n) => Ok(n),
        NumberOrText::Text(text) => text.trim().parse().map_err(serde::de::Error::custom),
    }
}

/// Unwraps a change record. `Ok(None)` means the record carries no event.
pub fn decode(bytes: &[u8]) -> Result<Option<Envelope>> {
    let record: ChangeRecord =
        serde_json::from_slice(bytes).map_err(|e| Error::serialization("envelope", e))?;

    let body = match record {
        ChangeRecord::Wrapped { payload } => payload,
        ChangeRecord::Bare(body) => body,
    };

    let Some(row) = body.after else {
        return Ok(None);
    };

    Ok(Some(Envelope {
        metadata: deserialize(&row.class_name, &row.metadata)?,
        type_name: row.class_name,
        global_sequence: row.global_sequence,
        aggregate_global_id: row.aggregate_global_id,
        payload: row.payload,
    }))
}
