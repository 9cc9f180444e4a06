//! Cursor codec.
//!
//! A cursor is the opaque, stable identity of one logical event. Its wire
//! form is the base64 (standard alphabet, padded) encoding of
//!
//! ```text
//! "1" \r <type code> \r <oid> \r <operation> \r <sec> \r <nano> \r <unique key>
//! ```
//!
//! Carriage return cannot appear in any field, so it is used as separator.
//! The format is shared with every consumer holding a cursor and must stay
//! byte compatible.

mod types;
pub use types::*;

#[cfg(test)]
mod cursor_test;

use base64::engine::general_purpose::STANDARD;
use base64::Engine;
use serde::Deserialize;
use serde::Serialize;

use crate::CursorError;

const CURSOR_VERSION: &str = "1";
const FIELD_SEPARATOR: char = '\r';
const MIN_FIELDS: usize = 6;

/// Encoded form of [`no_event_cursor`]. Consumers holding it restart their
/// scan from the head of the retained chain.
pub const NO_EVENT_CURSOR: &str = "MQ0xDW5vX2V2ZW50DW5vLW9wDTENMQ0=";

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Cursor {
    pub cursor_type: CursorType,
    pub cluster_time: ClusterTime,
    pub oid: String,
    pub oper: OperType,
    /// Disambiguates events sharing type, time and oid
    pub uniq_key: String,
}

/// The sentinel cursor meaning "no event currently available".
pub fn no_event_cursor() -> Cursor {
    Cursor {
        cursor_type: CursorType::NoEvent,
        cluster_time: ClusterTime::new(1, 1),
        oid: "no_event".to_string(),
        oper: OperType::NoOp,
        uniq_key: String::new(),
    }
}

impl Cursor {
    pub fn encode(&self) -> Result<String, CursorError> {
        if self.cursor_type == CursorType::Unknown {
            return Err(CursorError::InvalidCursor("unsupported cursor type".to_string()));
        }
        if self.cluster_time.sec == 0 {
            return Err(CursorError::InvalidCursor(
                "cluster time seconds is zero".to_string(),
            ));
        }
        if self.oid.is_empty() {
            return Err(CursorError::InvalidCursor("oid is empty".to_string()));
        }
        if self.oper.as_str().is_empty() {
            return Err(CursorError::InvalidCursor("operation is empty".to_string()));
        }

        let raw = [
            CURSOR_VERSION.to_string(),
            self.cursor_type.to_int().to_string(),
            self.oid.clone(),
            self.oper.as_str().to_string(),
            self.cluster_time.sec.to_string(),
            self.cluster_time.nano.to_string(),
            self.uniq_key.clone(),
        ]
        .join(&FIELD_SEPARATOR.to_string());

        Ok(STANDARD.encode(raw))
    }

    pub fn decode(cursor: &str) -> Result<Cursor, CursorError> {
        let bytes = STANDARD
            .decode(cursor)
            .map_err(|e| CursorError::InvalidCursor(format!("not base64: {e}")))?;
        let raw = String::from_utf8(bytes)
            .map_err(|e| CursorError::InvalidCursor(format!("not utf-8: {e}")))?;

        let fields: Vec<&str> = raw.split(FIELD_SEPARATOR).collect();
        if fields.len() < MIN_FIELDS {
            return Err(CursorError::InvalidCursor(format!(
                "expect at least {MIN_FIELDS} fields, got {}",
                fields.len()
            )));
        }

        if fields[0] != CURSOR_VERSION {
            return Err(CursorError::InvalidCursor(format!(
                "unsupported version {}",
                fields[0]
            )));
        }

        let code: i64 = fields[1]
            .parse()
            .map_err(|_| CursorError::InvalidCursor(format!("bad type code {}", fields[1])))?;
        let cursor_type = CursorType::from_int(code);
        if cursor_type == CursorType::Unknown {
            return Err(CursorError::InvalidCursor(format!("unknown type code {code}")));
        }

        if fields[3].is_empty() {
            return Err(CursorError::InvalidCursor("operation is empty".to_string()));
        }

        let sec: u32 = fields[4]
            .parse()
            .map_err(|_| CursorError::InvalidCursor(format!("bad seconds {}", fields[4])))?;
        let nano: u32 = fields[5]
            .parse()
            .map_err(|_| CursorError::InvalidCursor(format!("bad nanos {}", fields[5])))?;

        let uniq_key = if fields.len() > MIN_FIELDS {
            fields[MIN_FIELDS].to_string()
        } else {
            String::new()
        };

        Ok(Cursor {
            cursor_type,
            cluster_time: ClusterTime { sec, nano },
            oid: fields[2].to_string(),
            oper: OperType::from(fields[3]),
            uniq_key,
        })
    }

    /// Cursor used when the instance id alone distinguishes events sharing
    /// an oid and cluster time.
    pub fn for_event(
        cursor_type: CursorType,
        cluster_time: ClusterTime,
        oid: &str,
        oper: OperType,
        instance_id: i64,
    ) -> Cursor {
        Cursor {
            cursor_type,
            cluster_time,
            oid: oid.to_string(),
            oper,
            uniq_key: if instance_id > 0 {
                instance_id.to_string()
            } else {
                String::new()
            },
        }
    }
}

/// Fast path check that does not decode.
pub fn is_no_event_cursor(cursor: &str) -> bool {
    cursor == NO_EVENT_CURSOR
}

/// Mints the cursor of an ingested raw event, using `instance_id` (when > 0)
/// as unique key.
pub fn event_cursor(
    cursor_type: CursorType,
    event: &crate::ChangeEvent,
    instance_id: i64,
) -> Result<String, CursorError> {
    Cursor::for_event(
        cursor_type,
        event.cluster_time,
        &event.oid,
        event.operation_type.clone(),
        instance_id,
    )
    .encode()
}
