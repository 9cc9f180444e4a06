use serde::Deserialize;
use serde::Serialize;
use serde_json::Value;

use crate::is_no_event_cursor;
use crate::Cursor;
use crate::CursorType;
use crate::EventType;
use crate::NodeFilter;
use crate::Result;
use crate::WatchError;
use crate::NO_EVENT_CURSOR;

/// One watch request.
///
/// A non-empty `cursor` wins over `start_from`; with neither the request
/// watches from now.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchOptions {
    pub resource: CursorType,
    pub tenant_id: String,
    #[serde(default)]
    pub cursor: Option<String>,
    /// Unix seconds
    #[serde(default)]
    pub start_from: Option<i64>,
    /// Empty means every event type
    #[serde(default)]
    pub event_types: Vec<EventType>,
    /// Top level detail keys to return; empty returns whole documents
    #[serde(default)]
    pub fields: Vec<String>,
    #[serde(default)]
    pub sub_resource: Option<String>,
}

/// How a request picks its start position.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum WatchMode {
    Cursor,
    StartFrom,
    Now,
}

impl WatchMode {
    pub fn as_str(self) -> &'static str {
        match self {
            WatchMode::Cursor => "cursor",
            WatchMode::StartFrom => "start_from",
            WatchMode::Now => "now",
        }
    }
}

impl WatchOptions {
    pub fn new(
        resource: CursorType,
        tenant_id: &str,
    ) -> Self {
        Self {
            resource,
            tenant_id: tenant_id.to_string(),
            cursor: None,
            start_from: None,
            event_types: Vec::new(),
            fields: Vec::new(),
            sub_resource: None,
        }
    }

    pub fn with_cursor(
        mut self,
        cursor: impl Into<String>,
    ) -> Self {
        self.cursor = Some(cursor.into());
        self
    }

    pub fn with_start_from(
        mut self,
        start_from: i64,
    ) -> Self {
        self.start_from = Some(start_from);
        self
    }

    pub fn with_event_types(
        mut self,
        event_types: Vec<EventType>,
    ) -> Self {
        self.event_types = event_types;
        self
    }

    pub fn with_fields(
        mut self,
        fields: &[&str],
    ) -> Self {
        self.fields = fields.iter().map(|f| f.to_string()).collect();
        self
    }

    pub fn with_sub_resource(
        mut self,
        sub_resource: &str,
    ) -> Self {
        self.sub_resource = Some(sub_resource.to_string());
        self
    }

    pub fn mode(&self) -> WatchMode {
        if self.cursor.as_deref().is_some_and(|c| !c.is_empty()) {
            WatchMode::Cursor
        } else if self.start_from.is_some_and(|s| s != 0) {
            WatchMode::StartFrom
        } else {
            WatchMode::Now
        }
    }

    pub fn node_filter(&self) -> NodeFilter {
        NodeFilter {
            event_types: self.event_types.clone(),
            sub_resource: self.sub_resource.clone(),
        }
    }

    /// Rejects malformed requests before any store is touched.
    pub fn validate(&self) -> Result<()> {
        if !CursorType::WATCHABLE.contains(&self.resource) {
            return Err(invalid(format!("resource {} can not be watched", self.resource)));
        }
        if self.tenant_id.is_empty() {
            return Err(invalid("tenant id is empty".to_string()));
        }
        if let Some(cursor) = self.cursor.as_deref().filter(|c| !c.is_empty()) {
            if !is_no_event_cursor(cursor) {
                Cursor::decode(cursor).map_err(|e| invalid(format!("cursor: {e}")))?;
            }
        }
        if self.start_from.is_some_and(|s| s < 0) {
            return Err(invalid("start from must not be negative".to_string()));
        }
        if self.fields.iter().any(|f| f.is_empty()) {
            return Err(invalid("fields contain an empty name".to_string()));
        }
        Ok(())
    }
}

fn invalid(msg: String) -> crate::Error {
    WatchError::InvalidParam(msg).into()
}

/// One returned event. A `None` detail marks a position only response.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchEventDetail {
    pub cursor: String,
    pub resource: CursorType,
    #[serde(default)]
    pub event_type: Option<EventType>,
    #[serde(default)]
    pub detail: Option<Value>,
}

impl WatchEventDetail {
    pub fn no_event(resource: CursorType) -> Self {
        Self::position(NO_EVENT_CURSOR, resource)
    }

    /// Cursor to resume from, without any event.
    pub fn position(
        cursor: &str,
        resource: CursorType,
    ) -> Self {
        Self {
            cursor: cursor.to_string(),
            resource,
            event_type: None,
            detail: None,
        }
    }
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WatchResp {
    /// Whether `events` carry real events rather than a resume position
    pub watched: bool,
    pub events: Vec<WatchEventDetail>,
}

impl WatchResp {
    /// Shapes the events of one request.
    ///
    /// When nothing was hit a cursor request gets its own start cursor back,
    /// other requests get the no-event sentinel. A first event without detail
    /// is a resume position and is returned alone.
    pub fn shape(
        start_cursor: Option<&str>,
        resource: CursorType,
        events: Vec<WatchEventDetail>,
    ) -> Self {
        let unchanged = || match start_cursor.filter(|c| !c.is_empty()) {
            Some(cursor) => WatchEventDetail::position(cursor, resource),
            None => WatchEventDetail::no_event(resource),
        };

        let Some(first) = events.first() else {
            return WatchResp {
                watched: false,
                events: vec![unchanged()],
            };
        };

        if is_no_event_cursor(&first.cursor) {
            return WatchResp {
                watched: false,
                events: vec![unchanged()],
            };
        }

        if first.detail.is_none() {
            return WatchResp {
                watched: false,
                events: events.into_iter().take(1).collect(),
            };
        }

        WatchResp { watched: true, events }
    }
}
