//! Core domain types for tlog
//!
//! ## Terminology
//!
//! | Term | Definition |
//! |------|------------|
//! | **Event** | One captured interaction or diagnostic record, immutable once queued |
//! | **Draft** | A partial event handed to `track()` by a producer |
//! | **Batch** | The payload sent over the wire: events plus user/session/device |
//! | **Session** | The logical, cross-tab user session of one project |
//! | **Boundary event** | `session_start` or `session_end` |
//!
//! Event type and payload are one enum ([`EventData`]), so an event whose
//! `type` disagrees with its payload field cannot be constructed. On the wire
//! the variant becomes the `type` tag and its payload keeps its own field name:
//!
//! ```json
//! {"id": "…", "type": "click", "timestamp": 1700000000000, "page_url": "https://…",
//!  "click_data": {"x": 120, "y": 40, …}}
//! ```

use serde::{Deserialize, Serialize};

// ============================================
// Event types
// ============================================

/// Discriminant of [`EventData`]
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventType {
    PageView,
    Click,
    Scroll,
    SessionStart,
    SessionEnd,
    Custom,
    WebVitals,
    Error,
    ViewportVisible,
}

impl EventType {
    pub fn as_str(&self) -> &'static str {
        match self {
            EventType::PageView => "page_view",
            EventType::Click => "click",
            EventType::Scroll => "scroll",
            EventType::SessionStart => "session_start",
            EventType::SessionEnd => "session_end",
            EventType::Custom => "custom",
            EventType::WebVitals => "web_vitals",
            EventType::Error => "error",
            EventType::ViewportVisible => "viewport_visible",
        }
    }

    /// `session_start` and `session_end` bypass rate limits, sampling and caps.
    pub fn is_boundary(&self) -> bool {
        matches!(self, EventType::SessionStart | EventType::SessionEnd)
    }
}

impl std::fmt::Display for EventType {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.write_str(self.as_str())
    }
}

/// Type tag plus the single type-specific payload field
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum EventData {
    PageView {
        page_view: PageViewData,
    },
    Click {
        click_data: ClickData,
    },
    Scroll {
        scroll_data: ScrollData,
    },
    SessionStart,
    SessionEnd {
        session_end_reason: SessionEndReason,
    },
    Custom {
        custom_event: CustomEventData,
    },
    WebVitals {
        web_vitals: WebVitalsData,
    },
    Error {
        error_data: ErrorData,
    },
    ViewportVisible {
        viewport_data: ViewportData,
    },
}

impl EventData {
    pub fn event_type(&self) -> EventType {
        match self {
            EventData::PageView { .. } => EventType::PageView,
            EventData::Click { .. } => EventType::Click,
            EventData::Scroll { .. } => EventType::Scroll,
            EventData::SessionStart => EventType::SessionStart,
            EventData::SessionEnd { .. } => EventType::SessionEnd,
            EventData::Custom { .. } => EventType::Custom,
            EventData::WebVitals { .. } => EventType::WebVitals,
            EventData::Error { .. } => EventType::Error,
            EventData::ViewportVisible { .. } => EventType::ViewportVisible,
        }
    }
}

#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct PageViewData {
    #[serde(skip_serializing_if = "Option::is_none")]
    pub referrer: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub title: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub pathname: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub search: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub hash: Option<String>,
}

/// Click position and target description
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct ClickData {
    /// Viewport x coordinate in CSS pixels
    pub x: f64,
    /// Viewport y coordinate in CSS pixels
    pub y: f64,
    /// Position within the target element, 0..1
    pub relative_x: f64,
    pub relative_y: f64,
    /// Tag name of the clicked element
    pub tag: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,
    #[serde(rename = "class", skip_serializing_if = "Option::is_none")]
    pub class_name: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub text: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub href: Option<String>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ScrollDirection {
    Up,
    Down,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ScrollData {
    /// Percentage of the page scrolled, 0..=100
    pub depth: u8,
    pub direction: ScrollDirection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct CustomEventData {
    pub name: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct WebVitalsData {
    /// Metric name (LCP, CLS, INP, FCP, TTFB, LONG_TASK)
    #[serde(rename = "type")]
    pub vital_type: String,
    pub value: f64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ErrorKind {
    JsError,
    PromiseRejection,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ErrorData {
    #[serde(rename = "type")]
    pub kind: ErrorKind,
    pub message: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub filename: Option<String>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub line: Option<u32>,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub column: Option<u32>,
}

#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct ViewportData {
    /// CSS selector of the observed element
    pub selector: String,
    /// Milliseconds the element stayed visible
    pub dwell_time: u64,
    /// Visible fraction when the event fired, 0..1
    pub visibility_ratio: f64,
}

/// Why a session ended
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum SessionEndReason {
    /// Inactivity timer fired
    Inactivity,
    /// Explicit stop from the host API
    ManualStop,
    /// Page is unloading (reload, navigation or close)
    PageUnload,
}

impl SessionEndReason {
    pub fn as_str(&self) -> &'static str {
        match self {
            SessionEndReason::Inactivity => "inactivity",
            SessionEndReason::ManualStop => "manual_stop",
            SessionEndReason::PageUnload => "page_unload",
        }
    }
}

// ============================================
// Events and drafts
// ============================================

/// A queued event
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct Event {
    /// Opaque unique token
    pub id: String,
    /// Capture time, ms since the Unix epoch
    pub timestamp: i64,
    pub page_url: String,
    #[serde(skip_serializing_if = "Option::is_none")]
    pub from_page_url: Option<String>,
    #[serde(flatten)]
    pub data: EventData,
}

impl Event {
    pub fn event_type(&self) -> EventType {
        self.data.event_type()
    }
}

/// Partial event description accepted by `track()`
///
/// Anything left unset is stamped by the queue engine: `timestamp` from the
/// clock, `page_url` from the shared state's current page.
#[derive(Debug, Clone, Default, PartialEq)]
pub struct EventDraft {
    /// Missing type means the draft is dropped with a warning
    pub data: Option<EventData>,
    pub page_url: Option<String>,
    pub from_page_url: Option<String>,
    pub timestamp: Option<i64>,
}

impl EventDraft {
    pub fn new(data: EventData) -> Self {
        Self {
            data: Some(data),
            ..Default::default()
        }
    }

    pub fn page_view(page_view: PageViewData) -> Self {
        Self::new(EventData::PageView { page_view })
    }

    pub fn click(click_data: ClickData) -> Self {
        Self::new(EventData::Click { click_data })
    }

    pub fn scroll(depth: u8, direction: ScrollDirection) -> Self {
        Self::new(EventData::Scroll {
            scroll_data: ScrollData { depth, direction },
        })
    }

    pub fn custom(
        name: impl Into<String>,
        metadata: Option<serde_json::Map<String, serde_json::Value>>,
    ) -> Self {
        Self::new(EventData::Custom {
            custom_event: CustomEventData {
                name: name.into(),
                metadata,
            },
        })
    }

    pub fn web_vitals(vital_type: impl Into<String>, value: f64) -> Self {
        Self::new(EventData::WebVitals {
            web_vitals: WebVitalsData {
                vital_type: vital_type.into(),
                value,
            },
        })
    }

    pub fn error(kind: ErrorKind, message: impl Into<String>) -> Self {
        Self::new(EventData::Error {
            error_data: ErrorData {
                kind,
                message: message.into(),
                filename: None,
                line: None,
                column: None,
            },
        })
    }

    pub fn viewport(selector: impl Into<String>, dwell_time: u64, visibility_ratio: f64) -> Self {
        Self::new(EventData::ViewportVisible {
            viewport_data: ViewportData {
                selector: selector.into(),
                dwell_time,
                visibility_ratio,
            },
        })
    }

    pub fn with_page_url(mut self, url: impl Into<String>) -> Self {
        self.page_url = Some(url.into());
        self
    }

    pub fn with_from_page_url(mut self, url: impl Into<String>) -> Self {
        self.from_page_url = Some(url.into());
        self
    }

    pub fn with_timestamp(mut self, timestamp: i64) -> Self {
        self.timestamp = Some(timestamp);
        self
    }

    pub fn event_type(&self) -> Option<EventType> {
        self.data.as_ref().map(EventData::event_type)
    }
}

// ============================================
// Payloads
// ============================================

/// Device class reported with every batch
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum DeviceType {
    Desktop,
    Mobile,
    Tablet,
    #[default]
    Unknown,
}

/// Unit sent over the wire
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventBatch {
    pub user_id: String,
    pub session_id: String,
    pub device: DeviceType,
    pub events: Vec<Event>,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub global_metadata: Option<serde_json::Map<String, serde_json::Value>>,
}

/// A batch written to storage for recovery on a later load
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct PersistedPayload {
    #[serde(flatten)]
    pub batch: EventBatch,
    /// When the payload was persisted, ms since the Unix epoch
    pub timestamp: i64,
}

/// Injected into the request body at send time
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct RequestMetadata {
    pub referer: String,
    pub timestamp: i64,
}

// ============================================
// Session and cross-tab records
// ============================================

/// Stored session record (`tlog:{project}:session`)
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct SessionRecord {
    pub id: String,
    pub last_activity: i64,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum BroadcastAction {
    SessionStart,
    SessionEnd,
}

/// Message exchanged between tabs of the same project
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct BroadcastMessage {
    pub action: BroadcastAction,
    pub project_id: String,
    pub session_id: String,
    pub timestamp: i64,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub reason: Option<SessionEndReason>,
}
