//! Event model, validation, and canonical identifiers.

use serde::{Deserialize, Serialize};
use serde_json::{Map, Value, json};
use std::time::{SystemTime, UNIX_EPOCH};

/// The only accepted schema version.
pub const SCHEMA_VERSION: u64 = 1;

/// ID source for events minted by the tailing watcher.
pub const WATCHER_SOURCE: &str = "file_watcher";

/// `reason` carried by the marker synthesized when the log is truncated
/// or replaced underneath the watcher.
pub const RESET_REASON: &str = "File truncated or rotated";

/// Producer timestamps may run ahead of the server clock by at most this much.
const MAX_CLOCK_SKEW_SECS: f64 = 60.0;

const MAX_SESSION_ID_BYTES: usize = 256;
const MAX_PATH_BYTES: usize = 4096;
const MAX_TOOL_BYTES: usize = 256;
const MAX_COMMAND_BYTES: usize = 8192;
const MAX_REASON_BYTES: usize = 512;
const MAX_HOOK_NAME_BYTES: usize = 256;
const MAX_PAYLOAD_KEYS: usize = 100;
const MAX_METADATA_BYTES: usize = 10_000;

/// Closed set of event variants. Processing dispatches on this tag;
/// variant-specific fields stay in [`Event::fields`] and are enforced
/// by [`validate`].
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum EventKind {
    /// Agent session lifecycle (start, stop, interrupt, crash).
    Session,
    /// A file read or written by the agent.
    FileTouch,
    /// A tool invocation boundary (start or end).
    ToolCall,
    /// A coarse agent activity state.
    AgentState,
    /// Anything the hook normalizer could not map, plus synthesized markers.
    Unknown,
}

impl EventKind {
    fn parse(s: &str) -> Option<EventKind> {
        match s {
            "session" => Some(EventKind::Session),
            "file_touch" => Some(EventKind::FileTouch),
            "tool_call" => Some(EventKind::ToolCall),
            "agent_state" => Some(EventKind::AgentState),
            "unknown" => Some(EventKind::Unknown),
            _ => None,
        }
    }
}

/// A single telemetry event. Immutable once validated.
///
/// Common fields are typed; variant fields and any unknown top-level fields
/// a future producer might send live in the flattened `fields` map, so the
/// serialized line round-trips through the log without loss.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
pub struct Event {
    /// Schema version (always 1).
    pub v: u64,

    /// Producer wall-clock timestamp, fractional seconds since the epoch.
    pub ts: f64,

    /// Variant tag.
    #[serde(rename = "type")]
    pub kind: EventKind,

    /// Producer session the event belongs to.
    pub session_id: String,

    /// Canonical identifier, `<source>:<byte-offset>`. Assigned by the
    /// watcher when the line is framed; never set by producers.
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub id: Option<String>,

    /// Variant-specific fields plus preserved unknown fields.
    #[serde(flatten)]
    pub fields: Map<String, Value>,
}

impl Event {
    /// Construct an event with the current wall-clock timestamp.
    pub fn new(kind: EventKind, session_id: &str, fields: Map<String, Value>) -> Self {
        Event {
            v: SCHEMA_VERSION,
            ts: now_ts(),
            kind,
            session_id: session_id.to_string(),
            id: None,
            fields,
        }
    }

    /// Synthesize the marker delivered to mark a backpressure drop episode.
    ///
    /// `trigger_id` is the canonical ID of the newest dropped event; the
    /// marker's own ID is derived from it with a `:gap` suffix so it stays
    /// unique and sorts with the stream.
    pub fn gap_marker(
        dropped_count: u64,
        from_event_id: Option<&str>,
        to_offset: u64,
        trigger_id: &str,
    ) -> Self {
        let mut fields = Map::new();
        fields.insert("gap_type".into(), json!("dropped"));
        fields.insert("dropped_count".into(), json!(dropped_count));
        fields.insert(
            "from_event_id".into(),
            json!(from_event_id.unwrap_or("unknown")),
        );
        fields.insert("to_offset".into(), json!(to_offset));
        fields.insert(
            "reason".into(),
            json!(format!("queue overflow: dropped {dropped_count} events")),
        );
        Event {
            v: SCHEMA_VERSION,
            ts: now_ts(),
            kind: EventKind::Unknown,
            session_id: "system".into(),
            id: Some(gap_id(trigger_id)),
            fields,
        }
    }

    /// Synthesize the marker emitted when the watcher detects truncation
    /// or replacement of the log. Carries no canonical ID: it corresponds
    /// to no byte in the stream and resets the ordering watermark instead.
    pub fn reset_marker() -> Self {
        let mut fields = Map::new();
        fields.insert("reason".into(), json!(RESET_REASON));
        Event {
            v: SCHEMA_VERSION,
            ts: now_ts(),
            kind: EventKind::Unknown,
            session_id: "system".into(),
            id: None,
            fields,
        }
    }

    /// True for markers synthesized by [`Event::reset_marker`].
    pub fn is_reset_marker(&self) -> bool {
        self.kind == EventKind::Unknown
            && self.id.is_none()
            && self.fields.get("reason").and_then(Value::as_str) == Some(RESET_REASON)
    }

    /// True for markers synthesized by [`Event::gap_marker`].
    pub fn is_gap_marker(&self) -> bool {
        self.fields.get("gap_type").and_then(Value::as_str) == Some("dropped")
    }

    /// Byte offset embedded in this event's canonical ID, if any.
    pub fn offset(&self) -> Option<u64> {
        self.id.as_deref().and_then(id_offset)
    }

    /// Look up a variant field as a string.
    pub fn str_field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).and_then(Value::as_str)
    }
}

/// Mint the canonical ID for a line starting at `offset`.
pub fn watcher_id(offset: u64) -> String {
    format!("{WATCHER_SOURCE}:{offset}")
}

/// Derive a gap-marker ID from the triggering event's ID.
pub fn gap_id(trigger_id: &str) -> String {
    format!("{trigger_id}:gap")
}

/// Extract the numeric byte offset from a canonical ID.
///
/// IDs sort by this value; it is the ordering primitive for every batch
/// assertion. Works for both `file_watcher:123` and `file_watcher:123:gap`.
pub fn id_offset(id: &str) -> Option<u64> {
    let mut parts = id.split(':');
    let source = parts.next()?;
    if source.is_empty() {
        return None;
    }
    parts.next()?.parse().ok()
}

/// Current wall-clock time as fractional seconds since the epoch.
pub fn now_ts() -> f64 {
    SystemTime::now()
        .duration_since(UNIX_EPOCH)
        .map(|d| d.as_secs_f64())
        .unwrap_or(0.0)
}

/// One failed check from [`validate`].
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct FieldError {
    /// Top-level field the check applies to.
    pub field: String,
    /// Human-readable description of the violation.
    pub message: String,
}

impl FieldError {
    fn new(field: &str, message: impl Into<String>) -> Self {
        FieldError {
            field: field.to_string(),
            message: message.into(),
        }
    }
}

/// Validate a raw JSON value against the event schema.
///
/// Pure: inspects the value, mutates nothing, and reports every violation
/// rather than stopping at the first. Unknown top-level fields are
/// permitted (and preserved by [`Event`]'s flattened map).
pub fn validate(raw: &Value) -> Result<(), Vec<FieldError>> {
    validate_at(raw, now_ts())
}

/// [`validate`] with an explicit clock, for deterministic tests.
pub fn validate_at(raw: &Value, now: f64) -> Result<(), Vec<FieldError>> {
    let mut errors = Vec::new();

    let Some(obj) = raw.as_object() else {
        return Err(vec![FieldError::new("event", "must be a JSON object")]);
    };

    match obj.get("v").and_then(Value::as_u64) {
        Some(SCHEMA_VERSION) => {}
        Some(other) => errors.push(FieldError::new(
            "v",
            format!("unsupported schema version {other}"),
        )),
        None => errors.push(FieldError::new("v", "missing or not an integer")),
    }

    match obj.get("ts").and_then(Value::as_f64) {
        Some(ts) if ts.is_finite() && ts >= 0.0 && ts <= now + MAX_CLOCK_SKEW_SECS => {}
        Some(_) => errors.push(FieldError::new(
            "ts",
            "must be non-negative and at most 60s in the future",
        )),
        None => errors.push(FieldError::new("ts", "missing or not a number")),
    }

    match obj.get("session_id").and_then(Value::as_str) {
        Some("") => errors.push(FieldError::new("session_id", "must be non-empty")),
        Some(s) if s.len() > MAX_SESSION_ID_BYTES => errors.push(FieldError::new(
            "session_id",
            format!("exceeds {MAX_SESSION_ID_BYTES} bytes"),
        )),
        Some(_) => {}
        None => errors.push(FieldError::new("session_id", "missing or not a string")),
    }

    if let Some(id) = obj.get("id") {
        match id.as_str() {
            Some(s) if id_offset(s).is_some() => {}
            _ => errors.push(FieldError::new(
                "id",
                "must have the form <source>:<non-negative offset>",
            )),
        }
    }

    if let Some(meta) = obj.get("metadata") {
        if !meta.is_object() {
            errors.push(FieldError::new("metadata", "must be a JSON object"));
        } else if serialized_len(meta) > MAX_METADATA_BYTES {
            errors.push(FieldError::new(
                "metadata",
                format!("exceeds {MAX_METADATA_BYTES} bytes serialized"),
            ));
        }
    }

    let kind = match obj.get("type").and_then(Value::as_str) {
        Some(s) => match EventKind::parse(s) {
            Some(kind) => Some(kind),
            None => {
                errors.push(FieldError::new("type", format!("unrecognized type '{s}'")));
                None
            }
        },
        None => {
            errors.push(FieldError::new("type", "missing or not a string"));
            None
        }
    };

    match kind {
        Some(EventKind::FileTouch) => {
            check_str(obj, "path", MAX_PATH_BYTES, true, &mut errors);
            check_enum(obj, "kind", &["read", "write"], true, &mut errors);
        }
        Some(EventKind::ToolCall) => {
            check_str(obj, "tool", MAX_TOOL_BYTES, true, &mut errors);
            check_enum(obj, "phase", &["start", "end"], true, &mut errors);
            check_str(obj, "command", MAX_COMMAND_BYTES, false, &mut errors);
        }
        Some(EventKind::Session) => {
            check_enum(
                obj,
                "state",
                &["start", "stop", "interrupt", "crash"],
                true,
                &mut errors,
            );
            check_str(obj, "repo_root", MAX_PATH_BYTES, false, &mut errors);
        }
        Some(EventKind::AgentState) => {
            check_enum(obj, "state", &["thinking", "responding"], true, &mut errors);
        }
        Some(EventKind::Unknown) => {
            if let Some(keys) = obj.get("payload_keys") {
                match keys.as_array() {
                    Some(arr) if arr.len() > MAX_PAYLOAD_KEYS => errors.push(FieldError::new(
                        "payload_keys",
                        format!("exceeds {MAX_PAYLOAD_KEYS} entries"),
                    )),
                    Some(arr) if arr.iter().any(|k| !k.is_string()) => {
                        errors.push(FieldError::new("payload_keys", "entries must be strings"))
                    }
                    Some(_) => {}
                    None => errors.push(FieldError::new("payload_keys", "must be an array")),
                }
            }
            check_str(obj, "reason", MAX_REASON_BYTES, false, &mut errors);
            check_str(obj, "hook_event_name", MAX_HOOK_NAME_BYTES, false, &mut errors);
        }
        None => {}
    }

    if errors.is_empty() { Ok(()) } else { Err(errors) }
}

fn check_str(
    obj: &Map<String, Value>,
    key: &str,
    max: usize,
    required: bool,
    errors: &mut Vec<FieldError>,
) {
    match obj.get(key) {
        Some(v) => match v.as_str() {
            Some(s) if s.len() > max => {
                errors.push(FieldError::new(key, format!("exceeds {max} bytes")));
            }
            Some(_) => {}
            None => errors.push(FieldError::new(key, "must be a string")),
        },
        None if required => errors.push(FieldError::new(key, "missing")),
        None => {}
    }
}

fn check_enum(
    obj: &Map<String, Value>,
    key: &str,
    allowed: &[&str],
    required: bool,
    errors: &mut Vec<FieldError>,
) {
    match obj.get(key).and_then(Value::as_str) {
        Some(s) if allowed.contains(&s) => {}
        Some(s) => errors.push(FieldError::new(
            key,
            format!("'{s}' is not one of {allowed:?}"),
        )),
        None if required => errors.push(FieldError::new(key, "missing or not a string")),
        None => {}
    }
}

fn serialized_len(value: &Value) -> usize {
    serde_json::to_string(value).map(|s| s.len()).unwrap_or(0)
}
