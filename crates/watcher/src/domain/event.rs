#![forbid(unsafe_code)]

use crate::domain::{EventId, RegionId};
use config::Scope;
use serde::{Deserialize, Serialize};
use serde_json::{Map, Value};

/// What the fault handler knows at interception time. Plain old data so it
/// can be built and queued without touching the allocator.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct FastPathEvent {
    pub id: EventId,
    pub timestamp_ns: u64,
    /// Base address of the watched region the fault fell into.
    pub region_base: usize,
    pub fault_address: usize,
    pub thread_id: Option<u32>,
    pub instruction_pointer: u64,
}

/// One changed byte. Serialized as `{"offset": n, "before": "0xHH", "after": "0xHH"}`.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
pub struct ByteDelta {
    pub offset: usize,
    #[serde(with = "hex_byte")]
    pub before: u8,
    #[serde(with = "hex_byte")]
    pub after: u8,
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Symbol {
    pub function: String,
    pub file: String,
    pub line: u32,
}

impl Symbol {
    pub const UNKNOWN_FUNCTION: &'static str = "??";

    pub fn unknown() -> Self {
        Self {
            function: Self::UNKNOWN_FUNCTION.into(),
            file: String::new(),
            line: 0,
        }
    }

    pub fn is_unknown(&self) -> bool {
        self.function == Self::UNKNOWN_FUNCTION
    }
}

/// Database activity the mutating thread was part of, supplied by the
/// adapter layer. Opaque to the core apart from `operation`.
#[derive(Debug, Clone, Default, PartialEq, Serialize, Deserialize)]
pub struct SqlContext {
    pub operation: String,
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub query_fingerprint: Option<String>,
    #[serde(flatten)]
    pub extra: Map<String, Value>,
}

impl SqlContext {
    pub fn new(operation: impl Into<String>) -> Self {
        Self {
            operation: operation.into(),
            ..Default::default()
        }
    }

    pub fn with_fingerprint(mut self, fingerprint: impl Into<String>) -> Self {
        self.query_fingerprint = Some(fingerprint.into());
        self
    }
}

#[derive(Debug, Clone, PartialEq)]
pub struct EnrichedEvent {
    pub id: EventId,
    pub timestamp_ns: u64,
    pub symbol: Symbol,
    pub thread_id: Option<u32>,
    pub deltas: Vec<ByteDelta>,
    pub region_id: RegionId,
    pub region_name: String,
    pub sql_context: Option<SqlContext>,
    pub scope: Option<Scope>,
    pub annotations: Map<String, Value>,
}

impl EnrichedEvent {
    pub fn record(&self) -> EventRecord {
        EventRecord {
            event_id: self.id.to_string(),
            timestamp_ns: self.timestamp_ns,
            variable_id: self.region_id.to_string(),
            variable_name: self.region_name.clone(),
            function: self.symbol.function.clone(),
            file: self.symbol.file.clone(),
            line: self.symbol.line,
            thread_id: self.thread_id,
            deltas: self.deltas.clone(),
            sql_context: self.sql_context.clone(),
            scope: self.scope,
            annotations: self.annotations.clone(),
        }
    }

    /// Fold a filter-supplied map into `annotations`; later keys win.
    pub fn merge_annotations(&mut self, extra: Map<String, Value>) {
        self.annotations.extend(extra);
    }
}

/// One line of the event log. Field names are consumed by downstream tools
/// and must not change.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct EventRecord {
    pub event_id: String,
    pub timestamp_ns: u64,
    pub variable_id: String,
    pub variable_name: String,
    pub function: String,
    pub file: String,
    pub line: u32,
    pub thread_id: Option<u32>,
    pub deltas: Vec<ByteDelta>,
    pub sql_context: Option<SqlContext>,
    pub scope: Option<Scope>,
    #[serde(default, skip_serializing_if = "Map::is_empty")]
    pub annotations: Map<String, Value>,
}

mod hex_byte {
    use serde::{Deserialize, Deserializer, Serializer, de};

    pub fn serialize<S: Serializer>(byte: &u8, serializer: S) -> Result<S::Ok, S::Error> {
        serializer.serialize_str(&format!("{byte:#04x}"))
    }

    pub fn deserialize<'de, D: Deserializer<'de>>(deserializer: D) -> Result<u8, D::Error> {
        let text = String::deserialize(deserializer)?;
        let digits = text
            .strip_prefix("0x")
            .ok_or_else(|| de::Error::custom(format!("expected 0x-prefixed byte, got {text}")))?;
        u8::from_str_radix(digits, 16).map_err(de::Error::custom)
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use pretty_assertions::assert_eq;
    use serde_json::json;

    fn sample() -> EnrichedEvent {
        EnrichedEvent {
            id: EventId(1),
            timestamp_ns: 42,
            symbol: Symbol::unknown(),
            thread_id: Some(7),
            deltas: vec![ByteDelta {
                offset: 3,
                before: 0x0a,
                after: 0xff,
            }],
            region_id: RegionId::from("var-9"),
            region_name: "counter".into(),
            sql_context: Some(SqlContext::new("INSERT").with_fingerprint("q1")),
            scope: Some(Scope::Global),
            annotations: Map::new(),
        }
    }

    #[test]
    fn record_has_stable_field_names() {
        let value = serde_json::to_value(sample().record()).unwrap();
        assert_eq!(
            value,
            json!({
                "event_id": "evt-0000000000000001",
                "timestamp_ns": 42,
                "variable_id": "var-9",
                "variable_name": "counter",
                "function": "??",
                "file": "",
                "line": 0,
                "thread_id": 7,
                "deltas": [{"offset": 3, "before": "0x0a", "after": "0xff"}],
                "sql_context": {"operation": "INSERT", "query_fingerprint": "q1"},
                "scope": "global",
            })
        );
    }

    #[test]
    fn annotations_appear_once_added() {
        let mut event = sample();
        event.merge_annotations(Map::from_iter([("reviewed".to_string(), json!(true))]));
        let value = serde_json::to_value(event.record()).unwrap();
        assert_eq!(value["annotations"], json!({"reviewed": true}));
    }

    #[test]
    fn record_parses_back() {
        let record = sample().record();
        let line = serde_json::to_string(&record).unwrap();
        let parsed: EventRecord = serde_json::from_str(&line).unwrap();
        assert_eq!(parsed, record);
    }
}
