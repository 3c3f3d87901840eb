//! One JSONL log record.

use serde::{Deserialize, Serialize};
use serde_json::Value;

/// Severity order used by [`LogRecord::is_at_least`]
const LEVELS: [&str; 5] = ["trace", "debug", "info", "warn", "error"];

/// A single log line
///
/// Records are self-contained so that several nodes sharing a logs folder can
/// append to their own files and the files can be merged by timestamp.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
pub struct LogRecord {
    /// RFC 3339 UTC timestamp with milliseconds
    pub ts: String,
    /// trace, debug, info, warn or error
    pub level: String,
    /// Node name
    pub node: String,
    /// Module path of the event
    pub target: String,
    pub msg: String,
    /// Structured event fields (`peer`, `fingerprint`, `connection`, ...)
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub fields: Option<Value>,
    /// Enclosing spans, outermost first, joined with ` > `
    #[serde(default, skip_serializing_if = "Option::is_none")]
    pub span: Option<String>,
}

impl LogRecord {
    /// Record stamped with the current time
    pub fn now(
        level: impl Into<String>,
        node: impl Into<String>,
        target: impl Into<String>,
        msg: impl Into<String>,
    ) -> Self {
        Self {
            ts: chrono::Utc::now().to_rfc3339_opts(chrono::SecondsFormat::Millis, true),
            level: level.into(),
            node: node.into(),
            target: target.into(),
            msg: msg.into(),
            fields: None,
            span: None,
        }
    }

    pub fn with_fields(mut self, fields: Value) -> Self {
        self.fields = Some(fields);
        self
    }

    pub fn with_span(mut self, span: impl Into<String>) -> Self {
        self.span = Some(span.into());
        self
    }

    /// Whether this record is at `level` or more severe; unknown levels pass
    pub fn is_at_least(&self, level: &str) -> bool {
        let rank = |l: &str| LEVELS.iter().position(|x| x.eq_ignore_ascii_case(l));
        match (rank(&self.level), rank(level)) {
            (Some(ours), Some(min)) => ours >= min,
            _ => true,
        }
    }

    /// Field value as text, if present
    pub fn field(&self, name: &str) -> Option<String> {
        let value = self.fields.as_ref()?.get(name)?;
        Some(match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        })
    }

    /// One JSON line, without the trailing newline
    pub fn to_line(&self) -> serde_json::Result<String> {
        serde_json::to_string(self)
    }

    pub fn parse_line(line: &str) -> serde_json::Result<Self> {
        serde_json::from_str(line)
    }
}
