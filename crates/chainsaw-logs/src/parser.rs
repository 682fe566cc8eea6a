use chrono::{DateTime, TimeZone, Utc};
use serde_json::{Map, Value};

use chainsaw_types::{LogLevel, Record};

/// Common field names for log level
const LEVEL_FIELDS: [&str; 8] = [
    "level",
    "lvl",
    "severity",
    "log.level",
    "loglevel",
    "log_level",
    "Level",
    "LEVEL",
];

const MESSAGE_FIELDS: [&str; 4] = ["msg", "message", "Message", "text"];

const LOGGER_FIELDS: [&str; 5] = ["logger", "logger_name", "loggerName", "name", "target"];

const THREAD_FIELDS: [&str; 3] = ["thread", "thread_name", "threadName"];

const TIMESTAMP_FIELDS: [&str; 5] = ["timestamp", "time", "@timestamp", "ts", "date"];

/// Turns raw input lines into records
pub struct LineParser;

impl LineParser {
    /// Parse a raw line. `source` names the logger when the line carries none.
    pub fn parse(raw: &str, source: &str) -> Record {
        let (timestamp, content) = Self::extract_timestamp(raw);

        let (record, payload_time) = match Self::try_parse_json(content) {
            Some(fields) => Self::record_from_json(fields, source),
            None => (
                Record::new(source, Self::extract_level_from_text(content), content),
                None,
            ),
        };

        // A prefix timestamp wins over one in the payload
        match timestamp.or(payload_time) {
            Some(ts) => record.with_timestamp(ts),
            None => record,
        }
    }

    /// Extract an RFC 3339 timestamp prefix (`2024-01-15T10:30:00.123Z ...`)
    fn extract_timestamp(raw: &str) -> (Option<DateTime<Utc>>, &str) {
        if raw.len() >= 20 {
            // The 'Z' ending the timestamp sits within the first ~35 chars
            let search_end = Self::floor_char_boundary(raw, 35.min(raw.len()));
            if let Some(z_pos) = raw.get(..search_end).and_then(|s| s.find('Z')) {
                let ts_str = &raw[..=z_pos];
                if let Ok(ts) = DateTime::parse_from_rfc3339(ts_str) {
                    let remaining = raw[z_pos + 1..].trim_start();
                    return (Some(ts.with_timezone(&Utc)), remaining);
                }
            }
        }
        (None, raw)
    }

    /// Largest char boundary <= `idx`
    fn floor_char_boundary(s: &str, mut idx: usize) -> usize {
        if idx >= s.len() {
            return s.len();
        }
        while idx > 0 && !s.is_char_boundary(idx) {
            idx -= 1;
        }
        idx
    }

    fn try_parse_json(content: &str) -> Option<Map<String, Value>> {
        let trimmed = content.trim();
        if !trimmed.starts_with('{') {
            return None;
        }
        match serde_json::from_str(trimmed).ok()? {
            Value::Object(fields) => Some(fields),
            _ => None,
        }
    }

    fn record_from_json(
        mut fields: Map<String, Value>,
        source: &str,
    ) -> (Record, Option<DateTime<Utc>>) {
        let level = Self::take_first(&mut fields, &LEVEL_FIELDS)
            .map_or(LogLevel::Unknown, |value| Self::level_from_json(&value));
        let message = Self::take_first(&mut fields, &MESSAGE_FIELDS)
            .map(|value| Self::text(&value))
            .unwrap_or_default();
        let logger = Self::take_first(&mut fields, &LOGGER_FIELDS)
            .map(|value| Self::text(&value))
            .unwrap_or_else(|| source.to_string());

        let mut record = Record::new(logger, level, message);
        if let Some(thread) = Self::take_first(&mut fields, &THREAD_FIELDS) {
            record.thread = Self::text(&thread);
        }
        let timestamp = Self::take_first(&mut fields, &TIMESTAMP_FIELDS)
            .and_then(|value| Self::timestamp_from_json(&value));

        for (key, value) in fields {
            record.properties.insert(key, Self::text(&value));
        }
        (record, timestamp)
    }

    fn take_first(fields: &mut Map<String, Value>, names: &[&str]) -> Option<Value> {
        names.iter().find_map(|name| fields.remove(*name))
    }

    fn text(value: &Value) -> String {
        match value {
            Value::String(s) => s.clone(),
            other => other.to_string(),
        }
    }

    fn level_from_json(value: &Value) -> LogLevel {
        match value {
            Value::String(s) => LogLevel::parse(s),
            // Numeric levels (pino, bunyan)
            Value::Number(n) => match n.as_u64() {
                Some(0..=10) => LogLevel::Trace,
                Some(11..=20) => LogLevel::Debug,
                Some(21..=30) => LogLevel::Info,
                Some(31..=40) => LogLevel::Warn,
                Some(41..=50) => LogLevel::Error,
                Some(_) => LogLevel::Fatal,
                None => LogLevel::Unknown,
            },
            _ => LogLevel::Unknown,
        }
    }

    fn timestamp_from_json(value: &Value) -> Option<DateTime<Utc>> {
        match value {
            Value::String(s) => DateTime::parse_from_rfc3339(s)
                .ok()
                .map(|ts| ts.with_timezone(&Utc)),
            // Epoch milliseconds
            Value::Number(n) => n
                .as_i64()
                .and_then(|millis| Utc.timestamp_millis_opt(millis).single()),
            _ => None,
        }
    }

    /// Detect a level from plain text patterns
    fn extract_level_from_text(content: &str) -> LogLevel {
        let upper = content.to_uppercase();

        let bracket_patterns = [
            ("[FATAL]", LogLevel::Fatal),
            ("[PANIC]", LogLevel::Fatal),
            ("[CRITICAL]", LogLevel::Fatal),
            ("[ERROR]", LogLevel::Error),
            ("[ERR]", LogLevel::Error),
            ("[WARN]", LogLevel::Warn),
            ("[WARNING]", LogLevel::Warn),
            ("[INFO]", LogLevel::Info),
            ("[DEBUG]", LogLevel::Debug),
            ("[TRACE]", LogLevel::Trace),
        ];
        let colon_patterns = [
            ("FATAL:", LogLevel::Fatal),
            ("ERROR:", LogLevel::Error),
            ("WARNING:", LogLevel::Warn),
            ("WARN:", LogLevel::Warn),
            ("INFO:", LogLevel::Info),
            ("DEBUG:", LogLevel::Debug),
            ("TRACE:", LogLevel::Trace),
        ];
        let spaced_patterns = [
            (" FATAL ", LogLevel::Fatal),
            (" ERROR ", LogLevel::Error),
            (" WARN ", LogLevel::Warn),
            (" WARNING ", LogLevel::Warn),
            (" INFO ", LogLevel::Info),
            (" DEBUG ", LogLevel::Debug),
            (" TRACE ", LogLevel::Trace),
        ];

        let contained = bracket_patterns
            .iter()
            .chain(colon_patterns.iter())
            .chain(spaced_patterns.iter())
            .find(|(pattern, _)| upper.contains(pattern));
        if let Some((_, level)) = contained {
            return *level;
        }

        let start_patterns = [
            ("FATAL", LogLevel::Fatal),
            ("ERROR", LogLevel::Error),
            ("WARN", LogLevel::Warn),
            ("INFO", LogLevel::Info),
            ("DEBUG", LogLevel::Debug),
            ("TRACE", LogLevel::Trace),
        ];
        let trimmed_upper = upper.trim_start();
        start_patterns
            .iter()
            .find(|(pattern, _)| trimmed_upper.starts_with(pattern))
            .map_or(LogLevel::Unknown, |(_, level)| *level)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_parse_timestamp_prefix() {
        let line = "2024-01-15T10:30:00.123456789Z some log message";
        let record = LineParser::parse(line, "stdin");
        assert_eq!(record.timestamp.to_rfc3339(), "2024-01-15T10:30:00.123456789+00:00");
        assert_eq!(record.message, "some log message");
        assert_eq!(record.logger, "stdin");
    }

    #[test]
    fn test_parse_json_line() {
        let line = r#"{"level":"error","msg":"something failed","logger":"db","hostname":"web1","pid":42}"#;
        let record = LineParser::parse(line, "stdin");
        assert_eq!(record.level, LogLevel::Error);
        assert_eq!(record.message, "something failed");
        assert_eq!(record.logger, "db");
        assert_eq!(record.property("hostname"), Some("web1"));
        assert_eq!(record.property("pid"), Some("42"));
        assert_eq!(record.property("level"), None);
    }

    #[test]
    fn test_parse_json_numeric_level_and_time() {
        let line = r#"{"level":50,"msg":"x","time":1700000000000}"#;
        let record = LineParser::parse(line, "stdin");
        assert_eq!(record.level, LogLevel::Error);
        assert_eq!(record.timestamp.timestamp_millis(), 1_700_000_000_000);
    }

    #[test]
    fn test_parse_text_level() {
        assert_eq!(LineParser::parse("[ERROR] went wrong", "s").level, LogLevel::Error);
        assert_eq!(LineParser::parse("WARN: disk", "s").level, LogLevel::Warn);
        assert_eq!(LineParser::parse("just words", "s").level, LogLevel::Unknown);
    }

    #[test]
    fn test_parse_multibyte_utf8_no_panic() {
        let line = "─────────────────────────────────────────";
        let record = LineParser::parse(line, "s");
        assert_eq!(record.message, line);

        let line = "2024-01-15T10:30:00Z ╭────────────────────────────╮";
        let record = LineParser::parse(line, "s");
        assert_eq!(record.timestamp.to_rfc3339(), "2024-01-15T10:30:00+00:00");
    }
}
