//! Shared types for chainsaw
//!
//! This crate contains the record model used across the rule, store and
//! dispatch crates.

use chrono::{DateTime, Utc};
use std::cmp::Ordering;
use std::collections::HashMap;
use std::fmt;
use std::sync::{Arc, OnceLock};

// ============================================================================
// Well-known property keys
// ============================================================================

/// Property carrying a pre-assigned record identity
pub const ID_PROPERTY: &str = "log4jid";

/// Property carrying the event type of a record
pub const EVENT_TYPE_PROPERTY: &str = "log4j.eventtype";

/// Event type assumed when a record does not carry one
pub const DEFAULT_EVENT_TYPE: &str = "log4j";

// ============================================================================
// Log Types
// ============================================================================

/// Log severity level
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash, Default)]
pub enum LogLevel {
    Trace,
    Debug,
    #[default]
    Info,
    Warn,
    Error,
    Fatal,
    Unknown,
}

impl LogLevel {
    /// All levels in severity order
    pub const ALL: [LogLevel; 7] = [
        Self::Trace,
        Self::Debug,
        Self::Info,
        Self::Warn,
        Self::Error,
        Self::Fatal,
        Self::Unknown,
    ];

    /// Parse log level from common formats
    pub fn parse(s: &str) -> Self {
        match s.trim().to_lowercase().as_str() {
            "trace" | "trc" | "trce" | "finest" | "finer" => Self::Trace,
            "debug" | "dbg" | "debg" | "fine" | "config" => Self::Debug,
            "info" | "inf" | "information" => Self::Info,
            "warn" | "warning" | "wrn" => Self::Warn,
            "error" | "err" | "erro" | "severe" => Self::Error,
            "fatal" | "panic" | "critical" | "crit" | "ftl" => Self::Fatal,
            _ => Self::Unknown,
        }
    }

    /// Numeric severity used for comparisons
    pub fn severity(&self) -> u8 {
        match self {
            Self::Trace => 0,
            Self::Debug => 1,
            Self::Info => 2,
            Self::Warn => 3,
            Self::Error => 4,
            Self::Fatal => 5,
            Self::Unknown => 2, // Treat unknown as info level
        }
    }

    /// Short display string (3 chars)
    pub fn as_str(&self) -> &'static str {
        match self {
            Self::Trace => "TRC",
            Self::Debug => "DBG",
            Self::Info => "INF",
            Self::Warn => "WRN",
            Self::Error => "ERR",
            Self::Fatal => "FTL",
            Self::Unknown => "???",
        }
    }

    /// Full upper-case name, as written by logging frameworks
    pub fn name(&self) -> &'static str {
        match self {
            Self::Trace => "TRACE",
            Self::Debug => "DEBUG",
            Self::Info => "INFO",
            Self::Warn => "WARN",
            Self::Error => "ERROR",
            Self::Fatal => "FATAL",
            Self::Unknown => "UNKNOWN",
        }
    }

    fn index(&self) -> usize {
        match self {
            Self::Trace => 0,
            Self::Debug => 1,
            Self::Info => 2,
            Self::Warn => 3,
            Self::Error => 4,
            Self::Fatal => 5,
            Self::Unknown => 6,
        }
    }
}

impl fmt::Display for LogLevel {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.name())
    }
}

/// Source location of the logging call. Every part may be unknown.
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LocationInfo {
    pub class_name: Option<String>,
    pub file_name: Option<String>,
    pub line_number: Option<u32>,
    pub method_name: Option<String>,
}

impl LocationInfo {
    /// True when nothing about the location is known
    pub fn is_unknown(&self) -> bool {
        self.class_name.is_none()
            && self.file_name.is_none()
            && self.line_number.is_none()
            && self.method_name.is_none()
    }
}

/// A single log event.
///
/// All fields are fixed once the record is handed to the pipeline. The only
/// state written afterwards is the identity, which is set exactly once when the
/// record is first admitted into an event store.
#[derive(Clone, Debug)]
pub struct Record {
    /// Event time
    pub timestamp: DateTime<Utc>,

    /// Severity
    pub level: LogLevel,

    /// Logical source (logger) name
    pub logger: String,

    /// Rendered message
    pub message: String,

    /// Name of the thread that logged the event
    pub thread: String,

    /// Nested diagnostic context
    pub ndc: Option<String>,

    /// Location of the logging call
    pub location: LocationInfo,

    /// Stack trace lines of an attached throwable
    pub throwable: Vec<String>,

    /// Open-ended property bag
    pub properties: HashMap<String, String>,

    identity: OnceLock<u64>,
}

/// Records are shared between the dispatch queue and every store they land in
pub type ArcRecord = Arc<Record>;

impl Record {
    /// Create a new record with minimal fields
    pub fn new(logger: impl Into<String>, level: LogLevel, message: impl Into<String>) -> Self {
        Self {
            timestamp: Utc::now(),
            level,
            logger: logger.into(),
            message: message.into(),
            thread: String::new(),
            ndc: None,
            location: LocationInfo::default(),
            throwable: Vec::new(),
            properties: HashMap::new(),
            identity: OnceLock::new(),
        }
    }

    pub fn with_timestamp(mut self, timestamp: DateTime<Utc>) -> Self {
        self.timestamp = timestamp;
        self
    }

    pub fn with_thread(mut self, thread: impl Into<String>) -> Self {
        self.thread = thread.into();
        self
    }

    pub fn with_ndc(mut self, ndc: impl Into<String>) -> Self {
        self.ndc = Some(ndc.into());
        self
    }

    pub fn with_location(mut self, location: LocationInfo) -> Self {
        self.location = location;
        self
    }

    pub fn with_throwable(mut self, lines: Vec<String>) -> Self {
        self.throwable = lines;
        self
    }

    pub fn with_property(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.properties.insert(key.into(), value.into());
        self
    }

    /// Look up a property value
    pub fn property(&self, key: &str) -> Option<&str> {
        self.properties.get(key).map(String::as_str)
    }

    /// Event type, defaulting to [`DEFAULT_EVENT_TYPE`]
    pub fn event_type(&self) -> &str {
        self.property(EVENT_TYPE_PROPERTY)
            .unwrap_or(DEFAULT_EVENT_TYPE)
    }

    /// Identity carried in the [`ID_PROPERTY`] property, if it is numeric
    pub fn seeded_identity(&self) -> Option<u64> {
        self.property(ID_PROPERTY)
            .and_then(|v| v.trim().parse().ok())
    }

    /// Identity, if one has been assigned
    pub fn identity(&self) -> Option<u64> {
        self.identity.get().copied()
    }

    /// Return the identity, assigning one on first call.
    ///
    /// A numeric [`ID_PROPERTY`] wins over `next`; `next` is only invoked when
    /// neither an assigned identity nor a seeded one exists.
    pub fn identity_or_assign(&self, next: impl FnOnce() -> u64) -> u64 {
        *self
            .identity
            .get_or_init(|| self.seeded_identity().unwrap_or_else(next))
    }

    /// Throwable text joined into one string
    pub fn throwable_text(&self) -> String {
        self.throwable.concat()
    }

    /// Properties rendered as `key=value` pairs sorted by key
    pub fn properties_text(&self) -> String {
        let mut pairs: Vec<_> = self.properties.iter().collect();
        pairs.sort();
        pairs
            .into_iter()
            .map(|(k, v)| format!("{}={}", k, v))
            .collect::<Vec<_>>()
            .join(",")
    }
}

// ============================================================================
// Columns
// ============================================================================

/// Fixed columns every record exposes, in display order
#[derive(Clone, Copy, Debug, PartialEq, Eq, Hash)]
pub enum Column {
    Logger,
    Timestamp,
    Level,
    Thread,
    Message,
    Ndc,
    Throwable,
    Class,
    Method,
    File,
    Line,
    Properties,
    Id,
}

impl Column {
    pub const ALL: [Column; 13] = [
        Self::Logger,
        Self::Timestamp,
        Self::Level,
        Self::Thread,
        Self::Message,
        Self::Ndc,
        Self::Throwable,
        Self::Class,
        Self::Method,
        Self::File,
        Self::Line,
        Self::Properties,
        Self::Id,
    ];

    /// Column at a fixed index
    pub fn from_index(index: usize) -> Option<Self> {
        Self::ALL.get(index).copied()
    }

    /// Column header
    pub fn name(&self) -> &'static str {
        match self {
            Self::Logger => "Logger",
            Self::Timestamp => "Timestamp",
            Self::Level => "Level",
            Self::Thread => "Thread",
            Self::Message => "Message",
            Self::Ndc => "NDC",
            Self::Throwable => "Throwable",
            Self::Class => "Class",
            Self::Method => "Method",
            Self::File => "File",
            Self::Line => "Line",
            Self::Properties => "Properties",
            Self::Id => "ID",
        }
    }

    /// Text rendering of this column for a record
    pub fn text(&self, record: &Record) -> String {
        match self {
            Self::Logger => record.logger.clone(),
            Self::Timestamp => record.timestamp.to_rfc3339(),
            Self::Level => record.level.name().to_string(),
            Self::Thread => record.thread.clone(),
            Self::Message => record.message.clone(),
            Self::Ndc => record.ndc.clone().unwrap_or_default(),
            Self::Throwable => record.throwable_text(),
            Self::Class => record.location.class_name.clone().unwrap_or_default(),
            Self::Method => record.location.method_name.clone().unwrap_or_default(),
            Self::File => record.location.file_name.clone().unwrap_or_default(),
            Self::Line => record
                .location
                .line_number
                .map(|n| n.to_string())
                .unwrap_or_default(),
            Self::Properties => record.properties_text(),
            Self::Id => record.identity().map(|n| n.to_string()).unwrap_or_default(),
        }
    }

    /// Comparable projection of this column for sorting
    pub fn sort_key<'a>(&self, record: &'a Record) -> SortKey<'a> {
        match self {
            Self::Timestamp => SortKey::Time(record.timestamp),
            Self::Level => SortKey::Number(i128::from(record.level.severity())),
            Self::Line => record
                .location
                .line_number
                .map_or(SortKey::Missing, |n| SortKey::Number(i128::from(n))),
            Self::Id => record
                .identity()
                .map_or(SortKey::Missing, |n| SortKey::Number(i128::from(n))),
            Self::Logger => SortKey::Text(record.logger.as_str().into()),
            Self::Thread => SortKey::Text(record.thread.as_str().into()),
            Self::Message => SortKey::Text(record.message.as_str().into()),
            Self::Ndc => record
                .ndc
                .as_deref()
                .map_or(SortKey::Missing, |s| SortKey::Text(s.into())),
            Self::Class => record
                .location
                .class_name
                .as_deref()
                .map_or(SortKey::Missing, |s| SortKey::Text(s.into())),
            Self::Method => record
                .location
                .method_name
                .as_deref()
                .map_or(SortKey::Missing, |s| SortKey::Text(s.into())),
            Self::File => record
                .location
                .file_name
                .as_deref()
                .map_or(SortKey::Missing, |s| SortKey::Text(s.into())),
            Self::Throwable => SortKey::Text(record.throwable_text().into()),
            Self::Properties => SortKey::Text(record.properties_text().into()),
        }
    }
}

/// Comparable value of one cell. Missing values sort first.
#[derive(Clone, Debug, PartialEq, Eq, PartialOrd, Ord)]
pub enum SortKey<'a> {
    Missing,
    /// Wide enough for every `u64` identity
    Number(i128),
    Time(DateTime<Utc>),
    Text(std::borrow::Cow<'a, str>),
}

impl SortKey<'_> {
    /// Compare two keys, optionally reversing the order
    pub fn compare(&self, other: &Self, ascending: bool) -> Ordering {
        let ord = self.cmp(other);
        if ascending { ord } else { ord.reverse() }
    }
}

// ============================================================================
// Level tallies
// ============================================================================

/// Counts per log level
#[derive(Clone, Debug, Default, PartialEq, Eq)]
pub struct LevelCounts {
    counts: [usize; 7],
}

impl LevelCounts {
    pub fn increment(&mut self, level: LogLevel) {
        self.counts[level.index()] += 1;
    }

    pub fn decrement(&mut self, level: LogLevel) {
        let slot = &mut self.counts[level.index()];
        *slot = slot.saturating_sub(1);
    }

    pub fn get(&self, level: LogLevel) -> usize {
        self.counts[level.index()]
    }

    pub fn total(&self) -> usize {
        self.counts.iter().sum()
    }

    pub fn reset(&mut self) {
        self.counts = [0; 7];
    }
}
