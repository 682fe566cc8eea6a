use regex::Regex;
use std::fmt;

use chainsaw_types::{LogLevel, Record};

use crate::error::{Result, RuleError};
use crate::resolver::Field;
use crate::rule::Rule;

/// Comparison operator for [`LevelRule`]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum Inequality {
    Less,
    LessOrEqual,
    Greater,
    GreaterOrEqual,
    Equal,
    NotEqual,
}

impl Inequality {
    pub fn parse(symbol: &str) -> Result<Self> {
        match symbol {
            "<" => Ok(Self::Less),
            "<=" => Ok(Self::LessOrEqual),
            ">" => Ok(Self::Greater),
            ">=" => Ok(Self::GreaterOrEqual),
            "==" | "=" => Ok(Self::Equal),
            "!=" => Ok(Self::NotEqual),
            other => Err(RuleError::InvalidOperator(other.to_string())),
        }
    }

    fn holds(&self, left: u8, right: u8) -> bool {
        match self {
            Self::Less => left < right,
            Self::LessOrEqual => left <= right,
            Self::Greater => left > right,
            Self::GreaterOrEqual => left >= right,
            Self::Equal => left == right,
            Self::NotEqual => left != right,
        }
    }
}

/// Compares a record's level against a fixed level by severity
#[derive(Clone, Debug)]
pub struct LevelRule {
    op: Inequality,
    level: LogLevel,
}

impl LevelRule {
    /// Create a rule from an operator symbol and a level name
    pub fn new(symbol: &str, level: &str) -> Result<Self> {
        let op = Inequality::parse(symbol)?;
        let level = match LogLevel::parse(level) {
            LogLevel::Unknown => return Err(RuleError::UnknownLevel(level.to_string())),
            known => known,
        };
        Ok(Self { op, level })
    }

    /// Records at or above a level
    pub fn at_least(level: LogLevel) -> Self {
        Self {
            op: Inequality::GreaterOrEqual,
            level,
        }
    }

    /// Records at exactly a level
    pub fn exactly(level: LogLevel) -> Self {
        Self {
            op: Inequality::Equal,
            level,
        }
    }
}

impl Rule for LevelRule {
    fn evaluate(&self, record: &Record) -> bool {
        // Exact equality keeps Unknown distinct from Info
        match self.op {
            Inequality::Equal => record.level == self.level,
            Inequality::NotEqual => record.level != self.level,
            op => op.holds(record.level.severity(), self.level.severity()),
        }
    }
}

/// Field equals a value
#[derive(Clone, Debug)]
pub struct EqualsRule {
    field: Field,
    value: String,
}

impl EqualsRule {
    pub fn new(field: &str, value: impl Into<String>) -> Result<Self> {
        let field = Field::parse(field).ok_or_else(|| RuleError::UnknownField(field.to_string()))?;
        Ok(Self {
            field,
            value: value.into(),
        })
    }
}

impl Rule for EqualsRule {
    fn evaluate(&self, record: &Record) -> bool {
        match &self.field {
            // Level names compare case-insensitively
            Field::Level => record.level == LogLevel::parse(&self.value),
            field => field.value(record) == self.value,
        }
    }
}

/// Field matches a regular expression
#[derive(Clone)]
pub struct LikeRule {
    field: Field,
    regex: Regex,
    pattern: String,
}

impl LikeRule {
    pub fn new(field: &str, pattern: &str) -> Result<Self> {
        Self::build(field, pattern, Regex::new(pattern)?)
    }

    /// Create a case-insensitive rule
    pub fn new_case_insensitive(field: &str, pattern: &str) -> Result<Self> {
        // Prepend (?i) for case insensitive matching
        Self::build(field, pattern, Regex::new(&format!("(?i){}", pattern))?)
    }

    fn build(field: &str, pattern: &str, regex: Regex) -> Result<Self> {
        let field = Field::parse(field).ok_or_else(|| RuleError::UnknownField(field.to_string()))?;
        Ok(Self {
            field,
            regex,
            pattern: pattern.to_string(),
        })
    }
}

impl Rule for LikeRule {
    fn evaluate(&self, record: &Record) -> bool {
        self.regex.is_match(&self.field.value(record))
    }
}

impl fmt::Debug for LikeRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("LikeRule")
            .field("field", &self.field)
            .field("pattern", &self.pattern)
            .finish()
    }
}

/// Case-insensitive substring search across the textual fields of a record
#[derive(Clone, Debug)]
pub struct PartialTextRule {
    needle: String,
}

impl PartialTextRule {
    pub fn new(text: &str) -> Self {
        Self {
            needle: text.to_lowercase(),
        }
    }
}

impl Rule for PartialTextRule {
    fn evaluate(&self, record: &Record) -> bool {
        if self.needle.is_empty() {
            return true;
        }
        let location = &record.location;
        let candidates = [
            Some(record.logger.as_str()),
            Some(record.message.as_str()),
            Some(record.thread.as_str()),
            record.ndc.as_deref(),
            location.class_name.as_deref(),
            location.method_name.as_deref(),
            location.file_name.as_deref(),
        ];
        candidates
            .into_iter()
            .flatten()
            .chain(record.properties.values().map(String::as_str))
            .any(|text| text.to_lowercase().contains(&self.needle))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn entry(level: LogLevel, message: &str) -> Record {
        Record::new("svc", level, message)
    }

    #[test]
    fn test_level_rule() {
        let rule = LevelRule::new(">=", "warn").unwrap();
        assert!(rule.evaluate(&entry(LogLevel::Error, "x")));
        assert!(rule.evaluate(&entry(LogLevel::Warn, "x")));
        assert!(!rule.evaluate(&entry(LogLevel::Info, "x")));

        let below = LevelRule::new("<", "INFO").unwrap();
        assert!(below.evaluate(&entry(LogLevel::Debug, "x")));
        assert!(!below.evaluate(&entry(LogLevel::Info, "x")));
    }

    #[test]
    fn test_level_rule_rejects_bad_input() {
        assert!(matches!(
            LevelRule::new("=>", "warn"),
            Err(RuleError::InvalidOperator(_))
        ));
        assert!(matches!(
            LevelRule::new(">", "loud"),
            Err(RuleError::UnknownLevel(_))
        ));
    }

    #[test]
    fn test_equals_rule() {
        let rule = EqualsRule::new("LEVEL", "error").unwrap();
        assert!(rule.evaluate(&entry(LogLevel::Error, "x")));
        assert!(!rule.evaluate(&entry(LogLevel::Info, "x")));

        let by_prop = EqualsRule::new("PROP.hostname", "web1").unwrap();
        let record = entry(LogLevel::Info, "x").with_property("hostname", "web1");
        assert!(by_prop.evaluate(&record));
    }

    #[test]
    fn test_like_rule() {
        let rule = LikeRule::new("MSG", "time(d)?out").unwrap();
        assert!(rule.evaluate(&entry(LogLevel::Info, "connection timeout")));
        assert!(!rule.evaluate(&entry(LogLevel::Info, "fine")));

        let ci = LikeRule::new_case_insensitive("MSG", "error").unwrap();
        assert!(ci.evaluate(&entry(LogLevel::Info, "An ERROR occurred")));
        assert!(!ci.evaluate(&entry(LogLevel::Info, "all good")));
    }

    #[test]
    fn test_like_rule_invalid_pattern() {
        assert!(matches!(
            LikeRule::new("MSG", "(unclosed"),
            Err(RuleError::Pattern(_))
        ));
    }

    #[test]
    fn test_partial_text_rule() {
        let rule = PartialTextRule::new("Disk");
        assert!(rule.evaluate(&entry(LogLevel::Info, "disk full")));
        let record = entry(LogLevel::Info, "x").with_property("device", "DISK0");
        assert!(rule.evaluate(&record));
        assert!(!rule.evaluate(&entry(LogLevel::Info, "network")));
    }
}
