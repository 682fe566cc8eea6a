use chainsaw_types::{ID_PROPERTY, Record};

use crate::error::{Result, RuleError};

/// Prefix selecting a property from the record's property bag
const PROPERTY_PREFIX: &str = "PROP.";

/// A field of a record that rules and routing expressions can refer to
#[derive(Clone, Debug, PartialEq, Eq, Hash)]
pub enum Field {
    Logger,
    Level,
    Class,
    File,
    Line,
    Method,
    Message,
    Ndc,
    Exception,
    Timestamp,
    Thread,
    /// Property name, case preserved
    Property(String),
}

impl Field {
    /// Parse a field keyword. Keywords are case-insensitive; the property name
    /// after `PROP.` keeps its case.
    pub fn parse(token: &str) -> Option<Self> {
        let upper = token.to_uppercase();
        let field = match upper.as_str() {
            "LOGGER" => Self::Logger,
            "LEVEL" => Self::Level,
            "CLASS" => Self::Class,
            "FILE" => Self::File,
            "LINE" => Self::Line,
            "METHOD" => Self::Method,
            "MSG" => Self::Message,
            "NDC" => Self::Ndc,
            "EXCEPTION" => Self::Exception,
            "TIMESTAMP" => Self::Timestamp,
            "THREAD" => Self::Thread,
            _ => {
                let name = token
                    .get(..PROPERTY_PREFIX.len())
                    .filter(|prefix| prefix.eq_ignore_ascii_case(PROPERTY_PREFIX))
                    .and(token.get(PROPERTY_PREFIX.len()..))?;
                Self::Property(name.to_string())
            }
        };
        Some(field)
    }

    /// Resolve this field against a record. Unknown values resolve to "".
    pub fn value(&self, record: &Record) -> String {
        let location = &record.location;
        match self {
            Self::Logger => record.logger.clone(),
            Self::Level => record.level.name().to_string(),
            Self::Class => location.class_name.clone().unwrap_or_default(),
            Self::File => location.file_name.clone().unwrap_or_default(),
            Self::Line => location
                .line_number
                .map(|n| n.to_string())
                .unwrap_or_default(),
            Self::Method => location.method_name.clone().unwrap_or_default(),
            Self::Message => record.message.clone(),
            Self::Ndc => record.ndc.clone().unwrap_or_default(),
            Self::Exception => record.throwable_text(),
            Self::Timestamp => record.timestamp.timestamp_millis().to_string(),
            Self::Thread => record.thread.clone(),
            Self::Property(name) => match record.property(name) {
                Some(value) => value.to_string(),
                // Counter-assigned identities live outside the property bag
                None if name == ID_PROPERTY => record
                    .identity()
                    .map(|id| id.to_string())
                    .unwrap_or_default(),
                None => String::new(),
            },
        }
    }
}

/// Resolves field names and field expressions against records
pub struct FieldResolver;

impl FieldResolver {
    /// Resolve a single field by name
    pub fn value(field_name: &str, record: &Record) -> Result<String> {
        Field::parse(field_name)
            .map(|field| field.value(record))
            .ok_or_else(|| RuleError::UnknownField(field_name.to_string()))
    }

    /// Substitute every field token in a whitespace-separated expression with
    /// its value. Tokens that are not fields are kept verbatim. Tokens are
    /// joined without separators, so `"PROP.host - LOGGER"` on a record from
    /// host `web1` with logger `app` resolves to `"web1-app"`.
    pub fn apply_fields(expression: &str, record: &Record) -> String {
        expression
            .split_whitespace()
            .map(|token| match Field::parse(token) {
                Some(field) => field.value(record),
                None => token.to_string(),
            })
            .collect()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsaw_types::{LocationInfo, LogLevel};

    fn record() -> Record {
        Record::new("com.example.Service", LogLevel::Warn, "disk almost full")
            .with_thread("main")
            .with_property("hostname", "web1")
            .with_location(LocationInfo {
                class_name: Some("Service".to_string()),
                line_number: Some(42),
                ..LocationInfo::default()
            })
    }

    #[test]
    fn test_parse_keywords_case_insensitive() {
        assert_eq!(Field::parse("logger"), Some(Field::Logger));
        assert_eq!(Field::parse("Msg"), Some(Field::Message));
        assert_eq!(Field::parse("nothing"), None);
    }

    #[test]
    fn test_property_name_keeps_case() {
        assert_eq!(
            Field::parse("prop.HostName"),
            Some(Field::Property("HostName".to_string()))
        );
    }

    #[test]
    fn test_values() {
        let r = record();
        assert_eq!(FieldResolver::value("LEVEL", &r).unwrap(), "WARN");
        assert_eq!(FieldResolver::value("LINE", &r).unwrap(), "42");
        assert_eq!(FieldResolver::value("FILE", &r).unwrap(), "");
        assert_eq!(FieldResolver::value("PROP.missing", &r).unwrap(), "");
        assert!(matches!(
            FieldResolver::value("BOGUS", &r),
            Err(RuleError::UnknownField(_))
        ));
    }

    #[test]
    fn test_apply_fields() {
        let r = record();
        assert_eq!(FieldResolver::apply_fields("PROP.hostname", &r), "web1");
        assert_eq!(
            FieldResolver::apply_fields("PROP.hostname - THREAD", &r),
            "web1-main"
        );
        assert_eq!(FieldResolver::apply_fields("", &r), "");
    }

    #[test]
    fn test_identity_property_falls_back_to_assigned_identity() {
        let r = record();
        assert_eq!(FieldResolver::apply_fields("PROP.log4jid", &r), "");
        r.identity_or_assign(|| 9);
        assert_eq!(FieldResolver::apply_fields("PROP.log4jid", &r), "9");

        let seeded = record().with_property(ID_PROPERTY, "17");
        assert_eq!(FieldResolver::apply_fields("PROP.log4jid", &seeded), "17");
    }
}
