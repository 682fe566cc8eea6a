//! Assigns records to destinations.

use chainsaw_rules::{FieldResolver, RuleRef};
use chainsaw_types::ArcRecord;

/// Destination used when a routing expression resolves to nothing
pub const UNKNOWN_DESTINATION: &str = "Unknown";

/// Records grouped by destination, in first-seen key order
#[derive(Debug, Default)]
pub struct EventBatch {
    groups: Vec<(String, Vec<ArcRecord>)>,
}

impl EventBatch {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn add(&mut self, destination: &str, record: ArcRecord) {
        match self.groups.iter_mut().find(|(key, _)| key == destination) {
            Some((_, records)) => records.push(record),
            None => self.groups.push((destination.to_string(), vec![record])),
        }
    }

    pub fn keys(&self) -> impl Iterator<Item = &str> {
        self.groups.iter().map(|(key, _)| key.as_str())
    }

    pub fn get(&self, destination: &str) -> Option<&[ArcRecord]> {
        self.groups
            .iter()
            .find(|(key, _)| key == destination)
            .map(|(_, records)| records.as_slice())
    }

    pub fn iter(&self) -> impl Iterator<Item = (&str, &[ArcRecord])> {
        self.groups
            .iter()
            .map(|(key, records)| (key.as_str(), records.as_slice()))
    }

    /// Number of destinations
    pub fn len(&self) -> usize {
        self.groups.len()
    }

    pub fn is_empty(&self) -> bool {
        self.groups.is_empty()
    }

    /// Records across all destinations, counting fan-out copies
    pub fn record_count(&self) -> usize {
        self.groups.iter().map(|(_, records)| records.len()).sum()
    }
}

/// Routing expression plus custom rule-based routes
#[derive(Default)]
pub struct Router {
    expression: Option<String>,
    routes: Vec<(String, RuleRef)>,
}

impl Router {
    pub fn new(expression: Option<String>) -> Self {
        Self {
            expression,
            routes: Vec::new(),
        }
    }

    pub fn expression(&self) -> Option<&str> {
        self.expression.as_deref()
    }

    pub fn set_expression(&mut self, expression: Option<String>) {
        self.expression = expression;
    }

    /// Add a custom route, replacing any route with the same key
    pub fn register_route(&mut self, key: impl Into<String>, rule: RuleRef) {
        let key = key.into();
        match self.routes.iter_mut().find(|(existing, _)| *existing == key) {
            Some((_, existing)) => *existing = rule,
            None => self.routes.push((key, rule)),
        }
    }

    pub fn remove_route(&mut self, key: &str) -> bool {
        let before = self.routes.len();
        self.routes.retain(|(existing, _)| existing != key);
        self.routes.len() != before
    }

    pub fn route_keys(&self) -> impl Iterator<Item = &str> {
        self.routes.iter().map(|(key, _)| key.as_str())
    }

    /// Default destination of a record, or `None` with no expression set
    pub fn destination(&self, record: &ArcRecord) -> Option<String> {
        let expression = self.expression.as_deref()?;
        let key = FieldResolver::apply_fields(expression, record);
        if key.is_empty() {
            Some(UNKNOWN_DESTINATION.to_string())
        } else {
            Some(key)
        }
    }

    /// Group records by destination. Each record goes to its default
    /// destination and to every custom route whose rule accepts it.
    pub fn route(&self, records: &[ArcRecord]) -> EventBatch {
        let mut batch = EventBatch::new();
        for record in records {
            let default = self.destination(record);
            if let Some(key) = &default {
                batch.add(key, record.clone());
            }
            for (key, rule) in &self.routes {
                if default.as_deref() != Some(key.as_str()) && rule.evaluate(record) {
                    batch.add(key, record.clone());
                }
            }
        }
        batch
    }
}

impl std::fmt::Debug for Router {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Router")
            .field("expression", &self.expression)
            .field("routes", &self.route_keys().collect::<Vec<_>>())
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsaw_rules::{LevelRule, Rule};
    use chainsaw_types::{LogLevel, Record};
    use std::sync::Arc;

    fn record(host: Option<&str>, app: Option<&str>, level: LogLevel) -> ArcRecord {
        let mut r = Record::new("app", level, "m");
        if let Some(host) = host {
            r = r.with_property("hostname", host);
        }
        if let Some(app) = app {
            r = r.with_property("application", app);
        }
        Arc::new(r)
    }

    fn default_router() -> Router {
        Router::new(Some("PROP.hostname - PROP.application".to_string()))
    }

    #[test]
    fn test_destination_concatenates_tokens() {
        let router = default_router();
        let key = router.destination(&record(Some("web1"), Some("shop"), LogLevel::Info));
        assert_eq!(key.as_deref(), Some("web1-shop"));
    }

    #[test]
    fn test_unresolved_expression_is_unknown() {
        let router = Router::new(Some("PROP.hostname".to_string()));
        let key = router.destination(&record(None, None, LogLevel::Info));
        assert_eq!(key.as_deref(), Some(UNKNOWN_DESTINATION));
    }

    #[test]
    fn test_no_expression_routes_nothing() {
        let router = Router::default();
        assert!(router.route(&[record(None, None, LogLevel::Info)]).is_empty());
    }

    #[test]
    fn test_groups_keep_first_seen_order() {
        let router = default_router();
        let records = [
            record(Some("b"), Some("x"), LogLevel::Info),
            record(Some("a"), Some("x"), LogLevel::Info),
            record(Some("b"), Some("x"), LogLevel::Info),
        ];
        let batch = router.route(&records);
        assert_eq!(batch.keys().collect::<Vec<_>>(), vec!["b-x", "a-x"]);
        assert_eq!(batch.get("b-x").map(<[ArcRecord]>::len), Some(2));
    }

    #[test]
    fn test_custom_route_fans_out() {
        let mut router = default_router();
        router.register_route("errors", Arc::new(LevelRule::at_least(LogLevel::Error)));
        let records = [
            record(Some("h"), Some("a"), LogLevel::Error),
            record(Some("h"), Some("a"), LogLevel::Info),
        ];
        let batch = router.route(&records);
        assert_eq!(batch.get("h-a").map(<[ArcRecord]>::len), Some(2));
        assert_eq!(batch.get("errors").map(<[ArcRecord]>::len), Some(1));
        assert_eq!(batch.record_count(), 3);

        assert!(router.remove_route("errors"));
        assert!(!router.remove_route("errors"));
    }

    #[test]
    fn test_custom_route_matching_default_key_is_not_duplicated() {
        let mut router = default_router();
        router.register_route("h-a", Arc::new(LevelRule::at_least(LogLevel::Trace)));
        let batch = router.route(&[record(Some("h"), Some("a"), LogLevel::Info)]);
        assert_eq!(batch.record_count(), 1);
    }

    #[test]
    fn test_register_route_replaces_same_key() {
        let mut router = default_router();
        let errors: RuleRef = Arc::new(LevelRule::at_least(LogLevel::Error));
        router.register_route("r", Arc::new(LevelRule::at_least(LogLevel::Trace)));
        router.register_route("r", errors.clone());
        assert_eq!(router.route_keys().count(), 1);
        assert!(!errors.evaluate(&record(None, None, LogLevel::Info)));
        let batch = router.route(&[record(Some("h"), Some("a"), LogLevel::Info)]);
        assert!(batch.get("r").is_none());
    }
}
