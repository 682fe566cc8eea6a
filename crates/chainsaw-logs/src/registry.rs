use std::sync::Arc;

use parking_lot::RwLock;
use tracing::info;

use chainsaw_rules::{Listeners, RuleRef};
use chainsaw_types::ArcRecord;

use crate::config::StoreConfig;
use crate::dispatch::BatchConsumer;
use crate::store::EventStore;

/// One [`EventStore`] per destination, created the first time a destination
/// receives records.
///
/// Every store is built from a clone of one [`StoreConfig`], so they draw
/// identities from the same counter and a record fanned out to several
/// destinations cannot collide with one numbered elsewhere.
pub struct StoreRegistry {
    config: StoreConfig,
    display_rule: RwLock<Option<RuleRef>>,
    stores: RwLock<Vec<EventStore>>,
    created: Listeners<EventStore>,
}

impl StoreRegistry {
    pub fn new(config: StoreConfig) -> Self {
        Self {
            config,
            display_rule: RwLock::new(None),
            stores: RwLock::new(Vec::new()),
            created: Listeners::new(),
        }
    }

    /// Store for a destination, if it has received anything
    pub fn get(&self, destination: &str) -> Option<EventStore> {
        self.stores
            .read()
            .iter()
            .find(|store| store.name() == destination)
            .cloned()
    }

    /// Store for a destination, creating it on first use
    pub fn get_or_create(&self, destination: &str) -> EventStore {
        if let Some(store) = self.get(destination) {
            return store;
        }

        let store = {
            let mut stores = self.stores.write();
            // Another thread may have won the race
            if let Some(store) = stores.iter().find(|store| store.name() == destination) {
                return store.clone();
            }
            let store = EventStore::new(destination, self.config.clone());
            if let Some(rule) = self.display_rule.read().clone() {
                store.set_display_rule(Some(rule));
            }
            stores.push(store.clone());
            store
        };

        info!(destination, "created store");
        self.created.emit(&store);
        store
    }

    /// Stores in creation order
    pub fn stores(&self) -> Vec<EventStore> {
        self.stores.read().clone()
    }

    pub fn destinations(&self) -> Vec<String> {
        self.stores
            .read()
            .iter()
            .map(|store| store.name().to_string())
            .collect()
    }

    /// Apply a display rule to every current and future store
    pub fn set_display_rule(&self, rule: Option<RuleRef>) {
        *self.display_rule.write() = rule.clone();
        for store in self.stores() {
            store.set_display_rule(rule.clone());
        }
    }

    /// Subscribers notified with each newly created store
    pub fn on_store_created(&self) -> &Listeners<EventStore> {
        &self.created
    }
}

impl BatchConsumer for StoreRegistry {
    fn receive_batch(&self, destination: &str, records: &[ArcRecord]) {
        self.get_or_create(destination)
            .admit_batch(records.iter().map(Arc::clone));
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use chainsaw_rules::LevelRule;
    use chainsaw_types::{LogLevel, Record};
    use parking_lot::Mutex;

    fn record(level: LogLevel) -> ArcRecord {
        Arc::new(Record::new("app", level, "m"))
    }

    #[test]
    fn test_creates_store_per_destination() {
        let registry = StoreRegistry::new(StoreConfig::default());
        let created = Arc::new(Mutex::new(Vec::new()));
        {
            let created = Arc::clone(&created);
            registry
                .on_store_created()
                .subscribe(move |store: &EventStore| created.lock().push(store.name().to_string()));
        }

        registry.receive_batch("a", &[record(LogLevel::Info), record(LogLevel::Info)]);
        registry.receive_batch("b", &[record(LogLevel::Info)]);
        registry.receive_batch("a", &[record(LogLevel::Info)]);

        assert_eq!(registry.destinations(), vec!["a", "b"]);
        assert_eq!(*created.lock(), vec!["a", "b"]);
        assert_eq!(registry.get("a").map(|s| s.len()), Some(3));
        assert!(registry.get("c").is_none());
    }

    #[test]
    fn test_display_rule_applies_to_new_stores() {
        let registry = StoreRegistry::new(StoreConfig::default());
        registry.receive_batch("a", &[record(LogLevel::Info)]);
        registry.set_display_rule(Some(Arc::new(LevelRule::at_least(LogLevel::Error))));
        registry.receive_batch("b", &[record(LogLevel::Info), record(LogLevel::Error)]);

        assert_eq!(registry.get("a").map(|s| s.visible_count()), Some(0));
        assert_eq!(registry.get("b").map(|s| s.visible_count()), Some(1));
    }
}
