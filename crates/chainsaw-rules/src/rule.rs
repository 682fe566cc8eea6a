use std::fmt;
use std::sync::{Arc, Weak};

use parking_lot::RwLock;
use tracing::debug;

use chainsaw_types::Record;

use crate::listeners::{ListenerId, Listeners};

/// A boolean predicate over a record
pub trait Rule: Send + Sync {
    /// Check if a record satisfies this rule
    fn evaluate(&self, record: &Record) -> bool;

    /// Change notifications, for rules whose definition can be replaced in
    /// place. Owners subscribe here to re-evaluate when the rule changes.
    fn changes(&self) -> Option<&Listeners<RuleChanged>> {
        None
    }
}

/// Shared, type-erased rule
pub type RuleRef = Arc<dyn Rule>;

/// Notification sent when a [`SharedRule`] gets a new definition
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct RuleChanged {
    pub name: String,
}

/// A named rule whose definition can be swapped while owners keep the same
/// handle. Every swap is broadcast to subscribers.
pub struct SharedRule {
    name: String,
    current: RwLock<RuleRef>,
    listeners: Listeners<RuleChanged>,
}

impl SharedRule {
    pub fn new(name: impl Into<String>, rule: RuleRef) -> Arc<Self> {
        Arc::new(Self {
            name: name.into(),
            current: RwLock::new(rule),
            listeners: Listeners::new(),
        })
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    /// Current definition
    pub fn definition(&self) -> RuleRef {
        self.current.read().clone()
    }

    /// Replace the definition and notify every subscriber
    pub fn replace(&self, rule: RuleRef) {
        *self.current.write() = rule;
        debug!(rule = %self.name, subscribers = self.listeners.len(), "rule definition replaced");
        self.listeners.emit(&RuleChanged {
            name: self.name.clone(),
        });
    }

    /// Subscribe to definition changes
    pub fn on_change<F>(&self, callback: F) -> ListenerId
    where
        F: Fn(&RuleChanged) + Send + Sync + 'static,
    {
        self.listeners.subscribe(callback)
    }

    pub fn remove_listener(&self, id: ListenerId) -> bool {
        self.listeners.unsubscribe(id)
    }
}

impl Rule for SharedRule {
    fn evaluate(&self, record: &Record) -> bool {
        let rule = self.definition();
        rule.evaluate(record)
    }

    fn changes(&self) -> Option<&Listeners<RuleChanged>> {
        Some(&self.listeners)
    }
}

impl fmt::Debug for SharedRule {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_struct("SharedRule")
            .field("name", &self.name)
            .field("listeners", &self.listeners)
            .finish()
    }
}

/// Rule backed by a closure
pub struct FnRule<F>(F);

impl<F> FnRule<F>
where
    F: Fn(&Record) -> bool + Send + Sync,
{
    pub fn new(predicate: F) -> Self {
        Self(predicate)
    }
}

impl<F> Rule for FnRule<F>
where
    F: Fn(&Record) -> bool + Send + Sync,
{
    fn evaluate(&self, record: &Record) -> bool {
        (self.0)(record)
    }
}

/// Matches every record
#[derive(Clone, Copy, Debug, Default)]
pub struct AcceptAll;

impl Rule for AcceptAll {
    fn evaluate(&self, _record: &Record) -> bool {
        true
    }
}

/// Forwards change notifications from child rules to the owners of a
/// composite. Child subscriptions hold only a weak handle back, and are
/// removed when the composite is dropped.
struct ChangeRelay {
    listeners: Arc<Listeners<RuleChanged>>,
    subscriptions: Vec<(RuleRef, ListenerId)>,
}

impl ChangeRelay {
    fn watch(children: &[RuleRef]) -> Self {
        let listeners = Arc::new(Listeners::new());
        let subscriptions = children
            .iter()
            .filter_map(|child| {
                let relay: Weak<Listeners<RuleChanged>> = Arc::downgrade(&listeners);
                let id = child.changes()?.subscribe(move |change| {
                    if let Some(relay) = relay.upgrade() {
                        relay.emit(change);
                    }
                });
                Some((Arc::clone(child), id))
            })
            .collect();
        Self {
            listeners,
            subscriptions,
        }
    }

    /// `None` when no child can change
    fn changes(&self) -> Option<&Listeners<RuleChanged>> {
        if self.subscriptions.is_empty() {
            None
        } else {
            Some(&self.listeners)
        }
    }
}

impl Drop for ChangeRelay {
    fn drop(&mut self) {
        for (child, id) in &self.subscriptions {
            if let Some(changes) = child.changes() {
                changes.unsubscribe(*id);
            }
        }
    }
}

/// Negation of another rule
pub struct NotRule {
    rule: RuleRef,
    relay: ChangeRelay,
}

impl NotRule {
    pub fn new(rule: RuleRef) -> Self {
        let relay = ChangeRelay::watch(std::slice::from_ref(&rule));
        Self { rule, relay }
    }
}

impl Rule for NotRule {
    fn evaluate(&self, record: &Record) -> bool {
        !self.rule.evaluate(record)
    }

    fn changes(&self) -> Option<&Listeners<RuleChanged>> {
        self.relay.changes()
    }
}

/// Conjunction. An empty conjunction matches everything.
pub struct AndRule {
    rules: Vec<RuleRef>,
    relay: ChangeRelay,
}

impl AndRule {
    pub fn new(rules: Vec<RuleRef>) -> Self {
        let relay = ChangeRelay::watch(&rules);
        Self { rules, relay }
    }
}

impl Rule for AndRule {
    fn evaluate(&self, record: &Record) -> bool {
        self.rules.iter().all(|rule| rule.evaluate(record))
    }

    fn changes(&self) -> Option<&Listeners<RuleChanged>> {
        self.relay.changes()
    }
}

/// Disjunction. An empty disjunction matches nothing.
pub struct OrRule {
    rules: Vec<RuleRef>,
    relay: ChangeRelay,
}

impl OrRule {
    pub fn new(rules: Vec<RuleRef>) -> Self {
        let relay = ChangeRelay::watch(&rules);
        Self { rules, relay }
    }
}

impl Rule for OrRule {
    fn evaluate(&self, record: &Record) -> bool {
        self.rules.iter().any(|rule| rule.evaluate(record))
    }

    fn changes(&self) -> Option<&Listeners<RuleChanged>> {
        self.relay.changes()
    }
}
