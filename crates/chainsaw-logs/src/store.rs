use std::collections::{HashMap, HashSet, VecDeque};
use std::io;
use std::sync::{Arc, Weak};
use std::thread::{self, JoinHandle};

use parking_lot::Mutex;
use tracing::{debug, info, warn};

use chainsaw_rules::{ListenerId, Rule, RuleRef};
use chainsaw_types::{ArcRecord, Column, ID_PROPERTY, LevelCounts, Record, SortKey};

use crate::config::{Capacity, IdentityCounter, StoreConfig};
use crate::events::{ColumnAdded, EventCount, Outbox, StoreEvents, StoreStatus, TableChange};

/// Initial allocation for unbounded stores
const INITIAL_CAPACITY: usize = 1024;

/// Records copied between migration progress reports
const MIGRATION_PROGRESS_STEP: usize = 1000;

/// Requested ordering of the visible projection
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct SortSpec {
    pub column: usize,
    pub ascending: bool,
}

/// Retained records with the structures derived from them. Built off to the
/// side during migration and swapped in whole.
struct Backing {
    all: VecDeque<ArcRecord>,
    identities: HashSet<u64>,
    level_counts: LevelCounts,
}

impl Backing {
    fn with_capacity(capacity: Capacity) -> Self {
        let slots = capacity.limit().unwrap_or(INITIAL_CAPACITY);
        Self {
            all: VecDeque::with_capacity(slots),
            identities: HashSet::with_capacity(slots),
            level_counts: LevelCounts::default(),
        }
    }

    /// Copy records into a fresh backing for `capacity`, keeping the newest
    /// ones when they do not all fit
    fn rebuild<F>(records: &[ArcRecord], capacity: Capacity, mut progress: F) -> Self
    where
        F: FnMut(usize),
    {
        let skip = capacity
            .limit()
            .map_or(0, |limit| records.len().saturating_sub(limit));
        let mut backing = Self::with_capacity(capacity);

        for (copied, record) in records.iter().skip(skip).enumerate() {
            if let Some(id) = record.identity() {
                backing.identities.insert(id);
            }
            backing.level_counts.increment(record.level);
            backing.all.push_back(Arc::clone(record));
            if (copied + 1) % MIGRATION_PROGRESS_STEP == 0 {
                progress(copied + 1);
            }
        }
        backing
    }
}

struct StoreState {
    capacity: Capacity,
    backing: Backing,
    visible: VecDeque<ArcRecord>,
    display_rule: Option<RuleRef>,
    /// Change subscription held on `display_rule`
    rule_subscription: Option<(RuleRef, ListenerId)>,
    sort: Option<SortSpec>,
    /// Dynamic property columns in discovery order
    columns: Vec<String>,
    column_index: HashMap<String, usize>,
    /// Bounded store has reached capacity at least once
    full: bool,
    /// Identities for records that arrive without one
    counter: IdentityCounter,
    warning_thresholds: Vec<f64>,
    thresholds_crossed: usize,
    /// Bumped on every change to `backing`
    generation: u64,
}

impl StoreState {
    fn new(config: &StoreConfig) -> Self {
        Self {
            capacity: config.capacity,
            backing: Backing::with_capacity(config.capacity),
            visible: VecDeque::new(),
            display_rule: None,
            rule_subscription: None,
            sort: None,
            columns: Vec::new(),
            column_index: HashMap::new(),
            full: false,
            counter: config.identities.clone(),
            warning_thresholds: config.warning_thresholds.clone(),
            thresholds_crossed: 0,
            generation: 0,
        }
    }

    fn count(&self) -> EventCount {
        EventCount {
            visible: self.visible.len(),
            total: self.backing.all.len(),
        }
    }

    fn is_displayed(&self, record: &Record) -> bool {
        self.display_rule
            .as_ref()
            .is_none_or(|rule| rule.evaluate(record))
    }

    /// Returns whether the record joined the visible projection
    fn admit(&mut self, record: ArcRecord, out: &mut Outbox) -> bool {
        let counter = &self.counter;
        let retained = &self.backing.identities;
        // Seeded identities may already occupy counter values
        let id = record.identity_or_assign(|| loop {
            let id = counter.next();
            if !retained.contains(&id) {
                break id;
            }
        });

        if !self.backing.identities.insert(id) {
            return false;
        }
        self.generation += 1;

        self.discover_columns(&record, out);

        if let Some(limit) = self.capacity.limit() {
            if self.backing.all.len() >= limit {
                if let Some(evicted) = self.backing.all.pop_front() {
                    self.evict(&evicted);
                }
            }
        }

        self.backing.level_counts.increment(record.level);
        self.backing.all.push_back(Arc::clone(&record));

        let displayed = self.is_displayed(&record);
        if displayed {
            self.visible.push_back(record);
        }

        self.note_row_change(displayed, out);
        self.check_thresholds(out);
        displayed
    }

    fn evict(&mut self, evicted: &ArcRecord) {
        if let Some(id) = evicted.identity() {
            self.backing.identities.remove(&id);
        }
        self.backing.level_counts.decrement(evicted.level);

        // Unsorted projections evict from the front
        let position = match self.visible.front() {
            Some(front) if Arc::ptr_eq(front, evicted) => Some(0),
            _ => self.visible.iter().position(|r| Arc::ptr_eq(r, evicted)),
        };
        if let Some(position) = position {
            self.visible.remove(position);
        }
    }

    fn discover_columns(&mut self, record: &Record, out: &mut Outbox) {
        let mut fresh: Vec<(&String, &String)> = record
            .properties
            .iter()
            .filter(|(key, _)| key.as_str() != ID_PROPERTY && !self.column_index.contains_key(*key))
            .collect();
        fresh.sort();

        for (key, value) in fresh {
            let index = Column::ALL.len() + self.columns.len();
            self.column_index.insert(key.clone(), index);
            self.columns.push(key.clone());
            out.columns.push(ColumnAdded {
                key: key.clone(),
                index,
                first_value: value.clone(),
            });
        }
    }

    fn note_row_change(&mut self, displayed: bool, out: &mut Outbox) {
        let whole = |visible: usize| TableChange::RowsUpdated {
            first: 0,
            last: visible.saturating_sub(1),
        };
        let inserted = TableChange::RowsInserted {
            first: self.visible.len().saturating_sub(1),
            last: self.visible.len().saturating_sub(1),
        };

        let Some(limit) = self.capacity.limit() else {
            if displayed {
                out.table.push(inserted);
            }
            return;
        };

        if self.full {
            if !self.visible.is_empty() {
                out.table.push(whole(self.visible.len()));
            }
        } else if self.backing.all.len() >= limit {
            self.full = true;
            if displayed {
                out.table.push(inserted);
            }
            if !self.visible.is_empty() {
                out.table.push(whole(self.visible.len()));
            }
        } else if displayed {
            out.table.push(inserted);
        }
    }

    fn check_thresholds(&mut self, out: &mut Outbox) {
        let Some(limit) = self.capacity.limit() else {
            return;
        };
        let size = self.backing.all.len();
        let utilisation = size as f64 / limit as f64;

        while let Some(&threshold) = self.warning_thresholds.get(self.thresholds_crossed) {
            if utilisation < threshold {
                break;
            }
            self.thresholds_crossed += 1;
            warn!(
                size,
                capacity = limit,
                "store reached {:.0}% of capacity",
                threshold * 100.0
            );
            out.status.push(StoreStatus::CapacityThreshold {
                threshold,
                size,
                capacity: limit,
            });
        }
    }

    /// Rebuild the visible projection from every retained record
    fn refilter(&mut self, out: &mut Outbox) {
        let visible: VecDeque<ArcRecord> = self
            .backing
            .all
            .iter()
            .filter(|record| self.is_displayed(record))
            .cloned()
            .collect();
        self.visible = visible;
        self.sort_visible();
        out.table.push(TableChange::DataChanged);
        out.count = Some(self.count());
    }

    fn sort_visible(&mut self) {
        let Some(spec) = self.sort else {
            return;
        };
        let ascending = spec.ascending;

        if let Some(column) = Column::from_index(spec.column) {
            self.visible.make_contiguous().sort_by(|a, b| {
                column
                    .sort_key(a)
                    .compare(&column.sort_key(b), ascending)
            });
        } else if let Some(key) = self.columns.get(spec.column - Column::ALL.len()).cloned() {
            let key_of = |record: &Record| -> SortKey<'static> {
                record
                    .property(&key)
                    .map_or(SortKey::Missing, |value| SortKey::Text(value.to_owned().into()))
            };
            self.visible
                .make_contiguous()
                .sort_by(|a, b| key_of(a).compare(&key_of(b), ascending));
        }
    }

    fn column_count(&self) -> usize {
        Column::ALL.len() + self.columns.len()
    }

    fn clear(&mut self) {
        self.backing = Backing::with_capacity(self.capacity);
        self.visible.clear();
        self.full = false;
        if !self.counter.restart_if_exclusive() {
            debug!("identity counter shared with other stores, not restarted");
        }
        self.thresholds_crossed = 0;
        self.generation += 1;
    }

    /// Swap in a backing built for `capacity`
    fn install(&mut self, capacity: Capacity, backing: Backing, out: &mut Outbox) {
        self.capacity = capacity;
        self.backing = backing;
        self.full = capacity
            .limit()
            .is_some_and(|limit| self.backing.all.len() >= limit);
        self.thresholds_crossed = 0;
        self.generation += 1;
        self.refilter(out);
        self.check_thresholds(out);
    }
}

struct StoreInner {
    name: String,
    state: Mutex<StoreState>,
    events: StoreEvents,
}

impl StoreInner {
    fn refilter(&self) {
        let mut out = Outbox::default();
        self.state.lock().refilter(&mut out);
        out.deliver(&self.events);
    }
}

/// Bounded or unbounded store of one destination's records, with a live
/// filtered projection.
///
/// Every read and write of the retained records, the identity set and the
/// visible projection happens under one per-store lock. Notifications are
/// delivered after the lock is released, on the calling thread.
#[derive(Clone)]
pub struct EventStore {
    inner: Arc<StoreInner>,
}

impl EventStore {
    /// Create a new store for a destination
    pub fn new(name: impl Into<String>, config: StoreConfig) -> Self {
        Self {
            inner: Arc::new(StoreInner {
                name: name.into(),
                state: Mutex::new(StoreState::new(&config)),
                events: StoreEvents::default(),
            }),
        }
    }

    pub fn name(&self) -> &str {
        &self.inner.name
    }

    /// Subscriber lists for this store's notifications
    pub fn events(&self) -> &StoreEvents {
        &self.inner.events
    }

    /// Admit a record.
    ///
    /// Duplicates (same identity as a retained record) are rejected. Returns
    /// whether the record joined the visible projection.
    pub fn admit(&self, record: ArcRecord) -> bool {
        let mut out = Outbox::default();
        let displayed = {
            let mut state = self.inner.state.lock();
            let displayed = state.admit(record, &mut out);
            out.count = Some(state.count());
            displayed
        };
        out.deliver(&self.inner.events);
        displayed
    }

    /// Admit several records, reporting the counts once at the end. Returns
    /// how many joined the visible projection.
    pub fn admit_batch<I>(&self, records: I) -> usize
    where
        I: IntoIterator<Item = ArcRecord>,
    {
        let mut out = Outbox::default();
        let mut displayed = 0;
        for record in records {
            let mut state = self.inner.state.lock();
            if state.admit(record, &mut out) {
                displayed += 1;
            }
        }
        out.count = Some(self.inner.state.lock().count());
        out.deliver(&self.inner.events);
        displayed
    }

    /// Replace the display rule (`None` shows everything) and rebuild the
    /// visible projection
    pub fn set_display_rule(&self, rule: Option<RuleRef>) {
        let subscription = rule.as_ref().and_then(|rule| {
            let changes = rule.changes()?;
            let weak: Weak<StoreInner> = Arc::downgrade(&self.inner);
            let id = changes.subscribe(move |_| {
                if let Some(inner) = weak.upgrade() {
                    debug!(store = %inner.name, "display rule changed");
                    inner.refilter();
                }
            });
            Some((Arc::clone(rule), id))
        });

        let mut out = Outbox::default();
        let previous = {
            let mut state = self.inner.state.lock();
            state.display_rule = rule;
            let previous = std::mem::replace(&mut state.rule_subscription, subscription);
            state.refilter(&mut out);
            previous
        };

        if let Some((old_rule, id)) = previous {
            if let Some(changes) = old_rule.changes() {
                changes.unsubscribe(id);
            }
        }
        out.deliver(&self.inner.events);
    }

    /// Current display rule
    pub fn display_rule(&self) -> Option<RuleRef> {
        self.inner.state.lock().display_rule.clone()
    }

    /// Index of the first visible row at or after (`forward`) or at or before
    /// `start` that satisfies `rule`
    pub fn find(&self, rule: &dyn Rule, start: usize, forward: bool) -> Option<usize> {
        let state = self.inner.state.lock();
        let visible = &state.visible;
        if start >= visible.len() {
            return None;
        }
        if forward {
            (start..visible.len()).find(|&i| rule.evaluate(&visible[i]))
        } else {
            (0..=start).rev().find(|&i| rule.evaluate(&visible[i]))
        }
    }

    /// Sort the visible projection by a column. Sorting stays on for later
    /// filter rebuilds. Returns false for an unknown column.
    pub fn sort(&self, column: usize, ascending: bool) -> bool {
        let mut out = Outbox::default();
        {
            let mut state = self.inner.state.lock();
            if column >= state.column_count() {
                return false;
            }
            state.sort = Some(SortSpec { column, ascending });
            state.sort_visible();
        }
        out.table.push(TableChange::DataChanged);
        out.deliver(&self.inner.events);
        true
    }

    /// Re-apply the current sort. Does nothing until [`sort`](Self::sort) has
    /// been called.
    pub fn resort(&self) {
        let mut out = Outbox::default();
        {
            let mut state = self.inner.state.lock();
            if state.sort.is_none() {
                return;
            }
            state.sort_visible();
        }
        out.table.push(TableChange::DataChanged);
        out.deliver(&self.inner.events);
    }

    pub fn sort_spec(&self) -> Option<SortSpec> {
        self.inner.state.lock().sort
    }

    pub fn capacity(&self) -> Capacity {
        self.inner.state.lock().capacity
    }

    pub fn is_bounded(&self) -> bool {
        self.capacity().is_bounded()
    }

    /// Switch eviction policy.
    ///
    /// Records are copied into a fresh backing on a dedicated thread while
    /// admits continue; the result is swapped in under the store lock. If
    /// records arrived meanwhile, the copy is redone from the live state
    /// under the lock. Fails only if the thread cannot be spawned.
    pub fn set_capacity(&self, capacity: Capacity) -> io::Result<JoinHandle<()>> {
        let inner = Arc::clone(&self.inner);
        thread::Builder::new()
            .name(format!("migrate-{}", self.inner.name))
            .spawn(move || migrate(&inner, capacity))
    }

    /// Drop every record. The identity counter restarts unless other stores
    /// share it.
    pub fn clear(&self) {
        let mut out = Outbox::default();
        {
            let mut state = self.inner.state.lock();
            state.clear();
            out.table.push(TableChange::DataChanged);
            out.count = Some(state.count());
        }
        out.deliver(&self.inner.events);
    }

    /// Retained record count
    pub fn len(&self) -> usize {
        self.inner.state.lock().backing.all.len()
    }

    pub fn is_empty(&self) -> bool {
        self.len() == 0
    }

    /// Visible record count
    pub fn visible_count(&self) -> usize {
        self.inner.state.lock().visible.len()
    }

    /// Visible and retained counts, read together
    pub fn counts(&self) -> EventCount {
        self.inner.state.lock().count()
    }

    /// Visible row at an index
    pub fn row(&self, index: usize) -> Option<ArcRecord> {
        self.inner.state.lock().visible.get(index).cloned()
    }

    /// Visible row index of a record, matched by identity
    pub fn row_index_of(&self, record: &Record) -> Option<usize> {
        let id = record.identity()?;
        self.inner
            .state
            .lock()
            .visible
            .iter()
            .position(|r| r.identity() == Some(id))
    }

    /// Snapshot of every retained record in arrival order
    pub fn all_records(&self) -> Vec<ArcRecord> {
        self.inner.state.lock().backing.all.iter().cloned().collect()
    }

    /// Snapshot of the visible projection
    pub fn visible_records(&self) -> Vec<ArcRecord> {
        self.inner.state.lock().visible.iter().cloned().collect()
    }

    /// Visible rows in a range (for virtual scrolling)
    pub fn range(&self, start: usize, count: usize) -> Vec<ArcRecord> {
        let state = self.inner.state.lock();
        state.visible.iter().skip(start).take(count).cloned().collect()
    }

    /// Retained records satisfying `rule`, regardless of the display rule
    pub fn matching(&self, rule: &dyn Rule) -> Vec<ArcRecord> {
        self.inner
            .state
            .lock()
            .backing
            .all
            .iter()
            .filter(|record| rule.evaluate(record))
            .cloned()
            .collect()
    }

    /// Entry count per log level over retained records
    pub fn level_counts(&self) -> LevelCounts {
        self.inner.state.lock().backing.level_counts.clone()
    }

    /// Fixed plus discovered columns
    pub fn column_count(&self) -> usize {
        self.inner.state.lock().column_count()
    }

    pub fn column_name(&self, index: usize) -> Option<String> {
        if let Some(column) = Column::from_index(index) {
            return Some(column.name().to_string());
        }
        self.inner
            .state
            .lock()
            .columns
            .get(index - Column::ALL.len())
            .cloned()
    }

    /// Property keys discovered so far, in discovery order
    pub fn dynamic_columns(&self) -> Vec<String> {
        self.inner.state.lock().columns.clone()
    }

    /// Text of one cell of the visible projection
    pub fn cell(&self, row: usize, column: usize) -> Option<String> {
        let state = self.inner.state.lock();
        let record = state.visible.get(row)?;
        match Column::from_index(column) {
            Some(column) => Some(column.text(record)),
            None => {
                let key = state.columns.get(column - Column::ALL.len())?;
                Some(record.property(key).unwrap_or_default().to_string())
            }
        }
    }
}

impl std::fmt::Debug for EventStore {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let state = self.inner.state.lock();
        f.debug_struct("EventStore")
            .field("name", &self.inner.name)
            .field("capacity", &state.capacity)
            .field("total", &state.backing.all.len())
            .field("visible", &state.visible.len())
            .finish()
    }
}

fn migrate(inner: &StoreInner, capacity: Capacity) {
    let (snapshot, generation) = {
        let state = inner.state.lock();
        let snapshot: Vec<ArcRecord> = state.backing.all.iter().cloned().collect();
        (snapshot, state.generation)
    };
    let total = snapshot.len();
    info!(store = %inner.name, ?capacity, total, "migrating store");
    inner
        .events
        .status
        .emit(&StoreStatus::MigrationStarted { total });

    let backing = Backing::rebuild(&snapshot, capacity, |copied| {
        inner
            .events
            .status
            .emit(&StoreStatus::MigrationProgress { copied, total });
    });

    let mut out = Outbox::default();
    {
        let mut state = inner.state.lock();
        let backing = if state.generation == generation {
            backing
        } else {
            debug!(store = %inner.name, "records arrived during migration, rebuilding under lock");
            let live: Vec<ArcRecord> = state.backing.all.iter().cloned().collect();
            Backing::rebuild(&live, capacity, |_| {})
        };
        state.install(capacity, backing, &mut out);
        out.status.push(StoreStatus::MigrationFinished {
            retained: state.backing.all.len(),
        });
    }
    out.deliver(&inner.events);
    info!(store = %inner.name, "migration finished");
}
