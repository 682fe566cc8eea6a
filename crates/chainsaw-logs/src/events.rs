//! Notifications emitted by an [`EventStore`](crate::EventStore)

use chainsaw_rules::Listeners;

/// Row-level change to the visible projection, shaped for a table view
#[derive(Clone, Debug, PartialEq, Eq)]
pub enum TableChange {
    /// Rows `first..=last` were appended
    RowsInserted { first: usize, last: usize },
    /// Rows `first..=last` may now show different records
    RowsUpdated { first: usize, last: usize },
    /// The whole projection was rebuilt
    DataChanged,
}

/// A property key seen for the first time in this store
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct ColumnAdded {
    pub key: String,
    /// Absolute column index, after the fixed columns
    pub index: usize,
    pub first_value: String,
}

/// Visible and retained record counts
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub struct EventCount {
    pub visible: usize,
    pub total: usize,
}

/// Capacity and migration status
#[derive(Clone, Debug, PartialEq)]
pub enum StoreStatus {
    /// Retained size reached a configured fraction of the capacity
    CapacityThreshold {
        threshold: f64,
        size: usize,
        capacity: usize,
    },
    MigrationStarted { total: usize },
    MigrationProgress { copied: usize, total: usize },
    MigrationFinished { retained: usize },
}

/// Subscriber lists, one per notification kind
#[derive(Debug, Default)]
pub struct StoreEvents {
    pub table: Listeners<TableChange>,
    pub columns: Listeners<ColumnAdded>,
    pub counts: Listeners<EventCount>,
    pub status: Listeners<StoreStatus>,
}

/// Notifications collected while the store lock is held and delivered after
/// it is released
#[derive(Debug, Default)]
pub(crate) struct Outbox {
    pub table: Vec<TableChange>,
    pub columns: Vec<ColumnAdded>,
    pub count: Option<EventCount>,
    pub status: Vec<StoreStatus>,
}

impl Outbox {
    pub fn deliver(self, events: &StoreEvents) {
        for change in &self.columns {
            events.columns.emit(change);
        }
        for change in &self.table {
            events.table.emit(change);
        }
        if let Some(count) = &self.count {
            events.counts.emit(count);
        }
        for status in &self.status {
            events.status.emit(status);
        }
    }
}
