//! Buffered log event pipeline for chainsaw
//!
//! This crate provides the per-destination event store, the batching
//! dispatch queue that feeds it, routing, line parsing and configuration.

mod config;
mod dispatch;
mod events;
mod parser;
mod registry;
mod router;
mod store;

pub use config::{
    Capacity, ConfigError, DEFAULT_BUFFER_SIZE, DEFAULT_INTERVAL_MS, DEFAULT_MIN_INTERVAL_MS,
    DEFAULT_ROUTING_EXPRESSION, DEFAULT_WARNING_THRESHOLDS, DispatchConfig, DispatchSection,
    IdentityCounter, PipelineConfig, ResponsivenessScale, StoreConfig, StoreSection,
};
pub use dispatch::{BatchConsumer, ConsumerId, DispatchQueue, FnConsumer};
pub use events::{ColumnAdded, EventCount, StoreEvents, StoreStatus, TableChange};
pub use parser::LineParser;
pub use registry::StoreRegistry;
pub use router::{EventBatch, Router, UNKNOWN_DESTINATION};
pub use store::{EventStore, SortSpec};

// Re-export types used in our public API
pub use chainsaw_types::{ArcRecord, Column, LevelCounts, LogLevel, Record};
