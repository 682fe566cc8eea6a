//! Record predicates for chainsaw
//!
//! This crate provides the [`Rule`] contract, swappable rules with change
//! notification, primitive rules and combinators, and field resolution.

mod error;
mod filter;
mod listeners;
mod resolver;
mod rule;

pub use error::{Result, RuleError};
pub use filter::{EqualsRule, Inequality, LevelRule, LikeRule, PartialTextRule};
pub use listeners::{ListenerId, Listeners};
pub use resolver::{Field, FieldResolver};
pub use rule::{AcceptAll, AndRule, FnRule, NotRule, OrRule, Rule, RuleChanged, RuleRef, SharedRule};

// Re-export types used in our public API
pub use chainsaw_types::{LogLevel, Record};
