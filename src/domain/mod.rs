//! Domain layer: core types, pool registry, and event system.
//!
//! This module contains the status list bit array and token claims, list
//! and pool identity, the persisted list model, the clock abstraction, the
//! event bus for broadcasting state changes, the aggregation index and the
//! pool registry.

pub mod aggregation;
pub mod clock;
pub mod event_bus;
pub mod list_record;
pub mod pool_entry;
pub mod pool_id;
pub mod pool_registry;
pub mod status_event;
pub mod status_list;
pub mod token;

pub use aggregation::AggregationIndex;
pub use clock::{Clock, ManualClock, SharedClock, SystemClock};
pub use event_bus::EventBus;
pub use list_record::{
    Claim, ListRecord, ListState, ListStorageMetadata, Reference, Release, StoredToken,
};
pub use pool_entry::{PoolEntry, PoolSummary};
pub use pool_id::{ListId, PoolId};
pub use pool_registry::PoolRegistry;
pub use status_event::{ListCacheEvent, StatusEvent};
pub use status_list::StatusList;
