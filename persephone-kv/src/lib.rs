//! Versioned key-value store.
//!
//! Every key carries a version that advances by one step per accepted write.
//! Writers present the version they last observed (compare-and-set), and
//! subscribers receive a replayable feed of `Change`/`Delete` events.

pub mod error;
pub mod memory;
pub mod store;
pub mod version;

pub use error::{Result, StoreError};
pub use memory::InMemoryKeyValueStore;
pub use store::{Event, EventSubscription, KeyValueStore, SubscriptionId, Versioned};
pub use version::{MonotonicVersion, Version};
