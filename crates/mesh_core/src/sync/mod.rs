//! # Property Synchronization
//!
//! Turns property notifications into typed deltas, schedules them in the time
//! circle and releases them as per-mailbox command lists.

pub mod accumulator;
pub mod message;
pub mod publisher;
pub mod time_circle;

pub use accumulator::SyncAccumulator;
pub use message::{PropertySyncCommand, PropertySyncCommandList, SyncMessage, SyncOperation, SyncPayload, SyncType};
pub use publisher::{SubscriberKind, SyncPublisher};
pub use time_circle::{TimeCircle, TimeCircleConfig, TimeCircleHandle, TimeCircleStats};
