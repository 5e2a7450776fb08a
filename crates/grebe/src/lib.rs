#![deny(clippy::await_holding_lock)]

pub mod cache;
pub mod common;
pub mod config;
pub mod events;
pub mod messages;
pub mod metrics;
pub mod proxy;
pub mod scheduler;

#[cfg(test)]
mod tests;

pub use crate::common::{Map, Set};

/// Identifier of an external resource manager.
pub type RmId = String;
/// Cluster-global (RM-qualified) partition name.
pub type PartitionName = String;
pub type ApplicationId = String;
pub type NodeId = String;
pub type QueueName = String;
/// RM-chosen key identifying one ask within an application.
pub type AllocationKey = String;
/// Uuid assigned to an allocation when a proposal is committed.
pub type AllocationUuid = String;

pub type Error = common::error::CoreError;
pub type Result<T> = std::result::Result<T, Error>;

/// Default capacity of the cache and proxy event queues.
pub const DEFAULT_EVENT_QUEUE_CAPACITY: usize = 1024 * 1024;
