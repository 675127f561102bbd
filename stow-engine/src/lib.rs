// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stowage Engine
//!
//! The storage registry and its endpoint validator, the job engine, the
//! archive engine and the progress bus.

pub mod archive;
pub mod engine;
pub mod job;
pub mod progress;
pub mod registry;
pub mod security;
pub mod store;

mod transfer;

#[cfg(test)]
mod testing;

pub use archive::ArchiveFormat;
pub use engine::{Engine, EngineConfig};
pub use job::{
    CancelCause, ConflictPolicy, ItemOutcome, ItemStatus, JobId, JobKind, JobRequest, JobSnapshot,
    JobStatus,
};
pub use progress::{Counters, ProgressBus, ProgressEvent, ProgressKind, Subscription, Topic};
pub use registry::{StorageLease, StorageRegistry, StorageStatus};
pub use security::{
    BlockedRange, HostResolver, SecurityGate, SecurityPolicy, StaticResolver, SystemResolver,
    BLOCKED_RANGES,
};
pub use store::{DescriptorStore, MemoryDescriptorStore, TomlDescriptorStore};
