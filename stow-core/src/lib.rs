// SPDX-License-Identifier: AGPL-3.0-or-later
//! Stowage Core
//!
//! Core traits and types shared by the storage drivers and the engine.

pub mod backend;
pub mod descriptor;
pub mod endpoint;
pub mod entry;
pub mod error;
pub mod path;
pub mod stream;

pub use backend::{BoxSink, ByteSink, ByteStream, Capabilities, StorageDriver};
pub use descriptor::{StorageDescriptor, StorageKind};
pub use endpoint::{BackendFactory, ResolvedEndpoint};
pub use entry::{EntryKind, EntryMeta};
pub use error::{ErrorReport, FailureClass, Side, StowError, StowResult};
pub use path::{QualifiedPath, StoragePath};
