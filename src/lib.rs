//! Kernel-side core of a user-space filesystem bridge.
//!
//! This crate mediates between an in-kernel filesystem framework (the
//! "fsext provider") and a user-space daemon speaking the FUSE wire
//! protocol. Each in-kernel operation becomes one or more wire exchanges,
//! multiplexed over a single bidirectional transact channel; inode and name
//! metadata is cached to suppress redundant daemon round trips.
//!
//! The moving parts, leaves first:
//!
//! - [`status`]: the host status taxonomy and the errno map;
//! - [`proto`]: the wire format and the stateless request builders;
//! - [`cache`]: the name→inode metadata cache with expiration and deferred
//!   forgets;
//! - [`ioq`]: the dual queue pairing outstanding requests with responses by
//!   correlation ID;
//! - [`context`]: the per-operation resumable state machine;
//! - [`engine`]: the transact loop;
//! - [`instance`]: per-volume lifecycle and the provider record.

pub mod cache;
pub mod context;
pub mod engine;
pub mod file;
pub mod fsext;
pub mod instance;
pub mod ioq;
pub mod proto;
pub mod status;
pub mod sync;

pub use fsext::{HostBridge, InternalRequest, InternalResponse, Transact, VolumeParams};
pub use instance::{FSEXT_PROVIDER, FsextProvider, Instance};
pub use status::Status;
