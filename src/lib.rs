//! # lazy_fuser
//!
//! The kernel-facing core of a virtual filesystem daemon that presents a
//! version-controlled working copy. Directory listings and file contents
//! are fetched from a [`BackingStore`](store::BackingStore) only when the
//! kernel first asks for them, while local modifications live in an
//! [`OverlayStore`](store::OverlayStore).
//!
//! A mount is served by a [`RequestChannel`]: it performs the INIT
//! handshake, decodes every request frame according to the negotiated
//! protocol version and runs it on a worker pool. Requests touching the
//! same inode run in arrival order; unrelated inodes proceed in parallel.
//!
//! ```no_run
//! use std::sync::Arc;
//! use lazy_fuser::store::memory::{MemoryBackingStore, MemoryOverlayStore};
//! use lazy_fuser::{ChannelConfig, MemoryTransport, RequestChannel, Session};
//!
//! let backing = Arc::new(MemoryBackingStore::new());
//! let root = backing.build_tree(&[("src/main.rs", "fn main() {}")]);
//! let session = Arc::new(Session::new(
//!     ChannelConfig::default(),
//!     backing,
//!     Arc::new(MemoryOverlayStore::new()),
//!     root,
//! ));
//!
//! let (transport, _kernel) = MemoryTransport::pair();
//! let channel = RequestChannel::handshake(transport, session).unwrap();
//! channel.run().unwrap();
//! ```
//!
//! A running daemon can hand its mount to a successor without the kernel
//! noticing: [`RequestChannel::into_takeover`] captures the inode map and
//! open handles as [`TakeoverData`](core::TakeoverData), which
//! [`Session::restore`] and [`RequestChannel::resume`] bring back to life.
//!
//! ## Feature flags
//!
//! - `fuse`: mounts through the `fuser` crate on Linux ([`platform::default_backend`]).
//! - `deadlock_detection`: periodically checks worker locks and logs deadlocks.

pub mod channel;
pub mod config;
pub mod core;
pub mod platform;
pub mod protocol;
pub mod session;
pub mod store;
pub mod transport;
pub mod types;

pub use channel::{ChannelExit, RequestChannel};
pub use config::ChannelConfig;
pub use session::Session;
pub use transport::{KernelEndpoint, KernelTransport, MemoryTransport};
