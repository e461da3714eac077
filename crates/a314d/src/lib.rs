//! a314d — bridge daemon between a peer computer and local services.
//!
//! The daemon multiplexes independent logical byte streams between
//! peer-side requestors (reached over a shared-memory ring pair with an
//! interrupt sideband) and host-side service providers (local clients on a
//! stream socket). Each stream is a full-duplex pipe with end-of-stream
//! and abrupt-reset semantics.
//!
//! # Architecture
//!
//! ```text
//!  peer ──irq/shm──▶ transport ──▶ ring layer ──▶ channels ──▶ clients
//!  peer ◀──shm────── transport ◀── ring layer ◀── channels ◀── clients
//! ```
//!
//! One [`Daemon`] task owns all state; see [`driver`] for the concurrency
//! story. The transport seams live in `a314-transport`, the two wire
//! protocols in `a314-wire`.

pub mod channel;
pub mod client;
pub mod config;
pub mod driver;
pub mod framing;
pub mod ring;
pub mod service;
pub mod spawn;

pub use client::ClientId;
pub use config::{DEFAULT_CONFIG_PATH, DaemonConfig, OnDemandService, load_config_file};
pub use driver::{Daemon, DaemonError};
pub use framing::{Framed, Message};
