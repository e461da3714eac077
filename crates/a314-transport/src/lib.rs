//! Transport layer for the a314 bridge daemon.
//!
//! The daemon talks to the peer through two narrow seams:
//!
//! - [`Bus`]: synchronous word-framed commands against the peer's shared
//!   memory and its 16-register control memory, and
//! - [`IrqLine`]: an awaitable edge-triggered interrupt raised by the peer.
//!
//! [`SpiBus`] and [`GpioIrq`] are the hardware implementations. The [`mem`]
//! module provides an in-process implementation of both seams together with
//! an emulated peer handle; it is the semantic reference the daemon's tests
//! run against.

pub mod bus;
pub mod irq;
pub mod mem;
pub mod spi;

pub use bus::Bus;
pub use irq::{GpioIrq, IrqLine};
pub use mem::{MemBus, MemIrq, MemPeer, mem_link};
pub use spi::SpiBus;
