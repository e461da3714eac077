//! The shared-memory bus seam.

use std::io;

use a314_wire::cmem;

/// Synchronous command access to the peer's shared memory.
///
/// Every operation is one word-framed command on the underlying transport.
/// Operations block, but complete in well under a millisecond on real
/// hardware, so the daemon issues them inline from its event loop. Any
/// failure here is fatal to the daemon: the peer link is its reason to
/// exist.
pub trait Bus: Send {
    /// Fill `buf` with shared-memory bytes starting at `addr`.
    fn read_mem(&mut self, addr: u32, buf: &mut [u8]) -> io::Result<()>;

    /// Write `data` into shared memory starting at `addr`.
    fn write_mem(&mut self, addr: u32, data: &[u8]) -> io::Result<()>;

    /// Read one 4-bit control-memory register.
    fn read_cmem(&mut self, reg: u8) -> io::Result<u8>;

    /// Write the low nibble of `data` to one control-memory register.
    fn write_cmem(&mut self, reg: u8, data: u8) -> io::Result<()>;

    /// Acknowledge the interrupt, returning the pending peer event bits.
    ///
    /// Reading the pending-events register is the acknowledgement.
    fn ack_irq(&mut self) -> io::Result<u8> {
        self.read_cmem(cmem::R_EVENTS)
    }
}
