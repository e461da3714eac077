//! In-process bus and interrupt line with an emulated peer.
//!
//! This is the semantic reference implementation of the transport seams:
//! the daemon behaves identically over [`MemBus`] and [`SpiBus`](crate::SpiBus),
//! and the daemon's integration tests drive it through the [`MemPeer`]
//! handle, which plays the peer's half of the ring and event discipline.

use std::io;
use std::sync::{Arc, Mutex, MutexGuard};

use tokio::sync::Notify;

use crate::bus::Bus;
use crate::irq::IrqLine;
use a314_wire::{A2R_DATA_OFFSET, R2A_DATA_OFFSET, RING_LEN, cmem, peer_event, status};

struct Inner {
    mem: Vec<u8>,
    base_regs: [u8; 5],
    /// Old register values served for the next N base-register reads, used
    /// to exercise the torn-read guard.
    staged_base: Option<([u8; 5], u8)>,
    r_events: u8,
    a_events: u8,
}

struct Shared {
    inner: Mutex<Inner>,
    host_irq: Notify,
    peer_irq: Notify,
}

impl Shared {
    fn lock(&self) -> MutexGuard<'_, Inner> {
        self.inner.lock().expect("mem bus lock poisoned")
    }
}

fn base_nibbles(addr: u32) -> [u8; 5] {
    let value = addr | 1;
    std::array::from_fn(|i| ((value >> (i * 4)) & 0xf) as u8)
}

/// Create a linked in-memory bus, interrupt line, and peer handle over a
/// fresh zeroed memory of `mem_size` bytes.
pub fn mem_link(mem_size: usize) -> (MemBus, MemIrq, MemPeer) {
    let shared = Arc::new(Shared {
        inner: Mutex::new(Inner {
            mem: vec![0; mem_size],
            base_regs: [0; 5],
            staged_base: None,
            r_events: 0,
            a_events: 0,
        }),
        host_irq: Notify::new(),
        peer_irq: Notify::new(),
    });
    (
        MemBus {
            shared: shared.clone(),
        },
        MemIrq {
            shared: shared.clone(),
        },
        MemPeer { shared },
    )
}

/// Host-side [`Bus`] over in-process memory.
pub struct MemBus {
    shared: Arc<Shared>,
}

fn range_check(mem: &[u8], addr: u32, len: usize) -> io::Result<std::ops::Range<usize>> {
    let start = addr as usize;
    let end = start.checked_add(len).filter(|&end| end <= mem.len());
    match end {
        Some(end) => Ok(start..end),
        None => Err(io::Error::new(
            io::ErrorKind::InvalidInput,
            format!("bus access out of range: {addr}+{len}"),
        )),
    }
}

impl Bus for MemBus {
    fn read_mem(&mut self, addr: u32, buf: &mut [u8]) -> io::Result<()> {
        let inner = self.shared.lock();
        let range = range_check(&inner.mem, addr, buf.len())?;
        buf.copy_from_slice(&inner.mem[range]);
        Ok(())
    }

    fn write_mem(&mut self, addr: u32, data: &[u8]) -> io::Result<()> {
        let mut inner = self.shared.lock();
        let range = range_check(&inner.mem, addr, data.len())?;
        inner.mem[range].copy_from_slice(data);
        Ok(())
    }

    fn read_cmem(&mut self, reg: u8) -> io::Result<u8> {
        let mut inner = self.shared.lock();
        let value = match reg {
            0..=4 => match inner.staged_base.take() {
                Some((old, left)) => {
                    if left > 1 {
                        inner.staged_base = Some((old, left - 1));
                    }
                    old[reg as usize]
                }
                None => inner.base_regs[reg as usize],
            },
            r if r == cmem::R_EVENTS => std::mem::take(&mut inner.r_events),
            r if r == cmem::A_EVENTS => inner.a_events,
            _ => 0,
        };
        Ok(value)
    }

    fn write_cmem(&mut self, reg: u8, data: u8) -> io::Result<()> {
        if reg == cmem::A_EVENTS {
            let mut inner = self.shared.lock();
            inner.a_events |= data & 0xf;
            drop(inner);
            self.shared.peer_irq.notify_one();
        }
        Ok(())
    }
}

/// Host-side [`IrqLine`] raised by the linked [`MemPeer`].
pub struct MemIrq {
    shared: Arc<Shared>,
}

impl IrqLine for MemIrq {
    async fn wait(&mut self) -> io::Result<()> {
        self.shared.host_irq.notified().await;
        Ok(())
    }
}

/// The peer's half of the link.
///
/// Test code uses this to publish a base address, feed A2R packets with the
/// proper ring discipline, and consume the daemon's R2A output.
#[derive(Clone)]
pub struct MemPeer {
    shared: Arc<Shared>,
}

impl MemPeer {
    /// Raise peer event bits and pulse the interrupt line.
    pub fn raise(&self, bits: u8) {
        self.shared.lock().r_events |= bits;
        self.shared.host_irq.notify_one();
    }

    /// Publish `addr` (low bit must be clear) as the new base address and
    /// signal it.
    pub fn set_base_address(&self, addr: u32) {
        assert_eq!(addr & 1, 0, "base address valid bit is reserved");
        {
            let mut inner = self.shared.lock();
            inner.base_regs = base_nibbles(addr);
            inner.staged_base = None;
        }
        self.raise(peer_event::BASE_ADDRESS);
    }

    /// Publish `new` while serving `old` for the next five base-register
    /// reads, so the daemon's double read observes a tear.
    pub fn set_base_address_torn(&self, old: u32, new: u32) {
        {
            let mut inner = self.shared.lock();
            inner.base_regs = base_nibbles(new);
            inner.staged_base = Some((base_nibbles(old), 5));
        }
        self.raise(peer_event::BASE_ADDRESS);
    }

    /// Write directly into shared memory.
    pub fn poke_mem(&self, addr: u32, data: &[u8]) {
        let mut inner = self.shared.lock();
        let start = addr as usize;
        inner.mem[start..start + data.len()].copy_from_slice(data);
    }

    /// Read directly out of shared memory.
    pub fn peek_mem(&self, addr: u32, len: usize) -> Vec<u8> {
        let inner = self.shared.lock();
        let start = addr as usize;
        inner.mem[start..start + len].to_vec()
    }

    /// Append framed packets to the A2R ring at `base`, advance the tail
    /// index, and signal the daemon.
    ///
    /// Panics if the bytes do not fit the ring; tests size their traffic.
    pub fn push_a2r(&self, base: u32, bytes: &[u8]) {
        {
            let mut inner = self.shared.lock();
            let base = base as usize;
            let head = inner.mem[base + status::A2R_HEAD];
            let tail = inner.mem[base + status::A2R_TAIL];
            let free = a314_wire::ring_free(head, tail) as usize;
            assert!(bytes.len() <= free, "A2R ring overflow in test peer");

            let ring = base + A2R_DATA_OFFSET as usize;
            let mut pos = tail as usize;
            for &b in bytes {
                inner.mem[ring + pos] = b;
                pos = (pos + 1) % RING_LEN;
            }
            inner.mem[base + status::A2R_TAIL] = tail.wrapping_add(bytes.len() as u8);
        }
        self.raise(peer_event::A2R_TAIL);
    }

    /// Consume everything currently in the R2A ring at `base`, advance the
    /// head index, and signal the daemon.
    pub fn take_r2a(&self, base: u32) -> Vec<u8> {
        let bytes = {
            let mut inner = self.shared.lock();
            let base = base as usize;
            let head = inner.mem[base + status::R2A_HEAD];
            let tail = inner.mem[base + status::R2A_TAIL];
            let len = a314_wire::ring_used(head, tail) as usize;
            let ring = base + R2A_DATA_OFFSET as usize;

            let mut out = Vec::with_capacity(len);
            let mut pos = head as usize;
            for _ in 0..len {
                out.push(inner.mem[ring + pos]);
                pos = (pos + 1) % RING_LEN;
            }
            inner.mem[base + status::R2A_HEAD] = tail;
            out
        };
        if !bytes.is_empty() {
            self.raise(peer_event::R2A_HEAD);
        }
        bytes
    }

    /// Read `len` R2A ring bytes starting at ring index `from`, following
    /// the wrap, without consuming them.
    pub fn peek_r2a_region(&self, base: u32, from: u8, len: usize) -> Vec<u8> {
        let inner = self.shared.lock();
        let ring = base as usize + R2A_DATA_OFFSET as usize;
        (0..len)
            .map(|i| inner.mem[ring + (from as usize + i) % RING_LEN])
            .collect()
    }

    /// Wait for the daemon to raise host event bits, returning and clearing
    /// them.
    pub async fn host_events(&self) -> u8 {
        loop {
            let pending = std::mem::take(&mut self.shared.lock().a_events);
            if pending != 0 {
                return pending;
            }
            self.shared.peer_irq.notified().await;
        }
    }

    /// Wait until the R2A ring at `base` holds data, then consume it.
    pub async fn next_r2a(&self, base: u32) -> Vec<u8> {
        loop {
            let bytes = self.take_r2a(base);
            if !bytes.is_empty() {
                return bytes;
            }
            self.shared.peer_irq.notified().await;
        }
    }
}
