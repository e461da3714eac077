//! SPI implementation of the [`Bus`] seam.
//!
//! The peer's shared memory sits behind an SPI bridge exposed through the
//! Linux spidev interface. Every bus operation is one full-duplex SPI
//! transfer: a command header, then data bytes.
//!
//! Bulk commands carry a 3-byte big-endian header of
//! `(cmd << 20) | (addr & 0xfffff)`; a bulk *read* additionally clocks one
//! zero byte before the response data starts. Control-memory commands are
//! 2-byte transfers with the register number packed into the command byte.

use std::fs::OpenOptions;
use std::io;
use std::mem::size_of;
use std::os::fd::AsRawFd;

use crate::bus::Bus;

/// Default spidev device node.
pub const SPI_DEVICE: &str = "/dev/spidev0.0";

/// Bus clock used for all transfers.
pub const SPI_SPEED_HZ: u32 = 67_000_000;

/// Chip select is active-high on this bridge.
const SPI_CS_HIGH: u8 = 0x04;
const SPI_BITS_PER_WORD: u8 = 8;

// Command codes in the transfer header.
const READ_SRAM_CMD: u32 = 0;
const WRITE_SRAM_CMD: u32 = 1;
const READ_CMEM_CMD: u8 = 2;
const WRITE_CMEM_CMD: u8 = 3;

/// Header bytes clocked out before bulk read response data arrives.
const READ_SRAM_HDR_LEN: usize = 4;

// ── spidev ioctl plumbing ─────────────────────────────────────────────────────

const IOC_WRITE: u64 = 1;
const SPI_IOC_MAGIC: u64 = b'k' as u64;

const fn ioc(dir: u64, nr: u64, size: u64) -> u64 {
    (dir << 30) | (size << 16) | (SPI_IOC_MAGIC << 8) | nr
}

const SPI_IOC_WR_MODE: u64 = ioc(IOC_WRITE, 1, 1);
const SPI_IOC_WR_BITS_PER_WORD: u64 = ioc(IOC_WRITE, 3, 1);
const SPI_IOC_WR_MAX_SPEED_HZ: u64 = ioc(IOC_WRITE, 4, 4);

#[repr(C)]
#[derive(Default)]
struct SpiIocTransfer {
    tx_buf: u64,
    rx_buf: u64,
    len: u32,
    speed_hz: u32,
    delay_usecs: u16,
    bits_per_word: u8,
    cs_change: u8,
    tx_nbits: u8,
    rx_nbits: u8,
    word_delay_usecs: u8,
    pad: u8,
}

const _: () = assert!(size_of::<SpiIocTransfer>() == 32);

const fn spi_ioc_message(n: u64) -> u64 {
    ioc(IOC_WRITE, 0, n * size_of::<SpiIocTransfer>() as u64)
}

fn ioctl_err(ret: libc::c_int) -> io::Result<()> {
    if ret < 0 {
        Err(io::Error::last_os_error())
    } else {
        Ok(())
    }
}

// ── bus implementation ────────────────────────────────────────────────────────

/// Pack a bulk command and 20-bit address into the 3-byte transfer header.
fn bulk_header(cmd: u32, addr: u32) -> [u8; 3] {
    let header = (cmd << 20) | (addr & 0xfffff);
    [
        ((header >> 16) & 0xff) as u8,
        ((header >> 8) & 0xff) as u8,
        (header & 0xff) as u8,
    ]
}

/// [`Bus`] over a spidev character device.
pub struct SpiBus {
    file: std::fs::File,
    tx: Vec<u8>,
    rx: Vec<u8>,
}

impl SpiBus {
    /// Open and configure the spidev device.
    pub fn open(path: &str) -> io::Result<Self> {
        let file = OpenOptions::new().read(true).write(true).open(path)?;
        let fd = file.as_raw_fd();

        let mode = SPI_CS_HIGH;
        let bits = SPI_BITS_PER_WORD;
        let speed = SPI_SPEED_HZ;
        unsafe {
            ioctl_err(libc::ioctl(fd, SPI_IOC_WR_MODE as _, &mode))?;
            ioctl_err(libc::ioctl(fd, SPI_IOC_WR_BITS_PER_WORD as _, &bits))?;
            ioctl_err(libc::ioctl(fd, SPI_IOC_WR_MAX_SPEED_HZ as _, &speed))?;
        }

        tracing::debug!(path, speed_hz = SPI_SPEED_HZ, "spi bus configured");

        Ok(Self {
            file,
            tx: Vec::new(),
            rx: Vec::new(),
        })
    }

    /// Run one full-duplex transfer of `len` bytes from `self.tx` into
    /// `self.rx`.
    fn transfer(&mut self, len: usize) -> io::Result<()> {
        self.tx.resize(len, 0);
        self.rx.resize(len, 0);

        let tr = SpiIocTransfer {
            tx_buf: self.tx.as_ptr() as u64,
            rx_buf: self.rx.as_mut_ptr() as u64,
            len: len as u32,
            speed_hz: SPI_SPEED_HZ,
            bits_per_word: SPI_BITS_PER_WORD,
            ..Default::default()
        };

        unsafe {
            ioctl_err(libc::ioctl(
                self.file.as_raw_fd(),
                spi_ioc_message(1) as _,
                &tr,
            ))
        }
    }
}

impl Bus for SpiBus {
    fn read_mem(&mut self, addr: u32, buf: &mut [u8]) -> io::Result<()> {
        tracing::trace!(addr, len = buf.len(), "spi read mem");

        self.tx.clear();
        self.tx.extend_from_slice(&bulk_header(READ_SRAM_CMD, addr));
        self.tx.push(0);
        self.transfer(buf.len() + READ_SRAM_HDR_LEN)?;

        buf.copy_from_slice(&self.rx[READ_SRAM_HDR_LEN..READ_SRAM_HDR_LEN + buf.len()]);
        Ok(())
    }

    fn write_mem(&mut self, addr: u32, data: &[u8]) -> io::Result<()> {
        tracing::trace!(addr, len = data.len(), "spi write mem");

        self.tx.clear();
        self.tx.extend_from_slice(&bulk_header(WRITE_SRAM_CMD, addr));
        self.tx.extend_from_slice(data);
        self.transfer(data.len() + 3)
    }

    fn read_cmem(&mut self, reg: u8) -> io::Result<u8> {
        self.tx.clear();
        self.tx.push((READ_CMEM_CMD << 4) | (reg & 0xf));
        self.tx.push(0);
        self.transfer(2)?;

        tracing::trace!(reg, value = self.rx[1], "spi read cmem");
        Ok(self.rx[1])
    }

    fn write_cmem(&mut self, reg: u8, data: u8) -> io::Result<()> {
        tracing::trace!(reg, data, "spi write cmem");

        self.tx.clear();
        self.tx.push((WRITE_CMEM_CMD << 4) | (reg & 0xf));
        self.tx.push(data & 0xf);
        self.transfer(2)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn bulk_header_packs_command_and_address() {
        assert_eq!(bulk_header(READ_SRAM_CMD, 0), [0, 0, 0]);
        assert_eq!(bulk_header(WRITE_SRAM_CMD, 0), [0x10, 0, 0]);
        assert_eq!(bulk_header(READ_SRAM_CMD, 0xf_ffff), [0x0f, 0xff, 0xff]);
        assert_eq!(bulk_header(WRITE_SRAM_CMD, 0x12345), [0x11, 0x23, 0x45]);
        // addresses are masked to 20 bits
        assert_eq!(bulk_header(READ_SRAM_CMD, 0xff0_0001), [0x00, 0x00, 0x01]);
    }

    #[test]
    fn ioctl_numbers_match_spidev_abi() {
        assert_eq!(SPI_IOC_WR_MODE, 0x4001_6b01);
        assert_eq!(SPI_IOC_WR_BITS_PER_WORD, 0x4001_6b03);
        assert_eq!(SPI_IOC_WR_MAX_SPEED_HZ, 0x4004_6b04);
        assert_eq!(spi_ioc_message(1), 0x4020_6b00);
    }
}
