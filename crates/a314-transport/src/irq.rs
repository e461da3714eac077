//! The peer interrupt seam.
//!
//! The peer signals the host by toggling a GPIO line. The sysfs value file
//! for the line becomes `POLLPRI`-ready on every edge; wrapping it in
//! [`AsyncFd`] with [`Interest::PRIORITY`] turns the edges into an
//! awaitable stream.

use std::fs::{File, OpenOptions};
use std::future::Future;
use std::io;
use std::os::fd::AsRawFd;
use std::os::unix::fs::OpenOptionsExt;
use std::time::Duration;

use tokio::io::Interest;
use tokio::io::unix::AsyncFd;

/// GPIO line the peer's interrupt is wired to.
pub const DEFAULT_IRQ_GPIO: u32 = 25;

/// An awaitable edge-triggered interrupt line.
pub trait IrqLine: Send {
    /// Resolve on the next interrupt edge.
    fn wait(&mut self) -> impl Future<Output = io::Result<()>> + Send;
}

/// [`IrqLine`] over a sysfs GPIO value file.
///
/// The first edge after attach only reflects the level the line already had
/// and is swallowed here rather than delivered to the caller.
pub struct GpioIrq {
    gpio: u32,
    fd: AsyncFd<File>,
    first_edge: bool,
}

fn gpio_path(gpio: u32, leaf: &str) -> String {
    format!("/sys/class/gpio/gpio{gpio}/{leaf}")
}

impl GpioIrq {
    /// Export the GPIO, configure it as a both-edges interrupt input, and
    /// register the value fd for priority readiness.
    pub fn export(gpio: u32) -> io::Result<Self> {
        std::fs::write("/sys/class/gpio/export", gpio.to_string())?;

        // The direction file appears asynchronously after export (udev
        // owns its permissions), so retry briefly.
        let direction = gpio_path(gpio, "direction");
        let mut set = false;
        for _ in 0..100 {
            if std::fs::write(&direction, "in").is_ok() {
                set = true;
                break;
            }
            std::thread::sleep(Duration::from_millis(10));
        }
        if !set {
            return Err(io::Error::new(
                io::ErrorKind::NotFound,
                format!("gpio {gpio} direction file never became writable"),
            ));
        }

        std::fs::write(gpio_path(gpio, "edge"), "both")?;

        let value = OpenOptions::new()
            .read(true)
            .custom_flags(libc::O_NONBLOCK)
            .open(gpio_path(gpio, "value"))?;

        let fd = AsyncFd::with_interest(value, Interest::PRIORITY)?;

        tracing::debug!(gpio, "interrupt line exported");

        Ok(Self {
            gpio,
            fd,
            first_edge: true,
        })
    }

    /// Rewind and read the value byte, clearing the pending edge.
    fn consume_edge(&self) -> io::Result<()> {
        let fd = self.fd.get_ref().as_raw_fd();

        if unsafe { libc::lseek(fd, 0, libc::SEEK_SET) } < 0 {
            return Err(io::Error::last_os_error());
        }
        let mut byte = 0u8;
        let n = unsafe { libc::read(fd, (&mut byte as *mut u8).cast(), 1) };
        if n != 1 {
            return Err(io::Error::new(
                io::ErrorKind::UnexpectedEof,
                "gpio value file returned no data",
            ));
        }
        Ok(())
    }
}

impl IrqLine for GpioIrq {
    async fn wait(&mut self) -> io::Result<()> {
        loop {
            let mut guard = self.fd.ready(Interest::PRIORITY).await?;
            self.consume_edge()?;
            guard.clear_ready();

            if self.first_edge {
                self.first_edge = false;
                tracing::debug!(gpio = self.gpio, "discarding initial interrupt edge");
                continue;
            }
            return Ok(());
        }
    }
}

impl Drop for GpioIrq {
    fn drop(&mut self) {
        // Best effort: leave the line the way we found it.
        let _ = std::fs::write(gpio_path(self.gpio, "edge"), "none");
        let _ = std::fs::write("/sys/class/gpio/unexport", self.gpio.to_string());
    }
}
