//! FR32 Serial Bootloader.
//!
//! Programs the flash of Fujitsu FR32 family MCUs through the two stage
//! serial bootstrap: the built-in boot ROM ([`bootstrap`]) accepts an
//! executable into RAM and calls it, then the RAM resident flash loader
//! ([`loader`]) blank checks, erases, reads and writes the flash array.
//! Flash images are exchanged as Motorola S-Records ([`srec`]).

#[macro_use]
extern crate log;

use embedded_hal::blocking::delay::DelayMs;

pub mod bootstrap;
pub mod checksum;
pub mod loader;
pub mod poll;
pub mod profile;
pub mod protocol;
pub mod srec;
pub mod trace;

#[cfg(feature = "native")]
pub mod native;

#[cfg(test)]
pub(crate) mod mock;

pub use bootstrap::Bootstrap;
pub use loader::{BlankCheck, Loader};
pub use profile::{ChipTable, DeviceProfile};
pub use srec::FlashImage;

/// Byte transport to the target, usually a serial port
///
/// Reads must return `Ok(0)` when nothing has arrived yet rather than
/// blocking indefinitely, every wait in the drivers is a poll loop.
pub trait Transport<E> {
    /// Read up to `buf.len()` bytes, returning the number received
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, E>;

    /// Write `data`, returning the number of bytes accepted
    fn write(&mut self, data: &[u8]) -> Result<usize, E>;

    /// Discard all buffered input and output
    fn purge(&mut self) -> Result<(), E>;

    /// Block until pending output has been sent
    fn drain(&mut self) -> Result<(), E>;

    /// Change the line rate
    fn set_baud(&mut self, baud: u32) -> Result<(), E>;
}

impl<T, E> Transport<E> for &mut T
where
    T: Transport<E> + ?Sized,
{
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, E> {
        (**self).read(buf)
    }
    fn write(&mut self, data: &[u8]) -> Result<usize, E> {
        (**self).write(data)
    }
    fn purge(&mut self) -> Result<(), E> {
        (**self).purge()
    }
    fn drain(&mut self) -> Result<(), E> {
        (**self).drain()
    }
    fn set_baud(&mut self, baud: u32) -> Result<(), E> {
        (**self).set_baud(baud)
    }
}

impl<T, E> Transport<E> for Box<T>
where
    T: Transport<E> + ?Sized,
{
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, E> {
        (**self).read(buf)
    }
    fn write(&mut self, data: &[u8]) -> Result<usize, E> {
        (**self).write(data)
    }
    fn purge(&mut self) -> Result<(), E> {
        (**self).purge()
    }
    fn drain(&mut self) -> Result<(), E> {
        (**self).drain()
    }
    fn set_baud(&mut self, baud: u32) -> Result<(), E> {
        (**self).set_baud(baud)
    }
}

/// Driver errors, generic over the transport error
#[derive(Debug, thiserror::Error)]
pub enum Error<E> {
    #[error("transport error: {0:?}")]
    Transport(E),

    #[error("timed out waiting for the target")]
    Timeout,

    #[error("malformed response {0:02x?}")]
    Malformed(Option<u8>),

    #[error("incomplete response, received {received} of {expected} bytes")]
    NoResponse { expected: usize, received: usize },

    #[error("short write, {written} of {expected} bytes accepted")]
    ShortWrite { expected: usize, written: usize },

    #[error("checksum mismatch (local 0x{local:04x}, remote 0x{remote:04x})")]
    ChecksumMismatch { local: u16, remote: u16 },

    #[error("target rejected block CRC")]
    CrcRejected,

    #[error("target failed to erase flash")]
    EraseFailed,

    #[error("invalid argument: {0}")]
    InvalidArgument(&'static str),
}

impl<E> From<E> for Error<E> {
    fn from(e: E) -> Self {
        Self::Transport(e)
    }
}

/// Delay implementation backed by `std::thread::sleep`
#[derive(Clone, Copy, Debug, Default)]
pub struct StdDelay;

impl DelayMs<u32> for StdDelay {
    fn delay_ms(&mut self, ms: u32) {
        std::thread::sleep(std::time::Duration::from_millis(ms as u64));
    }
}

#[derive(Clone, PartialEq, Debug)]
#[cfg_attr(feature = "structopt", derive(structopt::StructOpt))]
pub struct Options {
    /// Period to poll for target responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1"))]
    pub poll_delay_ms: u32,

    /// Idle polls tolerated while a flash block is streaming in
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "30"))]
    pub read_retries: u32,

    /// Timeout to wait for protocol markers and short responses
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "1000"))]
    pub response_timeout_ms: u32,

    /// Time a transport read may block before returning no data
    #[cfg_attr(feature = "structopt", structopt(long, default_value = "10"))]
    pub read_timeout_ms: u32,
}

impl Default for Options {
    fn default() -> Self {
        Self {
            poll_delay_ms: 1,
            read_retries: 30,
            response_timeout_ms: 1000,
            read_timeout_ms: 10,
        }
    }
}

impl Options {
    /// Idle polls allowed while waiting on a marker or short response,
    /// each one costs a blocked read plus the poll delay
    pub(crate) fn marker_retries(&self) -> u32 {
        let tick = self.poll_delay_ms.saturating_add(self.read_timeout_ms);
        self.response_timeout_ms / tick.max(1)
    }
}

#[cfg(test)]
mod tests {
    use super::Options;

    #[test]
    fn marker_budget_counts_blocked_reads() {
        let o = Options::default();
        assert_eq!(o.marker_retries(), 90);

        let o = Options {
            read_timeout_ms: 0,
            ..Options::default()
        };
        assert_eq!(o.marker_retries(), 1000);

        let o = Options {
            poll_delay_ms: 0,
            read_timeout_ms: 0,
            ..Options::default()
        };
        assert_eq!(o.marker_retries(), 1000);
    }
}
