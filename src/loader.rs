//! Stage 2: the RAM resident flash loader.
//!
//! Once [`crate::Bootstrap`] has called the loader it answers a small
//! command set over the same port, typically at a higher line rate. Every
//! block transfer is 512 bytes protected by a CRC16/CCITT.

use core::marker::PhantomData;
use std::time::Duration;

use embedded_hal::blocking::delay::DelayMs;

use crate::checksum::crc16_ccitt;
use crate::poll::{fill, poll, read_byte, send, Poll};
use crate::profile::DeviceProfile;
use crate::protocol::{loader_frame, LoaderCommand, LoaderResponse, BLOCK_SIZE, ERASED};
use crate::srec::{is_blank, FlashImage, IMAGE_SIZE};
use crate::{Error, Options, Transport};

const INTRO_SETTLE_MS: u32 = 100;
const INTRO_INTERVAL_MS: u32 = 100;
const INTRO_WINDOW: Duration = Duration::from_secs(10);
const BLANK_WINDOW: Duration = Duration::from_secs(1);
const ERASE_WINDOW: Duration = Duration::from_secs(30);
const COMMAND_GAP_MS: u32 = 10;

/// Result of a blank check
#[derive(Copy, Clone, PartialEq, Debug)]
pub enum BlankCheck {
    Blank,
    /// First programmed word found by the loader
    NotBlank { address: u32, value: u32 },
}

impl BlankCheck {
    pub fn is_blank(&self) -> bool {
        *self == BlankCheck::Blank
    }
}

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Idle,
    Introduced,
    BlankKnown,
    Erased,
    Read,
    Written,
}

pub struct Loader<'a, P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    profile: &'a DeviceProfile,
    _err: PhantomData<E>,
}

impl<'a, P, D, E> Loader<'a, P, D, E>
where
    P: Transport<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a loader session on a port already running stage 2
    pub fn new(port: P, delay: D, profile: &'a DeviceProfile, options: Options) -> Self {
        Self {
            state: State::Idle,
            options,
            port,
            delay,
            profile,
            _err: PhantomData,
        }
    }

    pub fn state(&self) -> State {
        self.state
    }

    pub fn into_inner(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Greet the loader, this must be the first command after the call
    pub fn intro(&mut self) -> Result<(), Error<E>> {
        self.delay.delay_ms(INTRO_SETTLE_MS);

        if let Some(b) = read_byte(&mut self.port)? {
            info!("Discarding leftover byte 0x{:02x}", b);
        }

        let ok = poll(
            &mut self.port,
            &mut self.delay,
            INTRO_WINDOW,
            INTRO_INTERVAL_MS,
            |port, _| {
                send(port, &[LoaderCommand::Intro.into()])?;
                match read_byte(port)? {
                    Some(b) if b == LoaderResponse::Ack => Ok(Poll::Ready(())),
                    Some(b) => {
                        debug!("Intro answered with 0x{:02x}", b);
                        Ok(Poll::Idle)
                    }
                    None => Ok(Poll::Idle),
                }
            },
        )?;

        if ok.is_none() {
            error!("Flash loader did not acknowledge intro");
            return Err(Error::Malformed(None));
        }

        debug!("Flash loader ready");
        self.state = State::Introduced;

        Ok(())
    }

    /// Ask the loader whether the flash starting at `base` is erased
    pub fn blank_check(&mut self, base: u32) -> Result<BlankCheck, Error<E>> {
        self.port.purge()?;
        self.delay.delay_ms(COMMAND_GAP_MS);

        send(&mut self.port, &loader_frame(LoaderCommand::BlankCheck, base))?;

        let retries = self.options.marker_retries();
        let backoff = self.options.poll_delay_ms;

        let r = poll(
            &mut self.port,
            &mut self.delay,
            BLANK_WINDOW,
            backoff,
            |port, delay| {
                let b = match read_byte(port)? {
                    Some(b) => b,
                    None => return Ok(Poll::Idle),
                };

                if b == LoaderResponse::Busy {
                    debug!("Blank check busy");
                    Ok(Poll::Pending)
                } else if b == LoaderResponse::Ack {
                    Ok(Poll::Ready(BlankCheck::Blank))
                } else if b == LoaderResponse::ErrBlank {
                    let mut diag = [0u8; 9];
                    let n = fill(port, delay, &mut diag, retries, backoff)?;
                    if n < diag.len() {
                        error!("Blank check diagnostic incomplete ({} bytes)", n);
                        return Err(Error::Malformed(None));
                    }
                    if diag[8] != LoaderResponse::ErrBlank {
                        error!("Blank check confirmation 0x{:02x}", diag[8]);
                        return Err(Error::Malformed(Some(diag[8])));
                    }
                    let address = u32::from_be_bytes([diag[0], diag[1], diag[2], diag[3]]);
                    let value = u32::from_be_bytes([diag[4], diag[5], diag[6], diag[7]]);
                    Ok(Poll::Ready(BlankCheck::NotBlank { address, value }))
                } else {
                    warn!("Ignoring unexpected blank check response 0x{:02x}", b);
                    Ok(Poll::Pending)
                }
            },
        )?;

        match r {
            Some(v) => {
                match v {
                    BlankCheck::Blank => debug!("Flash is blank"),
                    BlankCheck::NotBlank { address, value } => debug!(
                        "Flash not blank, 0x{:08x} at 0x{:08x}",
                        value, address
                    ),
                }
                self.state = State::BlankKnown;
                Ok(v)
            }
            None => {
                error!("Timed out waiting for blank check");
                Err(Error::Timeout)
            }
        }
    }

    /// Erase the whole chip
    ///
    /// Each busy marker from the loader restarts the 30 second window.
    pub fn erase_chip(&mut self, base: u32) -> Result<(), Error<E>> {
        self.port.purge()?;

        send(&mut self.port, &loader_frame(LoaderCommand::EraseChip, base))?;

        let mut marker = [0u8; 1];
        fill(
            &mut self.port,
            &mut self.delay,
            &mut marker,
            self.options.marker_retries(),
            self.options.poll_delay_ms,
        )?;

        let r = poll(
            &mut self.port,
            &mut self.delay,
            ERASE_WINDOW,
            self.options.poll_delay_ms,
            |port, _| match read_byte(port)? {
                Some(b) if b == LoaderResponse::Busy => {
                    debug!("Erase busy");
                    Ok(Poll::Extend)
                }
                Some(b) if b == LoaderResponse::Ack => Ok(Poll::Ready(())),
                Some(b) if b == LoaderResponse::Nak => {
                    error!("Flash loader failed to erase chip");
                    Err(Error::EraseFailed)
                }
                Some(b) => {
                    error!("Malformed erase response 0x{:02x}", b);
                    Err(Error::Malformed(Some(b)))
                }
                None => Ok(Poll::Idle),
            },
        )?;

        if r.is_none() {
            error!("Timed out waiting for erase");
            return Err(Error::Timeout);
        }

        info!("Chip erased");
        self.state = State::Erased;

        Ok(())
    }

    /// Write one block at `base`, returning the CRC sent with it
    pub fn write_block(&mut self, base: u32, data: &[u8; BLOCK_SIZE]) -> Result<u16, Error<E>> {
        self.port.purge()?;

        send(&mut self.port, &loader_frame(LoaderCommand::WriteFlash, base))?;

        for name in &["busy", "ready"] {
            let mut marker = [0u8; 1];
            let n = self.fill(&mut marker, self.options.marker_retries())?;
            if n == 0 {
                error!("No {} marker for write at 0x{:06x}", name, base);
                return Err(Error::NoResponse {
                    expected: 1,
                    received: 0,
                });
            }
        }

        send(&mut self.port, data)?;

        let crc = crc16_ccitt(data);
        send(&mut self.port, &crc.to_be_bytes())?;

        let mut resp = [0u8; 2];
        let n = self.fill(&mut resp, self.options.marker_retries())?;

        if n >= 1 && resp[0] == LoaderResponse::ErrCrc {
            error!("Flash loader rejected CRC 0x{:04x} at 0x{:06x}", crc, base);
            return Err(Error::CrcRejected);
        }
        if n < resp.len() {
            error!("Incomplete write response at 0x{:06x}", base);
            return Err(Error::NoResponse {
                expected: resp.len(),
                received: n,
            });
        }
        let expected = [LoaderResponse::Busy as u8, LoaderResponse::Ack as u8];
        if let Some((&got, _)) = resp.iter().zip(&expected).find(|(a, b)| a != b) {
            error!("Malformed write response {:02x?}", resp);
            return Err(Error::Malformed(Some(got)));
        }

        trace!("Wrote block 0x{:06x} crc 0x{:04x}", base, crc);
        self.state = State::Written;

        Ok(crc)
    }

    /// Read one block at `base` into `out`, returning the CRC it carried
    ///
    /// `out` is reset to the erased value first, it holds whatever arrived
    /// if the read fails part way.
    pub fn read_block(&mut self, base: u32, out: &mut [u8; BLOCK_SIZE]) -> Result<u16, Error<E>> {
        out.iter_mut().for_each(|b| *b = ERASED);

        self.port.purge()?;
        self.delay.delay_ms(COMMAND_GAP_MS);

        send(&mut self.port, &loader_frame(LoaderCommand::ReadFlash, base))?;

        for expected in &[LoaderResponse::Busy, LoaderResponse::Ack] {
            let mut marker = [0u8; 1];
            match self.fill(&mut marker, self.options.marker_retries())? {
                0 => {
                    error!("Missing {:?} marker for read at 0x{:06x}", expected, base);
                    return Err(Error::Malformed(None));
                }
                _ if marker[0] != *expected => {
                    error!(
                        "Expected {:?} for read at 0x{:06x}, got 0x{:02x}",
                        expected, base, marker[0]
                    );
                    return Err(Error::Malformed(Some(marker[0])));
                }
                _ => (),
            }
        }

        let n = self.fill(out, self.options.read_retries)?;
        if n < out.len() {
            error!(
                "Incomplete block at 0x{:06x}, {} of {} bytes",
                base,
                n,
                out.len()
            );
            return Err(Error::NoResponse {
                expected: out.len(),
                received: n,
            });
        }

        let mut trailer = [0u8; 3];
        let n = self.fill(&mut trailer, self.options.marker_retries())?;
        if n < trailer.len() {
            error!("Incomplete block trailer at 0x{:06x}", base);
            return Err(Error::NoResponse {
                expected: trailer.len(),
                received: n,
            });
        }
        if trailer[2] != LoaderResponse::Ack {
            error!("Block confirmation 0x{:02x} at 0x{:06x}", trailer[2], base);
            return Err(Error::Malformed(Some(trailer[2])));
        }

        let remote = u16::from_be_bytes([trailer[0], trailer[1]]);
        let local = crc16_ccitt(&out[..]);
        if local != remote {
            error!(
                "CRC mismatch at 0x{:06x}, 0x{:04x} (host) != 0x{:04x} (MCU)",
                base, local, remote
            );
            return Err(Error::ChecksumMismatch { local, remote });
        }

        trace!("Read block 0x{:06x} crc 0x{:04x}", base, remote);
        self.state = State::Read;

        Ok(remote)
    }

    /// Read the whole flash into a new image
    ///
    /// `progress` is called with the address and CRC of every block read.
    pub fn read_flash<F>(&mut self, mut progress: F) -> Result<FlashImage, Error<E>>
    where
        F: FnMut(u32, u16),
    {
        let mut image = FlashImage::new();
        let range = self.profile.flash_range();
        let end = range.end.min(IMAGE_SIZE as u32);
        let mut block = [ERASED; BLOCK_SIZE];

        debug!(
            "Reading {} flash 0x{:06x} - 0x{:06x}",
            self.profile.name, range.start, end
        );

        for address in self.profile.blocks() {
            if address >= end {
                break;
            }
            let crc = self.read_block(address, &mut block)?;

            let top = address.saturating_add(BLOCK_SIZE as u32).min(end);
            let len = (top - address) as usize;
            image.slice_mut(address..top).copy_from_slice(&block[..len]);

            progress(address, crc);
        }

        Ok(image)
    }

    /// Write every block of `image` in the flash that is not blank
    ///
    /// Returns the number of blocks written, `progress` is called with the
    /// address of every block visited and whether it was written.
    pub fn program<F>(&mut self, image: &FlashImage, mut progress: F) -> Result<usize, Error<E>>
    where
        F: FnMut(u32, bool),
    {
        let start = self.profile.flash_start;
        let end = self.profile.flash_end.min(IMAGE_SIZE as u32 - 1);
        let mut written = 0;

        for address in (start..=end).step_by(BLOCK_SIZE) {
            let top = address.saturating_add(BLOCK_SIZE as u32).min(end + 1);
            let window = image.slice(address..top);

            if is_blank(window) {
                progress(address, false);
                continue;
            }

            let mut block = [ERASED; BLOCK_SIZE];
            block[..window.len()].copy_from_slice(window);

            self.write_block(address, &block)?;
            written += 1;

            progress(address, true);
        }

        info!("Programmed {} blocks", written);

        Ok(written)
    }

    fn fill(&mut self, buf: &mut [u8], retries: u32) -> Result<usize, Error<E>> {
        fill(
            &mut self.port,
            &mut self.delay,
            buf,
            retries,
            self.options.poll_delay_ms,
        )
    }
}
