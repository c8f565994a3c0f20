//! Stage 1: the built-in boot ROM.
//!
//! The ROM only knows how to receive an executable into RAM and call it.
//! [`Bootstrap`] walks it through connect, check, upload and call, after which
//! the flash loader is running and the line rate may be raised for
//! [`crate::Loader`].

use core::marker::PhantomData;
use std::time::Duration;

use embedded_hal::blocking::delay::DelayMs;

use crate::checksum::sum16;
use crate::poll::{fill, poll, read_byte, send, Poll};
use crate::profile::DeviceProfile;
use crate::protocol::{rom_frame, RomCommand, RomResponse, MAX_UPLOAD};
use crate::{Error, Options, Transport};

/// Connect timeout used when the requested one is out of range
pub const DEFAULT_CONNECT_TIMEOUT_S: u32 = 5;

/// Longest connect timeout accepted
pub const MAX_CONNECT_TIMEOUT_S: u32 = 60;

const CONNECT_INTERVAL_MS: u32 = 50;
const COMMAND_GAP_MS: u32 = 10;
const UPLOAD_SETTLE_MS: u32 = 250;
const CHECK_WINDOW: Duration = Duration::from_secs(1);
const WRITE_ACK_WINDOW: Duration = Duration::from_secs(2);

#[derive(Copy, Clone, PartialEq, Debug)]
pub enum State {
    Idle,
    Connected,
    Checked,
    Uploaded,
    Called,
}

pub struct Bootstrap<'a, P, D, E> {
    state: State,
    options: Options,
    port: P,
    delay: D,
    profile: &'a DeviceProfile,
    kernel: Vec<u8>,
    _err: PhantomData<E>,
}

impl<'a, P, D, E> Bootstrap<'a, P, D, E>
where
    P: Transport<E>,
    D: DelayMs<u32>,
    E: core::fmt::Debug,
{
    /// Create a new boot ROM session for `profile` carrying the stage 2
    /// executable `kernel`
    pub fn new(
        port: P,
        delay: D,
        profile: &'a DeviceProfile,
        kernel: Vec<u8>,
        options: Options,
    ) -> Result<Self, Error<E>> {
        if kernel.is_empty() {
            return Err(Error::InvalidArgument("empty stage 2 image"));
        }
        if kernel.len() > MAX_UPLOAD {
            return Err(Error::InvalidArgument("stage 2 image exceeds upload frame"));
        }

        debug!(
            "Stage 2 for {} is {} bytes, loading at 0x{:x}",
            profile.name,
            kernel.len(),
            profile.load_address
        );

        Ok(Self {
            state: State::Idle,
            options,
            port,
            delay,
            profile,
            kernel,
            _err: PhantomData,
        })
    }

    /// Fetch the session state
    pub fn state(&self) -> State {
        self.state
    }

    /// Release the transport and delay, normally once [`State::Called`]
    pub fn into_inner(self) -> (P, D) {
        (self.port, self.delay)
    }

    /// Run the full sequence: connect, check, upload the stage 2 image,
    /// check again, then call it
    pub fn handoff(&mut self, timeout_s: u32) -> Result<(), Error<E>> {
        self.connect(timeout_s)?;
        self.check()?;
        self.upload_kernel()?;
        self.check()?;
        self.call(self.profile.load_address)
    }

    /// Ping until the ROM answers, giving the user a chance to power the
    /// board
    ///
    /// `timeout_s` outside 1..=60 falls back to 5 seconds.
    pub fn connect(&mut self, timeout_s: u32) -> Result<(), Error<E>> {
        let timeout_s = if (1..=MAX_CONNECT_TIMEOUT_S).contains(&timeout_s) {
            timeout_s
        } else {
            warn!(
                "Invalid timeout {}s, using {}s",
                timeout_s, DEFAULT_CONNECT_TIMEOUT_S
            );
            DEFAULT_CONNECT_TIMEOUT_S
        };

        self.port.purge()?;

        debug!("Probing for boot ROM");

        let found = poll(
            &mut self.port,
            &mut self.delay,
            Duration::from_secs(timeout_s as u64),
            CONNECT_INTERVAL_MS,
            |port, _| {
                send(port, &[RomCommand::Connect.into()])?;
                match read_byte(port)? {
                    Some(b) if b == RomResponse::Connect => Ok(Poll::Ready(())),
                    _ => Ok(Poll::Idle),
                }
            },
        )?;

        match found {
            Some(()) => {
                debug!("Boot ROM found");
                self.state = State::Connected;
                Ok(())
            }
            None => {
                error!("Timed out probing for boot ROM");
                Err(Error::Timeout)
            }
        }
    }

    /// Check the ROM is ready for a command
    pub fn check(&mut self) -> Result<(), Error<E>> {
        self.port.purge()?;
        self.delay.delay_ms(COMMAND_GAP_MS);

        send(&mut self.port, &[RomCommand::Check.into()])?;

        let mut last = None;
        let ready = poll(
            &mut self.port,
            &mut self.delay,
            CHECK_WINDOW,
            self.options.poll_delay_ms,
            |port, _| match read_byte(port)? {
                Some(b) if b == RomResponse::Check => Ok(Poll::Ready(())),
                Some(b) => {
                    last = Some(b);
                    Ok(Poll::Pending)
                }
                None => Ok(Poll::Idle),
            },
        )?;

        match (ready, last) {
            (Some(()), _) => {
                if self.state == State::Connected {
                    self.state = State::Checked;
                }
                Ok(())
            }
            (None, None) => {
                error!("No check response from boot ROM");
                Err(Error::Timeout)
            }
            (None, Some(b)) => {
                error!(
                    "Malformed check response 0x{:02x}, power cycle the board and try again",
                    b
                );
                Err(Error::Malformed(Some(b)))
            }
        }
    }

    /// Upload the stage 2 image to the profile load address
    pub fn upload_kernel(&mut self) -> Result<u16, Error<E>> {
        let kernel = core::mem::take(&mut self.kernel);
        let r = self.upload(self.profile.load_address, &kernel);
        self.kernel = kernel;
        r
    }

    /// Write `data` to RAM at `address`, returning the confirmed checksum
    pub fn upload(&mut self, address: u32, data: &[u8]) -> Result<u16, Error<E>> {
        if data.len() > MAX_UPLOAD {
            return Err(Error::InvalidArgument("upload exceeds frame size"));
        }

        self.port.purge()?;
        self.delay.delay_ms(COMMAND_GAP_MS);

        send(&mut self.port, &rom_frame(RomCommand::Write, address))?;

        let ack = poll(
            &mut self.port,
            &mut self.delay,
            WRITE_ACK_WINDOW,
            self.options.poll_delay_ms,
            |port, _| match read_byte(port)? {
                Some(b) if b == RomResponse::Write => Ok(Poll::Ready(())),
                Some(_) => Ok(Poll::Pending),
                None => Ok(Poll::Idle),
            },
        )?;
        if ack.is_none() {
            error!("Boot ROM did not accept write");
            return Err(Error::NoResponse {
                expected: 1,
                received: 0,
            });
        }

        send(&mut self.port, &(data.len() as u16).to_le_bytes())?;

        let local = sum16(data);
        debug!(
            "Writing {} bytes to 0x{:08x}, checksum 0x{:04x}",
            data.len(),
            address,
            local
        );

        send(&mut self.port, data)?;
        self.delay.delay_ms(UPLOAD_SETTLE_MS);

        let mut resp = [0u8; 2];
        let n = fill(
            &mut self.port,
            &mut self.delay,
            &mut resp,
            self.options.marker_retries(),
            self.options.poll_delay_ms,
        )?;
        if n < resp.len() {
            error!("Boot ROM did not confirm write");
            return Err(Error::NoResponse {
                expected: resp.len(),
                received: n,
            });
        }

        let remote = u16::from_le_bytes(resp);
        if local != remote {
            error!(
                "Checksum mismatch 0x{:04x} (host) != 0x{:04x} (MCU)",
                local, remote
            );
            return Err(Error::ChecksumMismatch { local, remote });
        }

        self.state = State::Uploaded;

        Ok(local)
    }

    /// Call `address` and wait for the called code to signal it is running
    ///
    /// The final wait has no fixed deadline, it continues while the target
    /// keeps sending and gives up after a response timeout of silence.
    pub fn call(&mut self, address: u32) -> Result<(), Error<E>> {
        self.port.purge()?;
        self.delay.delay_ms(COMMAND_GAP_MS);

        send(&mut self.port, &rom_frame(RomCommand::Call, address))?;

        let mut ack = [0u8; 1];
        let n = fill(
            &mut self.port,
            &mut self.delay,
            &mut ack,
            self.options.marker_retries(),
            self.options.poll_delay_ms,
        )?;
        match (n, ack[0]) {
            (1, b) if b == RomResponse::Call => (),
            (0, _) => {
                error!("No response to call");
                return Err(Error::Malformed(None));
            }
            (_, b) => {
                error!("Malformed response 0x{:02x} to call", b);
                return Err(Error::Malformed(Some(b)));
            }
        }

        self.delay.delay_ms(COMMAND_GAP_MS);

        let mut last = None;
        let done = poll(
            &mut self.port,
            &mut self.delay,
            Duration::from_millis(self.options.response_timeout_ms as u64),
            self.options.poll_delay_ms,
            |port, _| match read_byte(port)? {
                Some(b) if b == RomResponse::CallDone => Ok(Poll::Ready(())),
                Some(b) => {
                    last = Some(b);
                    Ok(Poll::Extend)
                }
                None => Ok(Poll::Idle),
            },
        )?;

        if done.is_none() {
            error!("Did not receive 0x31 after call");
            return Err(Error::Malformed(last));
        }

        debug!("Stage 2 running at 0x{:08x}", address);
        self.state = State::Called;

        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::mock::{MockError, NoDelay, Script};
    use crate::StdDelay;
    use std::time::Instant;

    fn profile() -> DeviceProfile {
        DeviceProfile {
            name: "MB91F362".to_string(),
            kernel: "m_flash.362".to_string(),
            load_address: 0x80400,
            flash_start: 0xC0000,
            flash_end: 0xFFFFF,
            flash_size: 0x40000,
            clocks: vec![],
        }
    }

    fn session<'a>(
        port: Script,
        profile: &'a DeviceProfile,
        kernel: &[u8],
    ) -> Bootstrap<'a, Script, NoDelay, MockError> {
        Bootstrap::new(port, NoDelay::default(), profile, kernel.to_vec(), Options::default())
            .unwrap()
    }

    #[test]
    fn connect_after_noise() {
        let p = profile();
        let port = Script::new().idle(3).reply(&[0x00]).reply(&[0x46]);
        let mut b = session(port, &p, &[0u8; 4]);

        b.connect(5).unwrap();
        assert_eq!(b.state(), State::Connected);

        let (port, delay) = b.into_inner();
        assert_eq!(port.written, vec![0x56; 5]);
        assert_eq!(port.purges, 1);
        assert_eq!(delay.total_ms, 4 * CONNECT_INTERVAL_MS as u64);
    }

    #[test]
    fn connect_times_out_without_target() {
        let p = profile();
        let mut b: Bootstrap<_, _, MockError> = Bootstrap::new(
            Script::new(),
            StdDelay,
            &p,
            vec![0u8; 4],
            Options::default(),
        )
        .unwrap();

        let start = Instant::now();
        let r = b.connect(1);
        let elapsed = start.elapsed();

        assert!(matches!(r, Err(Error::Timeout)));
        assert!(elapsed >= Duration::from_secs(1));
        assert!(elapsed < Duration::from_secs(3));
        assert_eq!(b.state(), State::Idle);
    }

    #[test]
    fn connect_aborts_on_transport_error() {
        let p = profile();
        let mut b = session(Script::new().idle(2).fail(), &p, &[0u8; 4]);
        assert!(matches!(b.connect(5), Err(Error::Transport(MockError))));
    }

    #[test]
    fn check_ignores_empty_reads() {
        let p = profile();
        let mut b = session(Script::new().idle(10).reply(&[0xF1]), &p, &[0u8; 4]);
        b.check().unwrap();
        assert_eq!(b.into_inner().0.written, vec![0x01]);
    }

    #[test]
    fn check_reports_wrong_byte() {
        let p = profile();
        let mut b = session(Script::new().reply(&[0x46]), &p, &[0u8; 4]);
        assert!(matches!(b.check(), Err(Error::Malformed(Some(0x46)))));
    }

    #[test]
    fn check_times_out_silently() {
        let p = profile();
        let mut b = session(Script::new(), &p, &[0u8; 4]);
        assert!(matches!(b.check(), Err(Error::Timeout)));
    }

    #[test]
    fn upload_confirms_checksum() {
        let p = profile();
        let kernel: Vec<u8> = (0..816u32).map(|i| (i * 13) as u8).collect();
        let sum = sum16(&kernel).to_le_bytes();
        let port = Script::new().idle(2).reply(&[0x83]).reply(&sum);
        let mut b = session(port, &p, &kernel);

        assert_eq!(b.upload_kernel().unwrap(), sum16(&kernel));
        assert_eq!(b.state(), State::Uploaded);

        let (port, _) = b.into_inner();
        let mut expected = vec![0x03, 0x00, 0x04, 0x08, 0x00];
        expected.extend_from_slice(&(816u16).to_le_bytes());
        expected.extend_from_slice(&kernel);
        assert_eq!(port.written, expected);
    }

    #[test]
    fn upload_detects_checksum_mismatch() {
        let p = profile();
        let kernel = [1u8, 2, 3];
        let port = Script::new().reply(&[0x83]).reply(&[0x07, 0x00]);
        let mut b = session(port, &p, &kernel);

        match b.upload(0x80400, &kernel) {
            Err(Error::ChecksumMismatch { local: 6, remote: 7 }) => (),
            r => panic!("unexpected {:?}", r),
        }
        assert_eq!(b.state(), State::Idle);
    }

    #[test]
    fn upload_without_ack_is_a_read_error() {
        let p = profile();
        let mut b = session(Script::new().reply(&[0x00, 0x12]), &p, &[1u8]);
        let start = Instant::now();
        assert!(matches!(
            b.upload(0x80400, &[1]),
            Err(Error::NoResponse { .. })
        ));
        assert!(start.elapsed() >= WRITE_ACK_WINDOW);
    }

    #[test]
    fn upload_rejects_oversized_images() {
        let p = profile();
        assert!(matches!(
            Bootstrap::new(
                Script::new(),
                NoDelay::default(),
                &p,
                vec![0u8; MAX_UPLOAD + 1],
                Options::default()
            ),
            Err(Error::<MockError>::InvalidArgument(_))
        ));

        let mut b = session(Script::new(), &p, &[1u8]);
        assert!(matches!(
            b.upload(0, &[0u8; MAX_UPLOAD + 1]),
            Err(Error::InvalidArgument(_))
        ));
        assert!(b.into_inner().0.written.is_empty());
    }

    #[test]
    fn call_waits_for_stage_two() {
        let p = profile();
        let port = Script::new().reply(&[0x84]).idle(5).reply(&[0x00, 0x12]).reply(&[0x31]);
        let mut b = session(port, &p, &[1u8]);

        b.call(0x80400).unwrap();
        assert_eq!(b.state(), State::Called);
        assert_eq!(b.into_inner().0.written, vec![0x04, 0x00, 0x04, 0x08, 0x00]);
    }

    #[test]
    fn call_rejects_bad_ack() {
        let p = profile();
        let mut b = session(Script::new().reply(&[0x83]), &p, &[1u8]);
        assert!(matches!(b.call(0x80400), Err(Error::Malformed(Some(0x83)))));
    }

    #[test]
    fn call_without_final_byte_is_malformed() {
        let p = profile();
        let mut b = session(Script::new().reply(&[0x84, 0x55]), &p, &[1u8]);
        assert!(matches!(b.call(0x80400), Err(Error::Malformed(Some(0x55)))));
    }

    #[test]
    fn handoff_runs_full_sequence() {
        let p = profile();
        let kernel = [0x10u8, 0x20, 0x30];
        let port = Script::new()
            .reply(&[0x46])
            .reply(&[0xF1])
            .reply(&[0x83])
            .reply(&sum16(&kernel).to_le_bytes())
            .reply(&[0xF1])
            .reply(&[0x84, 0x31]);
        let mut b = session(port, &p, &kernel);

        b.handoff(5).unwrap();
        assert_eq!(b.state(), State::Called);
    }
}
