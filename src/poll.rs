//! Polling helpers shared by both bootstrap stages.
//!
//! Every wait on the target is a software poll: either against a wall
//! clock [`Deadline`], or against a budget of idle reads.

use std::time::{Duration, Instant};

use embedded_hal::blocking::delay::DelayMs;

use crate::{Error, Transport};

/// Wall clock deadline that can be pushed back
#[derive(Clone, Copy, Debug)]
pub struct Deadline {
    window: Duration,
    expires: Instant,
}

impl Deadline {
    pub fn new(window: Duration) -> Self {
        Self {
            window,
            expires: Instant::now() + window,
        }
    }

    pub fn expired(&self) -> bool {
        Instant::now() >= self.expires
    }

    /// Restart the full window from now
    pub fn extend(&mut self) {
        self.expires = Instant::now() + self.window;
    }
}

/// Outcome of a single poll attempt
#[derive(Clone, Copy, Debug, PartialEq)]
pub enum Poll<T> {
    /// Finished with a value
    Ready(T),
    /// Nothing happened, back off before the next attempt
    Idle,
    /// Something happened, try again immediately
    Pending,
    /// The target asked for more time, restart the deadline
    Extend,
}

/// Repeat `attempt` until it is ready or `window` elapses
///
/// `attempt` receives the port and delay so it can run bounded reads of
/// its own, the delay is only used here to back off after [`Poll::Idle`].
///
/// Returns `Ok(None)` on timeout so callers can decide which error that
/// means in their context. The first attempt always runs. Errors returned
/// by `attempt` abort immediately.
pub fn poll<P, D, E, T, F>(
    port: &mut P,
    delay: &mut D,
    window: Duration,
    backoff_ms: u32,
    mut attempt: F,
) -> Result<Option<T>, Error<E>>
where
    D: DelayMs<u32>,
    F: FnMut(&mut P, &mut D) -> Result<Poll<T>, Error<E>>,
{
    let mut deadline = Deadline::new(window);

    loop {
        match attempt(port, delay)? {
            Poll::Ready(v) => return Ok(Some(v)),
            Poll::Idle => delay.delay_ms(backoff_ms),
            Poll::Pending => (),
            Poll::Extend => deadline.extend(),
        }

        if deadline.expired() {
            return Ok(None);
        }
    }
}

/// Read a single byte if one is available
pub fn read_byte<P, E>(port: &mut P) -> Result<Option<u8>, Error<E>>
where
    P: Transport<E>,
{
    let mut b = [0u8; 1];
    match port.read(&mut b)? {
        0 => Ok(None),
        _ => Ok(Some(b[0])),
    }
}

/// Fill `buf` from the port, tolerating up to `retries` consecutive empty
/// reads with `backoff_ms` between them
///
/// The idle budget resets whenever data arrives. Returns the number of
/// bytes received, which is less than `buf.len()` if the budget ran out.
pub fn fill<P, D, E>(
    port: &mut P,
    delay: &mut D,
    buf: &mut [u8],
    retries: u32,
    backoff_ms: u32,
) -> Result<usize, Error<E>>
where
    P: Transport<E>,
    D: DelayMs<u32>,
{
    let mut n = 0;
    let mut idle = retries;

    while n < buf.len() {
        match port.read(&mut buf[n..])? {
            0 if idle == 0 => break,
            0 => {
                idle -= 1;
                delay.delay_ms(backoff_ms);
            }
            r => {
                n += r;
                idle = retries;
            }
        }
    }

    Ok(n)
}

/// Write all of `data` then wait for it to leave the port
pub fn send<P, E>(port: &mut P, data: &[u8]) -> Result<(), Error<E>>
where
    P: Transport<E>,
{
    let written = port.write(data)?;
    if written < data.len() {
        error!("Short write ({} of {} bytes)", written, data.len());
        return Err(Error::ShortWrite {
            expected: data.len(),
            written,
        });
    }

    port.drain()?;

    Ok(())
}
