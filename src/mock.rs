//! Scripted transport for driver tests.

use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;

use crate::Transport;

#[derive(Debug, Clone, PartialEq)]
pub struct MockError;

#[derive(Debug)]
enum Step {
    Bytes(Vec<u8>),
    Idle,
    Fail,
}

/// Transport answering reads from a fixed script
///
/// Each scripted step feeds one or more reads, reads past the end of the
/// script return nothing. Purges do not discard scripted input.
#[derive(Debug, Default)]
pub struct Script {
    steps: VecDeque<Step>,
    pub written: Vec<u8>,
    pub purges: usize,
    pub drains: usize,
    pub baud: Option<u32>,
    accept: Option<usize>,
    fail_writes: bool,
}

impl Script {
    pub fn new() -> Self {
        Self::default()
    }

    /// Queue bytes for subsequent reads
    pub fn reply(mut self, data: &[u8]) -> Self {
        self.steps.push_back(Step::Bytes(data.to_vec()));
        self
    }

    /// Queue `n` empty reads
    pub fn idle(mut self, n: usize) -> Self {
        for _ in 0..n {
            self.steps.push_back(Step::Idle);
        }
        self
    }

    /// Queue a failing read
    pub fn fail(mut self) -> Self {
        self.steps.push_back(Step::Fail);
        self
    }

    /// Accept at most `n` bytes per write
    pub fn accept(mut self, n: usize) -> Self {
        self.accept = Some(n);
        self
    }

    /// Fail every write
    pub fn fail_writes(mut self) -> Self {
        self.fail_writes = true;
        self
    }
}

impl Transport<MockError> for Script {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, MockError> {
        match self.steps.pop_front() {
            None | Some(Step::Idle) => Ok(0),
            Some(Step::Fail) => Err(MockError),
            Some(Step::Bytes(mut data)) => {
                let n = data.len().min(buf.len());
                buf[..n].copy_from_slice(&data[..n]);
                if n < data.len() {
                    let rest = data.split_off(n);
                    self.steps.push_front(Step::Bytes(rest));
                }
                Ok(n)
            }
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, MockError> {
        if self.fail_writes {
            return Err(MockError);
        }
        let n = self.accept.map_or(data.len(), |a| a.min(data.len()));
        self.written.extend_from_slice(&data[..n]);
        Ok(n)
    }

    fn purge(&mut self) -> Result<(), MockError> {
        self.purges += 1;
        Ok(())
    }

    fn drain(&mut self) -> Result<(), MockError> {
        self.drains += 1;
        Ok(())
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), MockError> {
        self.baud = Some(baud);
        Ok(())
    }
}

/// Delay that only records the time asked for
#[derive(Debug, Default)]
pub struct NoDelay {
    pub total_ms: u64,
}

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, ms: u32) {
        self.total_ms += ms as u64;
    }
}
