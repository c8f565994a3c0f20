//! Simulated flash loader for end to end tests.

#![allow(dead_code)]

use std::collections::VecDeque;

use embedded_hal::blocking::delay::DelayMs;
use fr32_uart_loader::checksum::crc16_ccitt;
use fr32_uart_loader::profile::DeviceProfile;
use fr32_uart_loader::protocol::{LoaderCommand, LoaderResponse, BLOCK_SIZE, ERASED};
use fr32_uart_loader::Transport;

const BUSY: u8 = LoaderResponse::Busy as u8;
const ACK: u8 = LoaderResponse::Ack as u8;
const NAK: u8 = LoaderResponse::Nak as u8;
const ERRBLANK: u8 = LoaderResponse::ErrBlank as u8;
const ERRCRC: u8 = LoaderResponse::ErrCrc as u8;

#[derive(Debug, Clone, PartialEq)]
pub struct SimError;

#[derive(Debug)]
enum Mode {
    Command,
    Block(u32),
}

/// Stage 2 loader answering from an in memory flash array
pub struct Device {
    pub flash: Vec<u8>,
    start: u32,
    end: u32,
    rx: Vec<u8>,
    tx: VecDeque<u8>,
    mode: Mode,
    /// Answer the next block write with ERRCRC
    pub reject_next_write: bool,
    /// Answer erase with NAK
    pub fail_erase: bool,
    /// Busy markers sent while erasing
    pub erase_busy: usize,
    pub writes: Vec<u32>,
    pub reads: usize,
}

impl Device {
    pub fn new(start: u32, end: u32) -> Self {
        Self {
            flash: vec![ERASED; 1 << 24],
            start,
            end,
            rx: vec![],
            tx: VecDeque::new(),
            mode: Mode::Command,
            reject_next_write: false,
            fail_erase: false,
            erase_busy: 3,
            writes: vec![],
            reads: 0,
        }
    }

    pub fn for_profile(p: &DeviceProfile) -> Self {
        Self::new(p.flash_start, p.flash_end)
    }

    fn process(&mut self) {
        loop {
            match self.mode {
                Mode::Command => {
                    let cmd = match self.rx.first() {
                        Some(&c) => c,
                        None => return,
                    };
                    if cmd == LoaderCommand::Intro as u8 {
                        self.rx.remove(0);
                        self.tx.push_back(ACK);
                        continue;
                    }
                    if self.rx.len() < 4 {
                        return;
                    }
                    let address = u32::from_le_bytes([self.rx[1], self.rx[2], self.rx[3], 0]);
                    self.rx.drain(..4);
                    self.command(cmd, address);
                }
                Mode::Block(address) => {
                    if self.rx.len() < BLOCK_SIZE + 2 {
                        return;
                    }
                    let frame: Vec<u8> = self.rx.drain(..BLOCK_SIZE + 2).collect();
                    let (data, crc) = frame.split_at(BLOCK_SIZE);
                    let crc = u16::from_be_bytes([crc[0], crc[1]]);

                    if self.reject_next_write || crc != crc16_ccitt(data) {
                        self.reject_next_write = false;
                        self.tx.push_back(ERRCRC);
                    } else {
                        let a = address as usize;
                        self.flash[a..a + BLOCK_SIZE].copy_from_slice(data);
                        self.writes.push(address);
                        self.tx.extend(&[BUSY, ACK]);
                    }
                    self.mode = Mode::Command;
                }
            }
        }
    }

    fn command(&mut self, cmd: u8, address: u32) {
        let a = address as usize;

        if cmd == LoaderCommand::ReadFlash as u8 {
            let data = &self.flash[a..a + BLOCK_SIZE];
            self.tx.extend(&[BUSY, ACK]);
            self.tx.extend(data);
            self.tx.extend(&crc16_ccitt(data).to_be_bytes());
            self.tx.push_back(ACK);
            self.reads += 1;
        } else if cmd == LoaderCommand::WriteFlash as u8 {
            self.tx.extend(&[BUSY, ACK]);
            self.mode = Mode::Block(address);
        } else if cmd == LoaderCommand::BlankCheck as u8 {
            self.tx.push_back(BUSY);
            let range = self.start as usize..=self.end as usize;
            match self.flash[range.clone()].iter().position(|&b| b != ERASED) {
                None => self.tx.push_back(ACK),
                Some(i) => {
                    let word = (*range.start() + i) & !3;
                    let mut value = [ERASED; 4];
                    value.copy_from_slice(&self.flash[word..word + 4]);
                    self.tx.push_back(ERRBLANK);
                    self.tx.extend(&(word as u32).to_be_bytes());
                    self.tx.extend(&value);
                    self.tx.push_back(ERRBLANK);
                }
            }
        } else if cmd == LoaderCommand::EraseChip as u8 {
            for _ in 0..self.erase_busy + 1 {
                self.tx.push_back(BUSY);
            }
            if self.fail_erase {
                self.tx.push_back(NAK);
            } else {
                let (s, e) = (self.start as usize, self.end as usize);
                self.flash[s..=e].iter_mut().for_each(|b| *b = ERASED);
                self.tx.push_back(ACK);
            }
        }
    }
}

impl Transport<SimError> for Device {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, SimError> {
        let n = buf.len().min(self.tx.len());
        for (b, v) in buf.iter_mut().zip(self.tx.drain(..n)) {
            *b = v;
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, SimError> {
        self.rx.extend_from_slice(data);
        self.process();
        Ok(data.len())
    }

    fn purge(&mut self) -> Result<(), SimError> {
        self.tx.clear();
        Ok(())
    }

    fn drain(&mut self) -> Result<(), SimError> {
        Ok(())
    }

    fn set_baud(&mut self, _baud: u32) -> Result<(), SimError> {
        Ok(())
    }
}

#[derive(Debug, Default)]
pub struct NoDelay;

impl DelayMs<u32> for NoDelay {
    fn delay_ms(&mut self, _ms: u32) {}
}

pub fn profile() -> DeviceProfile {
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

/// Flash contents matching `fixtures/readback.s28`
pub fn pattern(flash: &mut [u8]) {
    for a in 0xC0000..0xC0100 {
        flash[a] = (a % 251) as u8;
    }
    for a in 0xD1230..0xD1240 {
        flash[a] = 0x00;
    }
    flash[0xE0005] = 0x12;
    for a in 0xFFFF0..0x100000 {
        flash[a] = (0xFF - (a & 0x0F)) as u8;
    }
}
