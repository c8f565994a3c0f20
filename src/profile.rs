//! Device profiles and the chip definition file.
//!
//! Each MCU is described by a section of an ini style file:
//!
//! ```text
//! [MB91F362]
//! DownloadFile=m_flash.362
//! LoadAddress=0x80400
//! StartAddress=0xC0000
//! EndAddress=0xFFFFF
//! FlashSize=0x40000
//! Clock=10MHz,12.5MHz,13.5MHz,17MHz
//! Baud=9600,9600,9600,9600
//! Baud2=57600,38400,57600,115200
//! ```
//!
//! `Clock`, `Baud` and `Baud2` are parallel lists, the stage 1 and stage 2
//! line rates follow the crystal fitted to the board.

use std::fs;
use std::ops::Range;
use std::path::Path;

use crate::protocol::BLOCK_SIZE;

/// Stage 2 rate used when a profile does not name one
pub const DEFAULT_STAGE2_BAUD: u32 = 115_200;

/// Highest address representable by the 24 bit flash loader
pub const ADDRESS_MAX: u32 = 0x00FF_FFFF;

#[derive(Debug, thiserror::Error)]
pub enum ProfileError {
    #[error("could not read chip definitions: {0}")]
    Io(#[from] std::io::Error),

    #[error("line {line}: invalid entry '{text}'")]
    Syntax { line: usize, text: String },

    #[error("line {line}: '{key}' has invalid value '{value}'")]
    Value {
        line: usize,
        key: String,
        value: String,
    },

    #[error("{device}: missing '{key}'")]
    Missing { device: String, key: &'static str },

    #[error("{device}: invalid flash address 0x{address:x}")]
    Range { device: String, address: u32 },

    #[error("{device}: clock and baud lists differ in length")]
    ClockTable { device: String },

    #[error("unknown device '{0}'")]
    UnknownDevice(String),

    #[error("{device}: crystal {crystal_hz} Hz is not supported")]
    UnsupportedClock { device: String, crystal_hz: u32 },
}

/// Line rates for one crystal frequency
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct ClockRate {
    pub crystal_hz: u32,
    pub stage1_baud: u32,
    pub stage2_baud: Option<u32>,
}

impl ClockRate {
    /// Stage 2 rate, falling back to [`DEFAULT_STAGE2_BAUD`]
    pub fn stage2(&self) -> u32 {
        self.stage2_baud.unwrap_or(DEFAULT_STAGE2_BAUD)
    }
}

/// Immutable description of one MCU
#[derive(Clone, Debug, PartialEq)]
pub struct DeviceProfile {
    /// Normalised device name
    pub name: String,
    /// File name of the stage 2 executable
    pub kernel: String,
    /// RAM address the stage 2 executable is loaded to and called at
    pub load_address: u32,
    pub flash_start: u32,
    /// Last flash address, inclusive
    pub flash_end: u32,
    pub flash_size: u32,
    pub clocks: Vec<ClockRate>,
}

impl DeviceProfile {
    /// Resolve the line rates for a crystal frequency
    pub fn rates(&self, crystal_hz: u32) -> Result<ClockRate, ProfileError> {
        self.clocks
            .iter()
            .find(|c| c.crystal_hz == crystal_hz)
            .copied()
            .ok_or_else(|| ProfileError::UnsupportedClock {
                device: self.name.clone(),
                crystal_hz,
            })
    }

    /// Flash addresses covered by a full read
    pub fn flash_range(&self) -> Range<u32> {
        self.flash_start..self.flash_start.saturating_add(self.flash_size)
    }

    /// Start addresses of every loader block in the flash
    pub fn blocks(&self) -> impl Iterator<Item = u32> {
        self.flash_range().step_by(BLOCK_SIZE)
    }
}

/// Normalise a device name the way section headings are matched
pub fn normalise_name(name: &str) -> String {
    name.trim()
        .chars()
        .map(|c| match c {
            '/' | ':' | ' ' => '_',
            c => c.to_ascii_uppercase(),
        })
        .collect()
}

/// Parse a frequency in megahertz such as `4`, `12.5` or `16MHz` into hertz
pub fn parse_mhz(s: &str) -> Option<u32> {
    let s = s.trim();
    let s = match s.len().checked_sub(3) {
        Some(i) if s.is_char_boundary(i) && s[i..].eq_ignore_ascii_case("mhz") => &s[..i],
        _ => s,
    };

    let (whole, frac) = match s.find('.') {
        Some(i) => (&s[..i], &s[i + 1..]),
        None => (s, ""),
    };
    if whole.is_empty() || frac.len() > 6 {
        return None;
    }

    let whole: u32 = whole.parse().ok()?;
    let frac_hz = if frac.is_empty() {
        0
    } else {
        let digits: u32 = frac.parse().ok()?;
        digits * 10u32.pow(6 - frac.len() as u32)
    };

    whole.checked_mul(1_000_000)?.checked_add(frac_hz)
}

fn parse_hex(s: &str) -> Option<u32> {
    let s = s.trim();
    let s = s
        .strip_prefix("0x")
        .or_else(|| s.strip_prefix("0X"))
        .unwrap_or(s);
    u32::from_str_radix(s, 16).ok()
}

fn parse_list<F>(line: usize, key: &str, value: &str, f: F) -> Result<Vec<u32>, ProfileError>
where
    F: Fn(&str) -> Option<u32>,
{
    value
        .split(',')
        .map(|v| {
            f(v).ok_or_else(|| ProfileError::Value {
                line,
                key: key.to_string(),
                value: v.trim().to_string(),
            })
        })
        .collect()
}

#[derive(Default)]
struct Section {
    name: String,
    kernel: Option<String>,
    load_address: Option<u32>,
    flash_start: Option<u32>,
    flash_end: Option<u32>,
    flash_size: Option<u32>,
    clock: Vec<u32>,
    baud: Vec<u32>,
    baud2: Vec<u32>,
}

impl Section {
    fn finish(self) -> Result<DeviceProfile, ProfileError> {
        let name = self.name;
        let missing = |key| ProfileError::Missing {
            device: name.clone(),
            key,
        };

        let kernel = self.kernel.ok_or_else(|| missing("DownloadFile"))?;
        let load_address = self.load_address.ok_or_else(|| missing("LoadAddress"))?;
        let flash_start = self.flash_start.ok_or_else(|| missing("StartAddress"))?;
        let flash_end = self.flash_end.ok_or_else(|| missing("EndAddress"))?;
        let flash_size = self.flash_size.ok_or_else(|| missing("FlashSize"))?;

        let last = flash_start.saturating_add(flash_size).saturating_sub(1);
        let bad = [flash_start, flash_end, last]
            .iter()
            .copied()
            .find(|&a| a > ADDRESS_MAX)
            .or_else(|| Some(flash_end).filter(|&e| e < flash_start));
        if let Some(address) = bad {
            return Err(ProfileError::Range {
                device: name,
                address,
            });
        }

        let (clock, baud, baud2) = (self.clock, self.baud, self.baud2);

        if clock.len() != baud.len() || (!baud2.is_empty() && baud2.len() != clock.len()) {
            return Err(ProfileError::ClockTable { device: name });
        }

        let clocks = clock
            .iter()
            .enumerate()
            .map(|(i, &crystal_hz)| ClockRate {
                crystal_hz,
                stage1_baud: baud[i],
                stage2_baud: baud2.get(i).copied().filter(|&b| b > 0),
            })
            .collect();

        Ok(DeviceProfile {
            name,
            kernel,
            load_address,
            flash_start,
            flash_end,
            flash_size,
            clocks,
        })
    }
}

/// All devices from a chip definition file
#[derive(Clone, Debug, Default, PartialEq)]
pub struct ChipTable {
    devices: Vec<DeviceProfile>,
}

impl ChipTable {
    /// Load a chip definition file
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ProfileError> {
        let text = fs::read_to_string(path)?;
        Self::parse(&text)
    }

    /// Parse chip definitions from text
    pub fn parse(text: &str) -> Result<Self, ProfileError> {
        let mut devices = Vec::new();
        let mut current: Option<Section> = None;

        for (i, raw) in text.lines().enumerate() {
            let line = i + 1;
            let s = raw.trim();

            if s.is_empty() || s.starts_with(';') || s.starts_with('#') {
                continue;
            }

            if s.starts_with('[') && s.ends_with(']') {
                if let Some(section) = current.take() {
                    devices.push(section.finish()?);
                }
                current = Some(Section {
                    name: normalise_name(&s[1..s.len() - 1]),
                    ..Default::default()
                });
                continue;
            }

            let section = match current.as_mut() {
                Some(section) => section,
                None => {
                    debug!("Ignoring line {} outside of a device section", line);
                    continue;
                }
            };

            let (key, value) = match s.find('=') {
                Some(n) => (s[..n].trim(), s[n + 1..].trim()),
                None => {
                    return Err(ProfileError::Syntax {
                        line,
                        text: s.to_string(),
                    })
                }
            };

            let hex = |v: &str| {
                parse_hex(v).ok_or_else(|| ProfileError::Value {
                    line,
                    key: key.to_string(),
                    value: v.to_string(),
                })
            };

            match key.to_ascii_lowercase().as_str() {
                "downloadfile" => section.kernel = Some(value.to_string()),
                "loadaddress" => section.load_address = Some(hex(value)?),
                "startaddress" => section.flash_start = Some(hex(value)?),
                "endaddress" => section.flash_end = Some(hex(value)?),
                "flashsize" => section.flash_size = Some(hex(value)?),
                "clock" => section.clock = parse_list(line, key, value, parse_mhz)?,
                "baud" => section.baud = parse_list(line, key, value, |v| v.trim().parse().ok())?,
                "baud2" => section.baud2 = parse_list(line, key, value, |v| v.trim().parse().ok())?,
                _ => debug!("Ignoring unknown key '{}' on line {}", key, line),
            }
        }

        if let Some(section) = current.take() {
            devices.push(section.finish()?);
        }

        Ok(Self { devices })
    }

    /// Find a device by name, case insensitive
    pub fn get(&self, name: &str) -> Result<&DeviceProfile, ProfileError> {
        let name = normalise_name(name);
        self.devices
            .iter()
            .find(|d| d.name == name)
            .ok_or(ProfileError::UnknownDevice(name))
    }

    pub fn devices(&self) -> &[DeviceProfile] {
        &self.devices
    }
}
