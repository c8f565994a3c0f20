
/// Largest image the boot ROM accepts in one WRITE frame
pub const MAX_UPLOAD: usize = 4096;

/// Flash block size used by the loader READFLASH / WRITEFLASH commands
pub const BLOCK_SIZE: usize = 512;

/// Value of an erased flash byte
pub const ERASED: u8 = 0xFF;

/// Boot ROM (stage 1) commands
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum RomCommand {
    /// Look for the power-on ROM state, doubles as a ping
    Connect = 0x56,

    /// Check the ROM is ready for a command
    Check = 0x01,

    /// Write data to RAM, followed by a 4 byte little endian address
    Write = 0x03,

    /// Call a RAM address, followed by a 4 byte little endian address
    Call = 0x04,
}

/// Boot ROM (stage 1) responses
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum RomResponse {
    /// Answer to [`RomCommand::Connect`], only sent directly after power-on
    Connect = 0x46,

    /// Answer to [`RomCommand::Check`]
    Check = 0xF1,

    /// Ready to receive the size and payload of a write
    Write = 0x83,

    /// Call accepted
    Call = 0x84,

    /// Sent just before the called code starts, the MCU side baud rate changes after this
    CallDone = 0x31,
}

/// Flash loader (stage 2) commands
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum LoaderCommand {
    /// Write a 512 byte block followed by a CRC16
    WriteFlash = 0x08,

    /// Read a 512 byte block followed by a CRC16
    ReadFlash = 0x28,

    /// Erase the whole chip
    EraseChip = 0x38,

    /// Test whether the flash is erased
    BlankCheck = 0x48,

    /// Only accepted as the first byte after the boot ROM call
    Intro = 0xE8,
}

/// Flash loader (stage 2) responses
#[derive(Debug, PartialEq, Clone, Copy)]
pub enum LoaderResponse {
    /// Command is executing, a final response follows
    Busy = 0x30,

    /// Command succeeded
    Ack = 0x31,

    /// Command failed
    Nak = 0x32,

    /// Blank check failed, a 32 bit address and 32 bit value follow
    ErrBlank = 0x34,

    /// Block CRC did not match
    ErrCrc = 0x35,
}

impl From<RomCommand> for u8 {
    fn from(c: RomCommand) -> u8 {
        c as u8
    }
}

impl From<LoaderCommand> for u8 {
    fn from(c: LoaderCommand) -> u8 {
        c as u8
    }
}

impl PartialEq<RomResponse> for u8 {
    fn eq(&self, other: &RomResponse) -> bool {
        *self == *other as u8
    }
}

impl PartialEq<LoaderResponse> for u8 {
    fn eq(&self, other: &LoaderResponse) -> bool {
        *self == *other as u8
    }
}

/// Encode a boot ROM command frame with a 32 bit little endian address
pub fn rom_frame(cmd: RomCommand, address: u32) -> [u8; 5] {
    let a = address.to_le_bytes();
    [cmd.into(), a[0], a[1], a[2], a[3]]
}

/// Encode a loader command frame with a 24 bit little endian address
pub fn loader_frame(cmd: LoaderCommand, address: u32) -> [u8; 4] {
    let a = address.to_le_bytes();
    [cmd.into(), a[0], a[1], a[2]]
}
