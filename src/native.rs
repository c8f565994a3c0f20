use std::io::{self, ErrorKind, Read, Write};
use std::time::Duration;

use serialport::{ClearBuffer, DataBits, FlowControl, Parity, StopBits};

use crate::Transport;

/// Native serial port, 8N1 without flow control
pub struct Serial {
    port: Box<dyn serialport::SerialPort>,
    name: String,
}

impl Serial {
    /// Open `path` at `baud`, reads return empty after `timeout`
    pub fn open(path: &str, baud: u32, timeout: Duration) -> Result<Self, serialport::Error> {
        let port = serialport::new(path, baud)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(Parity::None)
            .flow_control(FlowControl::None)
            .timeout(timeout)
            .open()?;

        debug!("Opened {} at {} baud", path, baud);

        Ok(Self {
            port,
            name: path.to_string(),
        })
    }
}

impl Transport<io::Error> for Serial {
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, io::Error> {
        match self.port.read(buf) {
            Ok(n) => Ok(n),
            Err(e) if e.kind() == ErrorKind::TimedOut => Ok(0),
            Err(e) => Err(e),
        }
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, io::Error> {
        self.port.write(data)
    }

    fn purge(&mut self) -> Result<(), io::Error> {
        self.port.clear(ClearBuffer::All).map_err(io::Error::from)
    }

    fn drain(&mut self) -> Result<(), io::Error> {
        self.port.flush()
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), io::Error> {
        debug!("Switching {} to {} baud", self.name, baud);
        self.port.set_baud_rate(baud).map_err(io::Error::from)
    }
}
