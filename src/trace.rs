//! Traffic dumping for any [`Transport`].

use crate::Transport;

/// Transport wrapper logging all traffic as hex at debug level
pub struct HexTrace<T> {
    inner: T,
    label: String,
    enabled: bool,
}

impl<T> HexTrace<T> {
    pub fn new(inner: T, label: &str, enabled: bool) -> Self {
        Self {
            inner,
            label: label.to_string(),
            enabled,
        }
    }

    pub fn into_inner(self) -> T {
        self.inner
    }
}

impl<T, E> Transport<E> for HexTrace<T>
where
    T: Transport<E>,
{
    fn read(&mut self, buf: &mut [u8]) -> Result<usize, E> {
        let n = self.inner.read(buf)?;
        if self.enabled && n > 0 {
            debug!("{} RX: {}", self.label, hex::encode_upper(&buf[..n]));
        }
        Ok(n)
    }

    fn write(&mut self, data: &[u8]) -> Result<usize, E> {
        let n = self.inner.write(data)?;
        if self.enabled {
            debug!("{} TX: {}", self.label, hex::encode_upper(&data[..n]));
        }
        Ok(n)
    }

    fn purge(&mut self) -> Result<(), E> {
        self.inner.purge()
    }

    fn drain(&mut self) -> Result<(), E> {
        self.inner.drain()
    }

    fn set_baud(&mut self, baud: u32) -> Result<(), E> {
        if self.enabled {
            debug!("{} baud {}", self.label, baud);
        }
        self.inner.set_baud(baud)
    }
}
