//! Serial port channel (USB K-Line cables, RS232 adapters)

use std::{
    io::{Read, Write},
    time::Duration,
};

use serialport::{ClearBuffer, DataBits, SerialPort, StopBits};

use crate::{
    channel::{ByteChannel, ChannelError, ChannelResult},
    config::{Parity, SerialConfig},
};

impl From<serialport::Error> for ChannelError {
    fn from(e: serialport::Error) -> Self {
        let code = match e.kind() {
            serialport::ErrorKind::NoDevice => 1,
            serialport::ErrorKind::InvalidInput => 2,
            serialport::ErrorKind::Io(_) => 4,
            _ => 3,
        };
        ChannelError::APIError {
            api_name: "serialport".into(),
            code,
            desc: e.description,
        }
    }
}

impl From<Parity> for serialport::Parity {
    fn from(p: Parity) -> Self {
        match p {
            Parity::None => serialport::Parity::None,
            Parity::Even => serialport::Parity::Even,
            Parity::Odd => serialport::Parity::Odd,
        }
    }
}

/// Byte channel on a serial port (8 data bits, 1 stop bit)
pub struct SerialPortChannel {
    cfg: SerialConfig,
    port: Option<Box<dyn SerialPort>>,
}

impl std::fmt::Debug for SerialPortChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SerialPortChannel")
            .field("cfg", &self.cfg)
            .field("open", &self.port.is_some())
            .finish()
    }
}

impl SerialPortChannel {
    /// Creates a channel for the port. The port is opened by [ByteChannel::open]
    pub fn new(cfg: SerialConfig) -> Self {
        Self { cfg, port: None }
    }

    fn safe_with_port<X, T: FnOnce(&mut Box<dyn SerialPort>) -> ChannelResult<X>>(
        &mut self,
        function: T,
    ) -> ChannelResult<X> {
        match self.port.as_mut() {
            Some(port) => function(port),
            None => Err(ChannelError::InterfaceNotOpen),
        }
    }
}

fn timeout(timeout_ms: u32) -> Duration {
    Duration::from_millis(std::cmp::max(1, timeout_ms) as u64)
}

impl ByteChannel for SerialPortChannel {
    fn open(&mut self) -> ChannelResult<()> {
        if self.port.is_some() {
            return Ok(());
        }
        log::debug!("Opening serial port {}", self.cfg.port);
        let port = serialport::new(&self.cfg.port, self.cfg.baud_rate)
            .data_bits(DataBits::Eight)
            .stop_bits(StopBits::One)
            .parity(self.cfg.parity.into())
            .timeout(timeout(self.cfg.timeout_ms))
            .open()?;
        self.port = Some(port);
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        if self.port.take().is_some() {
            log::debug!("Closed serial port {}", self.cfg.port);
        }
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> ChannelResult<()> {
        self.cfg.baud_rate = baud;
        match self.port.as_mut() {
            Some(port) => Ok(port.set_baud_rate(baud)?),
            None => Ok(()),
        }
    }

    fn write_bytes(&mut self, buffer: &[u8], timeout_ms: u32) -> ChannelResult<()> {
        self.safe_with_port(|port| {
            port.set_timeout(timeout(timeout_ms))?;
            port.write_all(buffer).map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut => ChannelError::WriteTimeout,
                _ => ChannelError::from(e),
            })?;
            port.flush()?;
            Ok(())
        })
    }

    fn read_bytes(&mut self, count: usize, timeout_ms: u32) -> ChannelResult<Vec<u8>> {
        self.safe_with_port(|port| {
            port.set_timeout(timeout(timeout_ms))?;
            let mut buf = vec![0u8; count];
            port.read_exact(&mut buf)?;
            Ok(buf)
        })
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        self.safe_with_port(|port| Ok(port.clear(ClearBuffer::Input)?))
    }
}

impl Drop for SerialPortChannel {
    #[allow(unused_must_use)]
    fn drop(&mut self) {
        self.close();
    }
}
