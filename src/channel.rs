//! Module for the transport boundary between a protocol and the physical ECU link
//!
//! Currently, the following channel types are defined:
//! * [ByteChannel] - Byte stream channel (Serial port, K-Line adapter)
//! * [CanChannel] - Raw CAN frame channel (SocketCAN, CAN adapters)
//!
//! Protocols never open a device themselves, they only ever ask the channel
//! they were given to do so.

use std::sync::Arc;

/// Communication channel result
pub type ChannelResult<T> = Result<T, ChannelError>;

#[derive(Debug, Clone)]
/// Error produced by a communication channel
pub enum ChannelError {
    /// Underlying IO Error with channel
    IOError(Arc<std::io::Error>),
    /// Timeout when writing data to the channel
    WriteTimeout,
    /// Timeout when reading from the channel
    ReadTimeout,
    /// The channel's Rx buffer is empty. Only applies when read timeout is 0
    BufferEmpty,
    /// Unsupported channel request
    UnsupportedRequest,
    /// The interface is not open
    InterfaceNotOpen,
    /// The channel was given settings it cannot apply
    ConfigurationError,
    /// Underlying API error with hardware
    APIError {
        /// Name of the API EG: 'socketCAN', 'serialport'
        api_name: String,
        /// Internal API error code
        code: u8,
        /// API error description
        desc: String,
    },
}

impl ChannelError {
    /// Returns true if the error is a read or write timeout
    pub fn is_timeout(&self) -> bool {
        matches!(self, ChannelError::ReadTimeout | ChannelError::WriteTimeout)
    }

    /// Returns true if the error means the physical link is gone or unusable
    pub fn is_fatal(&self) -> bool {
        matches!(
            self,
            ChannelError::IOError(_) | ChannelError::InterfaceNotOpen | ChannelError::APIError { .. }
        )
    }
}

impl std::fmt::Display for ChannelError {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChannelError::IOError(e) => write!(f, "IO error: {e}"),
            ChannelError::UnsupportedRequest => write!(f, "unsupported channel request"),
            ChannelError::ReadTimeout => write!(f, "timeout reading from channel"),
            ChannelError::WriteTimeout => write!(f, "timeout writing to channel"),
            ChannelError::BufferEmpty => write!(f, "channel's Receive buffer is empty"),
            ChannelError::InterfaceNotOpen => write!(f, "channel's interface is not open"),
            ChannelError::ConfigurationError => write!(f, "channel configuration is invalid"),
            ChannelError::APIError {
                api_name,
                code,
                desc,
            } => write!(f, "underlying {api_name} API error ({code}): {desc}"),
        }
    }
}

impl std::error::Error for ChannelError {
    fn source(&self) -> Option<&(dyn std::error::Error + 'static)> {
        if let Self::IOError(io_err) = self {
            Some(io_err.as_ref())
        } else {
            None
        }
    }
}

impl From<std::io::Error> for ChannelError {
    fn from(e: std::io::Error) -> Self {
        match e.kind() {
            std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => Self::ReadTimeout,
            _ => Self::IOError(Arc::new(e)),
        }
    }
}

/// Byte stream channel used by serial protocols (K-Line KWP2000 and the
/// framed proprietary protocol).
pub trait ByteChannel: Send {
    /// Opens the underlying device.
    /// It is ONLY called after any configuration function
    fn open(&mut self) -> ChannelResult<()>;

    /// Closes the channel. Closing a closed channel is not an error
    fn close(&mut self) -> ChannelResult<()>;

    /// Changes the line speed. Used for slow K-Line wake up sequences
    fn set_baud_rate(&mut self, baud: u32) -> ChannelResult<()>;

    /// Attempts to write bytes to the channel
    ///
    /// ## Parameters
    /// * buffer - The buffer of bytes to write to the channel
    /// * timeout_ms - Timeout for writing bytes. If a value of 0 is used, it tells the channel to write without checking if
    ///   data was actually written.
    fn write_bytes(&mut self, buffer: &[u8], timeout_ms: u32) -> ChannelResult<()>;

    /// Reads exactly `count` bytes from the channel.
    ///
    /// ## Parameters
    /// * count - Number of bytes to read
    /// * timeout_ms - Timeout for the whole read. If the bytes do not arrive in time,
    ///   [ChannelError::ReadTimeout] is returned and any bytes read so far are dropped
    fn read_bytes(&mut self, count: usize, timeout_ms: u32) -> ChannelResult<Vec<u8>>;

    /// Tells the channel to clear its Rx buffer
    fn clear_rx_buffer(&mut self) -> ChannelResult<()>;
}

/// A single classic CAN frame (Up to 8 data bytes)
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CanFrame {
    id: u32,
    dlc: u8,
    data: [u8; 8],
    ext: bool,
}

impl CanFrame {
    /// Creates a new CAN frame. Any data past 8 bytes is ignored
    pub fn new(id: u32, data: &[u8], ext: bool) -> Self {
        let dlc = std::cmp::min(data.len(), 8);
        let mut buf = [0u8; 8];
        buf[..dlc].copy_from_slice(&data[..dlc]);
        Self {
            id,
            dlc: dlc as u8,
            data: buf,
            ext,
        }
    }

    /// CAN ID of the frame
    pub fn id(&self) -> u32 {
        self.id
    }

    /// Data of the frame (`dlc` bytes long)
    pub fn data(&self) -> &[u8] {
        &self.data[..self.dlc as usize]
    }

    /// True if the frame uses a 29bit identifier
    pub fn is_extended(&self) -> bool {
        self.ext
    }
}

/// CAN frame channel used by the UDS protocol. ISO-TP is layered on top
/// of this in software (See [crate::uds::isotp])
pub trait CanChannel: Send {
    /// Opens the CAN interface
    fn open(&mut self) -> ChannelResult<()>;

    /// Closes the CAN interface. Closing a closed channel is not an error
    fn close(&mut self) -> ChannelResult<()>;

    /// Configures the bus speed and identifier width
    fn set_can_cfg(&mut self, bitrate: u32, use_extended: bool) -> ChannelResult<()>;

    /// Writes a single frame onto the bus
    fn write_frame(&mut self, frame: &CanFrame, timeout_ms: u32) -> ChannelResult<()>;

    /// Reads the next frame from the bus, regardless of its ID
    fn read_frame(&mut self, timeout_ms: u32) -> ChannelResult<CanFrame>;

    /// Tells the channel to clear its Rx buffer
    fn clear_rx_buffer(&mut self) -> ChannelResult<()>;
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn can_frame_truncates_long_payloads() {
        let f = CanFrame::new(0x7E0, &[1, 2, 3, 4, 5, 6, 7, 8, 9, 10], false);
        assert_eq!(f.data(), &[1, 2, 3, 4, 5, 6, 7, 8]);
        assert_eq!(f.id(), 0x7E0);
        assert!(!f.is_extended());
    }

    #[test]
    fn io_timeouts_map_to_read_timeout() {
        let e: ChannelError = std::io::Error::from(std::io::ErrorKind::TimedOut).into();
        assert!(e.is_timeout());
        let e: ChannelError = std::io::Error::from(std::io::ErrorKind::BrokenPipe).into();
        assert!(e.is_fatal());
    }
}
