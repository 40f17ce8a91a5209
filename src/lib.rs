#![warn(
    missing_docs,
    missing_debug_implementations,
    trivial_numeric_casts,
    unused_import_braces,
    unused_qualifications,
    clippy::uninlined_format_args
)]

//! A crate which provides one uniform operation set (connect, identify, read/write memory,
//! read/clear DTCs, disconnect) over three structurally different ECU protocols, and a
//! bridge that manages concurrent sessions with multiple ECUs.
//!
//! ## ECU protocol support
//!
//! ### Keyword protocol 2000 (KWP2000)
//! ISO14230 - K-Line request/response protocol. The bridge wakes the K-Line, opens the
//! connection with the framed `0x81` request, and reads/writes memory with 24 bit addresses.
//!
//! ### Unified diagnostic services (UDS)
//! ISO14229 - CAN based diagnostic protocol. Messages larger than one CAN frame are
//! segmented and reassembled by a software ISO-TP (ISO15765-2) layer (See [uds::isotp]).
//! Memory operations address data identifiers (DIDs).
//!
//! ### Denso-style framed serial protocol
//! `STX LEN CMD DATA CHK ETX` framed serial protocol with a fixed 32 bit memory map.
//! ROM and EEPROM sectors must be erased before they can be written.
//!
//! ## Hardware support
//!
//! * Serial ports / K-Line cables (Feature `serial`)
//! * SocketCAN (Feature `socketcan`, Linux only)
//! * Simulated links for testing without hardware (See [hardware::simulation])
//!
//! ## Logging
//! The crate logs through the [log] facade. Every frame on the wire is logged at debug level.

use channel::ChannelError;
use config::ConfigError;
use protocol::ProtocolError;

pub mod bridge;
pub mod channel;
pub mod config;
pub mod denso;
pub mod dtc;
pub mod hardware;
mod helpers;
pub mod kwp2000;
pub mod protocol;
pub mod uds;

pub use bridge::{Bridge, EcuIdentity, SessionInfo, SessionSnapshot, SessionState};
pub use helpers::EcuNrc;
pub use automotive_diag::ByteWrapper::*;

/// Bridge result
pub type BridgeResult<T> = Result<T, BridgeError>;

#[derive(Debug, Clone, thiserror::Error)]
/// Error returned by [Bridge] operations
pub enum BridgeError {
    /// Configuration missing, invalid, or for the wrong transport. Never reaches the wire
    #[error("Configuration error: {0}")]
    ConfigurationError(
        #[from]
        #[source]
        ConfigError,
    ),
    /// Handshake with the ECU failed or timed out
    #[error("Connection handshake failed: {0}")]
    ConnectError(String),
    /// No active session for the ECU
    #[error("ECU is not connected")]
    NotConnected,
    /// Address range or identifier rejected before sending anything
    #[error("Address range 0x{address:08X} (+{length} bytes) is not valid for this ECU")]
    InvalidAddress {
        /// Requested start address (or data identifier)
        address: u32,
        /// Requested length in bytes
        length: usize,
    },
    /// Malformed frame received
    #[error("Malformed frame: {0}")]
    FrameError(String),
    /// Multi-frame sequence violated or timed out
    #[error("Multi-frame reassembly failed: {0}")]
    ReassemblyError(String),
    /// Negative response from the ECU
    #[error("ECU Negative response. Error 0x{code:02X}, definition: {def:?}")]
    MemoryAccessError {
        /// Raw negative response code from ECU
        code: u8,
        /// Negative response code definition according to protocol
        def: Option<String>,
    },
    /// Write into memory that was not erased first
    #[error("Memory at 0x{address:08X} is write protected (sector not erased)")]
    WriteProtected {
        /// First address that is not writable
        address: u32,
    },
    /// Too many consecutive timeouts or a transport failure. Reconnect to recover
    #[error("Session with {0} is degraded, reconnect required")]
    SessionDegraded(String),
    /// ECU did not respond in time
    #[error("ECU did not respond in time")]
    Timeout(#[source] ChannelError),
    /// Transport failure
    #[error("Transport error: {0}")]
    Transport(#[source] ChannelError),
    /// ECU response does not answer the request
    #[error("Expected response 0x{expected:02X}, but received 0x{received:02X}")]
    UnexpectedResponse {
        /// Expected response id
        expected: u8,
        /// Received response id
        received: u8,
    },
    /// Operation not supported by the ECU's protocol
    #[error("Protocol does not support the request")]
    NotSupported,
}

impl From<ChannelError> for BridgeError {
    fn from(e: ChannelError) -> Self {
        if e.is_timeout() {
            BridgeError::Timeout(e)
        } else {
            BridgeError::Transport(e)
        }
    }
}

impl From<ProtocolError> for BridgeError {
    fn from(e: ProtocolError) -> Self {
        match e {
            ProtocolError::NotConnected => BridgeError::NotConnected,
            ProtocolError::ConnectError(reason) => BridgeError::ConnectError(reason),
            ProtocolError::InvalidAddress { address, length } => {
                BridgeError::InvalidAddress { address, length }
            }
            ProtocolError::FrameError(reason) => BridgeError::FrameError(reason),
            ProtocolError::ReassemblyError(reason) => BridgeError::ReassemblyError(reason),
            ProtocolError::MemoryAccessError { code, def } => {
                BridgeError::MemoryAccessError { code, def }
            }
            ProtocolError::WriteProtected { address } => BridgeError::WriteProtected { address },
            ProtocolError::UnexpectedResponse { expected, received } => {
                BridgeError::UnexpectedResponse { expected, received }
            }
            ProtocolError::NotSupported => BridgeError::NotSupported,
            ProtocolError::Channel(c) => c.into(),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn protocol_errors_keep_their_payload() {
        let e: BridgeError = ProtocolError::MemoryAccessError {
            code: 0x31,
            def: Some("RequestOutOfRange".into()),
        }
        .into();
        assert!(matches!(
            e,
            BridgeError::MemoryAccessError { code: 0x31, def: Some(ref d) } if d == "RequestOutOfRange"
        ));
        let e: BridgeError = ProtocolError::Channel(ChannelError::ReadTimeout).into();
        assert!(matches!(e, BridgeError::Timeout(ChannelError::ReadTimeout)));
        let e: BridgeError = ProtocolError::Channel(ChannelError::InterfaceNotOpen).into();
        assert!(matches!(e, BridgeError::Transport(ChannelError::InterfaceNotOpen)));
        let e: BridgeError = ProtocolError::InvalidAddress {
            address: 0x0100_0000,
            length: 4,
        }
        .into();
        assert_eq!(
            e.to_string(),
            "Address range 0x01000000 (+4 bytes) is not valid for this ECU"
        );
    }
}
