//! The uniform operation set every ECU protocol implements.
//!
//! A protocol owns exactly one transport channel. All data operations check the
//! protocol's connection state before touching that channel, and validate
//! addresses before anything is put on the wire.

use std::collections::BTreeMap;

use strum_macros::{AsRefStr, Display, EnumIter, EnumString};

use crate::{channel::ChannelError, dtc::DiagnosticCode};

/// Protocol result
pub type ProtocolResult<T> = Result<T, ProtocolError>;

/// Supported protocol families
#[derive(
    Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString, EnumIter, AsRefStr,
)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProtocolKind {
    /// KWP2000 over K-Line (ISO14230)
    #[strum(serialize = "kwp2000")]
    Kwp2000,
    /// UDS (ISO14229) over ISO-TP (ISO15765-2) on CAN
    Uds,
    /// Denso-style STX/ETX framed serial protocol
    ProprietaryFramed,
}

impl ProtocolKind {
    /// Returns true if the protocol runs over a CAN bus rather than a serial line
    pub fn uses_can(&self) -> bool {
        matches!(self, ProtocolKind::Uds)
    }
}

/// Internal connection state of a protocol
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ProtocolState {
    /// No link with the ECU
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Handshake completed, data operations are accepted
    Connected,
    /// Handshake failed
    Error,
}

#[derive(Debug, Clone, thiserror::Error)]
/// Error produced by a protocol operation
pub enum ProtocolError {
    /// Operation attempted while the protocol is not connected
    #[error("Protocol is not connected to the ECU")]
    NotConnected,
    /// Handshake with the ECU failed or timed out
    #[error("Connection handshake failed: {0}")]
    ConnectError(String),
    /// Requested address range is not addressable by this protocol
    #[error("Address range 0x{address:08X} (+{length} bytes) is not valid for this ECU")]
    InvalidAddress {
        /// Requested start address (or data identifier)
        address: u32,
        /// Requested length in bytes
        length: usize,
    },
    /// A malformed frame was received
    #[error("Malformed frame: {0}")]
    FrameError(String),
    /// Multi-frame reassembly failed
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
    /// A write was attempted into memory that is not prepared for writing
    #[error("Memory at 0x{address:08X} is write protected (sector not erased)")]
    WriteProtected {
        /// First address that is not writable
        address: u32,
    },
    /// ECU responded, but with a response that does not answer the request
    #[error("Expected response 0x{expected:02X}, but received 0x{received:02X}")]
    UnexpectedResponse {
        /// Expected response id
        expected: u8,
        /// Received response id
        received: u8,
    },
    /// Protocol does not support the request
    #[error("Protocol does not support the request")]
    NotSupported,
    /// Error with underlying communication channel
    #[error("Protocol channel error")]
    Channel(
        #[from]
        #[source]
        ChannelError,
    ),
}

impl ProtocolError {
    /// Returns true if the error was caused by the ECU not answering in time
    pub fn is_timeout(&self) -> bool {
        match self {
            ProtocolError::Channel(c) => c.is_timeout(),
            _ => false,
        }
    }

    /// Returns true if the error means the transport is no longer usable
    pub fn is_fatal(&self) -> bool {
        match self {
            ProtocolError::Channel(c) => c.is_fatal(),
            _ => false,
        }
    }
}

/// Type of memory a region is backed by
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum AccessKind {
    /// Read only memory (Program flash on most ECUs)
    ROM,
    /// Volatile memory
    RAM,
    /// Non volatile data memory
    EEPROM,
    /// Generic flash memory
    Flash,
}

/// A contiguous, addressable memory window declared by a protocol
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct MemoryRegion {
    /// First address of the region
    pub base_address: u32,
    /// Size of the region in bytes
    pub length: u32,
    /// Memory type
    pub access_kind: AccessKind,
}

impl MemoryRegion {
    /// Creates a new region
    pub const fn new(base_address: u32, length: u32, access_kind: AccessKind) -> Self {
        Self {
            base_address,
            length,
            access_kind,
        }
    }

    /// One past the last address of the region
    pub fn end(&self) -> u64 {
        self.base_address as u64 + self.length as u64
    }

    /// Returns true if `[address, address + length)` lies fully inside the region.
    /// Zero length ranges are never contained
    pub fn contains(&self, address: u32, length: usize) -> bool {
        let start = address as u64;
        let end = start + length as u64;
        length != 0 && start >= self.base_address as u64 && end <= self.end()
    }
}

/// Finds the single region that fully contains `[address, address + length)`.
///
/// Ranges spanning two regions, falling outside every region, or overflowing the
/// address width produce [ProtocolError::InvalidAddress]
pub fn find_region(
    regions: &[MemoryRegion],
    address: u32,
    length: usize,
) -> ProtocolResult<MemoryRegion> {
    regions
        .iter()
        .find(|r| r.contains(address, length))
        .copied()
        .ok_or(ProtocolError::InvalidAddress { address, length })
}

/// Identification data reported by an ECU
#[derive(Debug, Clone, PartialEq, Eq, Default)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EcuInfo {
    /// ECU family name
    pub ecu_type: String,
    /// Protocol name
    pub protocol: String,
    /// Connection description, EG: `/dev/ttyUSB0@38400`
    pub connection: String,
    /// Protocol specific identification fields (part number, versions...)
    pub fields: BTreeMap<String, String>,
}

impl EcuInfo {
    /// Creates an info record with no identification fields
    pub fn new(ecu_type: &str, protocol: &str, connection: String) -> Self {
        Self {
            ecu_type: ecu_type.into(),
            protocol: protocol.into(),
            connection,
            fields: BTreeMap::new(),
        }
    }

    /// Looks up an identification field
    pub fn field(&self, name: &str) -> Option<&str> {
        self.fields.get(name).map(|s| s.as_str())
    }
}

/// Capability set implemented once per protocol variant.
///
/// All operations except [EcuProtocol::connect] and [EcuProtocol::disconnect]
/// return [ProtocolError::NotConnected] without touching the transport
/// when the protocol is not in the [ProtocolState::Connected] state.
pub trait EcuProtocol: Send + std::fmt::Debug {
    /// Protocol family
    fn kind(&self) -> ProtocolKind;

    /// Current connection state
    fn state(&self) -> ProtocolState;

    /// Memory regions this protocol can address. Empty for identifier based protocols
    fn memory_regions(&self) -> &[MemoryRegion] {
        &[]
    }

    /// Opens the transport and performs the connection handshake
    fn connect(&mut self) -> ProtocolResult<()>;

    /// Leaves the diagnostic session and closes the transport.
    /// Disconnecting a disconnected protocol succeeds without doing anything
    fn disconnect(&mut self) -> ProtocolResult<()>;

    /// Reads ECU identification data
    fn identify(&mut self) -> ProtocolResult<EcuInfo>;

    /// Reads `length` bytes starting at `address`
    fn read_memory(&mut self, address: u32, length: usize) -> ProtocolResult<Vec<u8>>;

    /// Writes `data` starting at `address`
    fn write_memory(&mut self, address: u32, data: &[u8]) -> ProtocolResult<()>;

    /// Reads stored diagnostic trouble codes
    fn read_dtcs(&mut self) -> ProtocolResult<Vec<DiagnosticCode>>;

    /// Clears all stored diagnostic trouble codes
    fn clear_dtcs(&mut self) -> ProtocolResult<()>;

    /// Erases the memory sector containing `address`, preparing it for writing.
    /// Only protocols with erasable memory support this
    fn erase_memory(&mut self, _address: u32) -> ProtocolResult<()> {
        Err(ProtocolError::NotSupported)
    }
}
