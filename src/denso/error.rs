use crate::helpers::EcuNrc;

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
/// Error codes following a NAK status byte
pub enum DensoNak {
    /// Command byte is not known to the ECU
    InvalidCommand,
    /// Address is outside of the ECU's memory map
    InvalidAddress,
    /// Requested length is invalid for the command
    InvalidLength,
    /// The ECU received a frame with a bad checksum
    FrameChecksumError,
    /// Target memory is write protected (not erased)
    WriteProtected,
    /// Sector erase failed
    EraseFailed,
    /// Programming the flash failed
    ProgramFailed,
    /// ECU is busy with a previous command
    Busy,
    /// Unknown error code
    Unknown(u8),
}

impl From<u8> for DensoNak {
    fn from(p: u8) -> Self {
        match p {
            0x01 => Self::InvalidCommand,
            0x02 => Self::InvalidAddress,
            0x03 => Self::InvalidLength,
            0x04 => Self::FrameChecksumError,
            0x05 => Self::WriteProtected,
            0x06 => Self::EraseFailed,
            0x07 => Self::ProgramFailed,
            0x08 => Self::Busy,
            x => Self::Unknown(x),
        }
    }
}

impl EcuNrc for DensoNak {
    fn is_response_pending(&self) -> bool {
        false
    }

    fn is_busy_repeat(&self) -> bool {
        *self == DensoNak::Busy
    }
}
