//! Module for the Denso-style (SH705x family) framed serial protocol
//!
//! Every command is sent in a `STX LEN CMD DATA CHK ETX` frame (See [frame]) and
//! answered with an ACK, NAK or DATA frame. Memory is addressed with 32 bit
//! addresses inside a fixed memory map (See [memory]).
//!
//! ROM and EEPROM can only be written after the sectors being written have been
//! erased during the same connection.

use std::time::Duration;

use crate::{
    channel::ByteChannel,
    config::{DensoOptions, EcuConfig},
    dtc::{DiagnosticCode, DtcStatusFlags},
    helpers::{ascii_string, hex_string, nrc_error},
    protocol::{
        find_region, AccessKind, EcuInfo, EcuProtocol, MemoryRegion, ProtocolError,
        ProtocolKind, ProtocolResult, ProtocolState,
    },
};

mod error;
pub mod frame;
pub mod memory;

pub use error::*;
use frame::Response;
use memory::ErasedSectors;

/// Largest block read or written by a single memory command
pub const MEMORY_BLOCK_SIZE: usize = 240;

/// Pattern sent before the initialize command
pub const SYNC_PATTERN: [u8; 12] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x55, 0xAA,
];

const SYNC_SETTLE_MS: u64 = 100;

/// Denso command codes
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord)]
pub enum DensoCommand {
    /// Initialize communication
    Init,
    /// Read ROM (and EEPROM)
    ReadRom,
    /// Read RAM
    ReadRam,
    /// Write ROM (and EEPROM). Requires erased sectors
    WriteRom,
    /// Write RAM
    WriteRam,
    /// Erase one sector
    EraseSector,
    /// Checksum of a memory range
    Checksum,
    /// ECU identification
    EcuInfo,
    /// Read DTCs
    ReadDtc,
    /// Clear DTCs
    ClearDtc,
    /// Reset the ECU
    Reset,
    /// Wake up after initialization
    WakeUp,
}

impl From<DensoCommand> for u8 {
    fn from(cmd: DensoCommand) -> Self {
        match cmd {
            DensoCommand::Init => 0x00,
            DensoCommand::ReadRom => 0x01,
            DensoCommand::ReadRam => 0x02,
            DensoCommand::WriteRom => 0x03,
            DensoCommand::WriteRam => 0x04,
            DensoCommand::EraseSector => 0x05,
            DensoCommand::Checksum => 0x06,
            DensoCommand::EcuInfo => 0x07,
            DensoCommand::ReadDtc => 0x08,
            DensoCommand::ClearDtc => 0x09,
            DensoCommand::Reset => 0x0A,
            DensoCommand::WakeUp => 0x81,
        }
    }
}

/// 16 bit sum used by the ECU to report a memory range checksum
pub fn range_checksum(data: &[u8]) -> u16 {
    data.iter().fold(0u16, |acc, b| acc.wrapping_add(*b as u16))
}

/// Denso-style protocol bound to a serial byte channel
pub struct DensoProtocol {
    channel: Box<dyn ByteChannel>,
    options: DensoOptions,
    timeout_ms: u32,
    connection: String,
    state: ProtocolState,
    erased: ErasedSectors,
}

impl std::fmt::Debug for DensoProtocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("DensoProtocol")
            .field("connection", &self.connection)
            .field("state", &self.state)
            .field("erased", &self.erased)
            .finish()
    }
}

impl DensoProtocol {
    /// Creates a new protocol instance. No I/O is performed until [EcuProtocol::connect]
    pub fn new(channel: Box<dyn ByteChannel>, config: &EcuConfig) -> Self {
        Self {
            channel,
            options: config.denso,
            timeout_ms: config.connection.timeout_ms(),
            connection: config.connection.describe(),
            state: ProtocolState::Disconnected,
            erased: ErasedSectors::default(),
        }
    }

    fn ensure_connected(&self) -> ProtocolResult<()> {
        match self.state {
            ProtocolState::Connected => Ok(()),
            _ => Err(ProtocolError::NotConnected),
        }
    }

    fn send(&mut self, cmd: DensoCommand, data: &[u8]) -> ProtocolResult<()> {
        let f = frame::encode(cmd.into(), data)?;
        log::debug!("Denso Tx: {f:02X?}");
        self.channel.write_bytes(&f, self.timeout_ms)?;
        Ok(())
    }

    fn exchange(
        &mut self,
        cmd: DensoCommand,
        data: &[u8],
        timeout_ms: u32,
    ) -> ProtocolResult<Response> {
        self.channel.clear_rx_buffer()?;
        self.send(cmd, data)?;
        let (status, payload) = frame::read(self.channel.as_mut(), timeout_ms)?;
        match Response::parse(status, &payload)? {
            Response::Nak(code) => Err(nrc_error::<DensoNak>(code)),
            resp => Ok(resp),
        }
    }

    fn expect_ack(&mut self, cmd: DensoCommand, data: &[u8], timeout_ms: u32) -> ProtocolResult<()> {
        match self.exchange(cmd, data, timeout_ms)? {
            Response::Ack => Ok(()),
            other => Err(ProtocolError::UnexpectedResponse {
                expected: frame::RESP_ACK,
                received: other.status(),
            }),
        }
    }

    fn expect_data(&mut self, cmd: DensoCommand, data: &[u8]) -> ProtocolResult<Vec<u8>> {
        match self.exchange(cmd, data, self.timeout_ms)? {
            Response::Data(d) => Ok(d),
            other => Err(ProtocolError::UnexpectedResponse {
                expected: frame::RESP_DATA,
                received: other.status(),
            }),
        }
    }

    fn handshake(&mut self) -> ProtocolResult<()> {
        log::debug!("Sending sync pattern {SYNC_PATTERN:02X?}");
        self.channel.write_bytes(&SYNC_PATTERN, self.timeout_ms)?;
        std::thread::sleep(Duration::from_millis(SYNC_SETTLE_MS));
        let timeout = self.timeout_ms;
        self.expect_ack(DensoCommand::Init, &[], timeout)?;
        self.expect_ack(DensoCommand::WakeUp, &[0x01, 0x02, 0x03], timeout)
    }

    fn range_request(address: u32, length: usize) -> Vec<u8> {
        let mut req = address.to_be_bytes().to_vec();
        req.extend_from_slice(&(length as u16).to_be_bytes());
        req
    }

    fn verify(&mut self, address: u32, data: &[u8]) -> ProtocolResult<()> {
        let resp = self.expect_data(DensoCommand::Checksum, &Self::range_request(address, data.len()))?;
        let expected = range_checksum(data);
        match resp.as_slice() {
            [hi, lo, ..] if u16::from_be_bytes([*hi, *lo]) == expected => Ok(()),
            _ => Err(ProtocolError::FrameError(format!(
                "write verification at 0x{address:08X} failed, expected checksum 0x{expected:04X}, ECU reported {resp:02X?}"
            ))),
        }
    }
}

impl EcuProtocol for DensoProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::ProprietaryFramed
    }

    fn state(&self) -> ProtocolState {
        self.state
    }

    fn memory_regions(&self) -> &[MemoryRegion] {
        &memory::REGIONS
    }

    fn connect(&mut self) -> ProtocolResult<()> {
        if self.state == ProtocolState::Connected {
            return Ok(());
        }
        self.state = ProtocolState::Connecting;
        self.erased.clear();
        log::info!("Connecting to Denso ECU on {}", self.connection);
        let res = self.channel.open().map_err(ProtocolError::from).and_then(|_| self.handshake());
        match res {
            Ok(()) => {
                self.state = ProtocolState::Connected;
                log::info!("Denso ECU on {} connected", self.connection);
                Ok(())
            }
            Err(e) => {
                log::error!("Denso handshake on {} failed: {e}", self.connection);
                self.state = ProtocolState::Error;
                let _ = self.channel.close();
                Err(match e {
                    ProtocolError::ConnectError(reason) => ProtocolError::ConnectError(reason),
                    other => ProtocolError::ConnectError(other.to_string()),
                })
            }
        }
    }

    fn disconnect(&mut self) -> ProtocolResult<()> {
        if self.state == ProtocolState::Disconnected {
            return Ok(());
        }
        if self.state == ProtocolState::Connected {
            if let Err(e) = self.send(DensoCommand::Reset, &[]) {
                log::warn!("Reset request failed: {e}");
            }
        }
        self.state = ProtocolState::Disconnected;
        self.erased.clear();
        log::info!("Denso ECU on {} disconnected", self.connection);
        self.channel.close()?;
        Ok(())
    }

    fn identify(&mut self) -> ProtocolResult<EcuInfo> {
        self.ensure_connected()?;
        let data = self.expect_data(DensoCommand::EcuInfo, &[])?;
        let mut info = EcuInfo::new("Denso SH705x", "Denso Proprietary", self.connection.clone());
        if data.len() >= 32 {
            let word = |i: usize| u32::from_be_bytes([data[i], data[i + 1], data[i + 2], data[i + 3]]);
            info.fields.insert("cpu_id".into(), hex_string(&data[0..4]).to_uppercase());
            info.fields.insert("rom_size".into(), word(4).to_string());
            info.fields.insert("ram_size".into(), word(8).to_string());
            info.fields.insert("part_number".into(), ascii_string(&data[12..24]));
            info.fields.insert("software_version".into(), ascii_string(&data[24..32]));
            if data.len() >= 48 {
                info.fields.insert(
                    "hardware_version".into(),
                    hex_string(&data[32..40]).to_uppercase(),
                );
                info.fields.insert("calibration_id".into(), ascii_string(&data[40..48]));
            }
        } else {
            log::warn!("ECU info record too short ({} bytes)", data.len());
        }
        Ok(info)
    }

    fn read_memory(&mut self, address: u32, length: usize) -> ProtocolResult<Vec<u8>> {
        self.ensure_connected()?;
        let region = find_region(&memory::REGIONS, address, length)?;
        let cmd = match region.access_kind {
            AccessKind::RAM => DensoCommand::ReadRam,
            _ => DensoCommand::ReadRom,
        };
        let mut res = Vec::with_capacity(length);
        while res.len() < length {
            let addr = address + res.len() as u32;
            let block = std::cmp::min(MEMORY_BLOCK_SIZE, length - res.len());
            let data = self.expect_data(cmd, &Self::range_request(addr, block))?;
            if data.len() != block {
                return Err(ProtocolError::FrameError(format!(
                    "requested {block} bytes at 0x{addr:08X}, ECU returned {}",
                    data.len()
                )));
            }
            res.extend_from_slice(&data);
        }
        Ok(res)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> ProtocolResult<()> {
        self.ensure_connected()?;
        let region = find_region(&memory::REGIONS, address, data.len())?;
        let cmd = if memory::requires_erase(&region) {
            self.erased.check(address, data.len())?;
            DensoCommand::WriteRom
        } else {
            DensoCommand::WriteRam
        };
        let timeout = self.timeout_ms;
        for (idx, block) in data.chunks(MEMORY_BLOCK_SIZE).enumerate() {
            let addr = address + (idx * MEMORY_BLOCK_SIZE) as u32;
            let mut req = Self::range_request(addr, block.len());
            req.extend_from_slice(block);
            self.expect_ack(cmd, &req, timeout)?;
            if self.options.verify_after_write {
                self.verify(addr, block)?;
            }
            log::debug!("Wrote {} bytes to 0x{addr:08X}", block.len());
        }
        Ok(())
    }

    fn read_dtcs(&mut self) -> ProtocolResult<Vec<DiagnosticCode>> {
        self.ensure_connected()?;
        let data = self.expect_data(DensoCommand::ReadDtc, &[])?;
        let Some((count, codes)) = data.split_first() else {
            return Ok(Vec::new());
        };
        Ok(codes
            .chunks_exact(2)
            .take(*count as usize)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .filter(|c| *c != 0)
            .map(|c| DiagnosticCode::two_byte(c, DtcStatusFlags::CONFIRMED))
            .collect())
    }

    fn clear_dtcs(&mut self) -> ProtocolResult<()> {
        self.ensure_connected()?;
        let timeout = self.timeout_ms;
        self.expect_ack(DensoCommand::ClearDtc, &[], timeout)?;
        log::info!("Cleared DTCs on {}", self.connection);
        Ok(())
    }

    fn erase_memory(&mut self, address: u32) -> ProtocolResult<()> {
        self.ensure_connected()?;
        let region = find_region(&memory::REGIONS, address, 1)?;
        if !memory::requires_erase(&region) {
            return Err(ProtocolError::InvalidAddress { address, length: 1 });
        }
        let sector = memory::sector_of(address);
        let timeout = self.options.erase_timeout_ms;
        self.expect_ack(DensoCommand::EraseSector, &sector.to_be_bytes(), timeout)?;
        self.erased.mark(sector);
        log::info!("Erased sector 0x{sector:08X}");
        Ok(())
    }
}
