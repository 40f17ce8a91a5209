//! Module for KWP2000 (Keyword protocol 2000 - ISO14230) over K-Line
//!
//! Every exchange is a single `[Length][Data...][Checksum]` frame in each direction
//! (See [frame]). The connection is opened with a wake up pattern followed by the
//! framed connect request `0x81`, which the ECU acknowledges with `0x50`.
//!
//! Addressing is 24 bit. Memory transfers are split into blocks of
//! [MEMORY_BLOCK_SIZE] bytes.

use std::time::Duration;

use crate::{
    channel::{ByteChannel, ChannelError},
    config::{EcuConfig, Kwp2000Options},
    dtc::{DiagnosticCode, DtcStatusFlags},
    helpers::{await_response, hex_string, EcuNrc},
    protocol::{
        find_region, AccessKind, EcuInfo, EcuProtocol, MemoryRegion, ProtocolError,
        ProtocolKind, ProtocolResult, ProtocolState,
    },
};

pub mod frame;

pub use automotive_diag::kwp2000::{KwpCommand, KwpError, KwpErrorByte};
use automotive_diag::ByteWrapper::{Extended, Standard};

/// Largest block read or written by a single memory request
pub const MEMORY_BLOCK_SIZE: usize = 128;

/// Generic positive status byte
pub const POSITIVE_RESPONSE: u8 = 0x50;

/// The whole 24 bit address space
const ADDRESS_SPACE: [MemoryRegion; 1] = [MemoryRegion::new(0, 0x0100_0000, AccessKind::Flash)];

/// K-Line link service opening communication (Sent as the connect byte)
pub const START_COMMUNICATION: u8 = 0x81;
/// K-Line link service closing communication
pub const STOP_COMMUNICATION: u8 = 0x82;
/// Reads stored DTCs with the status group selected by the next byte
pub const READ_DIAGNOSTIC_TROUBLE_CODES: u8 = 0x19;

impl EcuNrc for KwpErrorByte {
    fn desc(&self) -> String {
        match self {
            Standard(e) => format!("{e:?}"),
            Extended(code) => format!("Extended(0x{code:02X})"),
        }
    }

    fn is_response_pending(&self) -> bool {
        matches!(self, Standard(KwpError::RequestCorrectlyReceivedResponsePending))
    }

    fn is_busy_repeat(&self) -> bool {
        matches!(self, Standard(KwpError::BusyRepeatRequest))
    }
}

/// KWP2000 protocol bound to a K-Line byte channel
pub struct Kwp2000Protocol {
    channel: Box<dyn ByteChannel>,
    options: Kwp2000Options,
    timeout_ms: u32,
    pending_timeout_ms: u32,
    max_pending_responses: u32,
    connection: String,
    state: ProtocolState,
}

impl std::fmt::Debug for Kwp2000Protocol {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Kwp2000Protocol")
            .field("connection", &self.connection)
            .field("state", &self.state)
            .field("options", &self.options)
            .finish()
    }
}

impl Kwp2000Protocol {
    /// Creates a new protocol instance. No I/O is performed until [EcuProtocol::connect]
    ///
    /// ## Parameters
    /// * channel - K-Line channel, already configured with the line settings
    /// * config - ECU configuration, only the KWP2000 options and timings are used
    pub fn new(channel: Box<dyn ByteChannel>, config: &EcuConfig) -> Self {
        Self {
            channel,
            options: config.kwp2000.clone(),
            timeout_ms: config.connection.timeout_ms(),
            pending_timeout_ms: config.pending_timeout_ms,
            max_pending_responses: config.max_pending_responses,
            connection: config.connection.describe(),
            state: ProtocolState::Disconnected,
        }
    }

    fn ensure_connected(&self) -> ProtocolResult<()> {
        match self.state {
            ProtocolState::Connected => Ok(()),
            _ => Err(ProtocolError::NotConnected),
        }
    }

    fn send_frame(&mut self, data: &[u8]) -> ProtocolResult<()> {
        let frame = frame::encode(data, self.options.checksum)?;
        log::debug!("K-Line Tx: {frame:02X?}");
        self.channel.write_bytes(&frame, self.timeout_ms)?;
        Ok(())
    }

    /// Sends a request and returns the positive response payload (status byte included)
    fn exchange(&mut self, request: &[u8]) -> ProtocolResult<Vec<u8>> {
        let sid = request[0];
        self.channel.clear_rx_buffer()?;
        self.send_frame(request)?;
        let checksum = self.options.checksum;
        let channel = &mut self.channel;
        let resp = await_response::<KwpErrorByte, _>(
            sid,
            self.timeout_ms,
            self.pending_timeout_ms,
            self.max_pending_responses,
            |timeout| frame::read(channel.as_mut(), checksum, timeout),
        )?;
        match resp.first() {
            Some(&POSITIVE_RESPONSE) => Ok(resp),
            Some(r) if *r == sid.wrapping_add(0x40) => Ok(resp),
            Some(r) => Err(ProtocolError::UnexpectedResponse {
                expected: POSITIVE_RESPONSE,
                received: *r,
            }),
            None => Err(ProtocolError::FrameError("empty response".into())),
        }
    }

    fn send_wake_pattern(&mut self) -> ProtocolResult<()> {
        log::debug!("Sending K-Line wake pattern {:02X?}", self.options.wake_pattern);
        if self.options.wake_byte_delay_ms == 0 {
            self.channel
                .write_bytes(&self.options.wake_pattern, self.timeout_ms)?;
        } else {
            let delay = Duration::from_millis(self.options.wake_byte_delay_ms as u64);
            for b in self.options.wake_pattern.iter() {
                self.channel.write_bytes(&[*b], self.timeout_ms)?;
                std::thread::sleep(delay);
            }
        }
        std::thread::sleep(Duration::from_millis(self.options.wake_settle_ms as u64));
        Ok(())
    }

    fn handshake(&mut self) -> ProtocolResult<()> {
        self.send_wake_pattern()?;
        self.channel.clear_rx_buffer()?;
        self.send_frame(&[START_COMMUNICATION])?;
        let resp = frame::read(self.channel.as_mut(), self.options.checksum, self.timeout_ms)?;
        match resp.first() {
            Some(&POSITIVE_RESPONSE) => Ok(()),
            Some(r) => Err(ProtocolError::ConnectError(format!(
                "ECU answered the connect request with 0x{r:02X}"
            ))),
            None => Err(ProtocolError::ConnectError("empty connect response".into())),
        }
    }
}

impl EcuProtocol for Kwp2000Protocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Kwp2000
    }

    fn state(&self) -> ProtocolState {
        self.state
    }

    fn memory_regions(&self) -> &[MemoryRegion] {
        &ADDRESS_SPACE
    }

    fn connect(&mut self) -> ProtocolResult<()> {
        if self.state == ProtocolState::Connected {
            return Ok(());
        }
        self.state = ProtocolState::Connecting;
        log::info!("Connecting to KWP2000 ECU on {}", self.connection);
        let res = self.channel.open().map_err(ProtocolError::from).and_then(|_| self.handshake());
        match res {
            Ok(()) => {
                self.state = ProtocolState::Connected;
                log::info!("KWP2000 ECU on {} connected", self.connection);
                Ok(())
            }
            Err(e) => {
                log::error!("KWP2000 handshake on {} failed: {e}", self.connection);
                self.state = ProtocolState::Error;
                let _ = self.channel.close();
                Err(match e {
                    ProtocolError::ConnectError(reason) => ProtocolError::ConnectError(reason),
                    ProtocolError::Channel(ChannelError::ReadTimeout) => {
                        ProtocolError::ConnectError("no response to connect request".into())
                    }
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
            if let Err(e) = self.send_frame(&[STOP_COMMUNICATION]) {
                log::warn!("Stop communication request failed: {e}");
            }
        }
        self.state = ProtocolState::Disconnected;
        log::info!("KWP2000 ECU on {} disconnected", self.connection);
        self.channel.close()?;
        Ok(())
    }

    fn identify(&mut self) -> ProtocolResult<EcuInfo> {
        self.ensure_connected()?;
        let resp = self.exchange(&[KwpCommand::ReadECUIdentification.into(), 0x86])?;
        let mut info = EcuInfo::new("Bosch ME17", "KWP2000", self.connection.clone());
        let data = &resp[1..];
        if data.len() >= 20 {
            info.fields.insert("part_number".into(), hex_string(&data[0..10]));
            info.fields.insert("sw_version".into(), hex_string(&data[10..14]));
            info.fields.insert("hw_version".into(), hex_string(&data[14..18]));
            info.fields.insert("supplier_id".into(), hex_string(&data[18..20]));
        } else {
            log::warn!("ECU identification record too short ({} bytes)", data.len());
        }
        Ok(info)
    }

    fn read_memory(&mut self, address: u32, length: usize) -> ProtocolResult<Vec<u8>> {
        self.ensure_connected()?;
        find_region(&ADDRESS_SPACE, address, length)?;
        let mut res = Vec::with_capacity(length);
        while res.len() < length {
            let addr = address + res.len() as u32;
            let block = std::cmp::min(MEMORY_BLOCK_SIZE, length - res.len());
            let mut req: Vec<u8> = vec![KwpCommand::ReadMemoryByAddress.into()];
            req.extend_from_slice(&addr.to_be_bytes()[1..]);
            req.extend_from_slice(&(block as u16).to_be_bytes());
            let resp = self.exchange(&req)?;
            let data = &resp[1..];
            if data.len() != block {
                return Err(ProtocolError::FrameError(format!(
                    "requested {block} bytes at 0x{addr:06X}, ECU returned {}",
                    data.len()
                )));
            }
            res.extend_from_slice(data);
        }
        Ok(res)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> ProtocolResult<()> {
        self.ensure_connected()?;
        find_region(&ADDRESS_SPACE, address, data.len())?;
        for (idx, block) in data.chunks(MEMORY_BLOCK_SIZE).enumerate() {
            let addr = address + (idx * MEMORY_BLOCK_SIZE) as u32;
            let mut req: Vec<u8> = vec![KwpCommand::WriteMemoryByAddress.into()];
            req.extend_from_slice(&addr.to_be_bytes()[1..]);
            req.extend_from_slice(block);
            self.exchange(&req)?;
            log::debug!("Wrote {} bytes to 0x{addr:06X}", block.len());
        }
        Ok(())
    }

    fn read_dtcs(&mut self) -> ProtocolResult<Vec<DiagnosticCode>> {
        self.ensure_connected()?;
        let resp = self.exchange(&[READ_DIAGNOSTIC_TROUBLE_CODES, 0x02])?;
        Ok(resp[1..]
            .chunks_exact(2)
            .map(|c| u16::from_be_bytes([c[0], c[1]]))
            .filter(|c| *c != 0)
            .map(|c| DiagnosticCode::two_byte(c, DtcStatusFlags::CONFIRMED))
            .collect())
    }

    fn clear_dtcs(&mut self) -> ProtocolResult<()> {
        self.ensure_connected()?;
        self.exchange(&[KwpCommand::ClearDiagnosticInformation.into(), 0xFF, 0x00])?;
        log::info!("Cleared DTCs on {}", self.connection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nrc_lookup() {
        assert_eq!(KwpErrorByte::from(0x33).desc(), "SecurityAccessDenied");
        assert!(KwpErrorByte::from(0x78).is_response_pending());
        assert!(KwpErrorByte::from(0x21).is_busy_repeat());
        assert!(!KwpErrorByte::from(0x31).is_response_pending());
        assert_eq!(u8::from(KwpCommand::ReadMemoryByAddress), 0x23);
        assert_eq!(u8::from(KwpCommand::WriteMemoryByAddress), 0x3D);
    }
}
