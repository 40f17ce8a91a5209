//! Module for UDS (Unified diagnostic services - ISO14229) over ISO-TP
//!
//! UDS has no linear address space. [EcuProtocol::read_memory] and
//! [EcuProtocol::write_memory] address data identifiers (DIDs), so only the
//! lower 16 bits of an address may be set.

use crate::{
    channel::CanChannel,
    config::{CanBusConfig, EcuConfig, UdsOptions},
    dtc::{DiagnosticCode, DtcStatusFlags},
    helpers::{ascii_string, await_response, check_pos_response_id, hex_string, EcuNrc},
    protocol::{EcuInfo, EcuProtocol, ProtocolError, ProtocolKind, ProtocolResult, ProtocolState},
};

pub mod isotp;

pub use automotive_diag::uds::{UdsCommand, UdsError, UdsErrorByte};
use automotive_diag::ByteWrapper::{Extended, Standard};
use isotp::IsoTpChannel;

/// Default diagnostic session
pub const SESSION_DEFAULT: u8 = 0x01;
/// Programming session
pub const SESSION_PROGRAMMING: u8 = 0x02;
/// Extended diagnostic session
pub const SESSION_EXTENDED: u8 = 0x03;

impl EcuNrc for UdsErrorByte {
    fn desc(&self) -> String {
        match self {
            Standard(e) => format!("{e:?}"),
            Extended(code) => format!("Extended(0x{code:02X})"),
        }
    }

    fn is_response_pending(&self) -> bool {
        matches!(self, Standard(UdsError::RequestCorrectlyReceivedResponsePending))
    }

    fn is_busy_repeat(&self) -> bool {
        matches!(self, Standard(UdsError::BusyRepeatRequest))
    }
}

/// Identification DIDs read by [EcuProtocol::identify]. (DID, field name, ASCII encoded)
const IDENTIFICATION_DIDS: [(u16, &str, bool); 3] = [
    (0xF186, "active_session", false),
    (0xF187, "part_number", true),
    (0xF189, "software_version", true),
];

/// UDS protocol bound to an ISO-TP link
#[derive(Debug)]
pub struct UdsProtocol {
    isotp: IsoTpChannel,
    options: UdsOptions,
    timeout_ms: u32,
    pending_timeout_ms: u32,
    max_pending_responses: u32,
    connection: String,
    state: ProtocolState,
}

impl UdsProtocol {
    /// Creates a new protocol instance. No I/O is performed until [EcuProtocol::connect]
    ///
    /// ## Parameters
    /// * channel - CAN channel, already configured with the bus settings
    /// * can - CAN addressing of the ECU
    /// * config - ECU configuration, only the UDS options and timings are used
    pub fn new(channel: Box<dyn CanChannel>, can: &CanBusConfig, config: &EcuConfig) -> Self {
        Self {
            isotp: IsoTpChannel::new(
                channel,
                can.request_id,
                can.response_id,
                can.extended_ids,
                config.uds.iso_tp,
            ),
            options: config.uds,
            timeout_ms: can.timeout_ms,
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

    /// Sends a request and returns the positive response
    fn exchange(&mut self, request: &[u8]) -> ProtocolResult<Vec<u8>> {
        let sid = request[0];
        self.isotp.can_channel().clear_rx_buffer()?;
        self.isotp.send(request, self.timeout_ms)?;
        let isotp = &mut self.isotp;
        let resp = await_response::<UdsErrorByte, _>(
            sid,
            self.timeout_ms,
            self.pending_timeout_ms,
            self.max_pending_responses,
            |timeout| isotp.receive(timeout),
        )?;
        check_pos_response_id(sid, &resp)?;
        Ok(resp)
    }

    fn validate_did(address: u32, length: usize) -> ProtocolResult<u16> {
        u16::try_from(address).map_err(|_| ProtocolError::InvalidAddress { address, length })
    }

    fn read_did(&mut self, did: u16) -> ProtocolResult<Vec<u8>> {
        let mut req: Vec<u8> = vec![UdsCommand::ReadDataByIdentifier.into()];
        req.extend_from_slice(&did.to_be_bytes());
        let resp = self.exchange(&req)?;
        if resp.len() < 3 || resp[1..3] != did.to_be_bytes() {
            return Err(ProtocolError::FrameError(format!(
                "response {resp:02X?} does not answer DID 0x{did:04X}"
            )));
        }
        Ok(resp[3..].to_vec())
    }

    fn session_control(&mut self, session: u8) -> ProtocolResult<()> {
        let resp = self.exchange(&[UdsCommand::DiagnosticSessionControl.into(), session])?;
        match resp.get(1) {
            Some(s) if *s == session => Ok(()),
            _ => Err(ProtocolError::ConnectError(format!(
                "ECU did not confirm session 0x{session:02X}: {resp:02X?}"
            ))),
        }
    }
}

impl EcuProtocol for UdsProtocol {
    fn kind(&self) -> ProtocolKind {
        ProtocolKind::Uds
    }

    fn state(&self) -> ProtocolState {
        self.state
    }

    fn connect(&mut self) -> ProtocolResult<()> {
        if self.state == ProtocolState::Connected {
            return Ok(());
        }
        self.state = ProtocolState::Connecting;
        log::info!("Connecting to UDS ECU on {}", self.connection);
        let session = self.options.session_type;
        let res = self
            .isotp
            .can_channel()
            .open()
            .map_err(ProtocolError::from)
            .and_then(|_| self.session_control(session));
        match res {
            Ok(()) => {
                self.state = ProtocolState::Connected;
                log::info!("UDS ECU on {} in session 0x{session:02X}", self.connection);
                Ok(())
            }
            Err(e) => {
                log::error!("UDS session control on {} failed: {e}", self.connection);
                self.state = ProtocolState::Error;
                let _ = self.isotp.can_channel().close();
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
            let req = [UdsCommand::DiagnosticSessionControl.into(), SESSION_DEFAULT];
            if let Err(e) = self.isotp.send(&req, self.timeout_ms) {
                log::warn!("Returning ECU to the default session failed: {e}");
            }
        }
        self.state = ProtocolState::Disconnected;
        log::info!("UDS ECU on {} disconnected", self.connection);
        self.isotp.can_channel().close()?;
        Ok(())
    }

    fn identify(&mut self) -> ProtocolResult<EcuInfo> {
        self.ensure_connected()?;
        let mut info = EcuInfo::new("Siemens MSV", "UDS/ISO14229", self.connection.clone());
        for (did, name, ascii) in IDENTIFICATION_DIDS {
            match self.read_did(did) {
                Ok(data) if !data.is_empty() => {
                    let value = if ascii {
                        ascii_string(&data)
                    } else {
                        hex_string(&data)
                    };
                    info.fields.insert(name.into(), value);
                }
                Ok(_) => {}
                Err(ProtocolError::MemoryAccessError { code, .. }) => {
                    log::debug!("DID 0x{did:04X} not available (NRC 0x{code:02X})");
                }
                Err(e) => return Err(e),
            }
        }
        Ok(info)
    }

    fn read_memory(&mut self, address: u32, length: usize) -> ProtocolResult<Vec<u8>> {
        self.ensure_connected()?;
        let did = Self::validate_did(address, length)?;
        let mut data = self.read_did(did)?;
        if length != 0 && data.len() > length {
            data.truncate(length);
        }
        Ok(data)
    }

    fn write_memory(&mut self, address: u32, data: &[u8]) -> ProtocolResult<()> {
        self.ensure_connected()?;
        let did = Self::validate_did(address, data.len())?;
        if data.is_empty() || data.len() > isotp::MAX_PAYLOAD - 3 {
            return Err(ProtocolError::InvalidAddress {
                address,
                length: data.len(),
            });
        }
        let mut req: Vec<u8> = vec![UdsCommand::WriteDataByIdentifier.into()];
        req.extend_from_slice(&did.to_be_bytes());
        req.extend_from_slice(data);
        let resp = self.exchange(&req)?;
        if resp.len() < 3 || resp[1..3] != did.to_be_bytes() {
            return Err(ProtocolError::FrameError(format!(
                "response {resp:02X?} does not confirm DID 0x{did:04X}"
            )));
        }
        log::debug!("Wrote {} bytes to DID 0x{did:04X}", data.len());
        Ok(())
    }

    fn read_dtcs(&mut self) -> ProtocolResult<Vec<DiagnosticCode>> {
        self.ensure_connected()?;
        let sub = self.options.dtc_sub_function;
        let resp = self.exchange(&[
            UdsCommand::ReadDTCInformation.into(),
            sub,
            self.options.dtc_status_mask,
        ])?;
        if resp.len() < 3 || resp[1] != sub {
            return Err(ProtocolError::FrameError(format!(
                "invalid DTC response {resp:02X?}"
            )));
        }
        Ok(resp[3..]
            .chunks_exact(4)
            .map(|r| {
                (
                    u32::from_be_bytes([0, r[0], r[1], r[2]]),
                    DtcStatusFlags::from_bits_retain(r[3]),
                )
            })
            .filter(|(code, _)| *code != 0)
            .map(|(code, status)| DiagnosticCode::three_byte(code, status))
            .collect())
    }

    fn clear_dtcs(&mut self) -> ProtocolResult<()> {
        self.ensure_connected()?;
        self.exchange(&[UdsCommand::ClearDiagnosticInformation.into(), 0xFF, 0xFF, 0xFF])?;
        log::info!("Cleared DTCs on {}", self.connection);
        Ok(())
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn nrc_lookup() {
        assert_eq!(UdsErrorByte::from(0x31).desc(), "RequestOutOfRange");
        assert!(UdsErrorByte::from(0x78).is_response_pending());
        assert!(UdsErrorByte::from(0x21).is_busy_repeat());
        assert_eq!(u8::from(UdsCommand::ReadDataByIdentifier), 0x22);
        assert_eq!(u8::from(UdsCommand::ReadDTCInformation), 0x19);
    }

    #[test]
    fn did_addresses_are_16_bit() {
        assert_eq!(UdsProtocol::validate_did(0xF187, 0).ok(), Some(0xF187));
        assert!(matches!(
            UdsProtocol::validate_did(0x1_0000, 2),
            Err(ProtocolError::InvalidAddress { address: 0x1_0000, length: 2 })
        ));
    }
}
