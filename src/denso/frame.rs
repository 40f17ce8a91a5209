//! Denso-style serial frame codec: `STX LEN CMD DATA... CHK ETX`
//!
//! LEN counts CMD and DATA. CHK is chosen so that LEN + CMD + DATA + CHK is 0 (mod 256).

use crate::{
    channel::ByteChannel,
    helpers::{additive_checksum, deadline_after, remaining_ms, twos_complement_checksum},
    protocol::{ProtocolError, ProtocolResult},
};

/// Start of frame
pub const STX: u8 = 0x02;
/// End of frame
pub const ETX: u8 = 0x03;

/// Most data bytes a frame can hold next to its command byte
pub const MAX_DATA: usize = 254;

/// Largest number of bytes skipped while looking for [STX]
const MAX_GARBAGE: usize = 64;

/// Status byte: command accepted
pub const RESP_ACK: u8 = 0x06;
/// Status byte: command rejected, followed by an error code
pub const RESP_NAK: u8 = 0x15;
/// Status byte: data follows (2 byte big endian length, then data)
pub const RESP_DATA: u8 = 0x80;

/// Encodes a frame
pub fn encode(cmd: u8, data: &[u8]) -> ProtocolResult<Vec<u8>> {
    if data.len() > MAX_DATA {
        return Err(ProtocolError::FrameError(format!(
            "cannot frame {} data bytes",
            data.len()
        )));
    }
    let mut frame = Vec::with_capacity(data.len() + 5);
    frame.push(STX);
    frame.push(data.len() as u8 + 1);
    frame.push(cmd);
    frame.extend_from_slice(data);
    frame.push(twos_complement_checksum(&frame[1..]));
    frame.push(ETX);
    Ok(frame)
}

/// Decodes a complete frame into its command (or status) byte and data
pub fn decode(frame: &[u8]) -> ProtocolResult<(u8, Vec<u8>)> {
    if frame.len() < 5 || frame[0] != STX {
        return Err(ProtocolError::FrameError(format!("invalid frame {frame:02X?}")));
    }
    let len = frame[1] as usize;
    if len == 0 || frame.len() != len + 4 {
        return Err(ProtocolError::FrameError(format!(
            "length byte {len} does not match frame {frame:02X?}"
        )));
    }
    if frame[frame.len() - 1] != ETX {
        return Err(ProtocolError::FrameError(format!(
            "frame {frame:02X?} does not end with ETX"
        )));
    }
    // LEN, CMD, DATA and CHK
    let covered = &frame[1..frame.len() - 1];
    if additive_checksum(covered) != 0 {
        return Err(ProtocolError::FrameError(format!(
            "checksum mismatch in frame {frame:02X?}"
        )));
    }
    Ok((frame[2], frame[3..frame.len() - 2].to_vec()))
}

/// Reads one frame, skipping anything received before [STX]
pub fn read(channel: &mut dyn ByteChannel, timeout_ms: u32) -> ProtocolResult<(u8, Vec<u8>)> {
    let deadline = deadline_after(timeout_ms);
    let mut skipped = 0;
    loop {
        let b = channel.read_bytes(1, remaining_ms(deadline))?;
        if b.first() == Some(&STX) {
            break;
        }
        skipped += 1;
        if skipped > MAX_GARBAGE {
            return Err(ProtocolError::FrameError("no start of frame received".into()));
        }
    }
    if skipped != 0 {
        log::debug!("Skipped {skipped} bytes before STX");
    }
    let mut frame = vec![STX];
    frame.extend_from_slice(&channel.read_bytes(1, remaining_ms(deadline))?);
    let len = match frame.get(1) {
        Some(0) | None => return Err(ProtocolError::FrameError("zero length frame".into())),
        Some(l) => *l as usize,
    };
    frame.extend_from_slice(&channel.read_bytes(len + 2, remaining_ms(deadline))?);
    log::debug!("Denso Rx: {frame:02X?}");
    decode(&frame)
}

/// Decoded ECU response
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Response {
    /// Command accepted
    Ack,
    /// Command rejected with an error code
    Nak(u8),
    /// Data returned by the ECU
    Data(Vec<u8>),
}

impl Response {
    /// Status byte the response was framed with
    pub fn status(&self) -> u8 {
        match self {
            Self::Ack => RESP_ACK,
            Self::Nak(_) => RESP_NAK,
            Self::Data(_) => RESP_DATA,
        }
    }

    /// Interprets a decoded frame as a response
    pub fn parse(status: u8, data: &[u8]) -> ProtocolResult<Self> {
        match status {
            RESP_ACK => Ok(Self::Ack),
            RESP_NAK => Ok(Self::Nak(data.first().copied().unwrap_or(0))),
            RESP_DATA => {
                if data.len() < 2 {
                    return Err(ProtocolError::FrameError("data response without length".into()));
                }
                let len = u16::from_be_bytes([data[0], data[1]]) as usize;
                if data.len() - 2 < len {
                    return Err(ProtocolError::FrameError(format!(
                        "data response announces {len} bytes, carries {}",
                        data.len() - 2
                    )));
                }
                Ok(Self::Data(data[2..2 + len].to_vec()))
            }
            other => Err(ProtocolError::UnexpectedResponse {
                expected: RESP_ACK,
                received: other,
            }),
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_frames_sum_to_zero() {
        for data in [&[][..], &[0x00, 0x01, 0x00, 0x00, 0x00, 0x10][..], &[0xFF; 200][..]] {
            let f = encode(0x01, data).unwrap();
            assert_eq!(f[0], STX);
            assert_eq!(*f.last().unwrap(), ETX);
            assert_eq!(f[1] as usize, data.len() + 1);
            assert_eq!(additive_checksum(&f[1..f.len() - 1]), 0);
            assert_eq!(decode(&f).unwrap(), (0x01, data.to_vec()));
        }
    }

    #[test]
    fn init_frame_layout() {
        assert_eq!(encode(0x00, &[]).unwrap(), vec![0x02, 0x01, 0x00, 0xFF, 0x03]);
    }

    #[test]
    fn checksum_off_by_one_is_rejected() {
        let mut f = encode(0x02, &[0x05, 0xFF, 0xFF, 0x00, 0x00, 0x04]).unwrap();
        let chk = f.len() - 2;
        f[chk] = f[chk].wrapping_add(1);
        assert!(matches!(decode(&f), Err(ProtocolError::FrameError(_))));
    }

    #[test]
    fn missing_etx_is_rejected() {
        let mut f = encode(RESP_ACK, &[]).unwrap();
        let last = f.len() - 1;
        f[last] = 0x04;
        assert!(matches!(decode(&f), Err(ProtocolError::FrameError(_))));
    }

    #[test]
    fn responses() {
        assert_eq!(Response::parse(RESP_ACK, &[]).unwrap(), Response::Ack);
        assert_eq!(Response::parse(RESP_NAK, &[0x05]).unwrap(), Response::Nak(0x05));
        assert_eq!(
            Response::parse(RESP_DATA, &[0x00, 0x02, 0xAA, 0xBB]).unwrap(),
            Response::Data(vec![0xAA, 0xBB])
        );
        assert!(Response::parse(RESP_DATA, &[0x00, 0x03, 0xAA]).is_err());
        assert_eq!(Response::Data(vec![1]).status(), RESP_DATA);
        assert_eq!(Response::Nak(0x05).status(), RESP_NAK);
    }
}
