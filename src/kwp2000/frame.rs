//! K-Line frame codec: `[Length][Data...][Checksum]`

use crate::{
    channel::ByteChannel,
    config::KwpChecksum,
    helpers::{additive_checksum, deadline_after, inverted_checksum, remaining_ms},
    protocol::{ProtocolError, ProtocolResult},
};

/// Largest data block a single frame can carry (Length is one byte)
pub const MAX_FRAME_DATA: usize = 255;

fn checksum(variant: KwpChecksum, covered: &[u8]) -> u8 {
    match variant {
        KwpChecksum::Additive => additive_checksum(covered),
        KwpChecksum::Inverted => inverted_checksum(covered),
    }
}

/// Encodes `data` into a frame
pub fn encode(data: &[u8], variant: KwpChecksum) -> ProtocolResult<Vec<u8>> {
    if data.is_empty() || data.len() > MAX_FRAME_DATA {
        return Err(ProtocolError::FrameError(format!(
            "cannot frame {} data bytes",
            data.len()
        )));
    }
    let mut frame = Vec::with_capacity(data.len() + 2);
    frame.push(data.len() as u8);
    frame.extend_from_slice(data);
    frame.push(checksum(variant, &frame));
    Ok(frame)
}

/// Decodes a complete frame, returning its data bytes
pub fn decode(frame: &[u8], variant: KwpChecksum) -> ProtocolResult<Vec<u8>> {
    let (len, rest) = frame
        .split_first()
        .ok_or_else(|| ProtocolError::FrameError("empty frame".into()))?;
    if *len == 0 || rest.len() != *len as usize + 1 {
        return Err(ProtocolError::FrameError(format!(
            "length byte {len} does not match frame {frame:02X?}"
        )));
    }
    let (covered, chk) = frame.split_at(frame.len() - 1);
    let expected = checksum(variant, covered);
    if chk[0] != expected {
        return Err(ProtocolError::FrameError(format!(
            "checksum 0x{:02X} does not match calculated 0x{expected:02X} in {frame:02X?}",
            chk[0]
        )));
    }
    Ok(covered[1..].to_vec())
}

/// Reads one frame from the channel. The whole frame must arrive within `timeout_ms`
pub fn read(
    channel: &mut dyn ByteChannel,
    variant: KwpChecksum,
    timeout_ms: u32,
) -> ProtocolResult<Vec<u8>> {
    let deadline = deadline_after(timeout_ms);
    let mut frame = channel.read_bytes(1, timeout_ms)?;
    let len = match frame.first() {
        Some(0) | None => return Err(ProtocolError::FrameError("zero length frame".into())),
        Some(l) => *l as usize,
    };
    let rest = channel.read_bytes(len + 1, remaining_ms(deadline))?;
    frame.extend_from_slice(&rest);
    log::debug!("K-Line Rx: {frame:02X?}");
    decode(&frame, variant)
}
