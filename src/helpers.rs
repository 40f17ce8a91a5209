//! Framing and response helpers shared by every protocol.
//!
//! The checksum functions are plain functions, each protocol module picks the
//! one its frame format uses.

use std::time::{Duration, Instant};

use crate::{
    channel::ChannelError,
    protocol::{ProtocolError, ProtocolResult},
};

/// Negative response service identifier shared by KWP2000 and UDS
pub const NEGATIVE_RESPONSE_SID: u8 = 0x7F;

/// Negative response code meaning the ECU received the request but needs more time
pub const NRC_RESPONSE_PENDING: u8 = 0x78;

/// Modulo 256 sum of all bytes
pub fn additive_checksum(bytes: &[u8]) -> u8 {
    bytes.iter().fold(0u8, |acc, b| acc.wrapping_add(*b))
}

/// Bitwise inverse of [additive_checksum]
pub fn inverted_checksum(bytes: &[u8]) -> u8 {
    !additive_checksum(bytes)
}

/// Two's complement of [additive_checksum], so that the sum of
/// all covered bytes plus the checksum is 0 (mod 256)
pub fn twos_complement_checksum(bytes: &[u8]) -> u8 {
    additive_checksum(bytes).wrapping_neg()
}

/// Negative response code table of a protocol
pub trait EcuNrc: From<u8> + std::fmt::Debug {
    /// Description of the error, attached to [ProtocolError::MemoryAccessError]
    fn desc(&self) -> String {
        format!("{self:?}")
    }

    /// True if the ECU asks the tester to keep waiting for the real response
    fn is_response_pending(&self) -> bool;

    /// True if the ECU is busy and the request may be repeated later
    fn is_busy_repeat(&self) -> bool;
}

/// Builds the [ProtocolError::MemoryAccessError] for a raw negative response code,
/// decoding it with the protocol's NRC table `N`
pub fn nrc_error<N: EcuNrc>(code: u8) -> ProtocolError {
    let nrc = N::from(code);
    if nrc.is_busy_repeat() {
        log::warn!("ECU is busy (NRC 0x{code:02X}), request is not repeated");
    } else {
        log::warn!("ECU negative response 0x{code:02X} ({nrc:?})");
    }
    ProtocolError::MemoryAccessError {
        code,
        def: Some(nrc.desc()),
    }
}

/// Extracts the negative response code from a response payload.
///
/// Both `[0x7F][SID][NRC]` and the short `[0x7F][NRC]` layouts are accepted.
/// Returns [None] if the payload is not a negative response, and a
/// [ProtocolError::FrameError] if it is one without a code byte.
///
/// ## Parameters
/// * sid - The service ID of the request the payload answers
/// * payload - Response payload
pub fn negative_response_code(sid: u8, payload: &[u8]) -> ProtocolResult<Option<u8>> {
    match payload {
        [NEGATIVE_RESPONSE_SID, s, code, ..] if *s == sid => Ok(Some(*code)),
        [NEGATIVE_RESPONSE_SID, code, ..] => Ok(Some(*code)),
        [NEGATIVE_RESPONSE_SID] => Err(ProtocolError::FrameError(
            "negative response without a response code".into(),
        )),
        _ => Ok(None),
    }
}

/// Checks if the response payload matches the request ServiceID.
/// For both KWP and UDS, the matching response SID is request + 0x40.
///
/// ## Parameters
/// * sid - The SID to match against
/// * resp - Response from the ECU to check
pub fn check_pos_response_id(sid: u8, resp: &[u8]) -> ProtocolResult<()> {
    let expected = sid.wrapping_add(0x40);
    match resp.first() {
        Some(r) if *r == expected => Ok(()),
        Some(r) => {
            log::error!(
                "ECU SID mismatch. Request SID was 0x{sid:02X}, response SID was 0x{r:02X}"
            );
            Err(ProtocolError::UnexpectedResponse {
                expected,
                received: *r,
            })
        }
        None => Err(ProtocolError::FrameError("empty response".into())),
    }
}

/// Runs one request/response exchange, transparently waiting through
/// response pending negative responses.
///
/// `receive` is called with the timeout to use for the next response. It is first
/// called with `timeout_ms`, then once per pending response with `pending_timeout_ms`.
/// A pending response is never returned to the caller, any other negative response
/// is decoded with `N` and returned as an error. More than `max_pending` pending
/// responses in a row fail the exchange with [ChannelError::ReadTimeout].
pub fn await_response<N, F>(
    sid: u8,
    timeout_ms: u32,
    pending_timeout_ms: u32,
    max_pending: u32,
    mut receive: F,
) -> ProtocolResult<Vec<u8>>
where
    N: EcuNrc,
    F: FnMut(u32) -> ProtocolResult<Vec<u8>>,
{
    let mut wait = timeout_ms;
    let mut pending = 0u32;
    loop {
        let start = Instant::now();
        let resp = receive(wait)?;
        match negative_response_code(sid, &resp)? {
            None => return Ok(resp),
            Some(code) if N::from(code).is_response_pending() => {
                pending += 1;
                if pending > max_pending {
                    log::error!(
                        "ECU is still pending on 0x{sid:02X} after {max_pending} pending responses, giving up"
                    );
                    return Err(ChannelError::ReadTimeout.into());
                }
                log::warn!(
                    "ECU responded with response pending to 0x{sid:02X}, waiting up to {pending_timeout_ms}ms (last wait took {:?})",
                    start.elapsed()
                );
                wait = pending_timeout_ms;
            }
            Some(code) => return Err(nrc_error::<N>(code)),
        }
    }
}

/// Remaining time of a deadline in milliseconds, zero once it has passed
pub fn remaining_ms(deadline: Instant) -> u32 {
    deadline
        .saturating_duration_since(Instant::now())
        .as_millis()
        .min(u32::MAX as u128) as u32
}

/// Deadline `timeout_ms` from now
pub fn deadline_after(timeout_ms: u32) -> Instant {
    Instant::now() + Duration::from_millis(timeout_ms as u64)
}

/// Formats bytes as a lowercase hex string without separators
pub fn hex_string(bytes: &[u8]) -> String {
    bytes.iter().map(|b| format!("{b:02x}")).collect()
}

/// Decodes printable ASCII, dropping padding and non printable bytes
pub fn ascii_string(bytes: &[u8]) -> String {
    bytes
        .iter()
        .filter(|b| b.is_ascii_graphic() || **b == b' ')
        .map(|b| *b as char)
        .collect::<String>()
        .trim()
        .to_string()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[derive(Debug)]
    struct TestNrc(u8);

    impl From<u8> for TestNrc {
        fn from(p: u8) -> Self {
            Self(p)
        }
    }

    impl EcuNrc for TestNrc {
        fn is_response_pending(&self) -> bool {
            self.0 == NRC_RESPONSE_PENDING
        }

        fn is_busy_repeat(&self) -> bool {
            self.0 == 0x21
        }
    }

    #[test]
    fn checksums() {
        let data = [0x05, 0x23, 0x00, 0x10, 0x00, 0x01, 0x00];
        assert_eq!(additive_checksum(&data), 0x39);
        assert_eq!(inverted_checksum(&data), 0xC6);
        let chk = twos_complement_checksum(&data);
        assert_eq!(additive_checksum(&data).wrapping_add(chk), 0);
        assert_eq!(twos_complement_checksum(&[]), 0);
    }

    #[test]
    fn negative_response_layouts() {
        assert_eq!(negative_response_code(0x23, &[0x7F, 0x23, 0x31]).unwrap(), Some(0x31));
        assert_eq!(negative_response_code(0x23, &[0x7F, 0x31]).unwrap(), Some(0x31));
        assert_eq!(negative_response_code(0x23, &[0x63, 0x01]).unwrap(), None);
        assert!(matches!(
            negative_response_code(0x23, &[0x7F]),
            Err(ProtocolError::FrameError(_))
        ));
        assert!(check_pos_response_id(0x22, &[0x62, 0xF1]).is_ok());
        assert!(matches!(
            check_pos_response_id(0x22, &[0x6E]),
            Err(ProtocolError::UnexpectedResponse { expected: 0x62, received: 0x6E })
        ));
    }

    #[test]
    fn pending_responses_extend_the_wait() {
        let mut responses = vec![vec![0x62, 0xAA], vec![0x7F, 0x22, 0x78], vec![0x7F, 0x22, 0x78]];
        let mut timeouts = Vec::new();
        let res = await_response::<TestNrc, _>(0x22, 100, 5000, 20, |t| {
            timeouts.push(t);
            Ok(responses.pop().unwrap())
        });
        assert_eq!(res.unwrap(), vec![0x62, 0xAA]);
        assert_eq!(timeouts, vec![100, 5000, 5000]);
    }

    #[test]
    fn busy_repeat_is_surfaced() {
        let res = await_response::<TestNrc, _>(0x22, 100, 5000, 20, |_| Ok(vec![0x7F, 0x22, 0x21]));
        assert!(matches!(res, Err(ProtocolError::MemoryAccessError { code: 0x21, .. })));
    }

    #[test]
    fn endless_pending_responses_time_out() {
        let mut calls = 0u32;
        let res = await_response::<TestNrc, _>(0x23, 100, 5000, 4, |_| {
            calls += 1;
            assert!(calls < 100, "pending responses were never capped");
            Ok(vec![0x7F, 0x23, 0x78])
        });
        assert!(matches!(
            res,
            Err(ProtocolError::Channel(ChannelError::ReadTimeout))
        ));
        // Four pending replies are tolerated, the fifth gives up
        assert_eq!(calls, 5);
    }

    #[test]
    fn truncated_negative_response_is_a_frame_error() {
        let res = await_response::<TestNrc, _>(0x22, 100, 5000, 20, |_| Ok(vec![0x7F]));
        assert!(matches!(res, Err(ProtocolError::FrameError(_))));
    }

    #[test]
    fn string_helpers() {
        assert_eq!(hex_string(&[0x0A, 0xFF]), "0aff");
        assert_eq!(ascii_string(b"  1037\x00\xFF "), "1037");
    }
}
