//! Software ISO-TP (ISO15765-2) layer on top of a raw [CanChannel]
//!
//! Sending segments a payload into a Single Frame, or a First Frame followed by
//! Consecutive Frames paced by the receiver's Flow Control frames.
//! Receiving is an explicit state machine ([RxState]), which either returns the
//! complete payload or fails. Partially reassembled data is never returned.

use std::{cmp::min, time::Duration};

use crate::{
    channel::{CanChannel, CanFrame, ChannelError},
    config::IsoTpSettings,
    helpers::{deadline_after, remaining_ms},
    protocol::{ProtocolError, ProtocolResult},
};

/// Largest payload ISO-TP can carry
pub const MAX_PAYLOAD: usize = 4095;

/// Padding byte for unused bytes of a frame
const PAD_BYTE: u8 = 0xCC;

const PCI_SINGLE: u8 = 0x00;
const PCI_FIRST: u8 = 0x10;
const PCI_CONSECUTIVE: u8 = 0x20;
const PCI_FLOW_CONTROL: u8 = 0x30;

const FC_CONTINUE: u8 = 0x30;
const FC_WAIT: u8 = 0x31;
const FC_OVERFLOW: u8 = 0x32;

/// Converts a raw STmin byte into a delay
pub fn st_min_delay(st: u8) -> Duration {
    match st {
        0x00..=0x7F => Duration::from_millis(st as u64),
        0xF1..=0xF9 => Duration::from_micros((st - 0xF0) as u64 * 100),
        // Reserved values must be treated as the maximum
        _ => Duration::from_millis(0x7F),
    }
}

/// Receiver state of one inbound message
#[derive(Debug, Clone, PartialEq, Eq)]
enum RxState {
    /// Nothing received yet
    AwaitingFirst,
    /// First frame received, collecting consecutive frames
    AwaitingConsecutive {
        expected_seq: u8,
        collected: Vec<u8>,
        total_len: usize,
        block_count: u8,
    },
}

/// What the receiver has to do after processing a frame
#[derive(Debug, Clone, PartialEq, Eq)]
enum RxAction {
    None,
    SendFlowControl,
    Completed(Vec<u8>),
}

impl RxState {
    /// Advances the state machine with one frame from the ECU
    fn on_frame(&mut self, data: &[u8], block_size: u8) -> ProtocolResult<RxAction> {
        let pci = *data
            .first()
            .ok_or_else(|| ProtocolError::FrameError("empty CAN frame".into()))?;
        match self {
            RxState::AwaitingFirst => match pci & 0xF0 {
                PCI_SINGLE => {
                    let len = (pci & 0x0F) as usize;
                    if len == 0 || len > data.len() - 1 {
                        return Err(ProtocolError::FrameError(format!(
                            "invalid single frame {data:02X?}"
                        )));
                    }
                    Ok(RxAction::Completed(data[1..1 + len].to_vec()))
                }
                PCI_FIRST => {
                    if data.len() < 8 {
                        return Err(ProtocolError::FrameError(format!(
                            "short first frame {data:02X?}"
                        )));
                    }
                    let total_len = (((pci & 0x0F) as usize) << 8) | data[1] as usize;
                    if total_len < 8 {
                        return Err(ProtocolError::FrameError(format!(
                            "first frame announces only {total_len} bytes"
                        )));
                    }
                    *self = RxState::AwaitingConsecutive {
                        expected_seq: 1,
                        collected: data[2..8].to_vec(),
                        total_len,
                        block_count: 0,
                    };
                    Ok(RxAction::SendFlowControl)
                }
                PCI_CONSECUTIVE => Err(ProtocolError::ReassemblyError(
                    "consecutive frame received before a first frame".into(),
                )),
                PCI_FLOW_CONTROL => Ok(RxAction::None),
                _ => Err(ProtocolError::FrameError(format!(
                    "unknown PCI 0x{pci:02X}"
                ))),
            },
            RxState::AwaitingConsecutive {
                expected_seq,
                collected,
                total_len,
                block_count,
            } => match pci & 0xF0 {
                PCI_CONSECUTIVE => {
                    let seq = pci & 0x0F;
                    if seq != *expected_seq {
                        return Err(ProtocolError::ReassemblyError(format!(
                            "expected sequence {expected_seq}, received {seq} after {} of {total_len} bytes",
                            collected.len()
                        )));
                    }
                    let take = min(7, *total_len - collected.len());
                    if data.len() < 1 + take {
                        return Err(ProtocolError::FrameError(format!(
                            "short consecutive frame {data:02X?}"
                        )));
                    }
                    collected.extend_from_slice(&data[1..1 + take]);
                    if collected.len() == *total_len {
                        return Ok(RxAction::Completed(std::mem::take(collected)));
                    }
                    *expected_seq = (*expected_seq + 1) & 0x0F;
                    *block_count += 1;
                    if block_size != 0 && *block_count == block_size {
                        *block_count = 0;
                        Ok(RxAction::SendFlowControl)
                    } else {
                        Ok(RxAction::None)
                    }
                }
                PCI_FLOW_CONTROL => Ok(RxAction::None),
                _ => Err(ProtocolError::ReassemblyError(format!(
                    "new message {data:02X?} interrupted reassembly"
                ))),
            },
        }
    }
}

/// ISO-TP link between the tester and one ECU
pub struct IsoTpChannel {
    channel: Box<dyn CanChannel>,
    request_id: u32,
    response_id: u32,
    extended: bool,
    settings: IsoTpSettings,
}

impl std::fmt::Debug for IsoTpChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("IsoTpChannel")
            .field("request_id", &format_args!("0x{:03X}", self.request_id))
            .field("response_id", &format_args!("0x{:03X}", self.response_id))
            .field("extended", &self.extended)
            .field("settings", &self.settings)
            .finish()
    }
}

impl IsoTpChannel {
    /// Creates a new ISO-TP link
    ///
    /// ## Parameters
    /// * channel - CAN channel frames are exchanged on
    /// * request_id - CAN ID the tester sends on
    /// * response_id - CAN ID the ECU responds on. Frames with other IDs are ignored
    /// * extended - Use 29 bit CAN IDs
    /// * settings - Flow control parameters sent to the ECU
    pub fn new(
        channel: Box<dyn CanChannel>,
        request_id: u32,
        response_id: u32,
        extended: bool,
        settings: IsoTpSettings,
    ) -> Self {
        Self {
            channel,
            request_id,
            response_id,
            extended,
            settings,
        }
    }

    /// Underlying CAN channel
    pub fn can_channel(&mut self) -> &mut dyn CanChannel {
        self.channel.as_mut()
    }

    fn write(&mut self, data: &[u8], timeout_ms: u32) -> ProtocolResult<()> {
        let mut buf = data.to_vec();
        if self.settings.pad_frame {
            buf.resize(8, PAD_BYTE);
        }
        let frame = CanFrame::new(self.request_id, &buf, self.extended);
        log::debug!("ISO-TP Tx 0x{:03X}: {:02X?}", self.request_id, frame.data());
        self.channel.write_frame(&frame, timeout_ms)?;
        Ok(())
    }

    /// Reads the next frame sent by the ECU, skipping frames with other IDs
    fn read(&mut self, timeout_ms: u32) -> ProtocolResult<CanFrame> {
        let deadline = deadline_after(timeout_ms);
        loop {
            let frame = self.channel.read_frame(remaining_ms(deadline))?;
            if frame.id() == self.response_id {
                log::debug!("ISO-TP Rx 0x{:03X}: {:02X?}", frame.id(), frame.data());
                return Ok(frame);
            }
            log::debug!("Ignoring CAN frame from 0x{:03X}", frame.id());
        }
    }

    /// Waits for a continue-to-send flow control. Returns (block size, separation time)
    ///
    /// Each WAIT frame restarts the timeout, up to [IsoTpSettings::max_fc_wait] times
    fn await_flow_control(&mut self, timeout_ms: u32) -> ProtocolResult<(u8, Duration)> {
        let mut deadline = deadline_after(timeout_ms);
        let mut waits = 0u8;
        loop {
            let frame = match self.read(remaining_ms(deadline)) {
                Ok(f) => f,
                Err(ProtocolError::Channel(ChannelError::ReadTimeout)) => {
                    return Err(ProtocolError::ReassemblyError(
                        "timed out waiting for flow control".into(),
                    ));
                }
                Err(e) => return Err(e),
            };
            let data = frame.data();
            match data {
                [FC_CONTINUE, bs, st, ..] => return Ok((*bs, st_min_delay(*st))),
                [FC_WAIT, ..] => {
                    if waits >= self.settings.max_fc_wait {
                        return Err(ProtocolError::ReassemblyError(format!(
                            "ECU sent more than {} flow control WAIT frames",
                            self.settings.max_fc_wait
                        )));
                    }
                    waits += 1;
                    log::debug!("ECU asked to wait for flow control ({waits})");
                    deadline = deadline_after(timeout_ms);
                }
                [FC_OVERFLOW, ..] => {
                    return Err(ProtocolError::ReassemblyError(
                        "ECU reported a receive buffer overflow".into(),
                    ));
                }
                _ => {
                    return Err(ProtocolError::ReassemblyError(format!(
                        "expected flow control, received {data:02X?}"
                    )));
                }
            }
        }
    }

    /// Sends a payload, segmenting it if it does not fit in a single frame
    pub fn send(&mut self, payload: &[u8], timeout_ms: u32) -> ProtocolResult<()> {
        if payload.is_empty() || payload.len() > MAX_PAYLOAD {
            return Err(ProtocolError::FrameError(format!(
                "ISO-TP cannot carry {} bytes",
                payload.len()
            )));
        }
        if payload.len() <= 7 {
            let mut sf = vec![PCI_SINGLE | payload.len() as u8];
            sf.extend_from_slice(payload);
            return self.write(&sf, timeout_ms);
        }

        let mut ff = vec![
            PCI_FIRST | ((payload.len() >> 8) & 0x0F) as u8,
            (payload.len() & 0xFF) as u8,
        ];
        ff.extend_from_slice(&payload[0..6]);
        self.write(&ff, timeout_ms)?;

        let (mut bs, mut st) = self.await_flow_control(timeout_ms)?;
        let mut seq = 1u8;
        let mut sent_in_block = 0u8;
        for (idx, chunk) in payload[6..].chunks(7).enumerate() {
            if idx != 0 {
                if bs != 0 && sent_in_block == bs {
                    (bs, st) = self.await_flow_control(timeout_ms)?;
                    sent_in_block = 0;
                } else if !st.is_zero() {
                    std::thread::sleep(st);
                }
            }
            let mut cf = vec![PCI_CONSECUTIVE | seq];
            cf.extend_from_slice(chunk);
            self.write(&cf, timeout_ms)?;
            seq = (seq + 1) & 0x0F;
            sent_in_block = sent_in_block.wrapping_add(1);
        }
        Ok(())
    }

    /// Receives one complete payload. The whole message, including every consecutive
    /// frame, must arrive within `timeout_ms`
    pub fn receive(&mut self, timeout_ms: u32) -> ProtocolResult<Vec<u8>> {
        let deadline = deadline_after(timeout_ms);
        let mut state = RxState::AwaitingFirst;
        loop {
            let frame = match self.read(remaining_ms(deadline)) {
                Ok(f) => f,
                Err(ProtocolError::Channel(ChannelError::ReadTimeout))
                    if state != RxState::AwaitingFirst =>
                {
                    return Err(ProtocolError::ReassemblyError(
                        "timed out waiting for consecutive frame".into(),
                    ));
                }
                Err(e) => return Err(e),
            };
            match state.on_frame(frame.data(), self.settings.block_size)? {
                RxAction::None => {}
                RxAction::SendFlowControl => {
                    let fc = [FC_CONTINUE, self.settings.block_size, self.settings.st_min];
                    self.write(&fc, remaining_ms(deadline).max(1))?;
                }
                RxAction::Completed(payload) => return Ok(payload),
            }
        }
    }
}
