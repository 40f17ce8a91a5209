//! Simulated ECUs shared by the integration tests
#![allow(dead_code)]

use std::{
    collections::{BTreeMap, BTreeSet, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use ecu_bridge::{
    channel::CanFrame,
    config::KwpChecksum,
    denso,
    hardware::simulation::{SimulationByteChannel, SimulationCanChannel},
    kwp2000,
};

pub fn init_logging() {
    let _ = env_logger::builder().is_test(true).try_init();
}

pub fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// Default content of unwritten simulated memory
pub fn pattern(addr: u32) -> u8 {
    (addr ^ (addr >> 8) ^ (addr >> 16)) as u8
}

pub fn pattern_block(addr: u32, len: usize) -> Vec<u8> {
    (0..len as u32).map(|i| pattern(addr + i)).collect()
}

// ---------------------------------------------------------------------------
// KWP2000 (K-Line)
// ---------------------------------------------------------------------------

pub const KWP_WAKE: [u8; 13] = [
    0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x00, 0x55, 0x01, 0x8A,
];

#[derive(Debug, Default)]
pub struct KwpEcu {
    pub memory: BTreeMap<u32, u8>,
    pub dtcs: Vec<u16>,
    /// Number of response pending replies sent before every real response
    pub pending_before_response: u32,
    /// Negative response code returned for every memory read
    pub read_nrc: Option<u8>,
    /// Corrupts the checksum of every response
    pub bad_checksum: bool,
    /// Never answers
    pub silent: bool,
    pub started: bool,
    pub stopped: bool,
    pub requests: Vec<Vec<u8>>,
}

impl KwpEcu {
    fn read(&self, addr: u32) -> u8 {
        self.memory.get(&addr).copied().unwrap_or_else(|| pattern(addr))
    }

    fn handle(&mut self, req: &[u8]) -> Vec<u8> {
        self.requests.push(req.to_vec());
        let sid = req[0];
        match req {
            [0x81] => {
                self.started = true;
                vec![0x50]
            }
            [0x82] => {
                self.stopped = true;
                vec![0xC2]
            }
            [0x23, a2, a1, a0, l1, l0] => {
                if let Some(nrc) = self.read_nrc {
                    return vec![0x7F, sid, nrc];
                }
                let addr = u32::from_be_bytes([0, *a2, *a1, *a0]);
                let len = u16::from_be_bytes([*l1, *l0]) as u32;
                let mut resp = vec![0x63];
                resp.extend((addr..addr + len).map(|a| self.read(a)));
                resp
            }
            [0x3D, a2, a1, a0, data @ ..] => {
                let addr = u32::from_be_bytes([0, *a2, *a1, *a0]);
                for (i, b) in data.iter().enumerate() {
                    self.memory.insert(addr + i as u32, *b);
                }
                vec![0x7D]
            }
            [0x1A, 0x86] => {
                let mut resp = vec![0x5A];
                resp.extend_from_slice(b"0261S0412");
                resp.push(0x00);
                resp.extend_from_slice(&[0x01, 0x02, 0x03, 0x04]);
                resp.extend_from_slice(&[0xA0, 0xA1, 0xA2, 0xA3]);
                resp.extend_from_slice(&[0xB0, 0x5C]);
                resp
            }
            [0x19, 0x02] => {
                let mut resp = vec![0x59];
                for c in &self.dtcs {
                    resp.extend_from_slice(&c.to_be_bytes());
                }
                resp
            }
            [0x14, 0xFF, 0x00] => {
                self.dtcs.clear();
                vec![0x54]
            }
            _ => vec![0x7F, sid, 0x11],
        }
    }
}

pub fn kwp_link(ecu: Arc<Mutex<KwpEcu>>) -> SimulationByteChannel {
    SimulationByteChannel::new(move |buf| {
        let mut ecu = lock(&ecu);
        if ecu.silent || buf == KWP_WAKE {
            return Vec::new();
        }
        let Ok(req) = kwp2000::frame::decode(buf, KwpChecksum::Additive) else {
            return Vec::new();
        };
        let mut out = Vec::new();
        if req[0] != 0x81 {
            for _ in 0..ecu.pending_before_response {
                out.extend(kwp2000::frame::encode(&[0x7F, req[0], 0x78], KwpChecksum::Additive).unwrap());
            }
        }
        let resp = ecu.handle(&req);
        let mut f = kwp2000::frame::encode(&resp, KwpChecksum::Additive).unwrap();
        if ecu.bad_checksum {
            let last = f.len() - 1;
            f[last] = f[last].wrapping_add(1);
        }
        out.extend(f);
        out
    })
}

// ---------------------------------------------------------------------------
// UDS over ISO-TP
// ---------------------------------------------------------------------------

pub const UDS_REQUEST_ID: u32 = 0x7E0;
pub const UDS_RESPONSE_ID: u32 = 0x7E8;

#[derive(Debug)]
pub struct UdsEcu {
    pub dids: BTreeMap<u16, Vec<u8>>,
    pub dtcs: Vec<(u32, u8)>,
    pub session: u8,
    /// Block size the ECU sends in its flow control frames
    pub block_size: u8,
    /// Number of response pending replies sent before every real response
    pub pending_before_response: u32,
    /// Sends consecutive frames with a skipped sequence number
    pub skip_sequence: bool,
    /// Sends a frame from another node before every response
    pub chatter: bool,
    /// Never answers
    pub silent: bool,
    /// Complete requests received, in order
    pub requests: Vec<Vec<u8>>,
    pub(crate) rx: Option<(usize, Vec<u8>, u8)>,
    pub(crate) tx: VecDeque<Vec<u8>>,
}

impl Default for UdsEcu {
    fn default() -> Self {
        let mut dids = BTreeMap::new();
        dids.insert(0xF186, vec![0x01]);
        dids.insert(0xF187, b"5WP4 4862".to_vec());
        dids.insert(0xF189, b"SW 0815\0\0".to_vec());
        Self {
            dids,
            dtcs: Vec::new(),
            session: 0x01,
            block_size: 0,
            pending_before_response: 0,
            skip_sequence: false,
            chatter: false,
            silent: false,
            requests: Vec::new(),
            rx: None,
            tx: VecDeque::new(),
        }
    }
}

fn uds_frame(data: &[u8]) -> CanFrame {
    CanFrame::new(UDS_RESPONSE_ID, data, false)
}

impl UdsEcu {
    fn service(&mut self, req: &[u8]) -> Vec<u8> {
        self.requests.push(req.to_vec());
        let sid = req[0];
        match req {
            [0x10, session] => {
                self.session = *session;
                vec![0x50, *session, 0x00, 0x32, 0x01, 0xF4]
            }
            [0x22, hi, lo] => match self.dids.get(&u16::from_be_bytes([*hi, *lo])) {
                Some(data) => {
                    let mut resp = vec![0x62, *hi, *lo];
                    resp.extend_from_slice(data);
                    resp
                }
                None => vec![0x7F, sid, 0x31],
            },
            [0x2E, hi, lo, data @ ..] => {
                self.dids.insert(u16::from_be_bytes([*hi, *lo]), data.to_vec());
                vec![0x6E, *hi, *lo]
            }
            [0x19, sub, mask] => {
                let mut resp = vec![0x59, *sub, 0xFF];
                for (code, status) in self.dtcs.iter().filter(|(_, s)| s & mask != 0) {
                    resp.extend_from_slice(&code.to_be_bytes()[1..]);
                    resp.push(*status);
                }
                resp
            }
            [0x14, 0xFF, 0xFF, 0xFF] => {
                self.dtcs.clear();
                vec![0x54]
            }
            _ => vec![0x7F, sid, 0x11],
        }
    }

    /// Segments a response. Returns the frames to send now, queues the rest
    fn segment(&mut self, msg: &[u8]) -> Vec<CanFrame> {
        if msg.len() <= 7 {
            let mut sf = vec![msg.len() as u8];
            sf.extend_from_slice(msg);
            return vec![uds_frame(&sf)];
        }
        let mut ff = vec![0x10 | (msg.len() >> 8) as u8, msg.len() as u8];
        ff.extend_from_slice(&msg[..6]);
        let mut seq = 1u8;
        for chunk in msg[6..].chunks(7) {
            if self.skip_sequence && seq == 2 {
                seq = 3;
            }
            let mut cf = vec![0x20 | seq];
            cf.extend_from_slice(chunk);
            self.tx.push_back(cf);
            seq = (seq + 1) & 0x0F;
        }
        vec![uds_frame(&ff)]
    }

    fn respond(&mut self, req: &[u8]) -> Vec<CanFrame> {
        let mut out = Vec::new();
        if self.chatter {
            out.push(CanFrame::new(0x5A0, &[0x03, 0x7F, 0x22, 0x11], false));
        }
        for _ in 0..self.pending_before_response {
            out.push(uds_frame(&[0x03, 0x7F, req[0], 0x78]));
        }
        let resp = self.service(req);
        out.extend(self.segment(&resp));
        out
    }

    fn on_frame(&mut self, frame: &CanFrame) -> Vec<CanFrame> {
        if self.silent || frame.id() != UDS_REQUEST_ID {
            return Vec::new();
        }
        let data = frame.data();
        match data[0] >> 4 {
            0x0 => {
                let len = (data[0] & 0x0F) as usize;
                let req = data[1..1 + len].to_vec();
                self.respond(&req)
            }
            0x1 => {
                let total = (((data[0] & 0x0F) as usize) << 8) | data[1] as usize;
                self.rx = Some((total, data[2..8].to_vec(), 0));
                vec![uds_frame(&[0x30, self.block_size, 0x00])]
            }
            0x2 => {
                let Some((total, mut buf, count)) = self.rx.take() else {
                    return Vec::new();
                };
                let take = std::cmp::min(7, total - buf.len());
                buf.extend_from_slice(&data[1..1 + take]);
                if buf.len() == total {
                    return self.respond(&buf);
                }
                let count = count + 1;
                self.rx = Some((total, buf, count));
                if self.block_size != 0 && count % self.block_size == 0 {
                    vec![uds_frame(&[0x30, self.block_size, 0x00])]
                } else {
                    Vec::new()
                }
            }
            0x3 => {
                let bs = data[1] as usize;
                let n = if bs == 0 { self.tx.len() } else { bs.min(self.tx.len()) };
                self.tx.drain(..n).map(|cf| uds_frame(&cf)).collect()
            }
            _ => Vec::new(),
        }
    }
}

pub fn uds_link(ecu: Arc<Mutex<UdsEcu>>) -> SimulationCanChannel {
    SimulationCanChannel::new(move |frame| lock(&ecu).on_frame(frame))
}

// ---------------------------------------------------------------------------
// Denso-style framed serial
// ---------------------------------------------------------------------------

#[derive(Debug, Default)]
pub struct DensoEcu {
    pub memory: BTreeMap<u32, u8>,
    pub erased: BTreeSet<u32>,
    pub dtcs: Vec<u16>,
    /// Reports a wrong checksum for every checksum request
    pub bad_checksum: bool,
    /// Sends line noise before every response
    pub noise: bool,
    /// Never answers
    pub silent: bool,
    pub commands: Vec<u8>,
}

fn be32(b: &[u8]) -> u32 {
    u32::from_be_bytes([b[0], b[1], b[2], b[3]])
}

fn ack() -> Vec<u8> {
    denso::frame::encode(denso::frame::RESP_ACK, &[]).unwrap()
}

fn nak(code: u8) -> Vec<u8> {
    denso::frame::encode(denso::frame::RESP_NAK, &[code]).unwrap()
}

fn data_resp(data: &[u8]) -> Vec<u8> {
    let mut d = (data.len() as u16).to_be_bytes().to_vec();
    d.extend_from_slice(data);
    denso::frame::encode(denso::frame::RESP_DATA, &d).unwrap()
}

impl DensoEcu {
    fn read(&self, addr: u32) -> u8 {
        self.memory.get(&addr).copied().unwrap_or_else(|| pattern(addr))
    }

    fn handle(&mut self, cmd: u8, data: &[u8]) -> Vec<u8> {
        self.commands.push(cmd);
        match cmd {
            0x00 | 0x81 | 0x0A => ack(),
            0x01 | 0x02 if data.len() == 6 => {
                let addr = be32(data);
                let len = u16::from_be_bytes([data[4], data[5]]) as u32;
                let block: Vec<u8> = (addr..addr + len).map(|a| self.read(a)).collect();
                data_resp(&block)
            }
            0x03 | 0x04 if data.len() > 6 => {
                let addr = be32(data);
                let payload = &data[6..];
                if cmd == 0x03 {
                    let first = addr & !0xFFF;
                    let last = (addr + payload.len() as u32 - 1) & !0xFFF;
                    if (first..=last).step_by(0x1000).any(|s| !self.erased.contains(&s)) {
                        return nak(0x05);
                    }
                }
                for (i, b) in payload.iter().enumerate() {
                    self.memory.insert(addr + i as u32, *b);
                }
                ack()
            }
            0x05 if data.len() == 4 => {
                let sector = be32(data);
                for a in sector..sector + 0x1000 {
                    self.memory.insert(a, 0xFF);
                }
                self.erased.insert(sector);
                ack()
            }
            0x06 if data.len() == 6 => {
                let addr = be32(data);
                let len = u16::from_be_bytes([data[4], data[5]]) as u32;
                let mut sum = (addr..addr + len).fold(0u16, |acc, a| acc.wrapping_add(self.read(a) as u16));
                if self.bad_checksum {
                    sum = sum.wrapping_add(1);
                }
                data_resp(&sum.to_be_bytes())
            }
            0x07 => {
                let mut info = vec![0x70, 0x58, 0x00, 0x01];
                info.extend_from_slice(&0x0008_0000u32.to_be_bytes());
                info.extend_from_slice(&0x0000_8000u32.to_be_bytes());
                info.extend_from_slice(b"89663-0A140\0");
                info.extend_from_slice(b"SW1.2.03");
                info.extend_from_slice(&[0x48, 0x57, 0x00, 0x00, 0x00, 0x00, 0x00, 0x02]);
                info.extend_from_slice(b"CAL00042");
                data_resp(&info)
            }
            0x08 => {
                let mut d = vec![self.dtcs.len() as u8];
                for c in &self.dtcs {
                    d.extend_from_slice(&c.to_be_bytes());
                }
                data_resp(&d)
            }
            0x09 => {
                self.dtcs.clear();
                ack()
            }
            _ => nak(0x01),
        }
    }
}

pub fn denso_link(ecu: Arc<Mutex<DensoEcu>>) -> SimulationByteChannel {
    SimulationByteChannel::new(move |buf| {
        let mut ecu = lock(&ecu);
        if ecu.silent {
            return Vec::new();
        }
        let Ok((cmd, data)) = denso::frame::decode(buf) else {
            // Sync pattern and anything else unframed
            return Vec::new();
        };
        let mut out = Vec::new();
        if ecu.noise {
            out.extend_from_slice(&[0x00, 0xFF, 0x55]);
        }
        out.extend(ecu.handle(cmd, &data));
        out
    })
}
