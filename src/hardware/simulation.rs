//! Simulated ECU links for bench testing and dry runs
//!
//! A simulated channel hands every transmitted buffer (or CAN frame) to an ECU model
//! callback, and queues whatever the model answers for the next reads. Reads that find
//! nothing queued fail with [ChannelError::ReadTimeout] immediately, so a silent model
//! behaves like an ECU that never answers.
//!
//! Channels are cheap handles onto shared state. Cloning a channel gives a new, closed
//! handle onto the same simulated device, which tests use to inspect the traffic log.

use std::{
    collections::{HashMap, VecDeque},
    sync::{Arc, Mutex, MutexGuard},
};

use crate::{
    channel::{ByteChannel, CanChannel, CanFrame, ChannelError, ChannelResult},
    config::{CanBusConfig, SerialConfig},
};

use super::TransportFactory;

/// ECU model behind a [SimulationByteChannel]. Receives each written buffer, returns the bytes to queue
pub type ByteHandler = Box<dyn FnMut(&[u8]) -> Vec<u8> + Send>;

/// ECU model behind a [SimulationCanChannel]. Receives each written frame, returns the frames to queue
pub type CanHandler = Box<dyn FnMut(&CanFrame) -> Vec<CanFrame> + Send>;

fn lock<T>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

struct ByteDevice {
    handler: ByteHandler,
    rx: VecDeque<u8>,
    tx_log: Vec<Vec<u8>>,
    baud_rate: u32,
    unplugged: bool,
}

/// Simulated serial link
pub struct SimulationByteChannel {
    device: Arc<Mutex<ByteDevice>>,
    open: bool,
}

impl std::fmt::Debug for SimulationByteChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationByteChannel")
            .field("open", &self.open)
            .finish()
    }
}

impl Clone for SimulationByteChannel {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            open: false,
        }
    }
}

impl SimulationByteChannel {
    /// Creates a simulated serial link answered by `handler`
    pub fn new<F: FnMut(&[u8]) -> Vec<u8> + Send + 'static>(handler: F) -> Self {
        Self {
            device: Arc::new(Mutex::new(ByteDevice {
                handler: Box::new(handler),
                rx: VecDeque::new(),
                tx_log: Vec::new(),
                baud_rate: 0,
                unplugged: false,
            })),
            open: false,
        }
    }

    /// Every buffer written so far, in order
    pub fn tx_log(&self) -> Vec<Vec<u8>> {
        lock(&self.device).tx_log.clone()
    }

    /// Forgets the traffic log
    pub fn clear_tx_log(&self) {
        lock(&self.device).tx_log.clear();
    }

    /// Queues bytes as if the ECU had sent them unprompted
    pub fn inject(&self, bytes: &[u8]) {
        lock(&self.device).rx.extend(bytes);
    }

    /// Last baud rate set on the link
    pub fn baud_rate(&self) -> u32 {
        lock(&self.device).baud_rate
    }

    /// Simulates the adapter being removed. Every I/O fails with an IO error while set
    pub fn set_unplugged(&self, unplugged: bool) {
        lock(&self.device).unplugged = unplugged;
    }

    fn check(&self, device: &ByteDevice) -> ChannelResult<()> {
        if !self.open {
            return Err(ChannelError::InterfaceNotOpen);
        }
        if device.unplugged {
            return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into());
        }
        Ok(())
    }
}

impl ByteChannel for SimulationByteChannel {
    fn open(&mut self) -> ChannelResult<()> {
        if lock(&self.device).unplugged {
            return Err(std::io::Error::from(std::io::ErrorKind::NotFound).into());
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.open = false;
        Ok(())
    }

    fn set_baud_rate(&mut self, baud: u32) -> ChannelResult<()> {
        lock(&self.device).baud_rate = baud;
        Ok(())
    }

    fn write_bytes(&mut self, buffer: &[u8], _timeout_ms: u32) -> ChannelResult<()> {
        let mut device = lock(&self.device);
        self.check(&device)?;
        device.tx_log.push(buffer.to_vec());
        let resp = (device.handler)(buffer);
        device.rx.extend(resp);
        Ok(())
    }

    fn read_bytes(&mut self, count: usize, _timeout_ms: u32) -> ChannelResult<Vec<u8>> {
        let mut device = lock(&self.device);
        self.check(&device)?;
        if device.rx.len() < count {
            device.rx.clear();
            return Err(ChannelError::ReadTimeout);
        }
        Ok(device.rx.drain(..count).collect())
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        lock(&self.device).rx.clear();
        Ok(())
    }
}

struct CanDevice {
    handler: CanHandler,
    rx: VecDeque<CanFrame>,
    tx_log: Vec<CanFrame>,
    bitrate: u32,
    unplugged: bool,
}

/// Simulated CAN bus with one ECU model attached
pub struct SimulationCanChannel {
    device: Arc<Mutex<CanDevice>>,
    open: bool,
}

impl std::fmt::Debug for SimulationCanChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SimulationCanChannel")
            .field("open", &self.open)
            .finish()
    }
}

impl Clone for SimulationCanChannel {
    fn clone(&self) -> Self {
        Self {
            device: self.device.clone(),
            open: false,
        }
    }
}

impl SimulationCanChannel {
    /// Creates a simulated CAN bus answered by `handler`
    pub fn new<F: FnMut(&CanFrame) -> Vec<CanFrame> + Send + 'static>(handler: F) -> Self {
        Self {
            device: Arc::new(Mutex::new(CanDevice {
                handler: Box::new(handler),
                rx: VecDeque::new(),
                tx_log: Vec::new(),
                bitrate: 0,
                unplugged: false,
            })),
            open: false,
        }
    }

    /// Every frame written so far, in order
    pub fn tx_log(&self) -> Vec<CanFrame> {
        lock(&self.device).tx_log.clone()
    }

    /// Forgets the traffic log
    pub fn clear_tx_log(&self) {
        lock(&self.device).tx_log.clear();
    }

    /// Queues a frame as if another node had sent it unprompted
    pub fn inject(&self, frame: CanFrame) {
        lock(&self.device).rx.push_back(frame);
    }

    /// Bitrate set by [CanChannel::set_can_cfg]
    pub fn bitrate(&self) -> u32 {
        lock(&self.device).bitrate
    }

    /// Simulates the interface going down. Every I/O fails with an IO error while set
    pub fn set_unplugged(&self, unplugged: bool) {
        lock(&self.device).unplugged = unplugged;
    }

    fn check(&self, device: &CanDevice) -> ChannelResult<()> {
        if !self.open {
            return Err(ChannelError::InterfaceNotOpen);
        }
        if device.unplugged {
            return Err(std::io::Error::from(std::io::ErrorKind::BrokenPipe).into());
        }
        Ok(())
    }
}

impl CanChannel for SimulationCanChannel {
    fn open(&mut self) -> ChannelResult<()> {
        if lock(&self.device).unplugged {
            return Err(std::io::Error::from(std::io::ErrorKind::NotFound).into());
        }
        self.open = true;
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        self.open = false;
        Ok(())
    }

    fn set_can_cfg(&mut self, bitrate: u32, _use_extended: bool) -> ChannelResult<()> {
        lock(&self.device).bitrate = bitrate;
        Ok(())
    }

    fn write_frame(&mut self, frame: &CanFrame, _timeout_ms: u32) -> ChannelResult<()> {
        let mut device = lock(&self.device);
        self.check(&device)?;
        device.tx_log.push(*frame);
        let resp = (device.handler)(frame);
        device.rx.extend(resp);
        Ok(())
    }

    fn read_frame(&mut self, _timeout_ms: u32) -> ChannelResult<CanFrame> {
        let mut device = lock(&self.device);
        self.check(&device)?;
        device.rx.pop_front().ok_or(ChannelError::ReadTimeout)
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        lock(&self.device).rx.clear();
        Ok(())
    }
}

/// Transport factory that hands out simulated links registered by port / interface name
#[derive(Debug, Default)]
pub struct SimulationTransportFactory {
    serial: Mutex<HashMap<String, SimulationByteChannel>>,
    can: Mutex<HashMap<String, SimulationCanChannel>>,
}

impl SimulationTransportFactory {
    /// Creates an empty factory. Opening an unregistered port fails
    pub fn new() -> Self {
        Self::default()
    }

    /// Attaches a simulated serial device to `port`
    pub fn add_serial(&self, port: &str, channel: SimulationByteChannel) {
        lock(&self.serial).insert(port.into(), channel);
    }

    /// Attaches a simulated CAN bus to `interface`
    pub fn add_can(&self, interface: &str, channel: SimulationCanChannel) {
        lock(&self.can).insert(interface.into(), channel);
    }
}

fn no_device(name: &str) -> ChannelError {
    ChannelError::APIError {
        api_name: "simulation".into(),
        code: 0,
        desc: format!("no simulated device on {name}"),
    }
}

impl TransportFactory for SimulationTransportFactory {
    fn open_serial(&self, cfg: &SerialConfig) -> ChannelResult<Box<dyn ByteChannel>> {
        let mut channel = lock(&self.serial)
            .get(&cfg.port)
            .cloned()
            .ok_or_else(|| no_device(&cfg.port))?;
        channel.set_baud_rate(cfg.baud_rate)?;
        Ok(Box::new(channel))
    }

    fn open_can(&self, cfg: &CanBusConfig) -> ChannelResult<Box<dyn CanChannel>> {
        let mut channel = lock(&self.can)
            .get(&cfg.interface)
            .cloned()
            .ok_or_else(|| no_device(&cfg.interface))?;
        channel.set_can_cfg(cfg.bitrate, cfg.extended_ids)?;
        Ok(Box::new(channel))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn byte_channel_queues_model_answers() {
        let mut ch = SimulationByteChannel::new(|req| req.iter().rev().copied().collect());
        let log = ch.clone();
        assert!(matches!(ch.write_bytes(&[1], 0), Err(ChannelError::InterfaceNotOpen)));
        ch.open().unwrap();
        ch.write_bytes(&[1, 2, 3], 0).unwrap();
        assert_eq!(ch.read_bytes(2, 0).unwrap(), vec![3, 2]);
        assert!(matches!(ch.read_bytes(2, 0), Err(ChannelError::ReadTimeout)));
        assert_eq!(log.tx_log(), vec![vec![1, 2, 3]]);
    }

    #[test]
    fn unplugged_device_is_fatal() {
        let mut ch = SimulationCanChannel::new(|_| Vec::new());
        ch.open().unwrap();
        ch.set_unplugged(true);
        let err = ch.write_frame(&CanFrame::new(0x7E0, &[0x01], false), 0).unwrap_err();
        assert!(err.is_fatal());
    }

    #[test]
    fn factory_hands_out_closed_handles() {
        let factory = SimulationTransportFactory::new();
        let bus = SimulationCanChannel::new(|f| vec![*f]);
        factory.add_can("vcan0", bus.clone());
        let cfg = CanBusConfig {
            interface: "vcan0".into(),
            bitrate: 500_000,
            request_id: 0x7E0,
            response_id: 0x7E8,
            timeout_ms: 100,
            extended_ids: false,
        };
        let mut ch = factory.open_can(&cfg).unwrap();
        assert_eq!(bus.bitrate(), 500_000);
        assert!(ch.read_frame(0).is_err());
        ch.open().unwrap();
        ch.write_frame(&CanFrame::new(0x7E0, &[0x02, 0x10, 0x03], false), 0).unwrap();
        assert_eq!(ch.read_frame(0).unwrap().data(), &[0x02, 0x10, 0x03]);
        assert!(matches!(
            factory.open_can(&CanBusConfig { interface: "can9".into(), ..cfg }),
            Err(ChannelError::APIError { .. })
        ));
    }
}
