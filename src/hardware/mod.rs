//! The hardware module contains the adapters the bridge uses to reach a physical ECU link,
//! and in-memory simulated links for bench testing without hardware.
//!
//! The following adapters are available:
//! * [serial::SerialPortChannel] - Serial port / K-Line cable (Feature `serial`)
//! * [socketcan::SocketCanChannel] - Linux SocketCAN interface (Feature `socketcan`, Linux only)
//! * [simulation] - Simulated serial and CAN links driven by an ECU model

use crate::{
    channel::{ByteChannel, CanChannel, ChannelResult},
    config::{CanBusConfig, SerialConfig},
};

#[cfg(feature = "serial")]
pub mod serial;

#[cfg(all(feature = "socketcan", target_os = "linux"))]
pub mod socketcan;

pub mod simulation;

/// Creates transports for ECU configurations.
///
/// Channels returned by a factory are configured but NOT open. The protocol
/// that receives the channel opens it during its connect handshake.
pub trait TransportFactory: Send + Sync {
    /// Creates a byte channel for a serial configuration
    fn open_serial(&self, cfg: &SerialConfig) -> ChannelResult<Box<dyn ByteChannel>>;
    /// Creates a CAN channel for a CAN bus configuration
    fn open_can(&self, cfg: &CanBusConfig) -> ChannelResult<Box<dyn CanChannel>>;
}

/// Transport factory backed by the real hardware adapters compiled into the crate.
///
/// If the adapter for a transport kind was not compiled in, [crate::channel::ChannelError::UnsupportedRequest]
/// is returned.
#[derive(Debug, Default, Copy, Clone)]
pub struct HardwareTransportFactory;

impl TransportFactory for HardwareTransportFactory {
    #[allow(unused_variables)]
    fn open_serial(&self, cfg: &SerialConfig) -> ChannelResult<Box<dyn ByteChannel>> {
        #[cfg(feature = "serial")]
        {
            Ok(Box::new(serial::SerialPortChannel::new(cfg.clone())))
        }
        #[cfg(not(feature = "serial"))]
        {
            log::error!("Serial support is not compiled in, cannot use {}", cfg.port);
            Err(crate::channel::ChannelError::UnsupportedRequest)
        }
    }

    #[allow(unused_variables)]
    fn open_can(&self, cfg: &CanBusConfig) -> ChannelResult<Box<dyn CanChannel>> {
        #[cfg(all(feature = "socketcan", target_os = "linux"))]
        {
            let mut channel = socketcan::SocketCanChannel::new(&cfg.interface);
            channel.set_can_cfg(cfg.bitrate, cfg.extended_ids)?;
            Ok(Box::new(channel))
        }
        #[cfg(not(all(feature = "socketcan", target_os = "linux")))]
        {
            log::error!("SocketCAN support is not available, cannot use {}", cfg.interface);
            Err(crate::channel::ChannelError::UnsupportedRequest)
        }
    }
}
