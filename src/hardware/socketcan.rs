//! SocketCAN module

use std::time::{Duration, Instant};

use socketcan::{EmbeddedFrame, ExtendedId, Frame, Id, Socket, StandardId};

use crate::channel::{CanChannel, CanFrame, ChannelError, ChannelResult};

/// Raw CAN channel on a Linux SocketCAN interface
///
/// Bitrate is configured by the kernel (`ip link set can0 type can bitrate ...`),
/// so [CanChannel::set_can_cfg] only records the requested values.
pub struct SocketCanChannel {
    interface: String,
    bitrate: u32,
    extended: bool,
    socket: Option<socketcan::CanSocket>,
}

impl std::fmt::Debug for SocketCanChannel {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("SocketCanChannel")
            .field("interface", &self.interface)
            .field("bitrate", &self.bitrate)
            .field("extended", &self.extended)
            .field("open", &self.socket.is_some())
            .finish()
    }
}

impl SocketCanChannel {
    /// Creates a channel for the interface (EG: `can0`). Nothing is opened yet
    pub fn new(interface: &str) -> Self {
        Self {
            interface: interface.into(),
            bitrate: 0,
            extended: false,
            socket: None,
        }
    }

    fn safe_with_iface<X, T: FnOnce(&socketcan::CanSocket) -> ChannelResult<X>>(
        &self,
        function: T,
    ) -> ChannelResult<X> {
        match self.socket {
            Some(ref socket) => function(socket),
            None => Err(ChannelError::InterfaceNotOpen),
        }
    }
}

fn to_socketcan_id(id: u32, ext: bool) -> ChannelResult<Id> {
    let id = if ext {
        ExtendedId::new(id).map(Id::Extended)
    } else {
        u16::try_from(id)
            .ok()
            .and_then(StandardId::new)
            .map(Id::Standard)
    };
    id.ok_or(ChannelError::ConfigurationError)
}

impl CanChannel for SocketCanChannel {
    fn open(&mut self) -> ChannelResult<()> {
        if self.socket.is_some() {
            return Ok(()); // Already open!
        }
        log::debug!("Opening SocketCAN interface {}", self.interface);
        let socket = socketcan::CanSocket::open(&self.interface)?;
        socket.set_nonblocking(false)?;
        self.socket = Some(socket);
        Ok(())
    }

    fn close(&mut self) -> ChannelResult<()> {
        if self.socket.take().is_some() {
            log::debug!("Closed SocketCAN interface {}", self.interface);
        }
        Ok(())
    }

    fn set_can_cfg(&mut self, bitrate: u32, use_extended: bool) -> ChannelResult<()> {
        self.bitrate = bitrate;
        self.extended = use_extended;
        Ok(())
    }

    fn write_frame(&mut self, frame: &CanFrame, timeout_ms: u32) -> ChannelResult<()> {
        let id = to_socketcan_id(frame.id(), frame.is_extended())?;
        let cf = socketcan::CanFrame::new(id, frame.data()).ok_or(ChannelError::ConfigurationError)?;
        self.safe_with_iface(|iface| {
            iface.set_write_timeout(Duration::from_millis(std::cmp::max(1, timeout_ms) as u64))?;
            iface.write_frame(&cf).map_err(|e| match e.kind() {
                std::io::ErrorKind::TimedOut | std::io::ErrorKind::WouldBlock => {
                    ChannelError::WriteTimeout
                }
                _ => ChannelError::from(e),
            })
        })
    }

    fn read_frame(&mut self, timeout_ms: u32) -> ChannelResult<CanFrame> {
        let timeout = Duration::from_millis(std::cmp::max(1, timeout_ms) as u64);
        self.safe_with_iface(|iface| {
            let start = Instant::now();
            loop {
                let remaining = timeout.saturating_sub(start.elapsed());
                if remaining.is_zero() {
                    return Err(ChannelError::ReadTimeout);
                }
                iface.set_read_timeout(remaining)?;
                // Error and remote frames carry no diagnostic data
                if let socketcan::CanFrame::Data(read) = iface.read_frame()? {
                    return Ok(CanFrame::new(read.raw_id(), read.data(), read.is_extended()));
                }
            }
        })
    }

    fn clear_rx_buffer(&mut self) -> ChannelResult<()> {
        self.safe_with_iface(|iface| {
            iface.set_nonblocking(true)?;
            while iface.read_frame().is_ok() {}
            iface.set_nonblocking(false)?;
            Ok(())
        })
    }
}

impl Drop for SocketCanChannel {
    #[allow(unused_must_use)]
    fn drop(&mut self) {
        self.close();
    }
}
