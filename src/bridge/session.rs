//! Sessions: the live binding of one protocol instance to one ECU identity

use std::{
    sync::{Mutex, MutexGuard},
    time::SystemTime,
};

use strum_macros::{Display, EnumString};

use crate::{
    config::EcuConfig,
    protocol::{EcuInfo, EcuProtocol, ProtocolKind, ProtocolResult},
    BridgeError, BridgeResult,
};

/// Key of a session: protocol family plus a human readable label
#[derive(Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EcuIdentity {
    /// Protocol family, selects the protocol implementation
    pub kind: ProtocolKind,
    /// Label, EG: `bosch_me17`
    pub label: String,
}

impl EcuIdentity {
    /// Creates a new identity
    pub fn new(kind: ProtocolKind, label: &str) -> Self {
        Self {
            kind,
            label: label.into(),
        }
    }
}

impl std::fmt::Display for EcuIdentity {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        write!(f, "{}/{}", self.kind, self.label)
    }
}

/// Session state as seen by bridge callers
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, Display, EnumString)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum SessionState {
    /// Session closed
    Disconnected,
    /// Handshake in progress
    Connecting,
    /// Operations are accepted
    Connected,
    /// Transport failed or too many consecutive timeouts. Operations fail until reconnected
    Error,
}

/// Point in time copy of a session's state
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionSnapshot {
    /// State at the time of the snapshot
    pub state: SessionState,
    /// When the handshake completed
    pub connected_at: SystemTime,
    /// Number of operations in a row that timed out
    pub consecutive_timeouts: u32,
}

/// Everything the bridge knows about one ECU
#[derive(Debug, Clone, PartialEq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SessionInfo {
    /// ECU identity
    pub identity: EcuIdentity,
    /// Stored configuration, if any
    pub config: Option<EcuConfig>,
    /// Identification read when the session was established
    pub ecu_info: Option<EcuInfo>,
    /// Session state, if a session exists
    pub session: Option<SessionSnapshot>,
}

#[derive(Debug)]
struct SessionStatus {
    state: SessionState,
    consecutive_timeouts: u32,
}

pub(crate) fn lock<T: ?Sized>(m: &Mutex<T>) -> MutexGuard<'_, T> {
    m.lock().unwrap_or_else(|e| e.into_inner())
}

/// A connected protocol instance.
///
/// The protocol lock is the exclusive access token for the session: it is held for
/// one complete operation, including multi-frame transfers. The status lock is only
/// ever held for a few instructions, so snapshots never wait for wire traffic.
#[derive(Debug)]
pub(crate) struct Session {
    identity: EcuIdentity,
    protocol: Mutex<Box<dyn EcuProtocol>>,
    status: Mutex<SessionStatus>,
    connected_at: SystemTime,
    max_consecutive_timeouts: u32,
    ecu_info: Option<EcuInfo>,
}

impl Session {
    /// Wraps a protocol that completed its handshake
    pub(crate) fn new(
        identity: EcuIdentity,
        protocol: Box<dyn EcuProtocol>,
        max_consecutive_timeouts: u32,
        ecu_info: Option<EcuInfo>,
    ) -> Self {
        Self {
            identity,
            protocol: Mutex::new(protocol),
            status: Mutex::new(SessionStatus {
                state: SessionState::Connected,
                consecutive_timeouts: 0,
            }),
            connected_at: SystemTime::now(),
            max_consecutive_timeouts,
            ecu_info,
        }
    }

    pub(crate) fn ecu_info(&self) -> Option<&EcuInfo> {
        self.ecu_info.as_ref()
    }

    pub(crate) fn snapshot(&self) -> SessionSnapshot {
        let status = lock(&self.status);
        SessionSnapshot {
            state: status.state,
            connected_at: self.connected_at,
            consecutive_timeouts: status.consecutive_timeouts,
        }
    }

    /// Runs one operation with exclusive access to the protocol
    pub(crate) fn run<T, F>(&self, op: F) -> BridgeResult<T>
    where
        F: FnOnce(&mut dyn EcuProtocol) -> ProtocolResult<T>,
    {
        let mut protocol = lock(&self.protocol);
        if lock(&self.status).state == SessionState::Error {
            return Err(BridgeError::SessionDegraded(self.identity.to_string()));
        }
        let res = op(&mut **protocol);
        drop(protocol);

        let mut status = lock(&self.status);
        match &res {
            Ok(_) => status.consecutive_timeouts = 0,
            Err(e) if e.is_fatal() => {
                log::error!("Transport of {} failed: {e}", self.identity);
                status.state = SessionState::Error;
            }
            Err(e) if e.is_timeout() => {
                status.consecutive_timeouts += 1;
                log::warn!(
                    "{} did not respond ({} consecutive timeouts)",
                    self.identity,
                    status.consecutive_timeouts
                );
                if status.consecutive_timeouts >= self.max_consecutive_timeouts {
                    log::warn!("Session with {} is degraded", self.identity);
                    status.state = SessionState::Error;
                }
            }
            // The ECU answered, even if negatively
            Err(_) => status.consecutive_timeouts = 0,
        }
        res.map_err(BridgeError::from)
    }

    /// Disconnects the protocol. Waits for an in-flight operation to finish first
    pub(crate) fn close(&self) -> BridgeResult<()> {
        let res = lock(&self.protocol).disconnect();
        lock(&self.status).state = SessionState::Disconnected;
        log::info!("Session with {} closed", self.identity);
        res.map_err(BridgeError::from)
    }
}
