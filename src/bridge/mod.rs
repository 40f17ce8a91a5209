//! The bridge: one uniform entry point for every configured ECU
//!
//! The bridge owns the stored configurations and the live sessions, keyed by
//! [EcuIdentity]. The session table lock is only held while the table itself is
//! read or modified. Wire traffic of an operation only holds that session's own
//! exclusive access token, so different ECUs are served concurrently while
//! operations on the same ECU are strictly serialized.
//!
//! ## Example
//! ```no_run
//! use ecu_bridge::{bridge::{Bridge, EcuIdentity}, protocol::ProtocolKind};
//!
//! let bridge = Bridge::with_hardware();
//! let me17 = EcuIdentity::new(ProtocolKind::Kwp2000, "bosch_me17");
//! bridge.quick_connect(&me17, "/dev/ttyUSB0").unwrap();
//! let block = bridge.read_memory(&me17, 0x1000, 256).unwrap();
//! println!("{block:02X?}");
//! bridge.disconnect(&me17).unwrap();
//! ```

use std::{
    collections::{BTreeMap, HashMap},
    sync::{Arc, Mutex},
};

use crate::{
    config::{ConfigError, ConnectionConfig, EcuConfig},
    denso::DensoProtocol,
    dtc::DiagnosticCode,
    hardware::{HardwareTransportFactory, TransportFactory},
    kwp2000::Kwp2000Protocol,
    protocol::{EcuInfo, EcuProtocol, ProtocolKind},
    uds::UdsProtocol,
    BridgeError, BridgeResult,
};

mod session;

use session::{lock, Session};
pub use session::{EcuIdentity, SessionInfo, SessionSnapshot, SessionState};

/// Multi-ECU session manager
pub struct Bridge {
    factory: Box<dyn TransportFactory>,
    configs: Mutex<HashMap<EcuIdentity, EcuConfig>>,
    sessions: Mutex<HashMap<EcuIdentity, Arc<Session>>>,
}

impl std::fmt::Debug for Bridge {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        f.debug_struct("Bridge")
            .field("configured", &self.configured_ecus())
            .field("sessions", &lock(&self.sessions).keys().collect::<Vec<_>>())
            .finish()
    }
}

impl Default for Bridge {
    fn default() -> Self {
        Self::with_hardware()
    }
}

impl Bridge {
    /// Creates a bridge that obtains its transports from `factory`
    pub fn new<F: TransportFactory + 'static>(factory: F) -> Self {
        Self {
            factory: Box::new(factory),
            configs: Mutex::new(HashMap::new()),
            sessions: Mutex::new(HashMap::new()),
        }
    }

    /// Creates a bridge using the hardware adapters compiled into the crate
    pub fn with_hardware() -> Self {
        Self::new(HardwareTransportFactory)
    }

    /// Stores (or replaces) the configuration of an ECU. No I/O is performed.
    ///
    /// Fails with [BridgeError::ConfigurationError] if the configuration cannot be
    /// used by the identity's protocol (EG: a CAN configuration for KWP2000).
    pub fn configure_ecu(&self, identity: &EcuIdentity, config: EcuConfig) -> BridgeResult<()> {
        config.validate(identity.kind)?;
        log::debug!("Configured {identity} on {}", config.connection.describe());
        lock(&self.configs).insert(identity.clone(), config);
        Ok(())
    }

    /// Identities that have a stored configuration, sorted
    pub fn configured_ecus(&self) -> Vec<EcuIdentity> {
        let mut ids: Vec<EcuIdentity> = lock(&self.configs).keys().cloned().collect();
        ids.sort();
        ids
    }

    fn build_protocol(
        &self,
        identity: &EcuIdentity,
        config: &EcuConfig,
    ) -> BridgeResult<Box<dyn EcuProtocol>> {
        let protocol: Box<dyn EcuProtocol> = match (identity.kind, &config.connection) {
            (ProtocolKind::Kwp2000, ConnectionConfig::Serial(s)) => {
                Box::new(Kwp2000Protocol::new(self.factory.open_serial(s)?, config))
            }
            (ProtocolKind::ProprietaryFramed, ConnectionConfig::Serial(s)) => {
                Box::new(DensoProtocol::new(self.factory.open_serial(s)?, config))
            }
            (ProtocolKind::Uds, ConnectionConfig::CanBus(c)) => {
                Box::new(UdsProtocol::new(self.factory.open_can(c)?, c, config))
            }
            (kind, connection) => {
                return Err(ConfigError::TransportMismatch {
                    kind,
                    connection: connection.connection_type(),
                }
                .into())
            }
        };
        Ok(protocol)
    }

    /// Connects to a configured ECU.
    ///
    /// A previous session of the identity is closed before the new handshake starts,
    /// both run on the same physical link. Errors found before any wire traffic
    /// (missing configuration, transport not available) leave the previous session
    /// untouched. If the handshake itself fails, the identity has no session.
    pub fn connect(&self, identity: &EcuIdentity) -> BridgeResult<()> {
        let config = lock(&self.configs)
            .get(identity)
            .cloned()
            .ok_or_else(|| ConfigError::NotConfigured(identity.to_string()))?;
        let mut protocol = self.build_protocol(identity, &config)?;

        let previous = lock(&self.sessions).remove(identity);
        if let Some(old) = previous {
            log::debug!("Closing the existing session of {identity} before reconnecting");
            if let Err(e) = old.close() {
                log::warn!("Closing the replaced session of {identity} failed: {e}");
            }
        }
        protocol.connect()?;

        let ecu_info = match protocol.identify() {
            Ok(info) => Some(info),
            Err(e) => {
                log::warn!("{identity} connected, but identification failed: {e}");
                None
            }
        };
        let session = Arc::new(Session::new(
            identity.clone(),
            protocol,
            config.max_consecutive_timeouts,
            ecu_info,
        ));
        if let Some(racing) = lock(&self.sessions).insert(identity.clone(), session) {
            log::warn!("{identity} was connected concurrently, dropping the other session");
            if let Err(e) = racing.close() {
                log::warn!("Closing the concurrent session of {identity} failed: {e}");
            }
        }
        log::info!("Session with {identity} established");
        Ok(())
    }

    /// Disconnects from an ECU. Does nothing if there is no session
    pub fn disconnect(&self, identity: &EcuIdentity) -> BridgeResult<()> {
        let removed = lock(&self.sessions).remove(identity);
        match removed {
            Some(session) => session.close(),
            None => Ok(()),
        }
    }

    /// Disconnects every session
    pub fn disconnect_all(&self) {
        let sessions: Vec<_> = lock(&self.sessions).drain().collect();
        for (identity, session) in sessions {
            if let Err(e) = session.close() {
                log::warn!("Disconnecting {identity} failed: {e}");
            }
        }
    }

    fn session(&self, identity: &EcuIdentity) -> BridgeResult<Arc<Session>> {
        lock(&self.sessions)
            .get(identity)
            .cloned()
            .ok_or(BridgeError::NotConnected)
    }

    /// Returns true if a session exists and accepts operations
    pub fn is_connected(&self, identity: &EcuIdentity) -> bool {
        self.session(identity)
            .map(|s| s.snapshot().state == SessionState::Connected)
            .unwrap_or(false)
    }

    /// Reads ECU identification data
    pub fn get_ecu_info(&self, identity: &EcuIdentity) -> BridgeResult<EcuInfo> {
        self.session(identity)?.run(|p| p.identify())
    }

    /// Reads `length` bytes at `address`
    pub fn read_memory(&self, identity: &EcuIdentity, address: u32, length: usize) -> BridgeResult<Vec<u8>> {
        self.session(identity)?.run(|p| p.read_memory(address, length))
    }

    /// Writes `data` at `address`
    pub fn write_memory(&self, identity: &EcuIdentity, address: u32, data: &[u8]) -> BridgeResult<()> {
        self.session(identity)?.run(|p| p.write_memory(address, data))
    }

    /// Erases the memory sector containing `address`.
    /// Fails with [BridgeError::NotSupported] for protocols without erasable memory
    pub fn erase_memory(&self, identity: &EcuIdentity, address: u32) -> BridgeResult<()> {
        self.session(identity)?.run(|p| p.erase_memory(address))
    }

    /// Reads stored diagnostic trouble codes
    pub fn get_diagnostic_codes(&self, identity: &EcuIdentity) -> BridgeResult<Vec<DiagnosticCode>> {
        self.session(identity)?.run(|p| p.read_dtcs())
    }

    /// Clears stored diagnostic trouble codes
    pub fn clear_diagnostic_codes(&self, identity: &EcuIdentity) -> BridgeResult<()> {
        self.session(identity)?.run(|p| p.clear_dtcs())
    }

    /// Point in time copy of every session's state
    pub fn list_sessions(&self) -> BTreeMap<EcuIdentity, SessionSnapshot> {
        let sessions: Vec<(EcuIdentity, Arc<Session>)> = lock(&self.sessions)
            .iter()
            .map(|(k, v)| (k.clone(), v.clone()))
            .collect();
        sessions
            .into_iter()
            .map(|(k, v)| (k, v.snapshot()))
            .collect()
    }

    /// Stored configuration and session state of an ECU.
    /// Returns [None] if the ECU is neither configured nor connected
    pub fn session_info(&self, identity: &EcuIdentity) -> Option<SessionInfo> {
        let config = lock(&self.configs).get(identity).cloned();
        let session = self.session(identity).ok();
        if config.is_none() && session.is_none() {
            return None;
        }
        Some(SessionInfo {
            identity: identity.clone(),
            config,
            ecu_info: session.as_ref().and_then(|s| s.ecu_info().cloned()),
            session: session.map(|s| s.snapshot()),
        })
    }

    /// Configures an ECU with the default settings of its protocol on `port`
    /// (See [EcuConfig::default_for]) and connects to it
    pub fn quick_connect(&self, identity: &EcuIdentity, port: &str) -> BridgeResult<()> {
        self.configure_ecu(identity, EcuConfig::default_for(identity.kind, port))?;
        self.connect(identity)
    }

    /// Probes candidate ECUs in order, using default settings on each port.
    ///
    /// A candidate is detected if it completes the handshake and answers an
    /// identification request. The first detected candidate stays connected and is
    /// returned. Every other attempt is disconnected before this returns.
    pub fn auto_detect(&self, candidates: &[(EcuIdentity, String)]) -> BridgeResult<Option<EcuIdentity>> {
        for (identity, port) in candidates {
            log::info!("Probing {identity} on {port}");
            if let Err(e) = self.quick_connect(identity, port) {
                log::debug!("{identity} not found on {port}: {e}");
                continue;
            }
            match self.get_ecu_info(identity) {
                Ok(info) => {
                    log::info!("Detected {} ({identity}) on {port}", info.ecu_type);
                    return Ok(Some(identity.clone()));
                }
                Err(e) => {
                    log::debug!("{identity} on {port} did not identify: {e}");
                    if let Err(e) = self.disconnect(identity) {
                        log::warn!("Disconnecting probe of {identity} failed: {e}");
                    }
                }
            }
        }
        Ok(None)
    }
}

impl Drop for Bridge {
    fn drop(&mut self) {
        self.disconnect_all();
    }
}
