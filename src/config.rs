//! ECU connection configuration
//!
//! A configuration is an immutable record describing how to reach one ECU
//! (the transport and its timing) plus the protocol specific option blocks.
//! It is supplied either directly by a caller, or as a plain key/value record
//! coming from external profile storage (See [EcuConfig::from_record]).

use std::{collections::HashMap, str::FromStr};

use strum_macros::{Display, EnumIter, EnumString};

use crate::protocol::ProtocolKind;

/// Configuration result
pub type ConfigResult<T> = Result<T, ConfigError>;

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
/// Invalid configuration
pub enum ConfigError {
    /// Required key missing from a configuration record
    #[error("Configuration key '{0}' is missing")]
    MissingKey(String),
    /// Value in a configuration record could not be interpreted
    #[error("Configuration value '{value}' for key '{key}' is invalid")]
    InvalidValue {
        /// Key of the record entry
        key: String,
        /// Offending value
        value: String,
    },
    /// Connection type does not match the transport the protocol runs on
    #[error("Protocol {kind} cannot run over a {connection} connection")]
    TransportMismatch {
        /// Protocol the configuration was given for
        kind: ProtocolKind,
        /// Connection type of the configuration
        connection: ConnectionType,
    },
    /// A setting is outside of its valid range
    #[error("Setting '{0}' is out of range")]
    OutOfRange(&'static str),
    /// No configuration is stored for the ECU
    #[error("ECU {0} has not been configured")]
    NotConfigured(String),
}

/// Transport family of a [ConnectionConfig]
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionType {
    /// Serial port / K-Line adapter
    Serial,
    /// CAN interface
    CanBus,
}

/// Serial parity
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, EnumString, EnumIter)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum Parity {
    /// No parity bit
    None,
    /// Even parity
    Even,
    /// Odd parity
    Odd,
}

/// Serial port settings
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct SerialConfig {
    /// Serial port path, EG: `/dev/ttyUSB0` or `COM3`
    pub port: String,
    /// Line speed
    pub baud_rate: u32,
    /// Parity (8 data bits and 1 stop bit are always used)
    pub parity: Parity,
    /// Read/write timeout in milliseconds
    pub timeout_ms: u32,
}

/// CAN bus settings
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct CanBusConfig {
    /// CAN interface name, EG: `can0`
    pub interface: String,
    /// Bus speed in bits per second
    pub bitrate: u32,
    /// CAN ID the tester sends requests on
    pub request_id: u32,
    /// CAN ID the ECU responds on
    pub response_id: u32,
    /// Read/write timeout in milliseconds
    pub timeout_ms: u32,
    /// Use 29 bit CAN identifiers
    pub extended_ids: bool,
}

/// Transport configuration
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum ConnectionConfig {
    /// Serial connection
    Serial(SerialConfig),
    /// CAN connection
    CanBus(CanBusConfig),
}

impl ConnectionConfig {
    /// Transport family of the configuration
    pub fn connection_type(&self) -> ConnectionType {
        match self {
            ConnectionConfig::Serial(_) => ConnectionType::Serial,
            ConnectionConfig::CanBus(_) => ConnectionType::CanBus,
        }
    }

    /// Operation timeout in milliseconds
    pub fn timeout_ms(&self) -> u32 {
        match self {
            ConnectionConfig::Serial(s) => s.timeout_ms,
            ConnectionConfig::CanBus(c) => c.timeout_ms,
        }
    }

    /// Human readable connection description, EG: `/dev/ttyUSB0@38400`
    pub fn describe(&self) -> String {
        match self {
            ConnectionConfig::Serial(s) => format!("{}@{}", s.port, s.baud_rate),
            ConnectionConfig::CanBus(c) => format!("{}@{}", c.interface, c.bitrate),
        }
    }
}

/// K-Line checksum variant
#[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, Display, EnumString, EnumIter, Default)]
#[strum(serialize_all = "snake_case")]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub enum KwpChecksum {
    /// Modulo 256 sum of length and data bytes
    #[default]
    Additive,
    /// Bitwise inverse of the additive checksum
    Inverted,
}

/// KWP2000 (K-Line) options
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct Kwp2000Options {
    /// Frame checksum variant
    pub checksum: KwpChecksum,
    /// Bytes sent to wake the K-Line before the connect request
    pub wake_pattern: Vec<u8>,
    /// Delay between individual wake pattern bytes. 0 sends the pattern in one write
    pub wake_byte_delay_ms: u32,
    /// Delay between the wake pattern and the connect request
    pub wake_settle_ms: u32,
}

impl Default for Kwp2000Options {
    fn default() -> Self {
        let mut wake_pattern = vec![0x00; 10];
        wake_pattern.extend_from_slice(&[0x55, 0x01, 0x8A]);
        Self {
            checksum: KwpChecksum::Additive,
            wake_pattern,
            wake_byte_delay_ms: 0,
            wake_settle_ms: 100,
        }
    }
}

/// ISO-TP transport settings used when the tester receives multi-frame data
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct IsoTpSettings {
    /// Block size sent in flow control frames. 0 lets the ECU send everything at once
    pub block_size: u8,
    /// Minimum separation time sent in flow control frames (Raw ST byte)
    pub st_min: u8,
    /// Pad outgoing frames to 8 bytes
    pub pad_frame: bool,
    /// Most flow control WAIT frames accepted in a row before a send is abandoned
    pub max_fc_wait: u8,
}

impl Default for IsoTpSettings {
    fn default() -> Self {
        Self {
            block_size: 0,
            st_min: 0,
            pad_frame: false,
            max_fc_wait: 10,
        }
    }
}

/// UDS options
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct UdsOptions {
    /// Diagnostic session requested on connect
    pub session_type: u8,
    /// ISO-TP settings
    pub iso_tp: IsoTpSettings,
    /// ReadDTCInformation sub function used to read DTCs
    pub dtc_sub_function: u8,
    /// DTC status mask sent with the read request
    pub dtc_status_mask: u8,
}

impl Default for UdsOptions {
    fn default() -> Self {
        Self {
            session_type: 0x03,
            iso_tp: IsoTpSettings::default(),
            dtc_sub_function: 0x02,
            dtc_status_mask: 0xFF,
        }
    }
}

/// Denso-style framed protocol options
#[derive(Debug, Copy, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DensoOptions {
    /// Ask the ECU for a checksum of every written block and compare it
    pub verify_after_write: bool,
    /// Timeout for sector erase requests
    pub erase_timeout_ms: u32,
}

impl Default for DensoOptions {
    fn default() -> Self {
        Self {
            verify_after_write: true,
            erase_timeout_ms: 10_000,
        }
    }
}

/// Complete configuration of one ECU
#[derive(Debug, Clone, PartialEq, Eq)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct EcuConfig {
    /// Transport configuration
    pub connection: ConnectionConfig,
    /// KWP2000 options. Ignored by other protocols
    pub kwp2000: Kwp2000Options,
    /// UDS options. Ignored by other protocols
    pub uds: UdsOptions,
    /// Denso options. Ignored by other protocols
    pub denso: DensoOptions,
    /// Number of consecutive timeouts after which a session is considered degraded
    pub max_consecutive_timeouts: u32,
    /// How long to wait for the real response after a response pending reply
    pub pending_timeout_ms: u32,
    /// Most response pending replies accepted for one request
    pub max_pending_responses: u32,
}

impl EcuConfig {
    /// Creates a configuration with default protocol options
    pub fn new(connection: ConnectionConfig) -> Self {
        Self {
            connection,
            kwp2000: Kwp2000Options::default(),
            uds: UdsOptions::default(),
            denso: DensoOptions::default(),
            max_consecutive_timeouts: 3,
            pending_timeout_ms: 5000,
            max_pending_responses: 20,
        }
    }

    /// Default configuration for a protocol family on a port (serial path or CAN interface)
    pub fn default_for(kind: ProtocolKind, port: &str) -> Self {
        let connection = match kind {
            ProtocolKind::Kwp2000 => ConnectionConfig::Serial(SerialConfig {
                port: port.into(),
                baud_rate: 38400,
                parity: Parity::None,
                timeout_ms: 5000,
            }),
            ProtocolKind::Uds => ConnectionConfig::CanBus(CanBusConfig {
                interface: port.into(),
                bitrate: 500_000,
                request_id: 0x7E0,
                response_id: 0x7E8,
                timeout_ms: 5000,
                extended_ids: false,
            }),
            ProtocolKind::ProprietaryFramed => ConnectionConfig::Serial(SerialConfig {
                port: port.into(),
                baud_rate: 19200,
                parity: Parity::Even,
                timeout_ms: 10_000,
            }),
        };
        Self::new(connection)
    }

    /// Checks that the configuration can be used by a protocol of family `kind`
    pub fn validate(&self, kind: ProtocolKind) -> ConfigResult<()> {
        let connection = self.connection.connection_type();
        if kind.uses_can() != (connection == ConnectionType::CanBus) {
            return Err(ConfigError::TransportMismatch { kind, connection });
        }
        match &self.connection {
            ConnectionConfig::Serial(s) => {
                if s.baud_rate == 0 {
                    return Err(ConfigError::OutOfRange("baud_rate"));
                }
            }
            ConnectionConfig::CanBus(c) => {
                if c.bitrate == 0 {
                    return Err(ConfigError::OutOfRange("bitrate"));
                }
                let max_id = if c.extended_ids { 0x1FFF_FFFF } else { 0x7FF };
                if c.request_id > max_id {
                    return Err(ConfigError::OutOfRange("request_id"));
                }
                if c.response_id > max_id {
                    return Err(ConfigError::OutOfRange("response_id"));
                }
            }
        }
        if self.connection.timeout_ms() == 0 {
            return Err(ConfigError::OutOfRange("timeout"));
        }
        Ok(())
    }

    /// Builds a configuration from a plain key/value record.
    ///
    /// Missing keys take the value of [EcuConfig::default_for]. `port` (or `interface`)
    /// is required. Numeric values may be decimal or `0x` prefixed hex, `timeout` is in
    /// seconds and may be fractional.
    pub fn from_record(kind: ProtocolKind, record: &HashMap<String, String>) -> ConfigResult<Self> {
        let port = record
            .get("port")
            .or_else(|| record.get("interface"))
            .ok_or_else(|| ConfigError::MissingKey("port".into()))?;
        let mut cfg = Self::default_for(kind, port);

        if let Some(ct) = record.get("connection_type") {
            let wanted = parse_enum::<ConnectionType>("connection_type", ct)?;
            if wanted != cfg.connection.connection_type() {
                return Err(ConfigError::TransportMismatch {
                    kind,
                    connection: wanted,
                });
            }
        }

        let timeout_ms = match (record.get("timeout_ms"), record.get("timeout")) {
            (Some(ms), _) => Some(parse_number("timeout_ms", ms)?),
            (None, Some(secs)) => Some(parse_seconds("timeout", secs)?),
            (None, None) => None,
        };

        match &mut cfg.connection {
            ConnectionConfig::Serial(s) => {
                if let Some(v) = record.get("baud_rate") {
                    s.baud_rate = parse_number("baud_rate", v)?;
                }
                if let Some(v) = record.get("parity") {
                    s.parity = parse_enum("parity", v)?;
                }
                if let Some(t) = timeout_ms {
                    s.timeout_ms = t;
                }
            }
            ConnectionConfig::CanBus(c) => {
                if let Some(v) = record.get("can_bitrate").or_else(|| record.get("bitrate")) {
                    c.bitrate = parse_number("bitrate", v)?;
                }
                if let Some(v) = record.get("request_id") {
                    c.request_id = parse_number("request_id", v)?;
                }
                if let Some(v) = record.get("response_id") {
                    c.response_id = parse_number("response_id", v)?;
                }
                if let Some(v) = record.get("extended_ids") {
                    c.extended_ids = parse_bool("extended_ids", v)?;
                }
                if let Some(t) = timeout_ms {
                    c.timeout_ms = t;
                }
            }
        }

        for (key, value) in record {
            match key.as_str() {
                "max_consecutive_timeouts" => {
                    cfg.max_consecutive_timeouts = parse_number(key, value)?
                }
                "pending_timeout_ms" => cfg.pending_timeout_ms = parse_number(key, value)?,
                "max_pending_responses" => {
                    cfg.max_pending_responses = parse_number(key, value)?
                }
                "checksum" => cfg.kwp2000.checksum = parse_enum(key, value)?,
                "wake_byte_delay_ms" => cfg.kwp2000.wake_byte_delay_ms = parse_number(key, value)?,
                "wake_settle_ms" => cfg.kwp2000.wake_settle_ms = parse_number(key, value)?,
                "session_type" => cfg.uds.session_type = parse_number(key, value)?,
                "dtc_sub_function" => cfg.uds.dtc_sub_function = parse_number(key, value)?,
                "dtc_status_mask" => cfg.uds.dtc_status_mask = parse_number(key, value)?,
                "block_size" => cfg.uds.iso_tp.block_size = parse_number(key, value)?,
                "st_min" => cfg.uds.iso_tp.st_min = parse_number(key, value)?,
                "pad_frame" => cfg.uds.iso_tp.pad_frame = parse_bool(key, value)?,
                "max_fc_wait" => cfg.uds.iso_tp.max_fc_wait = parse_number(key, value)?,
                "verify_after_write" => cfg.denso.verify_after_write = parse_bool(key, value)?,
                "erase_timeout_ms" => cfg.denso.erase_timeout_ms = parse_number(key, value)?,
                "port" | "interface" | "connection_type" | "timeout" | "timeout_ms"
                | "baud_rate" | "parity" | "can_bitrate" | "bitrate" | "request_id"
                | "response_id" | "extended_ids" => {}
                other => log::debug!("Ignoring unknown configuration key '{other}'"),
            }
        }
        cfg.validate(kind)?;
        Ok(cfg)
    }
}

fn invalid(key: &str, value: &str) -> ConfigError {
    ConfigError::InvalidValue {
        key: key.into(),
        value: value.into(),
    }
}

fn parse_number<T: TryFrom<u64>>(key: &str, value: &str) -> ConfigResult<T> {
    let v = value.trim();
    let parsed = match v.strip_prefix("0x").or_else(|| v.strip_prefix("0X")) {
        Some(hex) => u64::from_str_radix(hex, 16),
        None => v.parse::<u64>(),
    }
    .map_err(|_| invalid(key, value))?;
    T::try_from(parsed).map_err(|_| invalid(key, value))
}

fn parse_seconds(key: &str, value: &str) -> ConfigResult<u32> {
    let secs = value
        .trim()
        .parse::<f64>()
        .map_err(|_| invalid(key, value))?;
    if !secs.is_finite() || secs <= 0.0 || secs * 1000.0 > u32::MAX as f64 {
        return Err(invalid(key, value));
    }
    Ok((secs * 1000.0).round() as u32)
}

fn parse_bool(key: &str, value: &str) -> ConfigResult<bool> {
    match value.trim().to_ascii_lowercase().as_str() {
        "true" | "1" | "yes" | "on" => Ok(true),
        "false" | "0" | "no" | "off" => Ok(false),
        _ => Err(invalid(key, value)),
    }
}

fn parse_enum<T: FromStr>(key: &str, value: &str) -> ConfigResult<T> {
    T::from_str(value.trim().to_ascii_lowercase().as_str()).map_err(|_| invalid(key, value))
}
