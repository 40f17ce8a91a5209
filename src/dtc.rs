//! Module for common Diagnostic trouble code data
//!
//! Every protocol decodes its own DTC response format into [DiagnosticCode],
//! after which the code is protocol agnostic.

bitflags::bitflags! {
    /// DTC status byte, bit layout according to ISO14229-1 (Annex D).
    ///
    /// Protocols which do not report a status byte produce [DtcStatusFlags::CONFIRMED]
    /// for every code they return, as the ECU only reports stored codes.
    #[derive(Debug, Copy, Clone, PartialEq, Eq, Hash, PartialOrd, Ord)]
    #[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
    pub struct DtcStatusFlags: u8 {
        /// Most recent test result was a failure
        const TEST_FAILED = 0x01;
        /// Test failed during the current operation cycle
        const TEST_FAILED_THIS_OPERATION_CYCLE = 0x02;
        /// Failure detected, but not yet confirmed
        const PENDING = 0x04;
        /// Failure confirmed and stored in non volatile memory
        const CONFIRMED = 0x08;
        /// Test has not completed since DTCs were last cleared
        const TEST_NOT_COMPLETED_SINCE_LAST_CLEAR = 0x10;
        /// Test has failed at least once since DTCs were last cleared
        const TEST_FAILED_SINCE_LAST_CLEAR = 0x20;
        /// Test has not completed during this operation cycle
        const TEST_NOT_COMPLETED_THIS_OPERATION_CYCLE = 0x40;
        /// The DTC requests the MIL (Malfunction indicator lamp) to be on
        const WARNING_INDICATOR_REQUESTED = 0x80;
    }
}

#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
/// DTC name interpretation format specifier
pub enum DtcFormat {
    /// 2 byte SAE J2012 / ISO15031-6 code, top 2 bits select the P/C/B/U group
    TwoByte,
    /// 3 byte ISO14229-1 code (2 byte J2012 code + failure type byte)
    ThreeByte,
}

/// Diagnostic trouble code (DTC) storage struct
#[derive(Debug, Copy, Clone, PartialEq, Eq, PartialOrd, Ord, Hash)]
#[cfg_attr(feature = "serde", derive(serde::Serialize, serde::Deserialize))]
pub struct DiagnosticCode {
    /// The raw value of the DTC according to the ECU
    pub code: u32,
    /// Width of [DiagnosticCode::code]
    pub format: DtcFormat,
    /// Status of the DTC
    pub status: DtcStatusFlags,
}

impl DiagnosticCode {
    /// Creates a 2 byte DTC
    pub fn two_byte(code: u16, status: DtcStatusFlags) -> Self {
        Self {
            code: code as u32,
            format: DtcFormat::TwoByte,
            status,
        }
    }

    /// Creates a 3 byte DTC. Only the lower 24 bits of `code` are kept
    pub fn three_byte(code: u32, status: DtcStatusFlags) -> Self {
        Self {
            code: code & 0x00FF_FFFF,
            format: DtcFormat::ThreeByte,
            status,
        }
    }

    /// Indication if the DTC turns on the MIL lamp.
    /// This usually means that the Check engine light is illuminated on the
    /// vehicles instrument cluster
    pub fn mil_on(&self) -> bool {
        self.status.contains(DtcStatusFlags::WARNING_INDICATOR_REQUESTED)
    }

    fn j2012_part(&self) -> u16 {
        match self.format {
            DtcFormat::TwoByte => self.code as u16,
            DtcFormat::ThreeByte => (self.code >> 8) as u16,
        }
    }
}

impl std::fmt::Display for DiagnosticCode {
    /// Formats the code the way scan tools print it, EG: `P0171` or `U0100-87`
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        let raw = self.j2012_part();
        let group = match raw >> 14 {
            0 => 'P',
            1 => 'C',
            2 => 'B',
            _ => 'U',
        };
        write!(f, "{group}{:04X}", raw & 0x3FFF)?;
        if self.format == DtcFormat::ThreeByte {
            write!(f, "-{:02X}", self.code & 0xFF)?;
        }
        Ok(())
    }
}
