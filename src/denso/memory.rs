//! Fixed memory map of Denso-style ECUs and erase sector bookkeeping

use std::collections::BTreeSet;

use crate::protocol::{AccessKind, MemoryRegion, ProtocolError, ProtocolResult};

/// Erase sector size
pub const SECTOR_SIZE: u32 = 0x1000;

/// Program ROM
pub const ROM: MemoryRegion = MemoryRegion::new(0x0000_0000, 0x0008_0000, AccessKind::ROM);
/// Calibration EEPROM
pub const EEPROM: MemoryRegion = MemoryRegion::new(0x00FE_0000, 0x0000_2000, AccessKind::EEPROM);
/// RAM window
pub const RAM: MemoryRegion = MemoryRegion::new(0x05FF_FF00, 0x0000_0100, AccessKind::RAM);

/// Every addressable region
pub const REGIONS: [MemoryRegion; 3] = [ROM, EEPROM, RAM];

/// Returns true if writing into the region requires an erased sector
pub fn requires_erase(region: &MemoryRegion) -> bool {
    matches!(region.access_kind, AccessKind::ROM | AccessKind::EEPROM | AccessKind::Flash)
}

/// Start address of the sector containing `address`
pub fn sector_of(address: u32) -> u32 {
    address & !(SECTOR_SIZE - 1)
}

/// Sectors erased during the current connection
#[derive(Debug, Clone, Default)]
pub struct ErasedSectors {
    sectors: BTreeSet<u32>,
}

impl ErasedSectors {
    /// Records the sector containing `address` as erased
    pub fn mark(&mut self, address: u32) {
        self.sectors.insert(sector_of(address));
    }

    /// Forgets every erased sector
    pub fn clear(&mut self) {
        self.sectors.clear();
    }

    /// Checks that every sector touched by `[address, address + length)` is erased.
    /// Returns [ProtocolError::WriteProtected] with the first sector that is not
    pub fn check(&self, address: u32, length: usize) -> ProtocolResult<()> {
        if length == 0 {
            return Ok(());
        }
        let last = address as u64 + length as u64 - 1;
        let mut sector = sector_of(address) as u64;
        while sector <= last {
            if !self.sectors.contains(&(sector as u32)) {
                let first_bad = std::cmp::max(sector as u32, address);
                return Err(ProtocolError::WriteProtected { address: first_bad });
            }
            sector += SECTOR_SIZE as u64;
        }
        Ok(())
    }
}
