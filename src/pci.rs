//! PCI configuration space access paths.
//!
//! Three ways to reach a function's configuration registers:
//!
//! - through host services ([`cfg_read`]/[`cfg_write`]), the default;
//! - bypassing the host with configuration mechanism #1 over ports
//!   `0xCF8`/`0xCFC`;
//! - through the platform ECAM window for extended offsets (>= `0x100`),
//!   which mechanism #1 cannot address.

use std::sync::Arc;

use crate::hal::{AccessWidth, HostApi, MmioSpace, PciLocation};
use crate::status::{ApiStatus, CanFail};

/// Mechanism #1 address port.
const CONFIG_ADDRESS: u64 = 0xCF8;
/// Mechanism #1 data port.
const CONFIG_DATA: u64 = 0xCFC;

/// Capability ID of the power-management capability.
pub const CAP_ID_POWER_MGMT: u8 = 0x01;
/// Capability ID of the Vital Product Data capability.
pub const CAP_ID_VPD: u8 = 0x03;
/// Capability ID of the CompactPCI hot-swap capability.
pub const CAP_ID_HOT_SWAP: u8 = 0x06;

/// Reads a configuration register through host services.
///
/// Extended offsets are routed through the ECAM window when one exists.
pub fn cfg_read(host: &dyn HostApi, loc: PciLocation, offset: u16) -> Result<u32, ApiStatus> {
    if offset >= 0x100 {
        return match host.ecam_window() {
            Some(window) => Ok(ecam_read(&window, loc, offset)),
            None => Err(ApiStatus::UnsupportedFunction),
        };
    }

    if offset & 0x3 != 0 {
        return Err(ApiStatus::InvalidOffset);
    }

    host.cfg_read32(loc, offset)
}

/// Writes a configuration register through host services.
pub fn cfg_write(
    host: &dyn HostApi,
    loc: PciLocation,
    offset: u16,
    value: u32,
) -> CanFail<ApiStatus> {
    if offset >= 0x100 {
        return match host.ecam_window() {
            Some(window) => {
                ecam_write(&window, loc, offset, value);
                Ok(())
            }
            None => Err(ApiStatus::UnsupportedFunction),
        };
    }

    if offset & 0x3 != 0 {
        return Err(ApiStatus::InvalidOffset);
    }

    host.cfg_write32(loc, offset, value)
}

/// Encodes a mechanism #1 address: enable bit, bus, slot, function and the
/// dword-aligned register offset.
fn mech1_address(loc: PciLocation, offset: u16) -> u32 {
    (1 << 31)
        | (u32::from(loc.bus) << 16)
        | (u32::from(loc.slot & 0x1F) << 11)
        | (u32::from(loc.function & 0x7) << 8)
        | (u32::from(offset) & 0xFC)
}

/// Reads a configuration register directly, bypassing host services.
///
/// Offsets below `0x100` use configuration mechanism #1; extended offsets
/// require an ECAM window.
pub fn cfg_read_bypass(
    host: &dyn HostApi,
    loc: PciLocation,
    offset: u16,
) -> Result<u32, ApiStatus> {
    if offset & 0x3 != 0 {
        return Err(ApiStatus::InvalidOffset);
    }

    if offset >= 0x100 {
        return match host.ecam_window() {
            Some(window) => Ok(ecam_read(&window, loc, offset)),
            None => Err(ApiStatus::UnsupportedFunction),
        };
    }

    host.io_write(CONFIG_ADDRESS, AccessWidth::Bit32, mech1_address(loc, offset));
    Ok(host.io_read(CONFIG_DATA, AccessWidth::Bit32))
}

/// Writes a configuration register directly, bypassing host services.
pub fn cfg_write_bypass(
    host: &dyn HostApi,
    loc: PciLocation,
    offset: u16,
    value: u32,
) -> CanFail<ApiStatus> {
    if offset & 0x3 != 0 {
        return Err(ApiStatus::InvalidOffset);
    }

    if offset >= 0x100 {
        return match host.ecam_window() {
            Some(window) => {
                ecam_write(&window, loc, offset, value);
                Ok(())
            }
            None => Err(ApiStatus::UnsupportedFunction),
        };
    }

    host.io_write(CONFIG_ADDRESS, AccessWidth::Bit32, mech1_address(loc, offset));
    host.io_write(CONFIG_DATA, AccessWidth::Bit32, value);
    Ok(())
}

fn ecam_offset(loc: PciLocation, offset: u16) -> u64 {
    (u64::from(loc.bus) << 20)
        | (u64::from(loc.slot & 0x1F) << 15)
        | (u64::from(loc.function & 0x7) << 12)
        | u64::from(offset & 0xFFF)
}

fn ecam_read(window: &Arc<dyn MmioSpace>, loc: PciLocation, offset: u16) -> u32 {
    window.read32(ecam_offset(loc, offset))
}

fn ecam_write(window: &Arc<dyn MmioSpace>, loc: PciLocation, offset: u16, value: u32) {
    window.write32(ecam_offset(loc, offset), value);
}

/// Scans the capability list for `capability_id` and returns its offset.
///
/// Returns 0 when the capability is absent or configuration accesses fail,
/// which is also what a downed link reads back.
pub fn capability_offset(host: &dyn HostApi, loc: PciLocation, capability_id: u8) -> u16 {
    // Capabilities pointer lives at 0x34.
    let Ok(mut reg) = cfg_read(host, loc, 0x34) else {
        return 0;
    };

    if reg == u32::MAX {
        return 0;
    }

    let mut cap_offset = (reg & 0xFF) as u16;

    while cap_offset != 0 && reg != u32::MAX {
        reg = match cfg_read(host, loc, cap_offset & !0x3) {
            Ok(value) => value,
            Err(_) => return 0,
        };

        if (reg & 0xFF) as u8 == capability_id {
            return cap_offset;
        }

        cap_offset = ((reg >> 8) & 0xFF) as u16;
    }

    0
}
