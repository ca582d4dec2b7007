//! Vital Product Data access through the PCI VPD capability.
//!
//! VPD is the configuration-space window onto the serial EEPROM. It is used
//! both as a public control operation and as the EEPROM fallback for the
//! 9054 AA stepping, whose EEPROM control register is broken.

use log::debug;

use crate::hal::{DeviceRegs, HostApi, PciLocation};
use crate::pci;
use crate::status::{ApiStatus, CanFail};

/// Retries of a whole VPD command before reporting a timeout.
const VPD_COMMAND_MAX_RETRIES: u32 = 3;
/// Completion polls per command attempt.
const VPD_STATUS_MAX_POLL: u32 = 10;
/// Delay between completion polls.
const VPD_STATUS_POLL_DELAY_MS: u64 = 5;

/// VPD command/completion flag (bit 31 of the capability dword).
const VPD_FLAG: u32 = 1 << 31;

/// `EEDO` input enable in the EEPROM control register; must be off while the
/// VPD engine owns the serial bus.
const EEDO_INPUT_ENABLE: u32 = 1 << 31;

/// Reads a 32-bit word through the VPD capability.
pub fn read(
    host: &dyn HostApi,
    loc: PciLocation,
    regs: &DeviceRegs,
    eeprom_ctrl: u16,
    offset: u16,
) -> Result<u32, ApiStatus> {
    if offset & 0x3 != 0 {
        return Err(ApiStatus::InvalidOffset);
    }

    let vpd_offset = pci::capability_offset(host, loc, pci::CAP_ID_VPD);
    if vpd_offset == 0 {
        return Err(ApiStatus::UnsupportedFunction);
    }

    disable_eedo_input(regs, eeprom_ctrl);

    // The command dword rewrites the capability header: id in the low byte,
    // word address in the upper half, flag clear for a read.
    let command = (u32::from(offset) << 16) | u32::from(pci::CAP_ID_VPD);

    for _ in 0..=VPD_COMMAND_MAX_RETRIES {
        pci::cfg_write(host, loc, vpd_offset, command)?;

        for _ in 0..=VPD_STATUS_MAX_POLL {
            std::thread::sleep(std::time::Duration::from_millis(VPD_STATUS_POLL_DELAY_MS));

            let status = pci::cfg_read(host, loc, vpd_offset)?;
            if status & VPD_FLAG != 0 {
                return pci::cfg_read(host, loc, vpd_offset + 4);
            }
        }
    }

    debug!(target: "plxcore::vpd", "timeout waiting for VPD read to complete");
    Err(ApiStatus::WaitTimeout)
}

/// Writes a 32-bit word through the VPD capability.
pub fn write(
    host: &dyn HostApi,
    loc: PciLocation,
    regs: &DeviceRegs,
    eeprom_ctrl: u16,
    offset: u16,
    value: u32,
) -> CanFail<ApiStatus> {
    if offset & 0x3 != 0 {
        return Err(ApiStatus::InvalidOffset);
    }

    let vpd_offset = pci::capability_offset(host, loc, pci::CAP_ID_VPD);
    if vpd_offset == 0 {
        return Err(ApiStatus::UnsupportedFunction);
    }

    disable_eedo_input(regs, eeprom_ctrl);

    pci::cfg_write(host, loc, vpd_offset + 4, value)?;

    // Flag set requests a write; the engine clears it on completion.
    let command = VPD_FLAG | (u32::from(offset) << 16) | u32::from(pci::CAP_ID_VPD);

    for _ in 0..=VPD_COMMAND_MAX_RETRIES {
        pci::cfg_write(host, loc, vpd_offset, command)?;

        for _ in 0..=VPD_STATUS_MAX_POLL {
            std::thread::sleep(std::time::Duration::from_millis(VPD_STATUS_POLL_DELAY_MS));

            let status = pci::cfg_read(host, loc, vpd_offset)?;
            if status & VPD_FLAG == 0 {
                return Ok(());
            }
        }
    }

    debug!(target: "plxcore::vpd", "timeout waiting for VPD write to complete");
    Err(ApiStatus::WaitTimeout)
}

/// Some chips require the `EEDO` input disabled while VPD is used. The bit
/// is reserved on older parts, so clearing it is harmless for all.
fn disable_eedo_input(regs: &DeviceRegs, eeprom_ctrl: u16) {
    let ctrl = regs.read(eeprom_ctrl);
    regs.write(eeprom_ctrl, ctrl & !EEDO_INPUT_ENABLE);
}
