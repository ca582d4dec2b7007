//! Per-chip capability layer.
//!
//! All chip-specific knowledge (register layout, EEPROM framing, interrupt
//! cause decoding, remap lookup, board reset) is bundled into a [`ChipOps`]
//! value resolved at device attach from the family tables below. The rest of
//! the driver holds a `ChipOps` and never hard-codes a register offset.

pub mod eeprom;
pub mod regs;

use log::debug;

use crate::chip::eeprom::EepromKind;
use crate::chip::regs::{
    DmaRegs, IntrBits, RegMap, DMA_MODE_BIT_DONE_INT, DMA_MODE_BIT_ROUTE_INT_PCI,
    EE_BIT_PRESENT, EE_BIT_RELOAD, EE_BIT_SW_RESET, INTR_9050_CLASS, INTR_9080_CLASS,
    OUTPOST_BIT_INT, QSR_BIT_I2O_DECODE, QSR_BIT_INPOST_INT_MASK,
    QSR_BIT_OUTFREE_OVERFLOW_MASK, REGS_9050_CLASS, REGS_9080_CLASS,
};
use crate::device::DeviceKey;
use crate::device::resources::synchronized_modify;
use crate::hal::{DeviceRegs, HostApi, PciLocation};
use crate::intr::{IntrCause, IntrSpec};
use crate::pci;
use crate::status::{ApiStatus, CanFail};
use crate::vpd;

/// PCI vendor ID of the bridge family.
pub const PLX_VENDOR_ID: u16 = 0x10B5;

/// Everything a [`ChipOps`] method needs from the owning device.
pub struct ChipIo<'a> {
    pub regs: &'a DeviceRegs,
    pub isr_lock: &'a spin::Mutex<()>,
    pub host: &'a dyn HostApi,
    pub loc: PciLocation,
}

/// EEPROM wiring of one family.
#[derive(Debug, Clone, Copy)]
pub struct EepromProfile {
    pub kind: EepromKind,

    /// Bytes of the EEPROM the chip actually loads.
    pub size: u16,

    /// Polarity of the write-completion poll. Every supported family reports
    /// completion with the data-in bit set; the knob exists because at least
    /// one silicon variant is suspected to invert it.
    pub write_done_when_set: bool,
}

/// Static description of one chip family.
#[derive(Debug, Clone, Copy)]
pub struct ChipProfile {
    pub chip_type: u16,
    pub name: &'static str,
    pub regs: RegMap,
    pub intr: IntrBits,
    pub eeprom: EepromProfile,
    pub dma_channels: u8,
    pub common_buffer_size: u32,
}

const COMMON_BUFFER_DEFAULT: u32 = 64 * 1024;

macro_rules! profile_9080_class {
    ($name: literal, $chip: literal, $eeprom: expr) => {
        ChipProfile {
            chip_type: $chip,
            name: $name,
            regs: REGS_9080_CLASS,
            intr: INTR_9080_CLASS,
            eeprom: EepromProfile {
                kind: $eeprom,
                size: 0x100,
                write_done_when_set: true,
            },
            dma_channels: 2,
            common_buffer_size: COMMON_BUFFER_DEFAULT,
        }
    };
}

macro_rules! profile_9050_class {
    ($name: literal, $chip: literal, $eeprom: expr) => {
        ChipProfile {
            chip_type: $chip,
            name: $name,
            regs: REGS_9050_CLASS,
            intr: INTR_9050_CLASS,
            eeprom: EepromProfile {
                kind: $eeprom,
                size: 0x64,
                write_done_when_set: true,
            },
            dma_channels: 0,
            common_buffer_size: 0,
        }
    };
}

pub static PROFILE_9030: ChipProfile = profile_9050_class!("Plx9030", 0x9030, EepromKind::Cs56);
pub static PROFILE_9050: ChipProfile = profile_9050_class!("Plx9050", 0x9050, EepromKind::Cs46);
pub static PROFILE_9054: ChipProfile = profile_9080_class!("Plx9054", 0x9054, EepromKind::Cs56);
pub static PROFILE_9056: ChipProfile = profile_9080_class!("Plx9056", 0x9056, EepromKind::Cs56);
pub static PROFILE_9080: ChipProfile = profile_9080_class!("Plx9080", 0x9080, EepromKind::Cs46);
pub static PROFILE_9656: ChipProfile = profile_9080_class!("Plx9656", 0x9656, EepromKind::Cs56);
pub static PROFILE_8311: ChipProfile = profile_9080_class!("Plx8311", 0x8311, EepromKind::Cs56);

static PROFILES: [&ChipProfile; 7] = [
    &PROFILE_9030,
    &PROFILE_9050,
    &PROFILE_9054,
    &PROFILE_9056,
    &PROFILE_9080,
    &PROFILE_9656,
    &PROFILE_8311,
];

impl ChipProfile {
    /// Looks up the profile for a known chip type.
    pub fn for_chip_type(chip_type: u16) -> Option<&'static ChipProfile> {
        PROFILES.iter().copied().find(|p| p.chip_type == chip_type)
    }

    /// Matches a probed function against the supported families.
    ///
    /// The 8311 embeds a 9056 core and reports the 9056 device ID with its
    /// own subsystem ID.
    pub fn match_device(vendor: u16, device: u16, sub_device: u16) -> Option<&'static ChipProfile> {
        if vendor != PLX_VENDOR_ID {
            return None;
        }

        if device == 0x9056 && sub_device == 0x8311 {
            return Some(&PROFILE_8311);
        }

        ChipProfile::for_chip_type(device)
    }
}

/// Capability object bound to one attached device.
#[derive(Clone, Copy)]
pub struct ChipOps {
    profile: &'static ChipProfile,
}

impl ChipOps {
    pub fn new(profile: &'static ChipProfile) -> Self {
        Self { profile }
    }

    pub fn profile(&self) -> &'static ChipProfile {
        self.profile
    }

    pub fn regs_map(&self) -> &'static RegMap {
        &self.profile.regs
    }

    pub fn dma_regs(&self) -> Option<&'static DmaRegs> {
        self.profile.regs.dma.as_ref()
    }

    // ---- chip identification ----

    /// Determines the chip type and revision from the hard-coded ID
    /// registers and stores them into the device key.
    ///
    /// The AA and AB steppings of the 9054 share a silicon revision ID; the
    /// local firmware reports the difference through the PCI revision field
    /// (0x0B means AB).
    pub fn chip_type_detect(&self, io: &ChipIo<'_>, key: &mut DeviceKey) {
        key.chip = self.profile.chip_type;
        key.chip_revision = key.revision;

        let (Some(id_offset), Some(rev_offset)) = (
            self.profile.regs.perm_vendor_id,
            self.profile.regs.perm_revision_id,
        ) else {
            return;
        };

        let hard_id = io.regs.read(id_offset);
        if (hard_id & 0xFFFF) as u16 != PLX_VENDOR_ID {
            return;
        }

        key.chip = (hard_id >> 16) as u16;

        let revision = io.regs.read(rev_offset);
        if revision == 0xA {
            let pci_rev = pci::cfg_read(io.host, io.loc, 0x08).unwrap_or(0);
            key.chip_revision = if (pci_rev & 0xFF) == 0x0B { 0xAB } else { 0xAA };
        } else if revision == 0xC {
            key.chip_revision = 0xAC;
        } else {
            key.chip_revision = revision as u8;
        }

        debug!(
            target: "plxcore::chip",
            "device {:04X}_{:04X} = {:04X} rev {:02X}",
            key.device, key.vendor, key.chip, key.chip_revision
        );
    }

    // ---- global interrupt gate ----

    /// Sets the master PCI interrupt enable bit.
    pub fn interrupts_enable(&self, io: &ChipIo<'_>) {
        synchronized_modify(
            io.isr_lock,
            io.regs,
            self.profile.regs.int_ctrl_stat,
            self.profile.intr.master_enable,
            0,
        );
    }

    /// Clears the master PCI interrupt enable bit.
    pub fn interrupts_disable(&self, io: &ChipIo<'_>) {
        synchronized_modify(
            io.isr_lock,
            io.regs,
            self.profile.regs.int_ctrl_stat,
            0,
            self.profile.intr.master_enable,
        );
    }

    // ---- per-source interrupt control ----

    /// Enables the interrupt sources selected by `spec`.
    pub fn intr_enable_sources(&self, io: &ChipIo<'_>, spec: &IntrSpec) {
        let intr = &self.profile.intr;
        let mut set_bits = 0u32;

        if spec.pci_main {
            set_bits |= intr.master_enable;
        }
        if spec.local_1 {
            set_bits |= intr.local_1.enable;
        }
        if spec.local_2 {
            if let Some(local_2) = intr.local_2 {
                set_bits |= local_2.enable;
            }
        }
        if spec.pci_abort {
            if let Some(abort) = intr.pci_abort {
                set_bits |= abort.enable;
            }
        }
        if spec.target_retry_abort {
            if let Some(retry) = intr.retry_abort_enable {
                set_bits |= retry;
            }
        }
        if spec.doorbell != 0 {
            if let Some(doorbell) = intr.doorbell {
                set_bits |= doorbell.enable;
            }
        }

        for channel in 0..2 {
            if spec.dma_done & (1 << channel) == 0 {
                continue;
            }
            let (Some(done), Some(dma)) = (intr.dma_done[channel], self.profile.regs.dma) else {
                continue;
            };

            set_bits |= done.enable;

            // The channel itself must have its done interrupt enabled and
            // routed to PCI for the INTCSR bit to matter.
            let mode = io.regs.read(dma.mode[channel]);
            io.regs.write(
                dma.mode[channel],
                mode | DMA_MODE_BIT_ROUTE_INT_PCI | DMA_MODE_BIT_DONE_INT,
            );
        }

        let mut qsr_clear = 0u32;
        if spec.mu_outbound_post {
            if let Some(mask_offset) = self.profile.regs.outpost_int_mask {
                io.regs.write(mask_offset, 0);
            }
        }
        if spec.mu_inbound_post {
            qsr_clear |= QSR_BIT_INPOST_INT_MASK;
        }
        if spec.mu_outbound_overflow {
            if let Some(overflow) = intr.mu_outbound_overflow_enable {
                set_bits |= overflow;
            }
            qsr_clear |= QSR_BIT_OUTFREE_OVERFLOW_MASK;
        }

        if set_bits != 0 {
            synchronized_modify(
                io.isr_lock,
                io.regs,
                self.profile.regs.int_ctrl_stat,
                set_bits,
                0,
            );
        }

        if qsr_clear != 0 {
            if let Some(qsr_offset) = self.profile.regs.fifo_ctrl_stat {
                let qsr = io.regs.read(qsr_offset);
                if qsr & qsr_clear != 0 {
                    io.regs.write(qsr_offset, qsr & !qsr_clear);
                }
            }
        }
    }

    /// Disables the interrupt sources selected by `spec`.
    pub fn intr_disable_sources(&self, io: &ChipIo<'_>, spec: &IntrSpec) {
        let intr = &self.profile.intr;
        let mut clear_bits = 0u32;

        if spec.pci_main {
            clear_bits |= intr.master_enable;
        }
        if spec.local_1 {
            clear_bits |= intr.local_1.enable;
        }
        if spec.local_2 {
            if let Some(local_2) = intr.local_2 {
                clear_bits |= local_2.enable;
            }
        }
        if spec.pci_abort {
            if let Some(abort) = intr.pci_abort {
                clear_bits |= abort.enable;
            }
        }
        if spec.target_retry_abort {
            if let Some(retry) = intr.retry_abort_enable {
                clear_bits |= retry;
            }
        }
        if spec.doorbell != 0 {
            if let Some(doorbell) = intr.doorbell {
                clear_bits |= doorbell.enable;
            }
        }

        for channel in 0..2 {
            if spec.dma_done & (1 << channel) == 0 {
                continue;
            }
            let (Some(done), Some(dma)) = (intr.dma_done[channel], self.profile.regs.dma) else {
                continue;
            };

            // Only take the INTCSR bit away if the channel interrupt is
            // routed to PCI; a local-routed channel is not ours to touch.
            let mode = io.regs.read(dma.mode[channel]);
            if mode & DMA_MODE_BIT_ROUTE_INT_PCI != 0 {
                clear_bits |= done.enable;
                io.regs.write(dma.mode[channel], mode & !DMA_MODE_BIT_DONE_INT);
            }
        }

        let mut qsr_set = 0u32;
        if spec.mu_outbound_post {
            if let Some(mask_offset) = self.profile.regs.outpost_int_mask {
                io.regs.write(mask_offset, OUTPOST_BIT_INT);
            }
        }
        if spec.mu_inbound_post {
            qsr_set |= QSR_BIT_INPOST_INT_MASK;
        }
        if spec.mu_outbound_overflow {
            qsr_set |= QSR_BIT_OUTFREE_OVERFLOW_MASK;
        }

        if clear_bits != 0 {
            synchronized_modify(
                io.isr_lock,
                io.regs,
                self.profile.regs.int_ctrl_stat,
                0,
                clear_bits,
            );
        }

        if qsr_set != 0 {
            if let Some(qsr_offset) = self.profile.regs.fifo_ctrl_stat {
                let qsr = io.regs.read(qsr_offset);
                if qsr | qsr_set != qsr {
                    io.regs.write(qsr_offset, qsr | qsr_set);
                }
            }
        }
    }

    // ---- interrupt cause handling ----

    /// Decodes the active, unmasked interrupt sources.
    ///
    /// `intcsr` is the interrupt control/status value the caller already
    /// read under the ISR lock. DMA done sources additionally require the
    /// channel's interrupt to be routed to PCI; the messaging unit outbound
    /// post interrupt lives in its own status/mask register pair.
    pub fn decode_cause(&self, regs: &DeviceRegs, intcsr: u32) -> IntrCause {
        let intr = &self.profile.intr;
        let mut cause = IntrCause::empty();

        if let Some(doorbell) = intr.doorbell {
            if intcsr & doorbell.active != 0 && intcsr & doorbell.enable != 0 {
                cause |= IntrCause::DOORBELL;
            }
        }

        if let Some(abort) = intr.pci_abort {
            if intcsr & abort.active != 0 && intcsr & abort.enable != 0 {
                cause |= IntrCause::PCI_ABORT;
            }
        }

        if intcsr & intr.local_1.active != 0 && intcsr & intr.local_1.enable != 0 {
            cause |= IntrCause::LOCAL_1;
        }

        if let Some(local_2) = intr.local_2 {
            if intcsr & local_2.active != 0 && intcsr & local_2.enable != 0 {
                cause |= IntrCause::LOCAL_2;
            }
        }

        for channel in 0..2 {
            let (Some(done), Some(dma)) = (intr.dma_done[channel], self.profile.regs.dma) else {
                continue;
            };

            if intcsr & done.active != 0 && intcsr & done.enable != 0 {
                let mode = regs.read(dma.mode[channel]);
                if mode & DMA_MODE_BIT_ROUTE_INT_PCI != 0 {
                    cause |= if channel == 0 {
                        IntrCause::DMA_0_DONE
                    } else {
                        IntrCause::DMA_1_DONE
                    };
                }
            }
        }

        if let (Some(stat_offset), Some(mask_offset)) = (
            self.profile.regs.outpost_int_stat,
            self.profile.regs.outpost_int_mask,
        ) {
            if regs.read(stat_offset) & OUTPOST_BIT_INT != 0
                && regs.read(mask_offset) & OUTPOST_BIT_INT == 0
            {
                cause |= IntrCause::MU_OUTBOUND_POST;
            }
        }

        cause
    }

    /// Translates a user notification spec into the cause mask and doorbell
    /// bitmap a wait object watches.
    pub fn intr_notify_flags(&self, spec: &IntrSpec) -> (IntrCause, u32) {
        let mut mask = IntrCause::empty();

        if spec.pci_abort {
            mask |= IntrCause::PCI_ABORT;
        }
        if spec.local_1 {
            mask |= IntrCause::LOCAL_1;
        }
        if spec.local_2 {
            mask |= IntrCause::LOCAL_2;
        }
        if spec.dma_done & (1 << 0) != 0 {
            mask |= IntrCause::DMA_0_DONE;
        }
        if spec.dma_done & (1 << 1) != 0 {
            mask |= IntrCause::DMA_1_DONE;
        }
        if spec.mu_outbound_post {
            mask |= IntrCause::MU_OUTBOUND_POST;
        }

        (mask, spec.doorbell)
    }

    /// Translates a triggered cause mask back into the user-facing spec.
    pub fn intr_status_flags(&self, cause: IntrCause, doorbell: u32) -> IntrSpec {
        let mut spec = IntrSpec::default();

        spec.pci_abort = cause.contains(IntrCause::PCI_ABORT);
        spec.local_1 = cause.contains(IntrCause::LOCAL_1);
        spec.local_2 = cause.contains(IntrCause::LOCAL_2);
        if cause.contains(IntrCause::DMA_0_DONE) {
            spec.dma_done |= 1 << 0;
        }
        if cause.contains(IntrCause::DMA_1_DONE) {
            spec.dma_done |= 1 << 1;
        }
        spec.mu_outbound_post = cause.contains(IntrCause::MU_OUTBOUND_POST);
        spec.doorbell = doorbell;

        spec
    }

    // ---- mailboxes ----

    /// Reads one of the eight mailbox registers.
    pub fn mailbox_read(&self, regs: &DeviceRegs, mailbox: u16) -> Result<u32, ApiStatus> {
        Ok(regs.read(self.mailbox_offset(mailbox)?))
    }

    /// Writes one of the eight mailbox registers.
    pub fn mailbox_write(&self, regs: &DeviceRegs, mailbox: u16, value: u32) -> CanFail<ApiStatus> {
        regs.write(self.mailbox_offset(mailbox)?, value);
        Ok(())
    }

    fn mailbox_offset(&self, mailbox: u16) -> Result<u16, ApiStatus> {
        if mailbox > 7 {
            return Err(ApiStatus::InvalidIndex);
        }

        // Mailboxes 0 and 1 sit in their own bank away from 2 through 7.
        let bank = if mailbox < 2 {
            self.profile.regs.mailbox_bank_low
        } else {
            self.profile.regs.mailbox_bank_high
        };

        bank.map(|base| base + mailbox * 4)
            .ok_or(ApiStatus::UnsupportedFunction)
    }

    // ---- BAR remap lookup ----

    /// Returns the remap register that pages the local window behind the
    /// given BAR, or `None` when the BAR has no remap.
    pub fn bar_remap_offset(&self, regs: &DeviceRegs, bar_index: u8) -> Option<u16> {
        let map = &self.profile.regs;

        if map.dma.is_none() {
            // 9050-class: BAR2 decodes local space 0, BAR3 local space 1.
            return match bar_index {
                2 => Some(map.space0_remap),
                3 => map.space1_remap,
                _ => None,
            };
        }

        // 9080-class. Space 0 can be shifted from BAR2 to BAR1 by the
        // endian descriptor, and enabling I2O decode moves space 1 to BAR0.
        let bars_shifted = regs.read(map.endian_desc) & 0x300 == 0x200;

        match bar_index {
            0 => {
                let qsr_offset = map.fifo_ctrl_stat?;
                if regs.read(qsr_offset) & QSR_BIT_I2O_DECODE != 0 {
                    map.space1_remap
                } else {
                    None
                }
            }
            1 if bars_shifted => Some(map.space0_remap),
            2 => {
                if bars_shifted {
                    map.space1_remap
                } else {
                    Some(map.space0_remap)
                }
            }
            3 => map.space1_remap,
            _ => None,
        }
    }

    // ---- EEPROM ----

    /// Reports whether the chip sees a valid EEPROM.
    pub fn eeprom_present(&self, regs: &DeviceRegs) -> bool {
        eeprom::present(regs, self.profile.regs.eeprom_ctrl)
    }

    /// Reads a 32-bit EEPROM word.
    ///
    /// The 9054 AA stepping has a broken EEPROM control register; on that
    /// stepping (and when the stepping cannot be identified) the access
    /// falls back to the VPD capability.
    pub fn eeprom_read_u32(&self, io: &ChipIo<'_>, offset: u16) -> Result<u32, ApiStatus> {
        if offset & 0x3 != 0 || offset > 0x200 {
            debug!(target: "plxcore::chip", "invalid EEPROM offset ({:#x})", offset);
            return Err(ApiStatus::InvalidOffset);
        }

        if self.use_vpd_for_eeprom(io) {
            if pci::capability_offset(io.host, io.loc, pci::CAP_ID_VPD) == 0 {
                return Err(ApiStatus::VpdNotSupported);
            }

            return vpd::read(io.host, io.loc, io.regs, self.profile.regs.eeprom_ctrl, offset)
                .map_err(|_| ApiStatus::Failed);
        }

        Ok(eeprom::read_u32(
            io.regs,
            self.profile.regs.eeprom_ctrl,
            self.profile.eeprom.kind,
            offset,
        ))
    }

    /// Writes a 32-bit EEPROM word, lifting the write-protect boundary for
    /// the duration of the access.
    pub fn eeprom_write_u32(&self, io: &ChipIo<'_>, offset: u16, value: u32) -> CanFail<ApiStatus> {
        if offset & 0x3 != 0 || offset > 0x200 {
            debug!(target: "plxcore::chip", "invalid EEPROM offset ({:#x})", offset);
            return Err(ApiStatus::InvalidOffset);
        }

        let endian_offset = self.profile.regs.endian_desc;
        let protect_save = io.regs.read(endian_offset);
        io.regs.write(endian_offset, protect_save & !(0xFF << 16));

        let result = if self.use_vpd_for_eeprom(io) {
            if pci::capability_offset(io.host, io.loc, pci::CAP_ID_VPD) == 0 {
                io.regs.write(endian_offset, protect_save);
                return Err(ApiStatus::VpdNotSupported);
            }

            vpd::write(
                io.host,
                io.loc,
                io.regs,
                self.profile.regs.eeprom_ctrl,
                offset,
                value,
            )
            .map_err(|_| ApiStatus::Failed)
        } else {
            eeprom::write_u32(
                io.regs,
                self.profile.regs.eeprom_ctrl,
                self.profile.eeprom.kind,
                offset,
                value,
                self.profile.eeprom.write_done_when_set,
            );
            Ok(())
        };

        io.regs.write(endian_offset, protect_save);

        result
    }

    /// The 9054 AA stepping must use VPD; AB and everything newer use the
    /// EEPROM control register. The stepping is read from the hard-coded
    /// revision register, disambiguated through the PCI revision ID.
    fn use_vpd_for_eeprom(&self, io: &ChipIo<'_>) -> bool {
        if self.profile.chip_type != 0x9054 {
            return false;
        }

        let Some(rev_offset) = self.profile.regs.perm_revision_id else {
            return false;
        };

        if io.regs.read(rev_offset) != 0xA {
            return false;
        }

        let pci_rev = pci::cfg_read(io.host, io.loc, 0x08).unwrap_or(0);
        (pci_rev & 0xFF) != 0x0B
    }

    // ---- board reset ----

    /// Resets the device through the chip's software reset feature.
    ///
    /// Registers that a reset wipes but the system depends on (command
    /// register aborts, I2O decode enable, interrupt line, hot-swap and
    /// power-management bits) are saved and restored around the reset, and
    /// the EEPROM is reloaded before the restore.
    pub fn board_reset(&self, io: &ChipIo<'_>) -> CanFail<ApiStatus> {
        let map = &self.profile.regs;

        // Clear any recorded PCI aborts (status bits 27 through 31).
        let command = pci::cfg_read(io.host, io.loc, 0x04)?;
        if command & (0xF8 << 24) != 0 {
            pci::cfg_write(io.host, io.loc, 0x04, command)?;
        }

        let i2o_enabled = map.fifo_ctrl_stat.is_some_and(|qsr_offset| {
            io.regs.read(qsr_offset) & QSR_BIT_I2O_DECODE != 0
        });

        let mut ctrl = io.regs.read(map.eeprom_ctrl);
        ctrl &= !(EE_BIT_SW_RESET | EE_BIT_RELOAD);
        let eeprom_present = ctrl & EE_BIT_PRESENT != 0;

        let interrupt_line = pci::cfg_read(io.host, io.loc, 0x3C)?;

        let hot_swap_offset = pci::capability_offset(io.host, io.loc, pci::CAP_ID_HOT_SWAP);
        let pm_offset = pci::capability_offset(io.host, io.loc, pci::CAP_ID_POWER_MGMT);

        let mut hot_swap_save = 0;
        let mut pm_save = 0;
        if eeprom_present {
            if hot_swap_offset != 0 {
                hot_swap_save = pci::cfg_read(io.host, io.loc, hot_swap_offset)?;
            }
            if pm_offset != 0 {
                pm_save = pci::cfg_read(io.host, io.loc, pm_offset + 4)?;
            }
        }

        // Hold the chip in software reset, then bring it back out.
        io.regs.write(map.eeprom_ctrl, ctrl | EE_BIT_SW_RESET);
        std::thread::sleep(std::time::Duration::from_millis(100));
        io.regs.write(map.eeprom_ctrl, ctrl);

        // Reload the EEPROM in case it is now programmed.
        io.regs.write(map.eeprom_ctrl, ctrl | EE_BIT_RELOAD);
        std::thread::sleep(std::time::Duration::from_millis(10));
        io.regs.write(map.eeprom_ctrl, ctrl);

        if i2o_enabled {
            if let Some(qsr_offset) = map.fifo_ctrl_stat {
                let qsr = io.regs.read(qsr_offset);
                io.regs.write(qsr_offset, qsr | QSR_BIT_I2O_DECODE);
            }
        }

        pci::cfg_write(io.host, io.loc, 0x3C, interrupt_line)?;

        if eeprom_present {
            if hot_swap_offset != 0 {
                // Do not write back the write-one-to-clear event bits.
                hot_swap_save &= !((1 << 23) | (1 << 22) | (1 << 17));
                pci::cfg_write(io.host, io.loc, hot_swap_offset, hot_swap_save)?;
            }
            if pm_offset != 0 {
                pm_save &= !(1 << 15);
                pci::cfg_write(io.host, io.loc, pm_offset + 4, pm_save)?;
            }
        }

        Ok(())
    }
}
