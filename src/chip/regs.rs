//! Per-family register layout tables.
//!
//! The 9080-class parts (9080/9054/9056/9656/8311) share one runtime
//! register map; the 9050-class parts (9050/9030) expose a much smaller one
//! with no doorbells, no messaging unit and no DMA engine. Everything the
//! rest of the driver needs to know about a family is collected here so that
//! no other module hard-codes an offset.

/// Runtime register offsets of one chip family.
///
/// `None` means the family does not implement the register.
#[derive(Debug, Clone, Copy)]
pub struct RegMap {
    /// Interrupt control/status (`INTCSR`).
    pub int_ctrl_stat: u16,

    /// Serial EEPROM control (`CNTRL` on 9080-class parts).
    pub eeprom_ctrl: u16,

    /// Endian descriptor / EEPROM write-protect boundary.
    pub endian_desc: u16,

    /// Hard-coded vendor/chip ID, used for chip type detection.
    pub perm_vendor_id: Option<u16>,

    /// Hard-coded silicon revision.
    pub perm_revision_id: Option<u16>,

    /// Doorbell raised by the local side toward PCI.
    pub pci_doorbell: Option<u16>,

    /// Doorbell raised by the PCI side toward the local bus.
    pub local_doorbell: Option<u16>,

    /// Messaging unit outbound-post interrupt status.
    pub outpost_int_stat: Option<u16>,

    /// Messaging unit outbound-post interrupt mask.
    pub outpost_int_mask: Option<u16>,

    /// Queue status/control (`QSR`), holds the I2O decode enable bit.
    pub fifo_ctrl_stat: Option<u16>,

    /// Register bank of mailboxes 0 and 1.
    pub mailbox_bank_low: Option<u16>,

    /// Register bank of mailboxes 2 through 7.
    pub mailbox_bank_high: Option<u16>,

    /// Local address space 0 remap.
    pub space0_remap: u16,

    /// Local address space 1 remap.
    pub space1_remap: Option<u16>,

    /// Expansion ROM remap.
    pub exp_rom_remap: u16,

    /// DMA block, absent on 9050-class parts.
    pub dma: Option<DmaRegs>,

    /// Highest valid register offset (exclusive).
    pub max_offset: u16,
}

/// DMA register block of a 9080-class part.
///
/// Each channel owns five consecutive registers starting at its mode
/// register; both channels share the command/status register, with channel 1
/// fields shifted up by eight bits.
#[derive(Debug, Clone, Copy)]
pub struct DmaRegs {
    pub mode: [u16; 2],
    pub command_stat: u16,
    pub pci_dac: [u16; 2],
}

impl DmaRegs {
    pub fn pci_addr(&self, channel: usize) -> u16 {
        self.mode[channel] + 0x4
    }

    pub fn local_addr(&self, channel: usize) -> u16 {
        self.mode[channel] + 0x8
    }

    pub fn transfer_count(&self, channel: usize) -> u16 {
        self.mode[channel] + 0xC
    }

    pub fn descriptor_ptr(&self, channel: usize) -> u16 {
        self.mode[channel] + 0x10
    }
}

/// Interrupt source bit positions inside `INTCSR` for one family.
#[derive(Debug, Clone, Copy)]
pub struct IntrBits {
    /// Master PCI interrupt enable.
    pub master_enable: u32,

    /// Doorbell interrupt enable/active pair.
    pub doorbell: Option<SrcBits>,

    /// PCI abort (master/target abort) enable/active pair.
    pub pci_abort: Option<SrcBits>,

    /// Local interrupt 1 (`LINTi1`).
    pub local_1: SrcBits,

    /// Local interrupt 2 (`LINTi2`), 9050-class only.
    pub local_2: Option<SrcBits>,

    /// Target retry abort enable (no separate active bit is decoded).
    pub retry_abort_enable: Option<u32>,

    /// Per-channel DMA done enable/active pairs.
    pub dma_done: [Option<SrcBits>; 2],

    /// Messaging unit outbound overflow enable.
    pub mu_outbound_overflow_enable: Option<u32>,
}

/// Enable/active mask pair of one interrupt source.
#[derive(Debug, Clone, Copy)]
pub struct SrcBits {
    pub enable: u32,
    pub active: u32,
}

/// Register map shared by the 9080-class bridges.
pub const REGS_9080_CLASS: RegMap = RegMap {
    int_ctrl_stat: 0x68,
    eeprom_ctrl: 0x6C,
    endian_desc: 0x0C,
    perm_vendor_id: Some(0x70),
    perm_revision_id: Some(0x74),
    pci_doorbell: Some(0x64),
    local_doorbell: Some(0x60),
    outpost_int_stat: Some(0x30),
    outpost_int_mask: Some(0x34),
    fifo_ctrl_stat: Some(0xE8),
    mailbox_bank_low: Some(0x78),
    mailbox_bank_high: Some(0x40),
    space0_remap: 0x04,
    space1_remap: Some(0xF4),
    exp_rom_remap: 0x14,
    dma: Some(DmaRegs {
        mode: [0x80, 0x94],
        command_stat: 0xA8,
        pci_dac: [0xB4, 0xB8],
    }),
    max_offset: 0x100,
};

/// Register map shared by the 9050-class bridges.
pub const REGS_9050_CLASS: RegMap = RegMap {
    int_ctrl_stat: 0x4C,
    eeprom_ctrl: 0x50,
    endian_desc: 0x0C,
    perm_vendor_id: None,
    perm_revision_id: None,
    pci_doorbell: None,
    local_doorbell: None,
    outpost_int_stat: None,
    outpost_int_mask: None,
    fifo_ctrl_stat: None,
    mailbox_bank_low: None,
    mailbox_bank_high: None,
    space0_remap: 0x14,
    space1_remap: Some(0x18),
    exp_rom_remap: 0x28,
    dma: None,
    max_offset: 0x54,
};

/// `INTCSR` layout of the 9080-class bridges.
pub const INTR_9080_CLASS: IntrBits = IntrBits {
    master_enable: 1 << 8,
    doorbell: Some(SrcBits {
        enable: 1 << 9,
        active: 1 << 13,
    }),
    pci_abort: Some(SrcBits {
        enable: 1 << 10,
        active: 1 << 14,
    }),
    local_1: SrcBits {
        enable: 1 << 11,
        active: 1 << 15,
    },
    local_2: None,
    retry_abort_enable: Some(1 << 12),
    dma_done: [
        Some(SrcBits {
            enable: 1 << 18,
            active: 1 << 21,
        }),
        Some(SrcBits {
            enable: 1 << 19,
            active: 1 << 22,
        }),
    ],
    mu_outbound_overflow_enable: Some(1 << 1),
};

/// `INTCSR` layout of the 9050-class bridges.
pub const INTR_9050_CLASS: IntrBits = IntrBits {
    master_enable: 1 << 6,
    doorbell: None,
    pci_abort: None,
    local_1: SrcBits {
        enable: 1 << 0,
        active: 1 << 2,
    },
    local_2: Some(SrcBits {
        enable: 1 << 3,
        active: 1 << 5,
    }),
    retry_abort_enable: None,
    dma_done: [None, None],
    mu_outbound_overflow_enable: None,
};

// Bit positions inside the EEPROM control register (9000-family `CNTRL`).

/// EEPROM clock.
pub const EE_BIT_CLOCK: u32 = 1 << 24;
/// EEPROM chip select.
pub const EE_BIT_CHIP_SELECT: u32 = 1 << 25;
/// EEPROM write data output.
pub const EE_BIT_WRITE_DATA: u32 = 1 << 26;
/// EEPROM read data input.
pub const EE_BIT_READ_DATA: u32 = 1 << 27;
/// EEPROM present/valid status.
pub const EE_BIT_PRESENT: u32 = 1 << 28;
/// EEPROM reload from device.
pub const EE_BIT_RELOAD: u32 = 1 << 29;
/// Software reset of the chip.
pub const EE_BIT_SW_RESET: u32 = 1 << 30;
/// `EEDO` input enable, reserved on older parts.
pub const EE_BIT_EEDO_INPUT: u32 = 1 << 31;

/// All four bit-bang lines of the EEPROM interface.
pub const EE_BITS_ALL_LINES: u32 = 0xF << 24;

// Bit positions inside the per-channel DMA mode register.

/// Chaining (scatter-gather) enable.
pub const DMA_MODE_BIT_SGL: u32 = 1 << 9;
/// Done-interrupt enable.
pub const DMA_MODE_BIT_DONE_INT: u32 = 1 << 10;
/// Constant local address.
pub const DMA_MODE_BIT_CONST_LOCAL: u32 = 1 << 11;
/// Route the channel interrupt to PCI instead of the local bus.
pub const DMA_MODE_BIT_ROUTE_INT_PCI: u32 = 1 << 17;
/// Dual-address cycle (64-bit PCI addressing).
pub const DMA_MODE_BIT_DUAL_ADDR: u32 = 1 << 18;

// Bit positions inside the shared DMA command/status register, channel 0.
// Channel 1 uses the same layout shifted up by eight bits.

pub const DMA_CSR_BIT_ENABLE: u32 = 1 << 0;
pub const DMA_CSR_BIT_START: u32 = 1 << 1;
pub const DMA_CSR_BIT_ABORT: u32 = 1 << 2;
pub const DMA_CSR_BIT_CLEAR_INT: u32 = 1 << 3;
pub const DMA_CSR_BIT_DONE: u32 = 1 << 4;

/// Shift of the command/status nibble of `channel`.
pub fn dma_csr_shift(channel: usize) -> u32 {
    (channel as u32) * 8
}

// Bit positions inside the descriptor-pointer register and the `next`
// descriptor word.

/// Descriptors are located in PCI (host) memory.
pub const DMA_DESC_BIT_IN_PCI_SPACE: u32 = 1 << 0;
/// End of chain.
pub const DMA_DESC_BIT_END_OF_CHAIN: u32 = 1 << 1;
/// Raise an interrupt after the terminal count of this descriptor.
pub const DMA_DESC_BIT_TERM_INT: u32 = 1 << 2;
/// Direction of transfer: local to PCI when set.
pub const DMA_DESC_BIT_LOCAL_TO_PCI: u32 = 1 << 3;

/// I2O decode enable inside the queue status/control register.
pub const QSR_BIT_I2O_DECODE: u32 = 1 << 0;
/// Inbound-post queue interrupt mask inside the queue status register.
pub const QSR_BIT_INPOST_INT_MASK: u32 = 1 << 4;
/// Outbound-free queue overflow interrupt mask.
pub const QSR_BIT_OUTFREE_OVERFLOW_MASK: u32 = 1 << 6;

/// Outbound-post queue interrupt bit inside its status/mask registers.
pub const OUTPOST_BIT_INT: u32 = 1 << 3;
