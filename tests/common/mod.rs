//! Test host: a simulated 9054-class bridge behind the `HostApi` seam.
//!
//! The model implements enough of the chip for the driver paths under test
//! to run end-to-end: the runtime register file with its side effects, the
//! bit-banged serial EEPROM, the VPD engine, a local-bus memory behind the
//! remappable BAR 2 window, and a DMA engine that executes block and
//! chained transfers against the simulated host RAM and raises the done
//! interrupt through the registered handler.

#![allow(dead_code)]

use std::collections::{HashMap, HashSet};
use std::sync::atomic::{AtomicBool, Ordering};
use std::sync::{Arc, Mutex, Weak};

use plxcore::hal::{
    AccessWidth, BarResource, CoherentBuffer, DmaDirection, HostApi, IrqHandle, IrqHandler,
    MmioSpace, PageHandle, PciLocation,
};
use plxcore::status::ApiStatus;
use plxcore::Driver;

pub const PAGE_SIZE: u32 = 0x1000;

/// Base bus address of the simulated system RAM pool.
pub const RAM_BASE: u64 = 0x0010_0000;
/// Size of the RAM pool.
pub const RAM_SIZE: usize = 8 << 20;
/// Base of simulated user virtual addresses.
pub const USER_BASE: u64 = 0x7000_0000;

/// BAR 0 (register window) base of chip `i`.
pub fn bar0_base(index: usize) -> u64 {
    0xF000_0000 + (index as u64) * 0x10_0000
}

/// BAR 2 (local window) base of chip `i`.
pub fn bar2_base(index: usize) -> u64 {
    bar0_base(index) + 0x1000
}

pub const BAR0_SIZE: u64 = 0x200;
pub const BAR1_IO_SIZE: u64 = 0x100;
pub const BAR2_SIZE: u64 = 0x800;
pub const LOCAL_MEM_SIZE: usize = 1 << 20;

// Register dword indices (offset / 4).
const REG_SPACE0_REMAP: usize = 0x04 / 4;
const REG_ENDIAN: usize = 0x0C / 4;
const REG_OUTPOST_STAT: usize = 0x30 / 4;
const REG_OUTPOST_MASK: usize = 0x34 / 4;
const REG_LOCAL_DOORBELL: usize = 0x60 / 4;
const REG_PCI_DOORBELL: usize = 0x64 / 4;
const REG_INTCSR: usize = 0x68 / 4;
const REG_CNTRL: usize = 0x6C / 4;
const REG_PERM_ID: usize = 0x70 / 4;
const REG_PERM_REV: usize = 0x74 / 4;
const REG_DMA_MODE: [usize; 2] = [0x80 / 4, 0x94 / 4];
const REG_DMA_PCI: [usize; 2] = [0x84 / 4, 0x98 / 4];
const REG_DMA_LOCAL: [usize; 2] = [0x88 / 4, 0x9C / 4];
const REG_DMA_COUNT: [usize; 2] = [0x8C / 4, 0xA0 / 4];
const REG_DMA_DESC: [usize; 2] = [0x90 / 4, 0xA4 / 4];
const REG_DMA_CSR: usize = 0xA8 / 4;
const REG_SPACE1_REMAP: usize = 0xF4 / 4;

// INTCSR bits (9054 layout).
pub const INTCSR_MASTER: u32 = 1 << 8;
pub const INTCSR_DB_ENABLE: u32 = 1 << 9;
pub const INTCSR_ABORT_ENABLE: u32 = 1 << 10;
pub const INTCSR_LOCAL1_ENABLE: u32 = 1 << 11;
pub const INTCSR_DB_ACTIVE: u32 = 1 << 13;
pub const INTCSR_ABORT_ACTIVE: u32 = 1 << 14;
pub const INTCSR_LOCAL1_ACTIVE: u32 = 1 << 15;
pub const INTCSR_DMA_ENABLE: [u32; 2] = [1 << 18, 1 << 19];
pub const INTCSR_DMA_ACTIVE: [u32; 2] = [1 << 21, 1 << 22];

// DMA CSR bits, channel 0 positions.
const CSR_ENABLE: u32 = 1 << 0;
const CSR_START: u32 = 1 << 1;
const CSR_ABORT: u32 = 1 << 2;
const CSR_CLEAR_INT: u32 = 1 << 3;
const CSR_DONE: u32 = 1 << 4;

// DMA mode bits.
const MODE_SGL: u32 = 1 << 9;
const MODE_DONE_INT: u32 = 1 << 10;
const MODE_ROUTE_PCI: u32 = 1 << 17;

// CNTRL (EEPROM control) bits.
const EE_CLOCK: u32 = 1 << 24;
const EE_CS: u32 = 1 << 25;
const EE_DI: u32 = 1 << 26;
const EE_DO: u32 = 1 << 27;
const EE_PRESENT: u32 = 1 << 28;

/// Simulated system RAM.
pub struct Ram {
    bytes: Mutex<Vec<u8>>,
}

impl Ram {
    fn new() -> Arc<Self> {
        Arc::new(Self {
            bytes: Mutex::new(vec![0; RAM_SIZE]),
        })
    }

    pub fn read(&self, offset: u64, buf: &mut [u8]) {
        let bytes = self.bytes.lock().unwrap();
        let offset = offset as usize;
        buf.copy_from_slice(&bytes[offset..offset + buf.len()]);
    }

    pub fn write(&self, offset: u64, data: &[u8]) {
        let mut bytes = self.bytes.lock().unwrap();
        let offset = offset as usize;
        bytes[offset..offset + data.len()].copy_from_slice(data);
    }

    pub fn read_u32_le(&self, offset: u64) -> u32 {
        let mut raw = [0u8; 4];
        self.read(offset, &mut raw);
        u32::from_le_bytes(raw)
    }
}

/// A window onto the RAM pool, handed out as a coherent buffer mapping.
struct RamWindow {
    ram: Arc<Ram>,
    base: u64,
    len: u64,
}

impl MmioSpace for RamWindow {
    fn read8(&self, offset: u64) -> u8 {
        let mut raw = [0u8; 1];
        self.ram.read(self.base + offset, &mut raw);
        raw[0]
    }

    fn read16(&self, offset: u64) -> u16 {
        let mut raw = [0u8; 2];
        self.ram.read(self.base + offset, &mut raw);
        u16::from_le_bytes(raw)
    }

    fn read32(&self, offset: u64) -> u32 {
        let mut raw = [0u8; 4];
        self.ram.read(self.base + offset, &mut raw);
        u32::from_le_bytes(raw)
    }

    fn write8(&self, offset: u64, value: u8) {
        self.ram.write(self.base + offset, &[value]);
    }

    fn write16(&self, offset: u64, value: u16) {
        self.ram.write(self.base + offset, &value.to_le_bytes());
    }

    fn write32(&self, offset: u64, value: u32) {
        self.ram.write(self.base + offset, &value.to_le_bytes());
    }

    fn len(&self) -> u64 {
        self.len
    }
}

/// Serial EEPROM model (93CS56-style, 256 sixteen-bit words).
struct EepromModel {
    words: [u16; 256],
    cs: bool,
    clock: bool,
    shift: u32,
    bits: u8,
    mode: EepromMode,
    write_enabled: bool,
    dout: bool,
}

enum EepromMode {
    Command,
    Read { addr: usize, bit: usize },
    WriteData { addr: usize, collected: u8, value: u16 },
    Idle,
}

const EE_CMD_BITS: u8 = 11;

impl EepromModel {
    fn new() -> Self {
        Self {
            words: [0; 256],
            cs: false,
            clock: false,
            shift: 0,
            bits: 0,
            mode: EepromMode::Idle,
            write_enabled: false,
            dout: true,
        }
    }

    /// Handles a write of the EEPROM control register.
    fn on_ctrl_write(&mut self, value: u32) {
        let cs = value & EE_CS != 0;
        let clock = value & EE_CLOCK != 0;
        let di = value & EE_DI != 0;

        if cs != self.cs {
            // Chip-select edge resets the instruction shifter.
            self.shift = 0;
            self.bits = 0;
            if !cs {
                self.mode = EepromMode::Idle;
                self.dout = true;
            } else {
                self.mode = EepromMode::Command;
            }
            self.cs = cs;
        }

        if clock && !self.clock && self.cs {
            self.on_clock_rise(di);
        }
        self.clock = clock;
    }

    fn on_clock_rise(&mut self, di: bool) {
        match &mut self.mode {
            EepromMode::Command => {
                self.shift = (self.shift << 1) | u32::from(di);
                self.bits += 1;

                if self.bits == EE_CMD_BITS {
                    self.decode_command();
                }
            }
            EepromMode::Read { addr, bit } => {
                let word = self.words[(*addr + *bit / 16) & 0xFF];
                self.dout = word & (1 << (15 - (*bit % 16))) != 0;
                *bit += 1;
            }
            EepromMode::WriteData {
                addr,
                collected,
                value,
            } => {
                *value = (*value << 1) | u16::from(di);
                *collected += 1;

                if *collected == 16 {
                    let addr = *addr;
                    let value = *value;
                    if self.write_enabled {
                        self.words[addr & 0xFF] = value;
                    }
                    self.mode = EepromMode::Idle;
                    self.dout = true;
                }
            }
            EepromMode::Idle => {}
        }
    }

    fn decode_command(&mut self) {
        let start = (self.shift >> (EE_CMD_BITS - 1)) & 1;
        let opcode = (self.shift >> (EE_CMD_BITS - 3)) & 0b11;
        let addr = (self.shift & 0xFF) as usize;

        self.shift = 0;
        self.bits = 0;

        if start == 0 {
            self.mode = EepromMode::Idle;
            return;
        }

        match opcode {
            0b10 => self.mode = EepromMode::Read { addr, bit: 0 },
            0b01 => {
                self.mode = EepromMode::WriteData {
                    addr,
                    collected: 0,
                    value: 0,
                }
            }
            0b00 => {
                // Top two address bits select write-enable vs disable.
                match addr >> 6 {
                    0b11 => self.write_enabled = true,
                    0b00 => self.write_enabled = false,
                    _ => {}
                }
                self.mode = EepromMode::Idle;
            }
            _ => self.mode = EepromMode::Idle,
        }
    }

    /// 32-bit view used by the VPD engine, composed the way the driver
    /// composes EEPROM words.
    fn read_u32(&self, offset: u16) -> u32 {
        let addr = usize::from(offset / 2) & 0xFF;
        (u32::from(self.words[addr]) << 16) | u32::from(self.words[(addr + 1) & 0xFF])
    }

    fn write_u32(&mut self, offset: u16, value: u32) {
        let addr = usize::from(offset / 2) & 0xFF;
        self.words[addr] = (value >> 16) as u16;
        self.words[(addr + 1) & 0xFF] = value as u16;
    }
}

struct ChipRegs {
    r: [u32; 64],
    /// Per-channel "transfer accepted but not yet finished".
    active: [bool; 2],
}

/// One simulated bridge chip.
pub struct ChipModel {
    pub loc: PciLocation,
    pub irq_line: u8,
    index: usize,
    regs: Mutex<ChipRegs>,
    eeprom: Mutex<EepromModel>,
    cfg: Mutex<[u32; 64]>,
    local_mem: Mutex<Vec<u8>>,
    ram: Arc<Ram>,
    host: Weak<TestHost>,

    /// Hold started transfers in flight instead of completing them
    /// immediately.
    pub dma_hold: AtomicBool,

    /// All register reads return all-ones, as a device in D3 does.
    pub low_power: AtomicBool,
}

impl ChipModel {
    fn new(
        loc: PciLocation,
        irq_line: u8,
        index: usize,
        ram: Arc<Ram>,
        host: Weak<TestHost>,
    ) -> Arc<Self> {
        let mut regs = ChipRegs {
            r: [0; 64],
            active: [false, false],
        };

        // Idle channels report done.
        regs.r[REG_DMA_CSR] = CSR_DONE | (CSR_DONE << 8);
        // Hard-coded identity.
        regs.r[REG_PERM_ID] = (0x9054 << 16) | 0x10B5;
        regs.r[REG_PERM_REV] = 0xC;

        let mut cfg = [0u32; 64];
        cfg[0x00] = (0x9054 << 16) | 0x10B5;
        // Capability list present.
        cfg[0x01] = 1 << (16 + 4);
        cfg[0x02] = 0x0680_000C;
        cfg[0x2C / 4] = (0x9054 << 16) | 0x10B5;
        cfg[0x34 / 4] = 0x40;
        cfg[0x3C / 4] = u32::from(irq_line);
        // PM -> HotSwap -> VPD capability chain.
        cfg[0x40 / 4] = (0x48 << 8) | 0x01;
        cfg[0x48 / 4] = (0x4C << 8) | 0x06;
        cfg[0x4C / 4] = 0x03;

        Arc::new(Self {
            loc,
            irq_line,
            index,
            regs: Mutex::new(regs),
            eeprom: Mutex::new(EepromModel::new()),
            cfg: Mutex::new(cfg),
            local_mem: Mutex::new(vec![0; LOCAL_MEM_SIZE]),
            ram,
            host,
            dma_hold: AtomicBool::new(false),
            low_power: AtomicBool::new(false),
        })
    }

    pub fn reg_read(&self, offset: u64) -> u32 {
        if self.low_power.load(Ordering::SeqCst) {
            return u32::MAX;
        }

        let index = (offset as usize) / 4;

        if index == REG_CNTRL {
            let regs = self.regs.lock().unwrap();
            let eeprom = self.eeprom.lock().unwrap();
            let mut value = regs.r[REG_CNTRL] & !(EE_DO | EE_PRESENT);
            value |= EE_PRESENT;
            if eeprom.dout {
                value |= EE_DO;
            }
            return value;
        }

        self.regs.lock().unwrap().r.get(index).copied().unwrap_or(0)
    }

    pub fn reg_write(&self, offset: u64, value: u32) {
        if self.low_power.load(Ordering::SeqCst) {
            return;
        }

        let index = (offset as usize) / 4;

        match index {
            REG_CNTRL => {
                {
                    let mut regs = self.regs.lock().unwrap();
                    regs.r[REG_CNTRL] = value & !(EE_DO | EE_PRESENT);
                }
                self.eeprom.lock().unwrap().on_ctrl_write(value);
            }
            REG_PCI_DOORBELL => {
                // Write-one-to-clear.
                let mut regs = self.regs.lock().unwrap();
                regs.r[REG_PCI_DOORBELL] &= !value;
                if regs.r[REG_PCI_DOORBELL] == 0 {
                    regs.r[REG_INTCSR] &= !INTCSR_DB_ACTIVE;
                }
            }
            REG_DMA_CSR => {
                let mut start = [false, false];
                let mut abort = [false, false];

                {
                    let mut regs = self.regs.lock().unwrap();

                    for channel in 0..2 {
                        let shift = channel * 8;

                        if value & (CSR_CLEAR_INT << shift) != 0 {
                            regs.r[REG_INTCSR] &= !INTCSR_DMA_ACTIVE[channel];
                        }

                        let enable = value & (CSR_ENABLE << shift) != 0;
                        let done_now = regs.r[REG_DMA_CSR] & (CSR_DONE << shift) != 0;

                        if enable && value & (CSR_START << shift) != 0 {
                            start[channel] = true;
                        }

                        if value & (CSR_ABORT << shift) != 0 && regs.active[channel] {
                            abort[channel] = true;
                        }

                        // Stored image: enable bit as written, done bit as
                        // internal status (cleared by a start).
                        let mut stored = regs.r[REG_DMA_CSR];
                        if enable {
                            stored |= CSR_ENABLE << shift;
                        } else {
                            stored &= !(CSR_ENABLE << shift);
                        }
                        if start[channel] {
                            stored &= !(CSR_DONE << shift);
                        } else if done_now {
                            stored |= CSR_DONE << shift;
                        }
                        regs.r[REG_DMA_CSR] = stored;

                        if start[channel] {
                            regs.active[channel] = true;
                        }
                    }
                }

                for channel in 0..2 {
                    if start[channel] && !self.dma_hold.load(Ordering::SeqCst) {
                        self.complete_dma(channel, true);
                    }
                    if abort[channel] {
                        // An abort terminates without transferring and
                        // raises the done interrupt.
                        self.complete_dma(channel, false);
                    }
                }
            }
            _ => {
                if let Some(slot) = self.regs.lock().unwrap().r.get_mut(index) {
                    *slot = value;
                }
            }
        }
    }

    /// Finishes the in-flight transfer of `channel`, moving data unless the
    /// finish is an abort.
    pub fn complete_dma(&self, channel: usize, do_transfer: bool) {
        let (mode, desc_ptr, pci, local, count) = {
            let regs = self.regs.lock().unwrap();
            (
                regs.r[REG_DMA_MODE[channel]],
                regs.r[REG_DMA_DESC[channel]],
                regs.r[REG_DMA_PCI[channel]],
                regs.r[REG_DMA_LOCAL[channel]],
                regs.r[REG_DMA_COUNT[channel]],
            )
        };

        if do_transfer {
            if mode & MODE_SGL != 0 {
                self.run_chain(desc_ptr & !0xF);
            } else {
                let local_to_pci = desc_ptr & (1 << 3) != 0;
                self.copy_block(pci, local, count, local_to_pci);
            }
        }

        let raise = {
            let mut regs = self.regs.lock().unwrap();
            let shift = channel * 8;

            regs.r[REG_DMA_CSR] |= CSR_DONE << shift;
            regs.active[channel] = false;

            if mode & MODE_DONE_INT != 0 && mode & MODE_ROUTE_PCI != 0 {
                regs.r[REG_INTCSR] |= INTCSR_DMA_ACTIVE[channel];
                true
            } else {
                false
            }
        };

        if raise {
            self.raise_irq();
        }
    }

    fn run_chain(&self, mut desc_addr: u32) {
        // Bounded walk so a corrupt chain cannot hang the test.
        for _ in 0..4096 {
            let base = u64::from(desc_addr) - RAM_BASE;
            let pci = self.ram.read_u32_le(base);
            let local = self.ram.read_u32_le(base + 4);
            let count = self.ram.read_u32_le(base + 8);
            let next = self.ram.read_u32_le(base + 12);

            let local_to_pci = next & (1 << 3) != 0;
            self.copy_block(pci, local, count, local_to_pci);

            if next & (1 << 1) != 0 {
                break;
            }

            desc_addr = next & !0xF;
        }
    }

    fn copy_block(&self, pci_addr: u32, local_addr: u32, count: u32, local_to_pci: bool) {
        let mut chunk = vec![0u8; count as usize];
        let ram_offset = u64::from(pci_addr) - RAM_BASE;
        let local = local_addr as usize;

        if local_to_pci {
            let local_mem = self.local_mem.lock().unwrap();
            chunk.copy_from_slice(&local_mem[local..local + count as usize]);
            drop(local_mem);
            self.ram.write(ram_offset, &chunk);
        } else {
            self.ram.read(ram_offset, &mut chunk);
            let mut local_mem = self.local_mem.lock().unwrap();
            local_mem[local..local + count as usize].copy_from_slice(&chunk);
        }
    }

    /// Raises the chip's interrupt line.
    pub fn raise_irq(&self) {
        if let Some(host) = self.host.upgrade() {
            host.trigger_irq(self.irq_line);
        }
    }

    /// The local side rings its doorbell toward PCI.
    pub fn ring_doorbell(&self, bits: u32) {
        {
            let mut regs = self.regs.lock().unwrap();
            regs.r[REG_PCI_DOORBELL] |= bits;
            regs.r[REG_INTCSR] |= INTCSR_DB_ACTIVE;
        }
        self.raise_irq();
    }

    /// Asserts the local LINTi1 interrupt.
    pub fn assert_local_interrupt(&self) {
        {
            let mut regs = self.regs.lock().unwrap();
            regs.r[REG_INTCSR] |= INTCSR_LOCAL1_ACTIVE;
        }
        self.raise_irq();
    }

    pub fn intcsr(&self) -> u32 {
        self.regs.lock().unwrap().r[REG_INTCSR]
    }

    pub fn raw_reg(&self, offset: u64) -> u32 {
        self.regs.lock().unwrap().r[(offset as usize) / 4]
    }

    pub fn local_read(&self, addr: usize, len: usize) -> Vec<u8> {
        self.local_mem.lock().unwrap()[addr..addr + len].to_vec()
    }

    pub fn local_write(&self, addr: usize, data: &[u8]) {
        self.local_mem.lock().unwrap()[addr..addr + data.len()].copy_from_slice(data);
    }

    pub fn local_fill(&self, addr: usize, len: usize, value: u8) {
        self.local_mem.lock().unwrap()[addr..addr + len].fill(value);
    }

    pub fn eeprom_word(&self, index: usize) -> u16 {
        self.eeprom.lock().unwrap().words[index]
    }

    pub fn set_eeprom_word(&self, index: usize, value: u16) {
        self.eeprom.lock().unwrap().words[index] = value;
    }

    fn cfg_read(&self, offset: u16) -> u32 {
        let index = usize::from(offset) / 4;
        self.cfg.lock().unwrap().get(index).copied().unwrap_or(!0)
    }

    fn cfg_write(&self, offset: u16, value: u32) {
        let index = usize::from(offset) / 4;

        // VPD command register: execute the access immediately.
        if offset == 0x4C {
            let byte_offset = ((value >> 16) & 0x7FFF) as u16;
            let mut cfg = self.cfg.lock().unwrap();
            let mut eeprom = self.eeprom.lock().unwrap();

            if value & (1 << 31) != 0 {
                // Write request: program from the data register, clear the
                // flag on completion.
                let data = cfg[0x50 / 4];
                eeprom.write_u32(byte_offset, data);
                cfg[0x4C / 4] = value & !(1 << 31);
            } else {
                // Read request: present the data, set the flag.
                cfg[0x50 / 4] = eeprom.read_u32(byte_offset);
                cfg[0x4C / 4] = value | (1 << 31);
            }
            return;
        }

        if let Some(slot) = self.cfg.lock().unwrap().get_mut(index) {
            *slot = value;
        }
    }
}

/// BAR 0 of a chip: the runtime register window.
struct Bar0Space {
    chip: Arc<ChipModel>,
}

impl MmioSpace for Bar0Space {
    fn read8(&self, offset: u64) -> u8 {
        (self.chip.reg_read(offset & !0x3) >> ((offset & 0x3) * 8)) as u8
    }

    fn read16(&self, offset: u64) -> u16 {
        (self.chip.reg_read(offset & !0x3) >> ((offset & 0x3) * 8)) as u16
    }

    fn read32(&self, offset: u64) -> u32 {
        self.chip.reg_read(offset)
    }

    fn write8(&self, _offset: u64, _value: u8) {
        unimplemented!("registers are written as dwords");
    }

    fn write16(&self, _offset: u64, _value: u16) {
        unimplemented!("registers are written as dwords");
    }

    fn write32(&self, offset: u64, value: u32) {
        self.chip.reg_write(offset, value);
    }

    fn len(&self) -> u64 {
        BAR0_SIZE
    }
}

/// BAR 2 of a chip: a window into local-bus memory, paged by the space 0
/// remap register.
struct Bar2Space {
    chip: Arc<ChipModel>,
}

impl Bar2Space {
    fn local_addr(&self, offset: u64) -> usize {
        let remap = self.chip.raw_reg(0x04);
        ((remap as u64 & !(BAR2_SIZE - 1)) + offset) as usize
    }
}

impl MmioSpace for Bar2Space {
    fn read8(&self, offset: u64) -> u8 {
        let addr = self.local_addr(offset);
        self.chip.local_mem.lock().unwrap()[addr]
    }

    fn read16(&self, offset: u64) -> u16 {
        let addr = self.local_addr(offset);
        let mem = self.chip.local_mem.lock().unwrap();
        u16::from_le_bytes([mem[addr], mem[addr + 1]])
    }

    fn read32(&self, offset: u64) -> u32 {
        let addr = self.local_addr(offset);
        let mem = self.chip.local_mem.lock().unwrap();
        u32::from_le_bytes([mem[addr], mem[addr + 1], mem[addr + 2], mem[addr + 3]])
    }

    fn write8(&self, offset: u64, value: u8) {
        let addr = self.local_addr(offset);
        self.chip.local_mem.lock().unwrap()[addr] = value;
    }

    fn write16(&self, offset: u64, value: u16) {
        let addr = self.local_addr(offset);
        let mut mem = self.chip.local_mem.lock().unwrap();
        mem[addr..addr + 2].copy_from_slice(&value.to_le_bytes());
    }

    fn write32(&self, offset: u64, value: u32) {
        let addr = self.local_addr(offset);
        let mut mem = self.chip.local_mem.lock().unwrap();
        mem[addr..addr + 4].copy_from_slice(&value.to_le_bytes());
    }

    fn len(&self) -> u64 {
        BAR2_SIZE
    }
}

#[derive(Default)]
struct PageState {
    refs: u32,
    dirty: bool,
}

struct UserRange {
    va: u64,
    ram_offset: u64,
    len: u64,
}

/// The simulated host.
pub struct TestHost {
    ram: Arc<Ram>,
    chips: Mutex<Vec<Arc<ChipModel>>>,
    irq_handlers: Mutex<HashMap<u8, IrqHandler>>,

    alloc_cursor: Mutex<u64>,
    live_coherent: Mutex<HashMap<u64, u32>>,
    reserved_pages: Mutex<HashSet<u64>>,

    user_cursor: Mutex<u64>,
    user_map: Mutex<Vec<UserRange>>,
    pages: Mutex<HashMap<u64, PageState>>,
    unmapped: Mutex<Vec<(u64, u32)>>,

    io_ports: Mutex<HashMap<u64, u32>>,
    cfg_latch: Mutex<u32>,
    claimed: Mutex<Vec<(u64, u64)>>,

    /// Coherent allocations above this size fail, for the shrink-loop test.
    pub alloc_fail_above: Mutex<Option<u32>>,
    /// At most this many pages lock successfully, for the partial-lock test.
    pub lock_limit: Mutex<Option<usize>>,
}

impl TestHost {
    pub fn new() -> Arc<Self> {
        Arc::new(Self {
            ram: Ram::new(),
            chips: Mutex::new(Vec::new()),
            irq_handlers: Mutex::new(HashMap::new()),
            alloc_cursor: Mutex::new(0),
            live_coherent: Mutex::new(HashMap::new()),
            reserved_pages: Mutex::new(HashSet::new()),
            user_cursor: Mutex::new(0),
            user_map: Mutex::new(Vec::new()),
            pages: Mutex::new(HashMap::new()),
            unmapped: Mutex::new(Vec::new()),
            io_ports: Mutex::new(HashMap::new()),
            cfg_latch: Mutex::new(0),
            claimed: Mutex::new(Vec::new()),
            alloc_fail_above: Mutex::new(None),
            lock_limit: Mutex::new(None),
        })
    }

    pub fn add_chip(self: &Arc<Self>, loc: PciLocation) -> Arc<ChipModel> {
        let mut chips = self.chips.lock().unwrap();
        let index = chips.len();
        let chip = ChipModel::new(
            loc,
            10 + index as u8,
            index,
            Arc::clone(&self.ram),
            Arc::downgrade(self),
        );
        chips.push(Arc::clone(&chip));
        chip
    }

    pub fn chip(&self, index: usize) -> Arc<ChipModel> {
        Arc::clone(&self.chips.lock().unwrap()[index])
    }

    fn chip_by_loc(&self, loc: PciLocation) -> Option<Arc<ChipModel>> {
        self.chips
            .lock()
            .unwrap()
            .iter()
            .find(|chip| chip.loc == loc)
            .cloned()
    }

    fn chip_by_bar(&self, phys: u64) -> Option<(Arc<ChipModel>, u64)> {
        let chips = self.chips.lock().unwrap();
        for chip in chips.iter() {
            if phys == bar0_base(chip.index) || phys == bar2_base(chip.index) {
                return Some((Arc::clone(chip), phys));
            }
        }
        None
    }

    pub fn trigger_irq(&self, line: u8) {
        let handler = self.irq_handlers.lock().unwrap().get(&line).cloned();
        if let Some(handler) = handler {
            let _ = handler();
        }
    }

    // ---- user-memory helpers for tests ----

    /// Creates a simulated user buffer and returns its virtual address.
    /// `page_offset` shifts the start inside its first page.
    pub fn user_alloc(&self, len: usize, page_offset: u32) -> u64 {
        let pages = (page_offset as usize + len).div_ceil(PAGE_SIZE as usize);

        let ram_offset = {
            let mut cursor = self.alloc_cursor.lock().unwrap();
            let offset = (*cursor + u64::from(PAGE_SIZE) - 1) & !(u64::from(PAGE_SIZE) - 1);
            *cursor = offset + (pages as u64) * u64::from(PAGE_SIZE);
            offset
        };

        let va = {
            let mut cursor = self.user_cursor.lock().unwrap();
            let va = USER_BASE + *cursor;
            *cursor += ((pages as u64) + 1) * u64::from(PAGE_SIZE);
            va
        } + u64::from(page_offset);

        self.user_map.lock().unwrap().push(UserRange {
            va: va & !(u64::from(PAGE_SIZE) - 1),
            ram_offset,
            len: (pages as u64) * u64::from(PAGE_SIZE),
        });

        va
    }

    fn user_to_ram(&self, va: u64) -> Option<u64> {
        let map = self.user_map.lock().unwrap();
        map.iter()
            .find(|range| va >= range.va && va < range.va + range.len)
            .map(|range| range.ram_offset + (va - range.va))
    }

    pub fn write_user(&self, va: u64, data: &[u8]) {
        let offset = self.user_to_ram(va).expect("unmapped user address");
        self.ram.write(offset, data);
    }

    pub fn read_user(&self, va: u64, len: usize) -> Vec<u8> {
        let offset = self.user_to_ram(va).expect("unmapped user address");
        let mut buf = vec![0u8; len];
        self.ram.read(offset, &mut buf);
        buf
    }

    pub fn page_refs(&self, page: PageHandle) -> u32 {
        self.pages
            .lock()
            .unwrap()
            .get(&page.0)
            .map_or(0, |state| state.refs)
    }

    pub fn any_page_locked(&self) -> bool {
        self.pages
            .lock()
            .unwrap()
            .values()
            .any(|state| state.refs != 0)
    }

    pub fn page_dirty(&self, bus_page: u64) -> bool {
        self.pages
            .lock()
            .unwrap()
            .get(&bus_page)
            .is_some_and(|state| state.dirty)
    }

    pub fn live_coherent_count(&self) -> usize {
        self.live_coherent.lock().unwrap().len()
    }

    pub fn unmapped_log(&self) -> Vec<(u64, u32)> {
        self.unmapped.lock().unwrap().clone()
    }

    /// Direct bus-address access to the RAM pool.
    pub fn read_bus(&self, bus: u64, len: usize) -> Vec<u8> {
        let mut buf = vec![0u8; len];
        self.ram.read(bus - RAM_BASE, &mut buf);
        buf
    }

    pub fn write_bus(&self, bus: u64, data: &[u8]) {
        self.ram.write(bus - RAM_BASE, data);
    }

    pub fn read_bus_u32(&self, bus: u64) -> u32 {
        self.ram.read_u32_le(bus - RAM_BASE)
    }

    /// Bus address of page `index` of a simulated user buffer.
    pub fn user_page_bus(&self, va: u64, index: usize) -> u64 {
        let page_mask = u64::from(PAGE_SIZE) - 1;
        let page_va = (va & !page_mask) + (index as u64) * u64::from(PAGE_SIZE);
        RAM_BASE + self.user_to_ram(page_va).expect("unmapped user address")
    }

    pub fn irq_handlers_empty(&self) -> bool {
        self.irq_handlers.lock().unwrap().is_empty()
    }

    pub fn set_io_port(&self, port: u64, value: u32) {
        self.io_ports.lock().unwrap().insert(port, value);
    }

    pub fn io_port(&self, port: u64) -> u32 {
        self.io_ports.lock().unwrap().get(&port).copied().unwrap_or(0)
    }
}

impl HostApi for TestHost {
    fn cfg_read32(&self, loc: PciLocation, offset: u16) -> Result<u32, ApiStatus> {
        match self.chip_by_loc(loc) {
            Some(chip) => Ok(chip.cfg_read(offset)),
            None => Err(ApiStatus::ConfigAccessFailed),
        }
    }

    fn cfg_write32(&self, loc: PciLocation, offset: u16, value: u32) -> Result<(), ApiStatus> {
        match self.chip_by_loc(loc) {
            Some(chip) => {
                chip.cfg_write(offset, value);
                Ok(())
            }
            None => Err(ApiStatus::ConfigAccessFailed),
        }
    }

    fn io_read(&self, port: u64, width: AccessWidth) -> u32 {
        if port == 0xCFC {
            let latch = *self.cfg_latch.lock().unwrap();
            let loc = PciLocation {
                bus: ((latch >> 16) & 0xFF) as u8,
                slot: ((latch >> 11) & 0x1F) as u8,
                function: ((latch >> 8) & 0x7) as u8,
            };
            return match self.chip_by_loc(loc) {
                Some(chip) => chip.cfg_read((latch & 0xFC) as u16),
                None => !0,
            };
        }

        let value = self.io_port(port);
        match width {
            AccessWidth::Bit8 => value & 0xFF,
            AccessWidth::Bit16 => value & 0xFFFF,
            AccessWidth::Bit32 => value,
        }
    }

    fn io_write(&self, port: u64, _width: AccessWidth, value: u32) {
        if port == 0xCF8 {
            *self.cfg_latch.lock().unwrap() = value;
            return;
        }

        if port == 0xCFC {
            let latch = *self.cfg_latch.lock().unwrap();
            let loc = PciLocation {
                bus: ((latch >> 16) & 0xFF) as u8,
                slot: ((latch >> 11) & 0x1F) as u8,
                function: ((latch >> 8) & 0x7) as u8,
            };
            if let Some(chip) = self.chip_by_loc(loc) {
                chip.cfg_write((latch & 0xFC) as u16, value);
            }
            return;
        }

        self.io_ports.lock().unwrap().insert(port, value);
    }

    fn bar_resource(&self, loc: PciLocation, index: usize) -> Option<BarResource> {
        let chip = self.chip_by_loc(loc)?;

        match index {
            0 => Some(BarResource {
                phys_addr: bar0_base(chip.index),
                size: BAR0_SIZE,
                io: false,
                bit64: false,
                prefetchable: false,
            }),
            1 => Some(BarResource {
                phys_addr: 0xD000 + (chip.index as u64) * 0x100,
                size: BAR1_IO_SIZE,
                io: true,
                bit64: false,
                prefetchable: false,
            }),
            2 => Some(BarResource {
                phys_addr: bar2_base(chip.index),
                size: BAR2_SIZE,
                io: false,
                bit64: false,
                prefetchable: false,
            }),
            _ => None,
        }
    }

    fn irq_line(&self, loc: PciLocation) -> u8 {
        self.chip_by_loc(loc).map_or(0, |chip| chip.irq_line)
    }

    fn claim_region(&self, phys_addr: u64, size: u64, _io: bool) -> bool {
        self.claimed.lock().unwrap().push((phys_addr, size));
        true
    }

    fn release_region(&self, phys_addr: u64, size: u64, _io: bool) {
        let mut claimed = self.claimed.lock().unwrap();
        if let Some(position) = claimed
            .iter()
            .position(|entry| *entry == (phys_addr, size))
        {
            claimed.remove(position);
        }
    }

    fn map_bar(&self, phys_addr: u64, _size: u64) -> Option<Arc<dyn MmioSpace>> {
        let (chip, base) = self.chip_by_bar(phys_addr)?;

        if base == bar0_base(chip.index) {
            Some(Arc::new(Bar0Space { chip }))
        } else {
            Some(Arc::new(Bar2Space { chip }))
        }
    }

    fn alloc_coherent(&self, size: u32) -> Option<CoherentBuffer> {
        if self
            .alloc_fail_above
            .lock()
            .unwrap()
            .is_some_and(|max| size > max)
        {
            return None;
        }

        let offset = {
            let mut cursor = self.alloc_cursor.lock().unwrap();
            let offset = (*cursor + u64::from(PAGE_SIZE) - 1) & !(u64::from(PAGE_SIZE) - 1);
            let pages = size.div_ceil(PAGE_SIZE);
            *cursor = offset + u64::from(pages) * u64::from(PAGE_SIZE);
            offset
        };

        let bus = RAM_BASE + offset;

        self.ram.write(offset, &vec![0u8; size as usize]);

        {
            let mut reserved = self.reserved_pages.lock().unwrap();
            let pages = size.div_ceil(PAGE_SIZE);
            for page in 0..pages {
                reserved.insert(bus + u64::from(page) * u64::from(PAGE_SIZE));
            }
        }

        self.live_coherent.lock().unwrap().insert(bus, size);

        Some(CoherentBuffer {
            cpu_addr: bus,
            bus_addr: bus,
            size,
            mem: Arc::new(RamWindow {
                ram: Arc::clone(&self.ram),
                base: offset,
                len: u64::from(size),
            }),
        })
    }

    fn free_coherent(&self, buffer: CoherentBuffer) {
        let removed = self.live_coherent.lock().unwrap().remove(&buffer.bus_addr);
        assert!(removed.is_some(), "double free of coherent buffer");

        let mut reserved = self.reserved_pages.lock().unwrap();
        let pages = buffer.size.div_ceil(PAGE_SIZE);
        for page in 0..pages {
            reserved.remove(&(buffer.bus_addr + u64::from(page) * u64::from(PAGE_SIZE)));
        }
    }

    fn page_size(&self) -> u32 {
        PAGE_SIZE
    }

    fn lock_user_pages(
        &self,
        user_va: u64,
        page_count: usize,
        _for_write: bool,
    ) -> Result<Vec<PageHandle>, usize> {
        if let Some(limit) = *self.lock_limit.lock().unwrap() {
            if page_count > limit {
                return Err(limit);
            }
        }

        let page_mask = u64::from(PAGE_SIZE) - 1;
        let mut handles = Vec::with_capacity(page_count);

        for index in 0..page_count {
            let va = (user_va & !page_mask) + (index as u64) * u64::from(PAGE_SIZE);
            let Some(ram_offset) = self.user_to_ram(va) else {
                // Roll back what was taken so far, as a real host would.
                for handle in handles {
                    self.release_page(handle);
                }
                return Err(index);
            };

            let handle = PageHandle(RAM_BASE + ram_offset);
            self.pages
                .lock()
                .unwrap()
                .entry(handle.0)
                .or_default()
                .refs += 1;
            handles.push(handle);
        }

        Ok(handles)
    }

    fn dma_map_page(
        &self,
        page: PageHandle,
        offset: u32,
        _len: u32,
        _direction: DmaDirection,
    ) -> u64 {
        page.0 + u64::from(offset)
    }

    fn dma_unmap_page(&self, bus_addr: u64, len: u32, _direction: DmaDirection) {
        self.unmapped.lock().unwrap().push((bus_addr, len));
    }

    fn page_reserved(&self, page: PageHandle) -> bool {
        self.reserved_pages.lock().unwrap().contains(&page.0)
    }

    fn mark_page_dirty(&self, page: PageHandle) {
        self.pages
            .lock()
            .unwrap()
            .entry(page.0)
            .or_default()
            .dirty = true;
    }

    fn release_page(&self, page: PageHandle) {
        let mut pages = self.pages.lock().unwrap();
        let state = pages.entry(page.0).or_default();
        assert!(state.refs > 0, "release of unlocked page {:#x}", page.0);
        state.refs -= 1;
    }

    fn request_irq(&self, line: u8, handler: IrqHandler) -> Result<IrqHandle, ApiStatus> {
        self.irq_handlers.lock().unwrap().insert(line, handler);
        Ok(IrqHandle(u64::from(line)))
    }

    fn free_irq(&self, handle: IrqHandle) {
        self.irq_handlers.lock().unwrap().remove(&(handle.0 as u8));
    }
}

/// A ready-to-use rig: host, driver and `count` probed 9054 devices at
/// bus 3, slots 1 and up.
pub fn rig(count: usize) -> (Arc<TestHost>, Driver) {
    let _ = env_logger::builder().is_test(true).try_init();

    let host = TestHost::new();

    for slot in 0..count {
        host.add_chip(PciLocation {
            bus: 3,
            slot: 1 + slot as u8,
            function: 0,
        });
    }

    let host_api: Arc<dyn HostApi> = host.clone();
    let driver = Driver::new(host_api);

    for slot in 0..count {
        driver
            .probe(PciLocation {
                bus: 3,
                slot: 1 + slot as u8,
                function: 0,
            })
            .expect("probe failed");
    }

    (host, driver)
}
