//! Bit-banged serial EEPROM access.
//!
//! The 9000-family parts expose the EEPROM's four lines (clock, chip select,
//! data in, data out) as bits of the EEPROM control register. Reads and
//! writes are clocked one bit at a time; short propagation delays are
//! produced by dummy register reads rather than timed sleeps, because the
//! available sleep resolution would make every access take seconds.

use crate::chip::regs::{
    EE_BITS_ALL_LINES, EE_BIT_CHIP_SELECT, EE_BIT_CLOCK, EE_BIT_EEDO_INPUT, EE_BIT_PRESENT,
    EE_BIT_READ_DATA, EE_BIT_WRITE_DATA,
};
use crate::hal::DeviceRegs;

/// Serial EEPROM part family wired to the bridge.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum EepromKind {
    Cs46,
    Cs56,
}

impl EepromKind {
    /// Bits in one instruction (start bit, opcode and address).
    pub fn command_length(self) -> u8 {
        match self {
            EepromKind::Cs46 => 9,
            EepromKind::Cs56 => 11,
        }
    }

    /// Left shift applied to the opcode to make room for the wider address
    /// field of the larger parts.
    pub fn command_shift(self) -> u8 {
        match self {
            EepromKind::Cs46 => 0,
            EepromKind::Cs56 => 2,
        }
    }
}

// Instruction opcodes, pre-positioned for a Cs46 frame.
const EE_CMD_READ: u32 = 0x0180;
const EE_CMD_WRITE: u32 = 0x0140;
const EE_CMD_WRITE_ENABLE: u32 = 0x0130;
const EE_CMD_WRITE_DISABLE: u32 = 0x0100;

/// Iterations of the write-completion poll before giving up.
const WRITE_VERIFY_MAX_POLL: u32 = 20_000;

/// Dummy register reads used as a propagation delay.
const SETTLE_READS: u32 = 20;

/// Returns whether the device reports a valid EEPROM attached.
pub fn present(regs: &DeviceRegs, ctrl: u16) -> bool {
    regs.read(ctrl) & EE_BIT_PRESENT != 0
}

/// Reads a 32-bit value from the EEPROM.
///
/// The caller has validated the offset; `offset / 2` is the 16-bit word
/// address the part expects.
pub fn read_u32(regs: &DeviceRegs, ctrl: u16, kind: EepromKind, offset: u16) -> u32 {
    let shift = kind.command_shift();

    send_command(
        regs,
        ctrl,
        (EE_CMD_READ << shift) | u32::from(offset / 2),
        kind.command_length(),
    );

    // The write-output bit must be held high before read operations on the
    // 9054; it is harmless on the other parts. Same for the EEDO input
    // enable, which is a reserved bit on older parts.
    let mut reg = regs.read(ctrl);
    reg |= EE_BIT_EEDO_INPUT;
    regs.write(ctrl, reg | EE_BIT_WRITE_DATA);

    let mut value: u32 = 0;

    for _ in 0..32 {
        clock(regs, ctrl);

        // Let the data bit propagate from the EEPROM to the chip.
        for _ in 0..SETTLE_READS {
            reg = regs.read(ctrl);
        }

        value = (value << 1) | u32::from(reg & EE_BIT_READ_DATA != 0);
    }

    reg &= !EE_BIT_EEDO_INPUT;
    regs.write(ctrl, reg & !EE_BITS_ALL_LINES);

    value
}

/// Writes a 32-bit value to the EEPROM as two 16-bit programming cycles.
///
/// `done_when_set` selects the polarity of the completion poll: the engine
/// waits for the data-in bit to match it, bounded by an iteration cap. The
/// poll is not treated as fatal when it expires; the subsequent read-back
/// (probe or verify) surfaces a genuine failure.
pub fn write_u32(
    regs: &DeviceRegs,
    ctrl: u16,
    kind: EepromKind,
    offset: u16,
    value: u32,
    done_when_set: bool,
) {
    let shift = kind.command_shift();
    let mut offset = offset;

    for half in 0..2 {
        let word = if half == 0 {
            (value >> 16) as u16
        } else {
            offset += 2;
            value as u16
        };

        send_command(regs, ctrl, EE_CMD_WRITE_ENABLE << shift, kind.command_length());
        send_command(
            regs,
            ctrl,
            (EE_CMD_WRITE << shift) | u32::from(offset / 2),
            kind.command_length(),
        );

        let mut reg = regs.read(ctrl);
        reg &= !EE_BITS_ALL_LINES;
        reg &= !EE_BIT_EEDO_INPUT;
        reg |= EE_BIT_CHIP_SELECT;

        // Clock out the sixteen data bits, most significant first.
        for bit in (0..16).rev() {
            if word & (1 << bit) != 0 {
                regs.write(ctrl, reg | EE_BIT_WRITE_DATA);
            } else {
                regs.write(ctrl, reg);
            }

            clock(regs, ctrl);
        }

        // Toggling chip select starts the internal programming cycle.
        regs.write(ctrl, reg & !EE_BIT_CHIP_SELECT);
        regs.write(ctrl, reg | EE_BIT_CHIP_SELECT);

        let mut poll = 0;
        loop {
            reg = regs.read(ctrl);

            if (reg & EE_BIT_READ_DATA != 0) == done_when_set {
                break;
            }

            poll += 1;
            if poll >= WRITE_VERIFY_MAX_POLL {
                break;
            }
        }

        send_command(regs, ctrl, EE_CMD_WRITE_DISABLE << shift, kind.command_length());
        regs.write(ctrl, reg & !EE_BITS_ALL_LINES);
    }
}

/// Clocks an instruction frame into the EEPROM, one bit at a time.
fn send_command(regs: &DeviceRegs, ctrl: u16, command: u32, length_bits: u8) {
    let mut reg = regs.read(ctrl);
    reg &= !EE_BITS_ALL_LINES;

    // Toggle chip select to take the part out of shift-register mode.
    regs.write(ctrl, reg);

    reg |= EE_BIT_CHIP_SELECT;
    regs.write(ctrl, reg);

    for bit in (0..length_bits).rev() {
        if command & (1 << bit) != 0 {
            regs.write(ctrl, reg | EE_BIT_WRITE_DATA);
        } else {
            regs.write(ctrl, reg);
        }

        clock(regs, ctrl);
    }
}

/// Sends one clock pulse, with a settle delay between the edges.
fn clock(regs: &DeviceRegs, ctrl: u16) {
    let mut reg = regs.read(ctrl);

    regs.write(ctrl, reg | EE_BIT_CLOCK);

    for _ in 0..SETTLE_READS {
        reg = regs.read(ctrl);
    }

    regs.write(ctrl, reg & !EE_BIT_CLOCK);
}
