//! Interrupt plumbing.
//!
//! Interrupt handling is split in two stages. The hard handler runs on the
//! (possibly shared) IRQ line: it verifies under the ISR lock that the chip
//! really asserted, masks the master enable so the line deasserts, latches
//! the decoded cause and schedules the deferred stage. The deferred stage
//! runs on the device's worker task: it acknowledges each source, wakes the
//! matching wait objects and only then re-enables the master interrupt.

pub mod wait;

use bitflags::bitflags;
use log::debug;

use crate::chip::regs::OUTPOST_BIT_INT;
use crate::device::resources::synchronized_modify;
use crate::device::{DeviceCtx, Lifecycle};
use crate::dma;
use crate::hal::IrqReturn;
use crate::pci;

bitflags! {
    /// Decoded interrupt sources of one hard-IRQ invocation.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct IntrCause: u32 {
        const PCI_ABORT            = 1 << 0;
        const LOCAL_1              = 1 << 1;
        const LOCAL_2              = 1 << 2;
        const DOORBELL             = 1 << 3;
        const MU_OUTBOUND_POST     = 1 << 4;
        const MU_INBOUND_POST      = 1 << 5;
        const MU_OUTBOUND_OVERFLOW = 1 << 6;
        const DMA_0_DONE           = 1 << 7;
        const DMA_1_DONE           = 1 << 8;
    }
}

/// User-facing interrupt selection, used to enable/disable sources and to
/// describe what triggered a notification.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct IntrSpec {
    /// Master PCI interrupt gate.
    pub pci_main: bool,
    pub pci_abort: bool,
    pub target_retry_abort: bool,
    pub local_1: bool,
    pub local_2: bool,

    /// Doorbell bit selection or triggered doorbell payload.
    pub doorbell: u32,

    /// One bit per DMA channel.
    pub dma_done: u8,

    pub mu_outbound_post: bool,
    pub mu_inbound_post: bool,
    pub mu_outbound_overflow: bool,
}

/// The hard interrupt handler.
///
/// Runs with the line possibly shared with other devices; everything here
/// must stay short and must not block. An all-ones read of the interrupt
/// register means the chip is in a low power state with register reads
/// disabled, so the assertion belongs to whoever shares the line.
pub fn isr(ctx: &DeviceCtx) -> IrqReturn {
    let Some(regs) = ctx.try_regs() else {
        return IrqReturn::NotOurs;
    };

    let intcsr_offset = ctx.chip().regs_map().int_ctrl_stat;
    let master_enable = ctx.chip().profile().intr.master_enable;

    let isr_guard = ctx.isr_lock().lock();

    let intcsr = regs.read(intcsr_offset);

    if intcsr == u32::MAX {
        drop(isr_guard);
        return IrqReturn::NotOurs;
    }

    if intcsr & master_enable == 0 {
        drop(isr_guard);
        return IrqReturn::NotOurs;
    }

    let cause = ctx.chip().decode_cause(&regs, intcsr);
    if cause.is_empty() {
        drop(isr_guard);
        return IrqReturn::NotOurs;
    }

    // The device interrupt is verified. Mask the master enable so the line
    // deasserts until the deferred stage has acknowledged the sources.
    regs.write(intcsr_offset, intcsr & !master_enable);

    drop(isr_guard);

    ctx.latch_cause(cause);

    // If the device is no longer started, do not schedule the deferred
    // stage; teardown owns the resources now.
    if ctx.lifecycle() == Lifecycle::Started {
        ctx.schedule_deferred();
    }

    IrqReturn::Handled
}

/// The deferred stage of interrupt handling.
///
/// Runs on the device worker task, at most one invocation in flight per
/// device. Wake-ups happen before the master interrupt is re-enabled, so a
/// woken thread observes the acknowledged state.
pub fn deferred_service(ctx: &DeviceCtx) {
    let regs = match ctx.try_regs() {
        Some(regs) if ctx.lifecycle() == Lifecycle::Started => regs,
        _ => {
            debug!(target: "plxcore::intr", "deferred handler aborted, device is stopping");
            ctx.clear_deferred_pending();
            return;
        }
    };

    let cause = ctx.take_latched_cause();
    let map = ctx.chip().regs_map();
    let mut doorbell_value = 0u32;

    if cause.contains(IntrCause::LOCAL_1) {
        // The true source sits on the local bus and is unknown here; mask
        // the source until user space clears it externally.
        synchronized_modify(
            ctx.isr_lock(),
            &regs,
            map.int_ctrl_stat,
            0,
            ctx.chip().profile().intr.local_1.enable,
        );
    }

    if cause.contains(IntrCause::LOCAL_2) {
        if let Some(local_2) = ctx.chip().profile().intr.local_2 {
            synchronized_modify(ctx.isr_lock(), &regs, map.int_ctrl_stat, 0, local_2.enable);
        }
    }

    if cause.contains(IntrCause::DOORBELL) {
        if let Some(doorbell_offset) = map.pci_doorbell {
            // Reading tells which bits fired; writing them back clears the
            // interrupt.
            doorbell_value = regs.read(doorbell_offset);
            regs.write(doorbell_offset, doorbell_value);
        }
    }

    if cause.contains(IntrCause::PCI_ABORT) {
        // The abort flags in the status half of the command register are
        // write-one-to-clear.
        if let Ok(command) = pci::cfg_read(ctx.host(), ctx.location(), 0x04) {
            let _ = pci::cfg_write(ctx.host(), ctx.location(), 0x04, command);
        }
    }

    if cause.contains(IntrCause::DMA_0_DONE) {
        dma::handle_done_interrupt(ctx, 0);
    }

    if cause.contains(IntrCause::DMA_1_DONE) {
        dma::handle_done_interrupt(ctx, 1);
    }

    if cause.contains(IntrCause::MU_OUTBOUND_POST) {
        // Mask the outbound-post interrupt; the consumer unmasks it again
        // once the queue is drained.
        if let Some(mask_offset) = map.outpost_int_mask {
            regs.write(mask_offset, OUTPOST_BIT_INT);
        }
    }

    ctx.wait_list().signal(cause, doorbell_value);

    ctx.chip().interrupts_enable(&ctx.chip_io(&regs));

    ctx.clear_deferred_pending();
}
