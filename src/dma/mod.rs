//! DMA engine of the 9080-class bridges.
//!
//! Two independent channels, each owned by whichever open file opened it.
//! Block transfers move one physically contiguous region; user-buffer
//! transfers page-lock the caller's memory and run a scatter-gather chain
//! built by [`sgl`]. Completion is signalled through the interrupt core,
//! never by blocking the submitting thread.

pub mod sgl;

use log::debug;
use modular_bitfield::prelude::*;

use crate::chip::regs::{
    dma_csr_shift, DmaRegs, DMA_CSR_BIT_ABORT, DMA_CSR_BIT_CLEAR_INT, DMA_CSR_BIT_DONE,
    DMA_CSR_BIT_ENABLE, DMA_CSR_BIT_START, DMA_DESC_BIT_IN_PCI_SPACE,
    DMA_DESC_BIT_LOCAL_TO_PCI, DMA_MODE_BIT_DONE_INT, DMA_MODE_BIT_DUAL_ADDR,
    DMA_MODE_BIT_ROUTE_INT_PCI, DMA_MODE_BIT_SGL,
};
use crate::device::{DeviceCtx, OwnerHandle};
use crate::hal::{CoherentBuffer, DeviceRegs, DmaDirection, PageHandle};
use crate::status::{ApiStatus, CanFail};

/// Direction of a transfer as user space states it.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaTransferDirection {
    /// Device reads the local bus and writes host memory.
    LocalToPci,
    /// Device reads host memory and writes the local bus.
    PciToLocal,
}

/// Commands accepted by [`control`].
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DmaCommand {
    Pause,
    Resume,
    Abort,
}

/// Parameters of one block or user-buffer transfer.
#[derive(Debug, Clone, Copy)]
pub struct DmaParams {
    /// User virtual address, user-buffer transfers only.
    pub user_va: u64,

    /// PCI bus address, block transfers only.
    pub pci_addr: u64,

    /// Starting local-bus address.
    pub local_addr: u32,

    pub byte_count: u32,
    pub direction: DmaTransferDirection,

    /// Suppress the done interrupt of a block transfer.
    pub ignore_block_int: bool,
}

/// Image of the per-channel mode register.
#[bitfield]
#[repr(u32)]
#[derive(Debug, Clone, Copy)]
struct DmaModeReg {
    local_bus_width: B2,
    wait_states: B4,
    ready_input: bool,
    burst_infinite: bool,
    burst: bool,
    sgl: bool,
    done_interrupt: bool,
    const_addr_local: bool,
    demand_mode: bool,
    write_invalidate: bool,
    enable_eot: bool,
    fast_terminate: bool,
    clear_count: bool,
    route_int_to_pci: bool,
    dual_addressing: bool,
    #[skip]
    __: B13,
}

/// Flattened channel properties, the user-facing form of the mode register.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct DmaProps {
    pub local_bus_width: u8,
    pub wait_states: u8,
    pub ready_input: bool,
    pub burst_infinite: bool,
    pub burst: bool,
    pub sgl_mode: bool,
    pub done_interrupt: bool,
    pub const_addr_local: bool,
    pub demand_mode: bool,
    pub write_invalidate: bool,
    pub enable_eot: bool,
    pub fast_terminate: bool,
    pub clear_count: bool,
    pub route_int_to_pci: bool,
    pub dual_addressing: bool,
}

impl DmaProps {
    fn to_register(self) -> u32 {
        DmaModeReg::new()
            .with_local_bus_width(self.local_bus_width & 0x3)
            .with_wait_states(self.wait_states & 0xF)
            .with_ready_input(self.ready_input)
            .with_burst_infinite(self.burst_infinite)
            .with_burst(self.burst)
            .with_sgl(self.sgl_mode)
            .with_done_interrupt(self.done_interrupt)
            .with_const_addr_local(self.const_addr_local)
            .with_demand_mode(self.demand_mode)
            .with_write_invalidate(self.write_invalidate)
            .with_enable_eot(self.enable_eot)
            .with_fast_terminate(self.fast_terminate)
            .with_clear_count(self.clear_count)
            .with_route_int_to_pci(self.route_int_to_pci)
            .with_dual_addressing(self.dual_addressing)
            .into()
    }

    fn from_register(value: u32) -> Self {
        let mode = DmaModeReg::from(value);

        Self {
            local_bus_width: mode.local_bus_width(),
            wait_states: mode.wait_states(),
            ready_input: mode.ready_input(),
            burst_infinite: mode.burst_infinite(),
            burst: mode.burst(),
            sgl_mode: mode.sgl(),
            done_interrupt: mode.done_interrupt(),
            const_addr_local: mode.const_addr_local(),
            demand_mode: mode.demand_mode(),
            write_invalidate: mode.write_invalidate(),
            enable_eot: mode.enable_eot(),
            fast_terminate: mode.fast_terminate(),
            clear_count: mode.clear_count(),
            route_int_to_pci: mode.route_int_to_pci(),
            dual_addressing: mode.dual_addressing(),
        }
    }
}

/// Mutable state of one DMA channel.
pub(crate) struct DmaChannel {
    pub open: bool,
    pub owner: Option<OwnerHandle>,
    pub sgl_pending: bool,
    pub const_local_addr: bool,
    pub user_pages: Vec<PageHandle>,
    pub descriptor_count: u32,
    pub initial_offset: u32,
    pub total_size: u32,
    pub direction: DmaDirection,
    pub sgl_buffer: Option<CoherentBuffer>,
}

impl Default for DmaChannel {
    fn default() -> Self {
        Self {
            open: false,
            owner: None,
            sgl_pending: false,
            const_local_addr: false,
            user_pages: Vec::new(),
            descriptor_count: 0,
            initial_offset: 0,
            total_size: 0,
            direction: DmaDirection::ToDevice,
            sgl_buffer: None,
        }
    }
}

/// Validates the channel index against the chip's channel count.
fn channel_regs(ctx: &DeviceCtx, channel: u8) -> Result<&'static DmaRegs, ApiStatus> {
    if channel >= ctx.chip().profile().dma_channels {
        debug!(target: "plxcore::dma", "invalid DMA channel ({})", channel);
        return Err(ApiStatus::DmaChannelInvalid);
    }

    ctx.chip().dma_regs().ok_or(ApiStatus::DmaChannelInvalid)
}

/// Classifies the channel state from the command/status register.
fn read_state(regs: &DeviceRegs, dma: &DmaRegs, channel: u8) -> ApiStatus {
    let mut csr = regs.read(dma.command_stat);

    if channel == 1 {
        csr >>= 8;
    }

    if csr & (DMA_CSR_BIT_DONE | DMA_CSR_BIT_ENABLE) == 0 {
        return ApiStatus::DmaPaused;
    }

    if csr & DMA_CSR_BIT_DONE != 0 {
        return ApiStatus::DmaDone;
    }

    ApiStatus::DmaInProgress
}

/// Opens a DMA channel for `owner` and enables its done interrupt.
pub fn channel_open(ctx: &DeviceCtx, channel: u8, owner: OwnerHandle) -> CanFail<ApiStatus> {
    channel_regs(ctx, channel)?;
    let regs = ctx.regs()?;

    {
        let mut chan = ctx.dma_channel(channel).lock();

        if chan.open {
            debug!(target: "plxcore::dma", "DMA channel {} already opened", channel);
            return Err(ApiStatus::DmaChannelUnavailable);
        }

        chan.open = true;
        chan.owner = Some(owner);
        chan.sgl_pending = false;
    }

    if let Some(done) = ctx.chip().profile().intr.dma_done[usize::from(channel)] {
        crate::device::resources::synchronized_modify(
            ctx.isr_lock(),
            &regs,
            ctx.chip().regs_map().int_ctrl_stat,
            done.enable,
            0,
        );
    }

    debug!(target: "plxcore::dma", "opened DMA channel {}", channel);

    Ok(())
}

/// Reads the channel properties back from the mode register.
pub fn get_properties(ctx: &DeviceCtx, channel: u8) -> Result<DmaProps, ApiStatus> {
    let dma = channel_regs(ctx, channel)?;
    let regs = ctx.regs()?;

    Ok(DmaProps::from_register(
        regs.read(dma.mode[usize::from(channel)]),
    ))
}

/// Writes the channel properties. Refused while a transfer is active or
/// when the channel belongs to a different owner.
pub fn set_properties(
    ctx: &DeviceCtx,
    channel: u8,
    props: &DmaProps,
    owner: OwnerHandle,
) -> CanFail<ApiStatus> {
    let dma = channel_regs(ctx, channel)?;
    let regs = ctx.regs()?;

    verify_owner(ctx, channel, owner)?;

    if status(ctx, channel, owner) != ApiStatus::DmaDone {
        debug!(target: "plxcore::dma", "DMA transfer in progress");
        return Err(ApiStatus::DmaInProgress);
    }

    regs.write(dma.mode[usize::from(channel)], props.to_register());

    Ok(())
}

/// Pause, resume or abort the channel.
pub fn control(
    ctx: &DeviceCtx,
    channel: u8,
    command: DmaCommand,
    owner: OwnerHandle,
) -> CanFail<ApiStatus> {
    let dma = channel_regs(ctx, channel)?;
    let regs = ctx.regs()?;

    verify_owner(ctx, channel, owner)?;

    let shift = dma_csr_shift(usize::from(channel));

    match command {
        DmaCommand::Pause => {
            let csr = regs.read(dma.command_stat);
            regs.write(dma.command_stat, csr & !(DMA_CSR_BIT_ENABLE << shift));

            // The transfer may have completed on its own before the pause
            // took effect.
            let csr = regs.read(dma.command_stat);
            if csr & (DMA_CSR_BIT_DONE << shift) != 0 {
                return Err(ApiStatus::DmaDone);
            }
        }
        DmaCommand::Resume => {
            let csr = regs.read(dma.command_stat);

            if csr & ((DMA_CSR_BIT_DONE | DMA_CSR_BIT_ENABLE) << shift) != 0 {
                return Err(ApiStatus::DmaInProgress);
            }

            regs.write(dma.command_stat, csr | (DMA_CSR_BIT_ENABLE << shift));
        }
        DmaCommand::Abort => {
            let csr = regs.read(dma.command_stat);
            regs.write(dma.command_stat, csr & !(DMA_CSR_BIT_ENABLE << shift));

            let csr = regs.read(dma.command_stat);
            if csr & (DMA_CSR_BIT_DONE << shift) != 0 {
                return Err(ApiStatus::DmaDone);
            }

            // The abort raises a done interrupt; completion cleanup runs
            // from the deferred handler.
            regs.write(dma.command_stat, csr | (DMA_CSR_BIT_ABORT << shift));
        }
    }

    Ok(())
}

/// Current channel state: `DmaDone`, `DmaPaused` or `DmaInProgress`.
pub fn status(ctx: &DeviceCtx, channel: u8, owner: OwnerHandle) -> ApiStatus {
    let dma = match channel_regs(ctx, channel) {
        Ok(dma) => dma,
        Err(status) => return status,
    };
    let regs = match ctx.regs() {
        Ok(regs) => regs,
        Err(status) => return status,
    };

    if let Err(status) = verify_owner(ctx, channel, owner) {
        return status;
    }

    read_state(&regs, dma, channel)
}

/// Starts a block-mode transfer of a physically contiguous region.
pub fn transfer_block(
    ctx: &DeviceCtx,
    channel: u8,
    params: &DmaParams,
    owner: OwnerHandle,
) -> CanFail<ApiStatus> {
    let dma = channel_regs(ctx, channel)?;
    let regs = ctx.regs()?;

    verify_owner(ctx, channel, owner)?;

    let shift = dma_csr_shift(usize::from(channel));
    let mode_offset = dma.mode[usize::from(channel)];

    if regs.read(dma.command_stat) & (DMA_CSR_BIT_DONE << shift) == 0 {
        debug!(target: "plxcore::dma", "DMA channel {} is currently active", channel);
        return Err(ApiStatus::DmaInProgress);
    }

    let chan = ctx.dma_channel(channel).lock();

    if !chan.open {
        debug!(target: "plxcore::dma", "DMA channel {} has not been opened", channel);
        return Err(ApiStatus::DmaChannelUnavailable);
    }

    // Block mode: no chaining, no dual addressing, interrupt routed to PCI.
    let mut mode = regs.read(mode_offset);
    mode &= !(DMA_MODE_BIT_SGL | DMA_MODE_BIT_DUAL_ADDR);
    mode |= DMA_MODE_BIT_ROUTE_INT_PCI;

    if params.ignore_block_int {
        mode &= !DMA_MODE_BIT_DONE_INT;
    } else {
        mode |= DMA_MODE_BIT_DONE_INT;
    }

    regs.write(mode_offset, mode);

    regs.write(dma.pci_addr(usize::from(channel)), params.pci_addr as u32);
    regs.write(dma.local_addr(usize::from(channel)), params.local_addr);
    regs.write(dma.transfer_count(usize::from(channel)), params.byte_count);

    let direction_bit = match params.direction {
        DmaTransferDirection::LocalToPci => DMA_DESC_BIT_LOCAL_TO_PCI,
        DmaTransferDirection::PciToLocal => 0,
    };
    regs.write(dma.descriptor_ptr(usize::from(channel)), direction_bit);

    // Upper half of the PCI address goes to the dual-address register.
    regs.write(dma.pci_dac[usize::from(channel)], (params.pci_addr >> 32) as u32);

    // The hardware expects a two-write start: enable the channel first,
    // then enable and start in a single write.
    let csr = regs.read(dma.command_stat);
    regs.write(dma.command_stat, csr | (DMA_CSR_BIT_ENABLE << shift));

    drop(chan);

    debug!(target: "plxcore::dma", "starting block DMA transfer on channel {}", channel);

    regs.write(
        dma.command_stat,
        csr | ((DMA_CSR_BIT_ENABLE | DMA_CSR_BIT_START) << shift),
    );

    Ok(())
}

/// Starts a scatter-gather transfer over a page-locked user buffer.
pub fn transfer_user_buffer(
    ctx: &DeviceCtx,
    channel: u8,
    params: &DmaParams,
    owner: OwnerHandle,
) -> CanFail<ApiStatus> {
    let dma = channel_regs(ctx, channel)?;
    let regs = ctx.regs()?;

    verify_owner(ctx, channel, owner)?;

    if params.user_va == 0 {
        return Err(ApiStatus::NullParam);
    }
    if params.byte_count == 0 {
        return Err(ApiStatus::InvalidSize);
    }

    let shift = dma_csr_shift(usize::from(channel));
    let mode_offset = dma.mode[usize::from(channel)];

    if regs.read(dma.command_stat) & (DMA_CSR_BIT_DONE << shift) == 0 {
        debug!(target: "plxcore::dma", "DMA channel {} is currently active", channel);
        return Err(ApiStatus::DmaInProgress);
    }

    {
        let mut chan = ctx.dma_channel(channel).lock();

        if !chan.open {
            debug!(target: "plxcore::dma", "DMA channel {} has not been opened", channel);
            return Err(ApiStatus::DmaChannelUnavailable);
        }

        if chan.sgl_pending {
            debug!(target: "plxcore::dma", "an SGL DMA transfer is currently pending");
            return Err(ApiStatus::DmaInProgress);
        }

        // Claim the channel before dropping the lock; the page-lock and
        // descriptor build must not run with the spinlock held.
        chan.sgl_pending = true;
    }

    let mut mode = regs.read(mode_offset);
    let const_local_addr = mode & crate::chip::regs::DMA_MODE_BIT_CONST_LOCAL != 0;

    // Page locking and the descriptor build may block, so they run without
    // the channel spinlock; the pending claim keeps competitors out.
    let existing = {
        let mut chan = ctx.dma_channel(channel).lock();
        chan.const_local_addr = const_local_addr;
        chan.sgl_buffer.take()
    };

    let head_bus = match sgl::lock_buffer_and_build(ctx, params, const_local_addr, existing) {
        Ok(build) => {
            let mut chan = ctx.dma_channel(channel).lock();
            chan.user_pages = build.pages;
            chan.descriptor_count = build.descriptor_count;
            chan.initial_offset = build.initial_offset;
            chan.total_size = build.total_size;
            chan.direction = build.direction;
            chan.sgl_buffer = Some(build.buffer);
            build.head_bus
        }
        Err((status, buffer)) => {
            debug!(target: "plxcore::dma", "unable to lock buffer and build SGL list");
            let mut chan = ctx.dma_channel(channel).lock();
            chan.sgl_buffer = buffer;
            chan.sgl_pending = false;
            return Err(status);
        }
    };

    // Chaining, done interrupt, PCI routing; dual addressing stays off
    // because the build path only produces 32-bit descriptors.
    mode |= DMA_MODE_BIT_SGL | DMA_MODE_BIT_DONE_INT | DMA_MODE_BIT_ROUTE_INT_PCI;
    mode &= !DMA_MODE_BIT_DUAL_ADDR;
    regs.write(mode_offset, mode);

    // Clear the upper PCI address in case it holds a stale value.
    regs.write(dma.pci_dac[usize::from(channel)], 0);

    regs.write(
        dma.descriptor_ptr(usize::from(channel)),
        head_bus | DMA_DESC_BIT_IN_PCI_SPACE,
    );

    let csr = regs.read(dma.command_stat);
    regs.write(dma.command_stat, csr | (DMA_CSR_BIT_ENABLE << shift));

    debug!(target: "plxcore::dma", "starting SGL DMA transfer on channel {}", channel);

    regs.write(
        dma.command_stat,
        csr | ((DMA_CSR_BIT_ENABLE | DMA_CSR_BIT_START) << shift),
    );

    Ok(())
}

/// Closes the channel.
///
/// With `check_in_progress` set the close is refused while a transfer is
/// running; otherwise the transfer is aborted and the deferred handler gets
/// a moment to reap the user pages. A still-pending SGL at that point means
/// the interrupt never fired, so the pages are reaped synchronously. The
/// persistent descriptor buffer is released either way.
pub fn channel_close(
    ctx: &DeviceCtx,
    channel: u8,
    check_in_progress: bool,
    owner: OwnerHandle,
) -> CanFail<ApiStatus> {
    channel_regs(ctx, channel)?;

    debug!(target: "plxcore::dma", "closing DMA channel {}", channel);

    {
        let chan = ctx.dma_channel(channel).lock();

        if !chan.open {
            debug!(target: "plxcore::dma", "DMA channel {} has not been opened", channel);
            return Err(ApiStatus::DmaChannelUnavailable);
        }

        if chan.owner != Some(owner) {
            debug!(target: "plxcore::dma", "DMA channel {} owned by different process", channel);
            return Err(ApiStatus::DeviceInUse);
        }
    }

    let state = status(ctx, channel, owner);

    if state != ApiStatus::DmaDone {
        if check_in_progress {
            return Err(state);
        }

        debug!(target: "plxcore::dma", "DMA in progress, aborting");

        // The abort raises a done interrupt; give the deferred handler a
        // moment to run the completion cleanup.
        let _ = control(ctx, channel, DmaCommand::Abort, owner);
        std::thread::sleep(std::time::Duration::from_millis(100));
    }

    {
        let mut chan = ctx.dma_channel(channel).lock();
        chan.open = false;
        chan.owner = None;
    }

    {
        let mut chan = ctx.dma_channel(channel).lock();

        if chan.sgl_pending {
            sgl::transfer_complete(ctx, &mut chan);
        }

        if let Some(buffer) = chan.sgl_buffer.take() {
            debug!(target: "plxcore::dma", "releasing memory used for SGL descriptors");
            ctx.host().free_coherent(buffer);
        }
    }

    Ok(())
}

/// Closes any channels still owned by `owner`; the per-owner teardown path.
pub fn channel_cleanup(ctx: &DeviceCtx, owner: OwnerHandle) {
    for channel in 0..ctx.chip().profile().dma_channels {
        let owned = {
            let chan = ctx.dma_channel(channel).lock();
            chan.open && chan.owner == Some(owner)
        };

        if owned {
            let _ = channel_close(ctx, channel, false, owner);
        }
    }
}

/// Deferred-handler acknowledgement of a channel's done interrupt.
///
/// Clears the interrupt bit and, if the channel was running a scatter-gather
/// transfer, performs the completion cleanup.
pub(crate) fn handle_done_interrupt(ctx: &DeviceCtx, channel: u8) {
    let Ok(dma) = channel_regs(ctx, channel) else {
        return;
    };
    let Ok(regs) = ctx.regs() else {
        return;
    };

    let shift = dma_csr_shift(usize::from(channel));

    let csr = regs.read(dma.command_stat);
    regs.write(dma.command_stat, csr | (DMA_CSR_BIT_CLEAR_INT << shift));

    let mode = regs.read(dma.mode[usize::from(channel)]);
    if mode & DMA_MODE_BIT_SGL != 0 {
        let mut chan = ctx.dma_channel(channel).lock();
        sgl::transfer_complete(ctx, &mut chan);
    }
}

/// `DeviceInUse` when the channel is open under a different owner.
fn verify_owner(ctx: &DeviceCtx, channel: u8, owner: OwnerHandle) -> CanFail<ApiStatus> {
    let chan = ctx.dma_channel(channel).lock();

    if chan.open && chan.owner != Some(owner) {
        debug!(target: "plxcore::dma", "DMA channel {} owned by different process", channel);
        return Err(ApiStatus::DeviceInUse);
    }

    Ok(())
}
