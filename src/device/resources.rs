//! Per-device resource arena.
//!
//! BAR bookkeeping, the owner-tagged DMA-coherent buffer list, the
//! ISR-synchronized register read-modify-write, windowed BAR-space
//! transfers and raw I/O-port transfers.

use std::sync::Arc;

use bitflags::bitflags;
use log::debug;

use crate::device::{DeviceCtx, OwnerHandle};
use crate::hal::{AccessWidth, CoherentBuffer, DeviceRegs, HostApi, MmioSpace};
use crate::status::{ApiStatus, CanFail};

bitflags! {
    /// Classification of one BAR.
    #[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
    pub struct BarFlags: u32 {
        const IO           = 1 << 0;
        const MEM          = 1 << 1;
        const BIT_32       = 1 << 2;
        const BIT_64       = 1 << 3;
        const PREFETCHABLE = 1 << 4;
        const PROBED       = 1 << 5;
        const CLAIMED      = 1 << 6;
    }
}

/// State of one BAR, including its kernel mapping when claimed.
#[derive(Clone, Default)]
pub struct BarInfo {
    pub phys_addr: u64,
    pub size: u64,
    pub flags: BarFlags,
    pub(crate) mapping: Option<Arc<dyn MmioSpace>>,
}

/// The copyable subset of [`BarInfo`] returned to user space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct BarProperties {
    pub phys_addr: u64,
    pub size: u64,
    pub flags: BarFlags,
}

impl BarInfo {
    pub fn properties(&self) -> BarProperties {
        BarProperties {
            phys_addr: self.phys_addr,
            size: self.size,
            flags: self.flags,
        }
    }
}

/// One tracked DMA-coherent allocation.
pub(crate) struct DmaBufferRec {
    pub owner: OwnerHandle,
    pub buffer: CoherentBuffer,
}

/// Buffer description returned to user space.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct PhysMemInfo {
    pub user_addr: u64,
    pub cpu_physical: u64,
    pub bus_physical: u64,
    pub size: u32,
}

/// Modifies a device register with the ISR excluded.
///
/// This is the only path that may change the interrupt control register:
/// the ISR decodes against the same register, so the read-modify-write has
/// to happen under the ISR lock.
pub fn synchronized_modify(
    isr_lock: &spin::Mutex<()>,
    regs: &DeviceRegs,
    offset: u16,
    bits_to_set: u32,
    bits_to_clear: u32,
) {
    let guard = isr_lock.lock();

    let mut value = regs.read(offset);
    value |= bits_to_set;
    value &= !bits_to_clear;
    regs.write(offset, value);

    drop(guard);
}

/// Reads a device register through the BAR 0 mapping.
pub fn register_read(ctx: &DeviceCtx, offset: u32) -> Result<u32, ApiStatus> {
    let max_offset = u32::from(ctx.chip().regs_map().max_offset);

    if offset & 0x3 != 0 || offset >= max_offset {
        debug!(target: "plxcore::device", "invalid register offset ({:#x})", offset);
        return Err(ApiStatus::InvalidOffset);
    }

    Ok(ctx.regs()?.read(offset as u16))
}

/// Writes a device register through the BAR 0 mapping.
pub fn register_write(ctx: &DeviceCtx, offset: u32, value: u32) -> CanFail<ApiStatus> {
    let max_offset = u32::from(ctx.chip().regs_map().max_offset);

    if offset & 0x3 != 0 || offset >= max_offset {
        debug!(target: "plxcore::device", "invalid register offset ({:#x})", offset);
        return Err(ApiStatus::InvalidOffset);
    }

    ctx.regs()?.write(offset as u16, value);

    Ok(())
}

/// Attempts a coherent allocation, optionally shrinking the request by
/// roughly ten percent per failure until the page-size floor.
pub(crate) fn alloc_coherent_shrinking(
    host: &dyn HostApi,
    mut size: u32,
    smaller_ok: bool,
) -> Option<CoherentBuffer> {
    let decrement = size / 10;

    debug!(
        target: "plxcore::device",
        "attempt to allocate physical memory ({} Kb)", size >> 10
    );

    loop {
        if let Some(buffer) = host.alloc_coherent(size) {
            return Some(buffer);
        }

        if smaller_ok && size > host.page_size() {
            size = size.saturating_sub(decrement).max(host.page_size());
        } else {
            debug!(target: "plxcore::device", "physical memory allocation failed");
            return None;
        }
    }
}

/// Allocates an owner-tagged DMA-coherent buffer and tracks it on the
/// device's buffer list.
pub fn alloc_physical(
    ctx: &DeviceCtx,
    size: u32,
    smaller_ok: bool,
    owner: OwnerHandle,
) -> Result<PhysMemInfo, ApiStatus> {
    // A zero-size request is valid; it exists so a common buffer of size
    // zero can be "allocated" during driver init.
    if size == 0 {
        return Ok(PhysMemInfo::default());
    }

    let buffer = alloc_coherent_shrinking(ctx.host(), size, smaller_ok)
        .ok_or(ApiStatus::InsufficientResources)?;

    let info = PhysMemInfo {
        user_addr: 0,
        cpu_physical: buffer.cpu_addr,
        bus_physical: buffer.bus_addr,
        size: buffer.size,
    };

    debug!(
        target: "plxcore::device",
        "allocated physical memory: cpu = {:#010x}    bus = {:#010x}    {} bytes",
        info.cpu_physical, info.bus_physical, info.size
    );

    ctx.phys_mem().lock().push(DmaBufferRec { owner, buffer });

    Ok(info)
}

/// Frees a tracked buffer identified by its bus address.
pub fn free_physical(ctx: &DeviceCtx, bus_physical: u64) -> CanFail<ApiStatus> {
    let record = {
        let mut list = ctx.phys_mem().lock();

        let position = list
            .iter()
            .position(|record| record.buffer.bus_addr == bus_physical);

        match position {
            Some(position) => list.remove(position),
            None => {
                debug!(target: "plxcore::device", "buffer object not found in list");
                return Err(ApiStatus::InvalidData);
            }
        }
    };

    ctx.host().free_coherent(record.buffer);

    Ok(())
}

/// Frees every tracked buffer belonging to `owner`; the per-owner teardown
/// path.
pub fn free_all_by_owner(ctx: &DeviceCtx, owner: OwnerHandle) {
    loop {
        let record = {
            let mut list = ctx.phys_mem().lock();

            match list.iter().position(|record| record.owner == owner) {
                Some(position) => list.remove(position),
                None => return,
            }
        };

        ctx.host().free_coherent(record.buffer);
    }
}

/// Reads or writes across a BAR window.
///
/// With `remap` set, `local_addr` addresses the local-bus space behind the
/// BAR: the window's remap register is saved, stepped across the request
/// one window at a time and restored on exit. Without it, `local_addr` is a
/// plain offset into the BAR and must fit entirely inside it.
pub fn bar_transfer(
    ctx: &DeviceCtx,
    bar_index: u8,
    local_addr: u32,
    data: &mut [u8],
    width: AccessWidth,
    remap: bool,
    read: bool,
) -> CanFail<ApiStatus> {
    debug!(
        target: "plxcore::device",
        "{} PCI BAR {} ({} = {:#010x}    {} bytes)",
        if read { "read from" } else { "write to" },
        bar_index,
        if remap { "local addr" } else { "offset" },
        local_addr,
        data.len()
    );

    let byte_count = data.len() as u32;

    match width {
        AccessWidth::Bit8 => {}
        AccessWidth::Bit16 => {
            if local_addr & 0x1 != 0 {
                return Err(ApiStatus::InvalidAddress);
            }
            if byte_count & 0x1 != 0 {
                return Err(ApiStatus::InvalidSize);
            }
        }
        AccessWidth::Bit32 => {
            if local_addr & 0x3 != 0 {
                return Err(ApiStatus::InvalidAddress);
            }
            if byte_count & 0x3 != 0 {
                return Err(ApiStatus::InvalidSize);
            }
        }
    }

    let regs = ctx.regs()?;

    let Some(remap_offset) = ctx.chip().bar_remap_offset(&regs, bar_index) else {
        return Err(ApiStatus::InvalidAddress);
    };

    let (space, bar_size) = {
        let bars = ctx.bars().lock();
        let bar = bars
            .get(usize::from(bar_index))
            .ok_or(ApiStatus::InvalidIndex)?;

        if bar.flags.contains(BarFlags::IO) {
            debug!(target: "plxcore::device", "I/O spaces not supported by this function");
            return Err(ApiStatus::InvalidAddress);
        }

        let Some(space) = bar.mapping.clone() else {
            debug!(target: "plxcore::device", "no kernel mapping for PCI BAR {}", bar_index);
            return Err(ApiStatus::InvalidAddress);
        };

        (space, bar.size as u32)
    };

    let remap_original = if remap {
        regs.read(remap_offset)
    } else {
        match local_addr.checked_add(byte_count) {
            Some(end) if end <= bar_size => {}
            _ => {
                debug!(target: "plxcore::device", "requested area exceeds space range");
                return Err(ApiStatus::InvalidSize);
            }
        }
        0
    };

    // Upper bits select the window, lower bits the offset inside it.
    let window_mask = !(bar_size - 1);

    let mut local_addr = local_addr;
    let mut cursor = 0usize;
    let mut remaining = byte_count;

    while remaining != 0 {
        if remap {
            let mut window = remap_original & !window_mask;
            window |= local_addr & window_mask;
            regs.write(remap_offset, window);
        }

        let space_offset = local_addr & !window_mask;
        let chunk = remaining.min(bar_size - space_offset);

        let slice = &mut data[cursor..cursor + chunk as usize];
        if read {
            copy_from_space(&space, u64::from(space_offset), slice, width);
        } else {
            copy_to_space(&space, u64::from(space_offset), slice, width);
        }

        cursor += chunk as usize;
        local_addr += chunk;
        remaining -= chunk;
    }

    if remap {
        regs.write(remap_offset, remap_original);
    }

    Ok(())
}

/// Reads or writes an I/O port range with the requested stride.
pub fn io_port_transfer(
    host: &dyn HostApi,
    port: u64,
    data: &mut [u8],
    width: AccessWidth,
    read: bool,
) -> CanFail<ApiStatus> {
    if data.is_empty() {
        return Err(ApiStatus::NullParam);
    }

    match width {
        AccessWidth::Bit8 => {}
        AccessWidth::Bit16 => {
            if port & 0x1 != 0 {
                debug!(target: "plxcore::device", "I/O port not aligned on 16-bit boundary");
                return Err(ApiStatus::InvalidAddress);
            }
            if data.len() & 0x1 != 0 {
                debug!(target: "plxcore::device", "byte count not aligned on 16-bit boundary");
                return Err(ApiStatus::InvalidSize);
            }
        }
        AccessWidth::Bit32 => {
            if port & 0x3 != 0 {
                debug!(target: "plxcore::device", "I/O port not aligned on 32-bit boundary");
                return Err(ApiStatus::InvalidAddress);
            }
            if data.len() & 0x3 != 0 {
                debug!(target: "plxcore::device", "byte count not aligned on 32-bit boundary");
                return Err(ApiStatus::InvalidSize);
            }
        }
    }

    let stride = width.bytes() as usize;

    for chunk in data.chunks_exact_mut(stride) {
        if read {
            let value = host.io_read(port, width);
            chunk.copy_from_slice(&value.to_le_bytes()[..stride]);
        } else {
            let mut raw = [0u8; 4];
            raw[..stride].copy_from_slice(chunk);
            host.io_write(port, width, u32::from_le_bytes(raw));
        }
    }

    Ok(())
}

fn copy_from_space(space: &Arc<dyn MmioSpace>, offset: u64, data: &mut [u8], width: AccessWidth) {
    match width {
        AccessWidth::Bit8 => {
            for (i, byte) in data.iter_mut().enumerate() {
                *byte = space.read8(offset + i as u64);
            }
        }
        AccessWidth::Bit16 => {
            for (i, chunk) in data.chunks_exact_mut(2).enumerate() {
                chunk.copy_from_slice(&space.read16(offset + (i as u64) * 2).to_le_bytes());
            }
        }
        AccessWidth::Bit32 => {
            for (i, chunk) in data.chunks_exact_mut(4).enumerate() {
                chunk.copy_from_slice(&space.read32(offset + (i as u64) * 4).to_le_bytes());
            }
        }
    }
}

fn copy_to_space(space: &Arc<dyn MmioSpace>, offset: u64, data: &[u8], width: AccessWidth) {
    match width {
        AccessWidth::Bit8 => {
            for (i, byte) in data.iter().enumerate() {
                space.write8(offset + i as u64, *byte);
            }
        }
        AccessWidth::Bit16 => {
            for (i, chunk) in data.chunks_exact(2).enumerate() {
                let mut raw = [0u8; 2];
                raw.copy_from_slice(chunk);
                space.write16(offset + (i as u64) * 2, u16::from_le_bytes(raw));
            }
        }
        AccessWidth::Bit32 => {
            for (i, chunk) in data.chunks_exact(4).enumerate() {
                let mut raw = [0u8; 4];
                raw.copy_from_slice(chunk);
                space.write32(offset + (i as u64) * 4, u32::from_le_bytes(raw));
            }
        }
    }
}
