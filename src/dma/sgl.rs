//! Scatter-gather list construction and completion.
//!
//! A user buffer is page-locked and described by a chain of four-word
//! descriptors living in a DMA-coherent buffer the channel keeps around
//! between transfers. One descriptor covers one page (or the partial first
//! and last pages); the chain terminates with the end-of-chain bit instead
//! of a next-descriptor address.
//!
//! Descriptor words are stored little-endian regardless of host byte order,
//! because the chip fetches them over the bus as raw memory.
//!
//! The build runs without the channel spinlock held: page locking and the
//! coherent allocation may block, and the `sgl_pending` claim already
//! excludes competing submitters. The caller commits the result into the
//! channel record under the lock afterwards.

use bytemuck::{Pod, Zeroable};
use log::debug;

use crate::chip::regs::{
    DMA_DESC_BIT_END_OF_CHAIN, DMA_DESC_BIT_IN_PCI_SPACE, DMA_DESC_BIT_LOCAL_TO_PCI,
};
use crate::device::DeviceCtx;
use crate::dma::{DmaChannel, DmaParams, DmaTransferDirection};
use crate::hal::{CoherentBuffer, DmaDirection, PageHandle};
use crate::status::ApiStatus;

/// One 32-bit-address SGL descriptor, as the chip fetches it.
///
/// A future dual-address variant doubles this to eight words; nothing else
/// in the build protocol changes.
#[derive(Debug, Clone, Copy, Pod, Zeroable)]
#[repr(C)]
pub(crate) struct DmaDescriptor {
    pub pci_low: u32,
    pub local_addr: u32,
    pub count: u32,
    pub next: u32,
}

/// Descriptor size in bytes, which is also the alignment the hardware
/// requires of the chain head.
pub(crate) const DESCRIPTOR_SIZE: u32 = core::mem::size_of::<DmaDescriptor>() as u32;

/// Result of a successful SGL build, to be committed into the channel
/// record under its lock.
pub(crate) struct SglBuild {
    pub head_bus: u32,
    pub pages: Vec<PageHandle>,
    pub descriptor_count: u32,
    pub initial_offset: u32,
    pub total_size: u32,
    pub direction: DmaDirection,
    pub buffer: CoherentBuffer,
}

/// Number of pages spanned by `[user_va, user_va + byte_count)`.
pub(crate) fn page_span(user_va: u64, byte_count: u32, page_size: u32) -> u32 {
    let mut offset = (user_va & u64::from(page_size - 1)) as u32;
    let mut remaining = byte_count;
    let mut pages = 0;

    while remaining != 0 {
        pages += 1;

        if remaining <= page_size - offset {
            remaining = 0;
        } else {
            remaining -= page_size - offset;
        }

        offset = 0;
    }

    pages
}

/// Page-locks the user buffer and builds its SGL.
///
/// `existing` is the channel's persistent descriptor buffer; it is re-used
/// when large enough and replaced otherwise. On failure the partial page
/// acquisition has been rolled back and the buffer (still valid, possibly
/// `None`) is handed back alongside the status.
pub(crate) fn lock_buffer_and_build(
    ctx: &DeviceCtx,
    params: &DmaParams,
    const_local_addr: bool,
    existing: Option<CoherentBuffer>,
) -> Result<SglBuild, (ApiStatus, Option<CoherentBuffer>)> {
    let host = ctx.host();
    let page_size = host.page_size();

    debug!(
        target: "plxcore::dma",
        "building SGL descriptors: va = {:#x}    local = {:#x}    {} bytes    {:?}",
        params.user_va, params.local_addr, params.byte_count, params.direction
    );

    let initial_offset = (params.user_va & u64::from(page_size - 1)) as u32;

    let total_pages = page_span(params.user_va, params.byte_count, page_size);
    if total_pages == 0 {
        return Err((ApiStatus::InvalidSize, existing));
    }

    // Local-to-PCI means the device writes host memory, so the pages must
    // be locked for writing.
    let direction = match params.direction {
        DmaTransferDirection::LocalToPci => DmaDirection::FromDevice,
        DmaTransferDirection::PciToLocal => DmaDirection::ToDevice,
    };
    let for_write = direction == DmaDirection::FromDevice;

    let pages = match host.lock_user_pages(params.user_va, total_pages as usize, for_write) {
        Ok(pages) => pages,
        Err(locked) => {
            debug!(
                target: "plxcore::dma",
                "only able to lock {} of {} user pages", locked, total_pages
            );
            return Err((ApiStatus::DmaSglPagesLockError, existing));
        }
    };

    debug!(target: "plxcore::dma", "page-locked {} user buffer pages", total_pages);

    // Size the descriptor buffer with one extra descriptor of slop so the
    // chain head can be aligned up to a descriptor boundary.
    let sgl_size = total_pages * DESCRIPTOR_SIZE + DESCRIPTOR_SIZE;

    let buffer = match existing {
        Some(buffer) if buffer.size >= sgl_size => {
            debug!(target: "plxcore::dma", "re-using previously allocated SGL descriptor buffer");
            buffer
        }
        other => {
            if let Some(old) = other {
                debug!(
                    target: "plxcore::dma",
                    "releasing previously allocated SGL descriptor buffer"
                );
                host.free_coherent(old);
            }

            match host.alloc_coherent(sgl_size) {
                Some(buffer) => buffer,
                None => {
                    debug!(
                        target: "plxcore::dma",
                        "unable to allocate {} bytes for {} SGL descriptors",
                        sgl_size, total_pages
                    );
                    release_pages(ctx, &pages);
                    return Err((ApiStatus::InsufficientResources, None));
                }
            }
        }
    };

    // Align the chain head, in bus space and within the buffer alike.
    let head_bus = (buffer.bus_addr as u32 + (DESCRIPTOR_SIZE - 1)) & !(DESCRIPTOR_SIZE - 1);
    let head_offset = u64::from(head_bus) - buffer.bus_addr;

    debug!(
        target: "plxcore::dma",
        "building SGL at {:#010x} ({} descriptors)", head_bus, total_pages
    );

    let dir_bit = if direction == DmaDirection::FromDevice {
        DMA_DESC_BIT_LOCAL_TO_PCI
    } else {
        0
    };

    let mut local_addr = params.local_addr;
    let mut offset = initial_offset;
    let mut remaining = params.byte_count;
    let mut next_bus = head_bus;

    for index in 0..total_pages {
        let block_size = remaining.min(page_size - offset);

        let bus_addr = host.dma_map_page(pages[index as usize], offset, block_size, direction);

        remaining -= block_size;

        let next = if remaining == 0 {
            dir_bit | DMA_DESC_BIT_END_OF_CHAIN | DMA_DESC_BIT_IN_PCI_SPACE
        } else {
            next_bus += DESCRIPTOR_SIZE;
            next_bus | dir_bit | DMA_DESC_BIT_IN_PCI_SPACE
        };

        let descriptor = DmaDescriptor {
            pci_low: (bus_addr as u32).to_le(),
            local_addr: local_addr.to_le(),
            count: block_size.to_le(),
            next: next.to_le(),
        };

        buffer.mem.write_bytes(
            head_offset + u64::from(index * DESCRIPTOR_SIZE),
            bytemuck::bytes_of(&descriptor),
        );

        if remaining != 0 {
            // A constant local address is used for FIFO-style peripherals.
            if !const_local_addr {
                local_addr += block_size;
            }
            offset = 0;
        }
    }

    Ok(SglBuild {
        head_bus,
        pages,
        descriptor_count: total_pages,
        initial_offset,
        total_size: params.byte_count,
        direction,
        buffer,
    })
}

/// Completion cleanup after an SGL transfer.
///
/// Walks the descriptor chain to recover each page's bus mapping, unmaps
/// and releases the pages, and clears the pending flag. Pages the device
/// wrote are marked dirty unless they are reserved pages. Running this
/// twice for one transfer is harmless because the pending flag is cleared
/// first time through.
pub(crate) fn transfer_complete(ctx: &DeviceCtx, channel: &mut DmaChannel) {
    if !channel.sgl_pending {
        debug!(target: "plxcore::dma", "no pending SGL DMA to complete");
        return;
    }

    debug!(target: "plxcore::dma", "unlocking user buffer used for SGL DMA transfer");

    let host = ctx.host();

    if let Some(buffer) = channel.sgl_buffer.as_ref() {
        let head_bus = (buffer.bus_addr as u32 + (DESCRIPTOR_SIZE - 1)) & !(DESCRIPTOR_SIZE - 1);
        let head_offset = u64::from(head_bus) - buffer.bus_addr;

        for index in 0..channel.descriptor_count {
            let mut raw = [0u8; DESCRIPTOR_SIZE as usize];
            buffer
                .mem
                .read_bytes(head_offset + u64::from(index * DESCRIPTOR_SIZE), &mut raw);

            let descriptor: DmaDescriptor = bytemuck::pod_read_unaligned(&raw);
            let bus_addr = u32::from_le(descriptor.pci_low);
            let block_size = u32::from_le(descriptor.count);

            host.dma_unmap_page(u64::from(bus_addr), block_size, channel.direction);

            let page = channel.user_pages[index as usize];

            if channel.direction == DmaDirection::FromDevice && !host.page_reserved(page) {
                host.mark_page_dirty(page);
            }

            host.release_page(page);
        }
    }

    channel.user_pages = Vec::new();
    channel.descriptor_count = 0;
    channel.sgl_pending = false;
}

fn release_pages(ctx: &DeviceCtx, pages: &[PageHandle]) {
    for page in pages {
        ctx.host().release_page(*page);
    }
}
