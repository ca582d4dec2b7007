//! Per-device state and lifecycle.
//!
//! A [`DeviceCtx`] is created at probe time, started (BAR enumeration and
//! mapping, chip detection, worker task, IRQ hookup) and stopped in the
//! reverse order. Every entry point of the driver takes the context
//! explicitly; there is no process-wide device singleton.

pub mod registry;
pub mod resources;

use std::sync::atomic::{AtomicBool, AtomicU32, AtomicU8, Ordering};
use std::sync::mpsc::{self, Sender};
use std::sync::{Arc, Weak};
use std::thread::JoinHandle;
use std::time::Duration;

use log::{debug, error, info};

use crate::chip::{ChipIo, ChipOps};
use crate::dma::DmaChannel;
use crate::hal::{DeviceRegs, HostApi, IrqHandle, IrqReturn, PciLocation};
use crate::intr::wait::WaitList;
use crate::intr::IntrCause;
use crate::pci;
use crate::status::{ApiStatus, CanFail};

use self::resources::{BarFlags, BarInfo, DmaBufferRec};

/// Wildcard sentinel for 8-bit query fields.
pub const IGNORE_FIELD_8: u8 = 0xFF;
/// Wildcard sentinel for 16-bit query fields.
pub const IGNORE_FIELD_16: u16 = 0xFFFF;

/// EEPROM offset used by the invert-and-restore probe.
const EEPROM_PROBE_OFFSET: u16 = 0x70;

/// Location and identity of one device.
///
/// Stored keys never carry the `IGNORE` sentinels; queries may.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub struct DeviceKey {
    pub bus: u8,
    pub slot: u8,
    pub function: u8,
    pub vendor: u16,
    pub device: u16,
    pub sub_vendor: u16,
    pub sub_device: u16,
    pub revision: u8,
    pub chip: u16,
    pub chip_revision: u8,

    /// Attach-order index of the device.
    pub device_number: u16,
}

impl DeviceKey {
    /// A query key with every field wildcarded.
    pub fn wildcard() -> Self {
        Self {
            bus: IGNORE_FIELD_8,
            slot: IGNORE_FIELD_8,
            function: IGNORE_FIELD_8,
            vendor: IGNORE_FIELD_16,
            device: IGNORE_FIELD_16,
            sub_vendor: IGNORE_FIELD_16,
            sub_device: IGNORE_FIELD_16,
            revision: IGNORE_FIELD_8,
            chip: IGNORE_FIELD_16,
            chip_revision: IGNORE_FIELD_8,
            device_number: 0,
        }
    }
}

/// Opaque identity of an open file, the unit of resource ownership.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct OwnerHandle(pub u64);

impl OwnerHandle {
    /// Owner of driver-internal allocations such as the common buffer.
    pub const DRIVER: OwnerHandle = OwnerHandle(0);
}

/// Start/stop state of a device.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[repr(u8)]
pub enum Lifecycle {
    Stopped = 0,
    Starting = 1,
    Started = 2,
    Stopping = 3,
}

impl Lifecycle {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => Lifecycle::Starting,
            2 => Lifecycle::Started,
            3 => Lifecycle::Stopping,
            _ => Lifecycle::Stopped,
        }
    }
}

/// Device power states, D0 through D3.
#[derive(Debug, Clone, Copy, PartialEq, Eq, PartialOrd, Ord)]
#[repr(u8)]
pub enum PowerState {
    D0 = 0,
    D1 = 1,
    D2 = 2,
    D3 = 3,
}

impl PowerState {
    fn from_u8(value: u8) -> Self {
        match value {
            1 => PowerState::D1,
            2 => PowerState::D2,
            3 => PowerState::D3,
            _ => PowerState::D0,
        }
    }
}

/// Lowest power state in which register access still works.
pub const MIN_WORKING_POWER_STATE: PowerState = PowerState::D2;

enum DpcMessage {
    Service,
    Shutdown,
}

struct DpcTask {
    tx: Sender<DpcMessage>,
    worker: JoinHandle<()>,
}

/// All state of one attached device.
pub struct DeviceCtx {
    host: Arc<dyn HostApi>,
    chip: ChipOps,
    name: String,
    location: PciLocation,
    irq_line: AtomicU8,

    key: spin::Mutex<DeviceKey>,
    lifecycle: AtomicU8,
    power_state: AtomicU8,

    bars: spin::Mutex<[BarInfo; 6]>,
    regs: spin::RwLock<Option<DeviceRegs>>,

    /// Synchronizes the interrupt control register with the ISR. Never held
    /// across a blocking call.
    isr_lock: spin::Mutex<()>,

    irq: spin::Mutex<Option<IrqHandle>>,

    /// Cause latched by the hard handler for the deferred stage.
    latched_cause: AtomicU32,
    deferred_pending: AtomicBool,
    dpc: spin::Mutex<Option<DpcTask>>,

    wait_list: WaitList,
    phys_mem: spin::Mutex<Vec<DmaBufferRec>>,
    channels: [spin::Mutex<DmaChannel>; 2],
}

impl DeviceCtx {
    /// Builds the context for a probed function.
    ///
    /// The device is left in the `Stopped` state; nothing is touched until
    /// [`DeviceCtx::start`].
    pub fn new(
        host: Arc<dyn HostApi>,
        chip: ChipOps,
        location: PciLocation,
        mut key: DeviceKey,
        device_number: u16,
    ) -> Arc<Self> {
        key.device_number = device_number;

        let name = format!("{}-{}", chip.profile().name, device_number);

        Arc::new(Self {
            host,
            chip,
            name,
            location,
            irq_line: AtomicU8::new(0),
            key: spin::Mutex::new(key),
            lifecycle: AtomicU8::new(Lifecycle::Stopped as u8),
            power_state: AtomicU8::new(PowerState::D0 as u8),
            bars: spin::Mutex::new(Default::default()),
            regs: spin::RwLock::new(None),
            isr_lock: spin::Mutex::new(()),
            irq: spin::Mutex::new(None),
            latched_cause: AtomicU32::new(0),
            deferred_pending: AtomicBool::new(false),
            dpc: spin::Mutex::new(None),
            wait_list: WaitList::new(),
            phys_mem: spin::Mutex::new(Vec::new()),
            channels: [
                spin::Mutex::new(DmaChannel::default()),
                spin::Mutex::new(DmaChannel::default()),
            ],
        })
    }

    // ---- accessors ----

    pub fn host(&self) -> &dyn HostApi {
        &*self.host
    }

    pub fn chip(&self) -> &ChipOps {
        &self.chip
    }

    pub fn name(&self) -> &str {
        &self.name
    }

    pub fn location(&self) -> PciLocation {
        self.location
    }

    pub fn key(&self) -> DeviceKey {
        *self.key.lock()
    }

    pub fn lifecycle(&self) -> Lifecycle {
        Lifecycle::from_u8(self.lifecycle.load(Ordering::SeqCst))
    }

    pub fn power_state(&self) -> PowerState {
        PowerState::from_u8(self.power_state.load(Ordering::SeqCst))
    }

    /// Records a power-state change. The core refuses register work below
    /// [`MIN_WORKING_POWER_STATE`] but drives no transitions itself.
    pub fn set_power_state(&self, state: PowerState) {
        self.power_state.store(state as u8, Ordering::SeqCst);
    }

    pub(crate) fn isr_lock(&self) -> &spin::Mutex<()> {
        &self.isr_lock
    }

    pub(crate) fn wait_list(&self) -> &WaitList {
        &self.wait_list
    }

    pub(crate) fn phys_mem(&self) -> &spin::Mutex<Vec<DmaBufferRec>> {
        &self.phys_mem
    }

    pub(crate) fn dma_channel(&self, channel: u8) -> &spin::Mutex<DmaChannel> {
        &self.channels[usize::from(channel)]
    }

    pub(crate) fn bars(&self) -> &spin::Mutex<[BarInfo; 6]> {
        &self.bars
    }

    /// Register window, or `None` while the device is stopped.
    pub(crate) fn try_regs(&self) -> Option<DeviceRegs> {
        self.regs.read().clone()
    }

    /// Register window, failing when BAR 0 is not mapped.
    pub(crate) fn regs(&self) -> Result<DeviceRegs, ApiStatus> {
        self.try_regs().ok_or(ApiStatus::Failed)
    }

    pub(crate) fn chip_io<'a>(&'a self, regs: &'a DeviceRegs) -> ChipIo<'a> {
        ChipIo {
            regs,
            isr_lock: &self.isr_lock,
            host: &*self.host,
            loc: self.location,
        }
    }

    /// Properties of one BAR.
    pub fn bar_properties(&self, bar_index: u8) -> Result<resources::BarProperties, ApiStatus> {
        let bars = self.bars.lock();

        let bar = bars
            .get(usize::from(bar_index))
            .ok_or(ApiStatus::InvalidIndex)?;

        if bar.size == 0 {
            debug!(target: "plxcore::device", "BAR {} is disabled", bar_index);
        }

        Ok(bar.properties())
    }

    // ---- deferred-work plumbing ----

    pub(crate) fn latch_cause(&self, cause: IntrCause) {
        self.latched_cause.store(cause.bits(), Ordering::SeqCst);
    }

    pub(crate) fn take_latched_cause(&self) -> IntrCause {
        IntrCause::from_bits_truncate(self.latched_cause.swap(0, Ordering::SeqCst))
    }

    /// Queues the deferred stage on the device worker. The worker owns a
    /// single queue slot: one `Service` message services every cause latched
    /// up to the moment it runs.
    pub(crate) fn schedule_deferred(&self) {
        self.deferred_pending.store(true, Ordering::SeqCst);

        let dpc = self.dpc.lock();
        if let Some(task) = dpc.as_ref() {
            let _ = task.tx.send(DpcMessage::Service);
        }
    }

    pub(crate) fn clear_deferred_pending(&self) {
        self.deferred_pending.store(false, Ordering::SeqCst);
    }

    pub(crate) fn deferred_pending(&self) -> bool {
        self.deferred_pending.load(Ordering::SeqCst)
    }

    // ---- lifecycle ----

    /// Starts the device: enumerates, claims and maps the BARs, detects the
    /// chip, spawns the deferred worker and installs the interrupt handler.
    ///
    /// BAR 0 must map or the device cannot be started at all; its window is
    /// the only path to the device registers.
    pub fn start(self: &Arc<Self>) -> CanFail<ApiStatus> {
        if self.lifecycle() == Lifecycle::Started {
            return Ok(());
        }

        debug!(target: "plxcore::device", "start device {}", self.name);

        self.lifecycle
            .store(Lifecycle::Starting as u8, Ordering::SeqCst);

        if let Err(status) = self.map_bar_resources() {
            self.unmap_bar_resources();
            self.lifecycle
                .store(Lifecycle::Stopped as u8, Ordering::SeqCst);
            return Err(status);
        }

        let bar0_mapping = self.bars.lock()[0].mapping.clone();
        let Some(bar0_mapping) = bar0_mapping else {
            error!(
                target: "plxcore::device",
                "BAR 0 mapping is required for register access"
            );
            self.unmap_bar_resources();
            self.lifecycle
                .store(Lifecycle::Stopped as u8, Ordering::SeqCst);
            return Err(ApiStatus::Failed);
        };

        let regs = DeviceRegs::new(bar0_mapping);
        *self.regs.write() = Some(regs.clone());

        {
            let io = self.chip_io(&regs);
            let mut key = self.key.lock();
            self.chip.chip_type_detect(&io, &mut key);
        }

        // All sources off until the handler is in place.
        self.chip.interrupts_disable(&self.chip_io(&regs));

        self.spawn_worker();

        let line = self.host.irq_line(self.location);
        self.irq_line.store(line, Ordering::SeqCst);
        if line == 0 {
            debug!(target: "plxcore::device", "device not using a PCI interrupt resource");
        } else {
            let weak: Weak<DeviceCtx> = Arc::downgrade(self);
            let handler: crate::hal::IrqHandler = Arc::new(move || match weak.upgrade() {
                Some(ctx) => crate::intr::isr(&ctx),
                None => IrqReturn::NotOurs,
            });

            match self.host.request_irq(line, handler) {
                Ok(handle) => {
                    debug!(target: "plxcore::device", "installed ISR for interrupt {}", line);
                    *self.irq.lock() = Some(handle);
                    self.chip.interrupts_enable(&self.chip_io(&regs));
                }
                Err(_) => {
                    error!(target: "plxcore::device", "unable to install ISR");
                }
            }
        }

        self.lifecycle
            .store(Lifecycle::Started as u8, Ordering::SeqCst);

        info!(target: "plxcore::device", "started device {}", self.name);

        Ok(())
    }

    /// Stops the device, draining in-flight deferred work before resources
    /// are released.
    pub fn stop(&self) {
        if self.lifecycle() == Lifecycle::Stopped {
            return;
        }

        // The ISR checks this before scheduling new deferred work.
        self.lifecycle
            .store(Lifecycle::Stopping as u8, Ordering::SeqCst);

        if self.deferred_pending() {
            debug!(
                target: "plxcore::device",
                "deferred handler pending, waiting for it to complete"
            );

            let mut rounds = 5;
            while self.deferred_pending() && rounds != 0 {
                std::thread::sleep(Duration::from_millis(100));
                rounds -= 1;
            }
        }

        debug!(target: "plxcore::device", "release device resources");

        let irq = self.irq.lock().take();
        if let Some(handle) = irq {
            if let Some(regs) = self.try_regs() {
                self.chip.interrupts_disable(&self.chip_io(&regs));
            }

            debug!(
                target: "plxcore::device",
                "remove ISR (IRQ = {})",
                self.irq_line.load(Ordering::SeqCst)
            );
            self.host.free_irq(handle);
        }

        // Stop the worker; queued service messages drain first and abort
        // harmlessly against the `Stopping` state.
        let dpc = self.dpc.lock().take();
        if let Some(task) = dpc {
            let _ = task.tx.send(DpcMessage::Shutdown);
            let _ = task.worker.join();
        }

        // No register access past this point.
        *self.regs.write() = None;
        self.unmap_bar_resources();

        self.lifecycle
            .store(Lifecycle::Stopped as u8, Ordering::SeqCst);

        info!(target: "plxcore::device", "stopped device {}", self.name);
    }

    fn spawn_worker(self: &Arc<Self>) {
        let (tx, rx) = mpsc::channel();
        let ctx = Arc::clone(self);

        let worker = std::thread::spawn(move || {
            while let Ok(message) = rx.recv() {
                match message {
                    DpcMessage::Service => crate::intr::deferred_service(&ctx),
                    DpcMessage::Shutdown => break,
                }
            }
        });

        *self.dpc.lock() = Some(DpcTask { tx, worker });
    }

    /// Enumerates the six BARs, claims their regions and maps memory BARs.
    fn map_bar_resources(&self) -> CanFail<ApiStatus> {
        let mut bars = self.bars.lock();

        for index in 0..6 {
            let Some(resource) = self.host.bar_resource(self.location, index) else {
                continue;
            };

            if resource.phys_addr == 0 || resource.size == 0 {
                continue;
            }

            let mut bar = BarInfo {
                phys_addr: resource.phys_addr,
                size: resource.size,
                flags: BarFlags::PROBED,
                mapping: None,
            };

            if resource.io {
                bar.phys_addr &= !0x3;
                bar.flags |= BarFlags::IO;

                if self.host.claim_region(bar.phys_addr, bar.size, true) {
                    bar.flags |= BarFlags::CLAIMED;
                }
            } else {
                bar.phys_addr &= !0xF;
                bar.flags |= BarFlags::MEM;
                bar.flags |= if resource.bit64 {
                    BarFlags::BIT_64
                } else {
                    BarFlags::BIT_32
                };
                if resource.prefetchable {
                    bar.flags |= BarFlags::PREFETCHABLE;
                }

                if !self.host.claim_region(bar.phys_addr, bar.size, false) {
                    error!(target: "plxcore::device", "request of BAR {} region failed", index);
                    return Err(ApiStatus::InsufficientResources);
                }
                bar.flags |= BarFlags::CLAIMED;

                match self.host.map_bar(bar.phys_addr, bar.size) {
                    Some(mapping) => bar.mapping = Some(mapping),
                    None => {
                        error!(target: "plxcore::device", "mapping of BAR {} failed", index);
                        bars[index] = bar;
                        return Err(ApiStatus::InsufficientResources);
                    }
                }
            }

            debug!(
                target: "plxcore::device",
                "PCI BAR {}: phys = {:#010x}    size = {:#x}    flags = {:?}",
                index, bar.phys_addr, bar.size, bar.flags
            );

            bars[index] = bar;
        }

        Ok(())
    }

    /// Unmaps and releases every BAR, in reverse enumeration order.
    fn unmap_bar_resources(&self) {
        let mut bars = self.bars.lock();

        for index in (0..6).rev() {
            let bar = &mut bars[index];

            if bar.phys_addr == 0 {
                continue;
            }

            if bar.flags.contains(BarFlags::MEM) {
                if bar.mapping.take().is_some() {
                    debug!(target: "plxcore::device", "unmap BAR {} from kernel space", index);
                }

                if bar.flags.contains(BarFlags::CLAIMED) {
                    self.host.release_region(bar.phys_addr, bar.size, false);
                }
            } else if bar.flags.contains(BarFlags::CLAIMED) {
                self.host.release_region(bar.phys_addr, bar.size, true);
            }

            *bar = BarInfo::default();
        }
    }

    // ---- per-owner teardown ----

    /// Releases everything `owner` holds on this device: its wait objects,
    /// its DMA channels, then its coherent buffers, in that order.
    pub fn owner_cleanup(&self, owner: OwnerHandle) {
        let _ = self.wait_list.cancel(owner, None);
        crate::dma::channel_cleanup(self, owner);
        resources::free_all_by_owner(self, owner);
    }

    // ---- EEPROM operations ----

    /// Whether the chip reports a valid EEPROM attached.
    pub fn eeprom_present(&self) -> Result<bool, ApiStatus> {
        let regs = self.regs()?;
        Ok(self.chip.eeprom_present(&regs))
    }

    /// Probes for an EEPROM by inverting a word and reading it back. The
    /// original value is restored when the probe succeeds.
    pub fn eeprom_probe(&self) -> Result<bool, ApiStatus> {
        let regs = self.regs()?;
        let io = self.chip_io(&regs);

        debug!(
            target: "plxcore::device",
            "probe EEPROM at offset {:02x}h", EEPROM_PROBE_OFFSET
        );

        let original = self.chip.eeprom_read_u32(&io, EEPROM_PROBE_OFFSET)?;

        let inverse = !original;
        self.chip
            .eeprom_write_u32(&io, EEPROM_PROBE_OFFSET, inverse)?;

        let read_back = self.chip.eeprom_read_u32(&io, EEPROM_PROBE_OFFSET)?;

        if read_back == inverse {
            debug!(target: "plxcore::device", "probe detected an EEPROM present");
            self.chip
                .eeprom_write_u32(&io, EEPROM_PROBE_OFFSET, original)?;
            Ok(true)
        } else {
            debug!(target: "plxcore::device", "probe did not detect an EEPROM");
            Ok(false)
        }
    }

    /// Reads a 32-bit EEPROM word at a 32-bit aligned offset.
    pub fn eeprom_read(&self, offset: u16) -> Result<u32, ApiStatus> {
        if offset & 0x3 != 0 {
            return Err(ApiStatus::InvalidOffset);
        }

        let regs = self.regs()?;
        self.chip.eeprom_read_u32(&self.chip_io(&regs), offset)
    }

    /// Writes a 32-bit EEPROM word at a 32-bit aligned offset.
    pub fn eeprom_write(&self, offset: u16, value: u32) -> CanFail<ApiStatus> {
        if offset & 0x3 != 0 {
            return Err(ApiStatus::InvalidOffset);
        }

        let regs = self.regs()?;
        self.chip
            .eeprom_write_u32(&self.chip_io(&regs), offset, value)
    }

    /// Reads a 16-bit EEPROM word, composed over the 32-bit primitive for
    /// parts without native 16-bit access.
    pub fn eeprom_read_16(&self, offset: u16) -> Result<u16, ApiStatus> {
        if offset & 0x1 != 0 {
            return Err(ApiStatus::InvalidOffset);
        }

        let word = self.eeprom_read(offset & !0x3)?;

        Ok(if offset & 0x3 != 0 {
            (word >> 16) as u16
        } else {
            word as u16
        })
    }

    /// Writes a 16-bit EEPROM word by read-modify-write of the containing
    /// 32-bit word.
    pub fn eeprom_write_16(&self, offset: u16, value: u16) -> CanFail<ApiStatus> {
        if offset & 0x1 != 0 {
            return Err(ApiStatus::InvalidOffset);
        }

        let word = self.eeprom_read(offset & !0x3)?;

        let word = if offset & 0x3 != 0 {
            (u32::from(value) << 16) | (word & 0xFFFF)
        } else {
            u32::from(value) | (word & 0xFFFF_0000)
        };

        self.eeprom_write(offset & !0x3, word)
    }

    // ---- VPD operations ----

    pub fn vpd_read(&self, offset: u16) -> Result<u32, ApiStatus> {
        let regs = self.regs()?;
        crate::vpd::read(
            &*self.host,
            self.location,
            &regs,
            self.chip.regs_map().eeprom_ctrl,
            offset,
        )
    }

    pub fn vpd_write(&self, offset: u16, value: u32) -> CanFail<ApiStatus> {
        let regs = self.regs()?;
        crate::vpd::write(
            &*self.host,
            self.location,
            &regs,
            self.chip.regs_map().eeprom_ctrl,
            offset,
            value,
        )
    }

    /// Reads the device's PCI configuration header fields into a key.
    pub(crate) fn read_identity(
        host: &dyn HostApi,
        loc: PciLocation,
    ) -> Result<DeviceKey, ApiStatus> {
        let id = pci::cfg_read(host, loc, 0x00)?;
        let class_rev = pci::cfg_read(host, loc, 0x08)?;
        let sub_id = pci::cfg_read(host, loc, 0x2C)?;

        Ok(DeviceKey {
            bus: loc.bus,
            slot: loc.slot,
            function: loc.function,
            vendor: (id & 0xFFFF) as u16,
            device: (id >> 16) as u16,
            sub_vendor: (sub_id & 0xFFFF) as u16,
            sub_device: (sub_id >> 16) as u16,
            revision: (class_rev & 0xFF) as u8,
            chip: 0,
            chip_revision: 0,
            device_number: 0,
        })
    }
}

impl Drop for DeviceCtx {
    fn drop(&mut self) {
        // Normal teardown already stopped the device; this is the backstop
        // for a context dropped without remove().
        if self.lifecycle() != Lifecycle::Stopped {
            self.stop();
        }
    }
}
