//! Character-device surface: open/close, mmap and the control fan-out.
//!
//! The [`Driver`] owns the device registry, the table of open files and the
//! driver-wide common buffer. One minor number per device in attach order,
//! plus a reserved management node that only answers driver-wide queries.
//! The control entry is a thin fan-out: it decodes the shared parameter
//! record and calls into the subsystems.

use std::sync::atomic::{AtomicU64, Ordering};
use std::sync::Arc;

use hashbrown::HashMap;
use log::debug;

use crate::chip::{ChipOps, ChipProfile};
use crate::device::registry::DeviceRegistry;
use crate::device::resources::{self, BarFlags, BarProperties, PhysMemInfo};
use crate::device::{DeviceCtx, DeviceKey, OwnerHandle, MIN_WORKING_POWER_STATE};
use crate::dma::{self, DmaCommand, DmaParams, DmaProps};
use crate::hal::{AccessWidth, CoherentBuffer, HostApi, PciLocation};
use crate::intr::wait::WaitHandle;
use crate::intr::IntrSpec;
use crate::pci;
use crate::status::{ApiStatus, CanFail};

/// Driver interface version reported by `DriverVersion`.
pub const VERSION_MAJOR: u32 = 7;
pub const VERSION_MINOR: u32 = 10;

/// Minor number of the management node.
pub const MGMT_MINOR: u32 = 0xFF;

/// Opaque handle of an open file.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub struct FileHandle(u64);

impl FileHandle {
    fn owner(self) -> OwnerHandle {
        OwnerHandle(self.0)
    }
}

enum OpenTarget {
    Device(Arc<DeviceCtx>),
    Management,
}

/// PCI Express properties of a port. The 9000 family predates PCI Express,
/// so every device reports as a non-PCIe legacy endpoint.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PortProperties {
    pub non_pcie: bool,
    pub port_type: PortType,
    pub link_width: u8,
    pub link_speed: u8,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Default)]
pub enum PortType {
    #[default]
    LegacyEndpoint,
    Endpoint,
}

impl Default for PortProperties {
    fn default() -> Self {
        Self {
            non_pcie: true,
            port_type: PortType::LegacyEndpoint,
            link_width: 0,
            link_speed: 0,
        }
    }
}

/// What an `mmap` on a device node resolves to.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct MmapTarget {
    pub phys_addr: u64,

    /// Size of the backing region; zero means the caller's length rules.
    pub size: u64,

    /// Device memory must be mapped non-cacheable; system memory is
    /// ordinary cached RAM. Either way the region is pinned.
    pub device_memory: bool,
}

/// The shared parameter record every control operation carries.
///
/// `value` is generic storage whose meaning depends on the operation; the
/// typed fields carry the operation-specific payloads.
#[derive(Debug, Clone, Default)]
pub struct IoParams {
    pub status: ApiStatus,
    pub key: DeviceKey,
    pub value: [u64; 3],
    pub access: Option<AccessWidth>,
    pub intr: IntrSpec,
    pub dma: Option<DmaParams>,
    pub props: DmaProps,
    pub phys: PhysMemInfo,
    pub port: PortProperties,
    pub bar: BarProperties,
}

impl IoParams {
    pub fn new() -> Self {
        Self::default()
    }
}

/// Control operation selectors.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ControlOp {
    DriverVersion,
    CommonBufferProperties,
    DeviceFind,
    ChipTypeGet,
    ChipTypeSet,
    PortProperties,
    DeviceReset,
    PciRegRead,
    PciRegWrite,
    PciRegReadBypassOs,
    PciRegWriteBypassOs,
    RegisterRead,
    RegisterWrite,
    MappedRegisterRead,
    MappedRegisterWrite,
    MailboxRead,
    MailboxWrite,
    EepromPresent,
    EepromProbe,
    EepromCrcGet,
    EepromCrcUpdate,
    EepromReadByOffset,
    EepromWriteByOffset,
    EepromReadByOffset16,
    EepromWriteByOffset16,
    VpdRead,
    VpdWrite,
    IoPortRead,
    IoPortWrite,
    PhysicalMemAllocate,
    PhysicalMemFree,
    IntrEnable,
    IntrDisable,
    NotificationRegisterFor,
    NotificationWait,
    NotificationStatus,
    NotificationCancel,
    BarProperties,
    BarSpaceRead,
    BarSpaceWrite,
    DmaChannelOpen,
    DmaGetProperties,
    DmaSetProperties,
    DmaControl,
    DmaStatus,
    DmaTransferBlock,
    DmaTransferUserBuffer,
    DmaChannelClose,
}

impl ControlOp {
    /// Operations that touch device registers and therefore require the
    /// device to be powered at least to the minimum working state.
    fn needs_power(self) -> bool {
        matches!(
            self,
            ControlOp::ChipTypeGet
                | ControlOp::RegisterRead
                | ControlOp::RegisterWrite
                | ControlOp::MappedRegisterRead
                | ControlOp::MappedRegisterWrite
                | ControlOp::MailboxRead
                | ControlOp::MailboxWrite
                | ControlOp::EepromPresent
                | ControlOp::EepromProbe
                | ControlOp::EepromReadByOffset
                | ControlOp::EepromWriteByOffset
                | ControlOp::EepromReadByOffset16
                | ControlOp::EepromWriteByOffset16
                | ControlOp::IntrEnable
                | ControlOp::IntrDisable
                | ControlOp::BarSpaceRead
                | ControlOp::BarSpaceWrite
                | ControlOp::DmaChannelOpen
                | ControlOp::DmaGetProperties
                | ControlOp::DmaSetProperties
                | ControlOp::DmaControl
                | ControlOp::DmaStatus
                | ControlOp::DmaTransferBlock
                | ControlOp::DmaTransferUserBuffer
                | ControlOp::DmaChannelClose
        )
    }
}

struct OpenFile {
    target: OpenTarget,
}

/// The driver: registry, open-file table and common buffer.
pub struct Driver {
    host: Arc<dyn HostApi>,
    registry: DeviceRegistry,
    common_buffer: spin::Mutex<Option<CoherentBuffer>>,
    open_files: spin::Mutex<HashMap<u64, OpenFile>>,
    next_file: AtomicU64,
}

impl Driver {
    pub fn new(host: Arc<dyn HostApi>) -> Self {
        Self {
            host,
            registry: DeviceRegistry::new(),
            common_buffer: spin::Mutex::new(None),
            open_files: spin::Mutex::new(HashMap::new()),
            // Owner 0 is reserved for the driver itself.
            next_file: AtomicU64::new(1),
        }
    }

    pub fn registry(&self) -> &DeviceRegistry {
        &self.registry
    }

    // ---- probe / remove ----

    /// Binds a probed function: reads its identity, resolves the chip
    /// profile, starts the device and registers it.
    pub fn probe(&self, loc: PciLocation) -> Result<Arc<DeviceCtx>, ApiStatus> {
        let key = DeviceCtx::read_identity(&*self.host, loc)?;

        let profile = ChipProfile::match_device(key.vendor, key.device, key.sub_device)
            .ok_or(ApiStatus::UnsupportedFunction)?;

        let device_number = self.registry.len() as u16;
        let device = DeviceCtx::new(
            Arc::clone(&self.host),
            ChipOps::new(profile),
            loc,
            key,
            device_number,
        );

        debug!(target: "plxcore::dispatch", "created device {}", device.name());

        self.registry.add(Arc::clone(&device));

        if let Err(status) = device.start() {
            let _ = self.registry.remove(&device);
            return Err(status);
        }

        // The first DMA-capable device brings the driver common buffer to
        // life; smaller-than-requested is acceptable for it.
        if profile.common_buffer_size != 0 {
            let mut slot = self.common_buffer.lock();
            if slot.is_none() {
                *slot = resources::alloc_coherent_shrinking(
                    &*self.host,
                    profile.common_buffer_size,
                    true,
                );
            }
        }

        Ok(device)
    }

    /// Unbinds a device: stops it and drops it from the registry.
    pub fn remove(&self, device: &Arc<DeviceCtx>) -> CanFail<ApiStatus> {
        device.stop();
        self.registry.remove(device)
    }

    /// Releases every device and the common buffer. Called at driver
    /// unload.
    pub fn shutdown(&self) {
        for device in self.registry.snapshot() {
            let _ = self.remove(&device);
        }

        if let Some(buffer) = self.common_buffer.lock().take() {
            self.host.free_coherent(buffer);
        }
    }

    // ---- open / close / mmap ----

    /// Opens a device node (minor = attach index) or the management node.
    pub fn open(&self, minor: u32) -> Result<FileHandle, ApiStatus> {
        let target = if minor == MGMT_MINOR {
            debug!(target: "plxcore::dispatch", "open management interface");
            OpenTarget::Management
        } else {
            let device = self
                .registry
                .get(minor as usize)
                .ok_or(ApiStatus::InvalidIndex)?;

            debug!(target: "plxcore::dispatch", "open device ({})", device.name());
            OpenTarget::Device(device)
        };

        let handle = FileHandle(self.next_file.fetch_add(1, Ordering::Relaxed));
        self.open_files
            .lock()
            .insert(handle.0, OpenFile { target });

        Ok(handle)
    }

    /// Closes an open file, releasing everything it owns.
    pub fn close(&self, handle: FileHandle) -> CanFail<ApiStatus> {
        let file = self
            .open_files
            .lock()
            .remove(&handle.0)
            .ok_or(ApiStatus::Failed)?;

        if let OpenTarget::Device(device) = file.target {
            debug!(target: "plxcore::dispatch", "close device ({})", device.name());
            device.owner_cleanup(handle.owner());
        }

        Ok(())
    }

    /// Resolves an `mmap` request on a device node.
    ///
    /// Page offsets 0 through 5 select the corresponding BAR; any other
    /// value is taken as the page number of a previously allocated DMA
    /// buffer's CPU physical address.
    pub fn mmap(&self, handle: FileHandle, page_offset: u64) -> Result<MmapTarget, ApiStatus> {
        let device = self.device_of(handle)?;
        let page_shift = self.host.page_size().trailing_zeros();

        if page_offset <= 5 {
            let bar = device.bar_properties(page_offset as u8)?;

            if bar.flags.contains(BarFlags::IO) {
                debug!(
                    target: "plxcore::dispatch",
                    "PCI BAR {} is an I/O space, cannot map to user space", page_offset
                );
                return Err(ApiStatus::InvalidAddress);
            }

            if bar.phys_addr == 0 || bar.size == 0 {
                return Err(ApiStatus::InvalidAddress);
            }

            debug!(target: "plxcore::dispatch", "map PCI BAR {}", page_offset);

            return Ok(MmapTarget {
                phys_addr: bar.phys_addr,
                size: bar.size,
                device_memory: true,
            });
        }

        let phys_addr = page_offset << page_shift;

        Ok(MmapTarget {
            phys_addr,
            size: 0,
            device_memory: false,
        })
    }

    // ---- the control entry ----

    /// Executes one control operation.
    ///
    /// The completion status is stored into `params.status` and returned.
    /// `data` is the caller's transfer buffer, used by the port, BAR-space
    /// and register-block operations.
    pub fn control(
        &self,
        handle: FileHandle,
        op: ControlOp,
        params: &mut IoParams,
        data: &mut [u8],
    ) -> ApiStatus {
        let status = self.dispatch(handle, op, params, data);

        params.status = match status {
            Ok(()) => ApiStatus::Success,
            Err(status) => status,
        };

        params.status
    }

    fn dispatch(
        &self,
        handle: FileHandle,
        op: ControlOp,
        params: &mut IoParams,
        data: &mut [u8],
    ) -> CanFail<ApiStatus> {
        let owner = handle.owner();

        // Driver-wide operations work from any node, including management.
        match op {
            ControlOp::DriverVersion => {
                params.value[0] = u64::from((VERSION_MAJOR << 16) | (VERSION_MINOR << 8));
                return Ok(());
            }
            ControlOp::CommonBufferProperties => {
                let slot = self.common_buffer.lock();
                params.phys = match slot.as_ref() {
                    Some(buffer) => PhysMemInfo {
                        user_addr: 0,
                        cpu_physical: buffer.cpu_addr,
                        bus_physical: buffer.bus_addr,
                        size: buffer.size,
                    },
                    None => PhysMemInfo::default(),
                };
                return Ok(());
            }
            ControlOp::DeviceFind => {
                let mut nth = params.value[0] as u16;
                let result = self.registry.find(&mut params.key, &mut nth);
                params.value[0] = u64::from(nth);
                return result;
            }
            ControlOp::IoPortRead => {
                let width = params.access.ok_or(ApiStatus::InvalidAccessType)?;
                return resources::io_port_transfer(
                    &*self.host,
                    params.value[0],
                    data,
                    width,
                    true,
                );
            }
            ControlOp::IoPortWrite => {
                let width = params.access.ok_or(ApiStatus::InvalidAccessType)?;
                return resources::io_port_transfer(
                    &*self.host,
                    params.value[0],
                    data,
                    width,
                    false,
                );
            }
            _ => {}
        }

        let device = self.device_of(handle)?;

        if op.needs_power() && device.power_state() > MIN_WORKING_POWER_STATE {
            debug!(
                target: "plxcore::dispatch",
                "device is in low power state, cannot continue"
            );
            return Err(ApiStatus::PowerDown);
        }

        match op {
            // Handled above.
            ControlOp::DriverVersion
            | ControlOp::CommonBufferProperties
            | ControlOp::DeviceFind
            | ControlOp::IoPortRead
            | ControlOp::IoPortWrite => unreachable!("dispatched as driver-wide operation"),

            ControlOp::ChipTypeGet => {
                let key = device.key();
                params.value[0] = u64::from(key.chip);
                params.value[1] = u64::from(key.chip_revision);
                Ok(())
            }

            // Changing the chip type dynamically is not supported in a
            // plug-and-play driver.
            ControlOp::ChipTypeSet => Err(ApiStatus::UnsupportedFunction),

            ControlOp::PortProperties => {
                debug!(
                    target: "plxcore::dispatch",
                    "device does not support PCI Express capability"
                );
                params.port = PortProperties::default();
                Ok(())
            }

            ControlOp::DeviceReset => {
                let regs = device.regs()?;
                device.chip().board_reset(&device.chip_io(&regs))
            }

            ControlOp::PciRegRead => {
                params.value[1] = u64::from(pci::cfg_read(
                    &*self.host,
                    device.location(),
                    params.value[0] as u16,
                )?);
                Ok(())
            }
            ControlOp::PciRegWrite => pci::cfg_write(
                &*self.host,
                device.location(),
                params.value[0] as u16,
                params.value[1] as u32,
            ),
            ControlOp::PciRegReadBypassOs => {
                params.value[1] = u64::from(pci::cfg_read_bypass(
                    &*self.host,
                    device.location(),
                    params.value[0] as u16,
                )?);
                Ok(())
            }
            ControlOp::PciRegWriteBypassOs => pci::cfg_write_bypass(
                &*self.host,
                device.location(),
                params.value[0] as u16,
                params.value[1] as u32,
            ),

            ControlOp::RegisterRead | ControlOp::MappedRegisterRead => {
                params.value[1] =
                    u64::from(resources::register_read(&device, params.value[0] as u32)?);
                Ok(())
            }
            ControlOp::RegisterWrite | ControlOp::MappedRegisterWrite => resources::register_write(
                &device,
                params.value[0] as u32,
                params.value[1] as u32,
            ),

            ControlOp::MailboxRead => {
                let regs = device.regs()?;
                params.value[1] =
                    u64::from(device.chip().mailbox_read(&regs, params.value[0] as u16)?);
                Ok(())
            }
            ControlOp::MailboxWrite => {
                let regs = device.regs()?;
                device
                    .chip()
                    .mailbox_write(&regs, params.value[0] as u16, params.value[1] as u32)
            }

            ControlOp::EepromPresent => {
                params.value[0] = u64::from(device.eeprom_present()?);
                Ok(())
            }
            ControlOp::EepromProbe => {
                params.value[0] = u64::from(device.eeprom_probe()?);
                Ok(())
            }

            // The 9000 family carries no EEPROM CRC.
            ControlOp::EepromCrcGet | ControlOp::EepromCrcUpdate => {
                Err(ApiStatus::UnsupportedFunction)
            }

            ControlOp::EepromReadByOffset => {
                params.value[1] = u64::from(device.eeprom_read(params.value[0] as u16)?);
                Ok(())
            }
            ControlOp::EepromWriteByOffset => {
                device.eeprom_write(params.value[0] as u16, params.value[1] as u32)
            }
            ControlOp::EepromReadByOffset16 => {
                params.value[1] = u64::from(device.eeprom_read_16(params.value[0] as u16)?);
                Ok(())
            }
            ControlOp::EepromWriteByOffset16 => {
                device.eeprom_write_16(params.value[0] as u16, params.value[1] as u16)
            }

            ControlOp::VpdRead => {
                params.value[1] = u64::from(device.vpd_read(params.value[0] as u16)?);
                Ok(())
            }
            ControlOp::VpdWrite => device.vpd_write(params.value[0] as u16, params.value[1] as u32),

            ControlOp::PhysicalMemAllocate => {
                params.phys = resources::alloc_physical(
                    &device,
                    params.phys.size,
                    params.value[0] != 0,
                    owner,
                )?;
                Ok(())
            }
            ControlOp::PhysicalMemFree => resources::free_physical(&device, params.phys.bus_physical),

            ControlOp::IntrEnable => {
                let regs = device.regs()?;
                device
                    .chip()
                    .intr_enable_sources(&device.chip_io(&regs), &params.intr);
                Ok(())
            }
            ControlOp::IntrDisable => {
                let regs = device.regs()?;
                device
                    .chip()
                    .intr_disable_sources(&device.chip_io(&regs), &params.intr);
                Ok(())
            }

            ControlOp::NotificationRegisterFor => {
                let (mask, doorbell) = device.chip().intr_notify_flags(&params.intr);
                let wait_handle = device.wait_list().register(owner, mask, doorbell);
                params.value[0] = wait_handle.0;
                Ok(())
            }
            ControlOp::NotificationWait => device
                .wait_list()
                .wait(WaitHandle(params.value[0]), params.value[1]),
            ControlOp::NotificationStatus => {
                let (mask, doorbell) = device.wait_list().status(WaitHandle(params.value[0]))?;
                params.intr = device.chip().intr_status_flags(mask, doorbell);
                Ok(())
            }
            ControlOp::NotificationCancel => {
                let wait_handle = if params.value[0] == 0 {
                    None
                } else {
                    Some(WaitHandle(params.value[0]))
                };
                device.wait_list().cancel(owner, wait_handle)
            }

            ControlOp::BarProperties => {
                params.bar = device.bar_properties(params.value[0] as u8)?;
                Ok(())
            }
            ControlOp::BarSpaceRead => {
                let width = params.access.ok_or(ApiStatus::InvalidAccessType)?;
                resources::bar_transfer(
                    &device,
                    params.value[0] as u8,
                    params.value[1] as u32,
                    data,
                    width,
                    params.value[2] != 0,
                    true,
                )
            }
            ControlOp::BarSpaceWrite => {
                let width = params.access.ok_or(ApiStatus::InvalidAccessType)?;
                resources::bar_transfer(
                    &device,
                    params.value[0] as u8,
                    params.value[1] as u32,
                    data,
                    width,
                    params.value[2] != 0,
                    false,
                )
            }

            ControlOp::DmaChannelOpen => dma::channel_open(&device, params.value[0] as u8, owner),
            ControlOp::DmaGetProperties => {
                params.props = dma::get_properties(&device, params.value[0] as u8)?;
                Ok(())
            }
            ControlOp::DmaSetProperties => {
                dma::set_properties(&device, params.value[0] as u8, &params.props, owner)
            }
            ControlOp::DmaControl => {
                let command = match params.value[1] {
                    0 => DmaCommand::Pause,
                    1 => DmaCommand::Resume,
                    2 => DmaCommand::Abort,
                    _ => return Err(ApiStatus::DmaCommandInvalid),
                };
                dma::control(&device, params.value[0] as u8, command, owner)
            }
            // The channel state is the completion code itself.
            ControlOp::DmaStatus => Err(dma::status(&device, params.value[0] as u8, owner)),
            ControlOp::DmaTransferBlock => {
                let dma_params = params.dma.as_ref().ok_or(ApiStatus::NullParam)?;
                dma::transfer_block(&device, params.value[0] as u8, dma_params, owner)
            }
            ControlOp::DmaTransferUserBuffer => {
                let dma_params = params.dma.as_ref().ok_or(ApiStatus::NullParam)?;
                dma::transfer_user_buffer(&device, params.value[0] as u8, dma_params, owner)
            }
            ControlOp::DmaChannelClose => dma::channel_close(
                &device,
                params.value[0] as u8,
                params.value[1] != 0,
                owner,
            ),
        }
    }

    fn device_of(&self, handle: FileHandle) -> Result<Arc<DeviceCtx>, ApiStatus> {
        let files = self.open_files.lock();

        match files.get(&handle.0) {
            Some(OpenFile {
                target: OpenTarget::Device(device),
            }) => Ok(Arc::clone(device)),
            Some(OpenFile {
                target: OpenTarget::Management,
            }) => Err(ApiStatus::UnsupportedFunction),
            None => Err(ApiStatus::Failed),
        }
    }
}

impl Drop for Driver {
    fn drop(&mut self) {
        self.shutdown();
    }
}
