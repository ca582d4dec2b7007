//! Portable driver core for the PLX 9000 family of PCI-to-Local-bus
//! bridges (9030/9050/9054/9056/9080/9656/8311).
//!
//! The crate exposes the bridges as open/close/mmap/control endpoints the
//! way the character-device driver does, with the host OS behind the
//! [`hal::HostApi`] seam: PCI configuration access, BAR claiming and
//! mapping, DMA-coherent allocation, user-page locking and IRQ delivery all
//! come from the host. Everything above that line is portable and runs the
//! same against real hardware services or against the simulated bridge the
//! test suite provides.
//!
//! Layout follows the driver's subsystems:
//!
//! - [`chip`]: per-chip capability object (register tables, EEPROM
//!   waveforms, interrupt decode, board reset);
//! - [`device`]: per-device state, lifecycle, registry and the resource
//!   arena (BARs, coherent buffers, synchronized register access);
//! - [`intr`]: two-stage interrupt handling and notification wait objects;
//! - [`dma`]: the two-channel DMA engine, block and scatter-gather modes;
//! - [`dispatch`]: the character-device surface and control-operation
//!   fan-out.

pub mod chip;
pub mod device;
pub mod dispatch;
pub mod dma;
pub mod hal;
pub mod intr;
pub mod pci;
pub mod status;
pub mod vpd;

pub use dispatch::{ControlOp, Driver, FileHandle, IoParams, MmapTarget};
pub use status::{ApiStatus, CanFail};
