//! Status codes shared across the whole control surface.
//!
//! Every control operation completes with an [`ApiStatus`] stored in the
//! caller's parameter record. The numeric values are part of the user-space
//! ABI and must not be reordered.

use thiserror::Error;

/// `CanFail` is a return type for operations that are allowed to fail, and
/// don't need to return anything.
pub type CanFail<T> = Result<(), T>;

/// Completion code of a driver operation.
#[derive(Error, Debug, Clone, Copy, PartialEq, Eq, Hash, Default)]
#[repr(u32)]
pub enum ApiStatus {
    #[default]
    #[error("success")]
    Success = 0,

    /// Register or EEPROM offset is misaligned or out of range.
    #[error("invalid offset")]
    InvalidOffset,

    /// BAR, mailbox or channel index outside its valid range.
    #[error("invalid index")]
    InvalidIndex,

    /// Address is misaligned or does not fall into a usable space.
    #[error("invalid address")]
    InvalidAddress,

    /// Byte count is zero, misaligned, or exceeds the target space.
    #[error("invalid size")]
    InvalidSize,

    #[error("invalid access width")]
    InvalidAccessType,

    #[error("required parameter missing")]
    NullParam,

    /// Host could not satisfy an allocation or mapping request.
    #[error("insufficient resources")]
    InsufficientResources,

    #[error("unsupported function")]
    UnsupportedFunction,

    /// A bounded wait expired before the condition was met.
    #[error("wait timed out")]
    WaitTimeout,

    /// The wait was cancelled, either explicitly or by owner teardown.
    #[error("wait canceled")]
    WaitCanceled,

    #[error("operation failed")]
    Failed,

    #[error("invalid DMA channel")]
    DmaChannelInvalid,

    /// Channel is not open, or is already held by another owner.
    #[error("DMA channel unavailable")]
    DmaChannelUnavailable,

    #[error("DMA transfer in progress")]
    DmaInProgress,

    #[error("DMA channel paused")]
    DmaPaused,

    #[error("DMA transfer done")]
    DmaDone,

    #[error("invalid DMA command")]
    DmaCommandInvalid,

    /// Could not allocate the page list for a scatter-gather transfer.
    #[error("SGL page list allocation failed")]
    DmaSglPagesGetError,

    /// Could not page-lock the full user buffer.
    #[error("SGL page lock failed")]
    DmaSglPagesLockError,

    /// Resource is owned by a different open file.
    #[error("device in use")]
    DeviceInUse,

    /// Device is in a power state too low for register access.
    #[error("device powered down")]
    PowerDown,

    #[error("PCI configuration access failed")]
    ConfigAccessFailed,

    #[error("VPD capability not present")]
    VpdNotSupported,

    #[error("invalid data")]
    InvalidData,
}

impl ApiStatus {
    /// True for codes that describe a DMA channel state rather than a
    /// failure (`DmaDone`, `DmaPaused`, `DmaInProgress`).
    pub fn is_dma_state(self) -> bool {
        matches!(
            self,
            ApiStatus::DmaDone | ApiStatus::DmaPaused | ApiStatus::DmaInProgress
        )
    }
}
