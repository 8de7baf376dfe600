//! Error types for vmio.

use thiserror::Error;

use crate::device::virtio::registry::DeviceHandle;
use crate::irq::LineId;

/// Result type alias using vmio's Error type.
pub type Result<T> = std::result::Result<T, Error>;

/// Why a descriptor chain was rejected.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ChainFault {
    /// A `next` link revisited a descriptor already seen in this chain.
    Cycle,
    /// More links than the negotiated queue size.
    TooLong,
    /// A descriptor index outside the table.
    IndexOutOfRange(u16),
    /// The guest published a head the host has not completed yet.
    HeadInFlight,
    /// Indirect descriptor without `VIRTIO_RING_F_INDIRECT_DESC`.
    UnexpectedIndirect,
    /// Indirect descriptor inside an indirect table, or combined with `next`.
    NestedIndirect,
    /// Indirect table length is zero or not a multiple of the descriptor size.
    InvalidIndirectTable(u32),
}

impl std::fmt::Display for ChainFault {
    fn fmt(&self, f: &mut std::fmt::Formatter<'_>) -> std::fmt::Result {
        match self {
            ChainFault::Cycle => write!(f, "descriptor cycle"),
            ChainFault::TooLong => write!(f, "chain longer than queue"),
            ChainFault::IndexOutOfRange(idx) => write!(f, "descriptor index {} out of range", idx),
            ChainFault::HeadInFlight => write!(f, "head already in flight"),
            ChainFault::UnexpectedIndirect => write!(f, "indirect descriptor not negotiated"),
            ChainFault::NestedIndirect => write!(f, "nested or chained indirect descriptor"),
            ChainFault::InvalidIndirectTable(len) => {
                write!(f, "invalid indirect table length {}", len)
            }
        }
    }
}

/// Errors that can occur in the device I/O core.
#[derive(Error, Debug)]
pub enum Error {
    // Guest protocol violations
    #[error("malformed descriptor chain at head {head}: {fault}")]
    MalformedChain { head: u16, fault: ChainFault },

    #[error("available index {avail} is more than {size} ahead of {last}")]
    InvalidAvailIndex { avail: u16, last: u16, size: u16 },

    // Guest memory errors
    #[error("guest range 0x{addr:x}+{len} is outside guest memory")]
    OutOfRange { addr: u64, len: u64 },

    #[error("guest address 0x{0:x} is not backed")]
    Unmapped(u64),

    #[error("guest address 0x{0:x} is read-only")]
    ReadOnly(u64),

    #[error("guest address 0x{addr:x} is not {align}-byte aligned")]
    Misaligned { addr: u64, align: u64 },

    #[error("invalid memory layout: {0}")]
    MemoryLayout(String),

    #[error("memory allocation failed: {0}")]
    MemoryAllocationFailed(String),

    // Queue errors
    #[error("unsupported queue size: {0}")]
    UnsupportedSize(u32),

    #[error("descriptor chain {0} is not outstanding")]
    UnknownChain(u16),

    #[error("queue {0} is not ready")]
    QueueNotReady(u16),

    // Interrupt errors
    #[error("interrupt line {0} has nothing pending")]
    NotPending(LineId),

    #[error("end-of-interrupt on line {0} which is not awaiting one")]
    InvalidEoi(LineId),

    #[error("unknown interrupt line {0}")]
    UnknownLine(LineId),

    #[error("interrupt source {0} out of range")]
    InvalidSource(u8),

    // Registry errors
    #[error("device {0} is busy")]
    Busy(DeviceHandle),

    #[error("device {0} is draining")]
    Draining(DeviceHandle),

    #[error("device not found: {0}")]
    UnknownDevice(DeviceHandle),

    #[error("device {device} has no queue {queue}")]
    UnknownQueue { device: DeviceHandle, queue: u16 },

    // Configuration errors
    #[error("invalid vCPU count: {0} (must be > 0)")]
    InvalidVcpuCount(u32),

    #[error("invalid queue size limit: {0} (must be a power of two in 2..=32768)")]
    InvalidQueueLimit(u32),

    #[error("device limit reached ({0} devices)")]
    DeviceLimit(usize),

    // Diagnostic path
    #[error("invalid diagnostic command: {0}")]
    InvalidDiagCommand(String),

    #[error("channel closed")]
    ChannelClosed,

    // I/O errors
    #[error("I/O error: {0}")]
    Io(#[from] std::io::Error),
}

impl Error {
    /// Whether this error was caused by the guest violating the ring protocol
    /// or handing out bad addresses. Such errors are contained to the
    /// transaction that hit them.
    pub fn is_guest_fault(&self) -> bool {
        matches!(
            self,
            Error::MalformedChain { .. }
                | Error::InvalidAvailIndex { .. }
                | Error::OutOfRange { .. }
                | Error::Unmapped(_)
                | Error::ReadOnly(_)
                | Error::Misaligned { .. }
        )
    }
}
