//! Kernel-internal error type and the syscall return-value convention.
//!
//! Subsystems return `Result<T, KernelError>`; [`syscall`](crate::userspace::syscall)
//! is the single place that flattens this into the signed-integer ABI of
//! spec section 6 (`>= 0` success, `-1` generic failure, `-EAGAIN`, `-EINTR`).

/// Errors surfaced at a kernel API boundary.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum KernelError {
    /// Bad pointer, out-of-range integer, malformed filename, unknown
    /// syscall/ioctl number, invalid descriptor.
    InvalidArgument,
    /// Out of physical frames, PCBs, ports, or SKB memory.
    OutOfMemory,
    /// Per-process descriptor table is full (spec `MAX_FILES`).
    OutOfDescriptors,
    /// Write to a read-only file, ioctl requiring the opposite mode, I/O
    /// from a background process group.
    PermissionDenied,
    /// Non-blocking descriptor with no data ready.
    WouldBlock,
    /// A blocked syscall was woken by a pending signal.
    Interrupted,
    /// TCP retransmission overflow or an explicit RST was received.
    ConnectionReset,
    /// Lookup failure that is not itself fatal (e.g. file/socket not found).
    NotFound,
}

impl KernelError {
    /// Maps this error to the syscall return-value convention of spec
    /// section 6. Every other error collapses to generic `-1`.
    #[must_use]
    pub const fn to_syscall_ret(self) -> isize {
        match self {
            Self::WouldBlock => -EAGAIN,
            Self::Interrupted => -EINTR,
            _ => -1,
        }
    }
}

/// "Would block" syscall error code.
pub const EAGAIN: isize = 11;

/// "Interrupted by signal" syscall error code.
pub const EINTR: isize = 4;

/// Result type used pervasively across kernel subsystems.
pub type KResult<T> = Result<T, KernelError>;
