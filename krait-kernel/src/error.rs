//! Kernel error codes
//!
//! Defines the error codes surfaced by the socket and memory subsystems.
//! Negative values indicate errors so that syscall shims can return them
//! directly in a register; zero is success.

/// Kernel error codes.
#[repr(i64)]
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum KernelError {
    /// A copy to or from user memory faulted.
    BadAddress = -1,
    /// Invalid argument (wrong family, wrong size, wrong role).
    InvalidArgument = -2,
    /// The requested address is already in use.
    AddressInUse = -3,
    /// The connection target is missing, not a socket, or refused us.
    ConnectionRefused = -4,
    /// The endpoint is already connected.
    AlreadyConnected = -5,
    /// The endpoint is not connected.
    NotConnected = -6,
    /// The peer has detached; writing is no longer possible.
    BrokenPipe = -7,
    /// A non-blocking operation would have to wait.
    TryAgain = -8,
    /// A blocked call was woken by thread interruption.
    Interrupted = -9,
    /// The operation is not supported for this socket type.
    NotSupported = -10,
    /// The caller lacks the privilege for this operation.
    PermissionDenied = -11,
    /// A bounded queue is saturated.
    Busy = -12,
    /// The path already exists (filesystem seam).
    AlreadyExists = -13,
    /// The path does not exist (filesystem seam).
    NotFound = -14,
}

impl KernelError {
    /// Convert to raw i64 for return.
    #[inline]
    pub const fn as_i64(self) -> i64 {
        self as i64
    }

    /// Get the error name for logging.
    pub const fn name(self) -> &'static str {
        match self {
            Self::BadAddress => "BadAddress",
            Self::InvalidArgument => "InvalidArgument",
            Self::AddressInUse => "AddressInUse",
            Self::ConnectionRefused => "ConnectionRefused",
            Self::AlreadyConnected => "AlreadyConnected",
            Self::NotConnected => "NotConnected",
            Self::BrokenPipe => "BrokenPipe",
            Self::TryAgain => "TryAgain",
            Self::Interrupted => "Interrupted",
            Self::NotSupported => "NotSupported",
            Self::PermissionDenied => "PermissionDenied",
            Self::Busy => "Busy",
            Self::AlreadyExists => "AlreadyExists",
            Self::NotFound => "NotFound",
        }
    }
}

impl core::fmt::Display for KernelError {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        f.write_str(self.name())
    }
}

/// Kernel result type.
pub type KResult<T> = Result<T, KernelError>;
