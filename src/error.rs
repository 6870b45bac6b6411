//! Error taxonomy shared by every component of the loader core.
//!
//! The original C sources return `-errno`-style `int`s (`-EINVAL`, `-EIO`, ...).
//! Here every fallible call returns `Result<T, Error>` instead, but [`Error::errno`]
//! recovers the legacy negative code for boundaries (the syspage HAL block, C FFI)
//! that still expect one.

/// Failure sentinels used throughout the loader core.
///
/// Mirrors the taxonomy in the original `plo` sources: argument-shape errors
/// (`Invalid`), capacity exhaustion (`NoSpace`), MPU encoding impossibility
/// (`PermissionDenied`), unrecoverable transport errors (`Io`), deadline
/// expiry (`Timeout`), unsupported operations (`NotSupported`), device-declared
/// disconnection (`ConnectionRefused`), and absent/unrecognised hardware
/// (`NoDevice`).
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
#[non_exhaustive]
pub enum Error {
    /// Bad name, duplicate alias, out-of-range index, unaligned offset, unparseable attr string.
    Invalid,
    /// Target region full: syspage arg string would overflow, map has no space, MPU table exhausted.
    NoSpace,
    /// MPU encoding impossible (sub-region granularity too small, hole would overlap another allocation).
    PermissionDenied,
    /// Transport-level error not recoverable by local retry.
    Io,
    /// Deadline expired waiting on hardware or a packet reply.
    Timeout,
    /// Handler present but doesn't support this call.
    NotSupported,
    /// Device declares itself disconnected (e.g. USB cable pulled).
    ConnectionRefused,
    /// Flash device inactive, or JEDEC probe found no known vendor.
    NoDevice,
}

impl Error {
    /// Recover the legacy negative errno this variant corresponds to.
    #[must_use]
    pub const fn errno(self) -> i32 {
        match self {
            Self::Invalid => -22,           // EINVAL
            Self::NoSpace => -12,           // ENOMEM
            Self::PermissionDenied => -1,   // EPERM
            Self::Io => -5,                 // EIO
            Self::Timeout => -110,          // ETIME/ETIMEDOUT
            Self::NotSupported => -6,       // ENXIO
            Self::ConnectionRefused => -111, // ECONNREFUSED
            Self::NoDevice => -19,          // ENODEV
        }
    }
}

impl core::fmt::Display for Error {
    fn fmt(&self, f: &mut core::fmt::Formatter<'_>) -> core::fmt::Result {
        let s = match self {
            Self::Invalid => "invalid argument",
            Self::NoSpace => "no space left",
            Self::PermissionDenied => "operation not permitted",
            Self::Io => "i/o error",
            Self::Timeout => "timed out",
            Self::NotSupported => "operation not supported",
            Self::ConnectionRefused => "connection refused",
            Self::NoDevice => "no such device",
        };
        f.write_str(s)
    }
}

#[cfg(test)]
impl std::error::Error for Error {}

/// Result alias used throughout the crate.
pub type Result<T> = core::result::Result<T, Error>;
