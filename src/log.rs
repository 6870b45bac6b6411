//! Logging facade.
//!
//! Every component logs through these five macros instead of calling
//! `defmt`/`log` directly, so the backend is a single Cargo-feature switch
//! (`log-defmt`, the default, or `log-log`) instead of being sprinkled through
//! every call site, matching how `hpm-hal` gates its diagnostics behind a
//! `defmt` feature.

#![allow(unused_macros, unused_imports)]

macro_rules! trace {
    ($($x:tt)*) => {
        {
            #[cfg(feature = "log-defmt")]
            defmt::trace!($($x)*);
            #[cfg(feature = "log-log")]
            log::trace!($($x)*);
        }
    };
}

macro_rules! debug {
    ($($x:tt)*) => {
        {
            #[cfg(feature = "log-defmt")]
            defmt::debug!($($x)*);
            #[cfg(feature = "log-log")]
            log::debug!($($x)*);
        }
    };
}

macro_rules! info {
    ($($x:tt)*) => {
        {
            #[cfg(feature = "log-defmt")]
            defmt::info!($($x)*);
            #[cfg(feature = "log-log")]
            log::info!($($x)*);
        }
    };
}

macro_rules! warn {
    ($($x:tt)*) => {
        {
            #[cfg(feature = "log-defmt")]
            defmt::warn!($($x)*);
            #[cfg(feature = "log-log")]
            log::warn!($($x)*);
        }
    };
}

macro_rules! error {
    ($($x:tt)*) => {
        {
            #[cfg(feature = "log-defmt")]
            defmt::error!($($x)*);
            #[cfg(feature = "log-log")]
            log::error!($($x)*);
        }
    };
}

pub(crate) use {debug, error, info, trace, warn};
