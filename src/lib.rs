//! Core of a multi-architecture bare-metal OS loader: a device registry, a
//! PHFS file/alias abstraction, a syspage/memory-map builder, an MPU region
//! allocator, and a NOR/QSPI flash engine.
//!
//! `no_std` outside of `cargo test`: the algorithmic core in every module
//! here is written against small hardware-facing traits ([`clock::Clock`],
//! [`phfs::msg::Endpoint`], [`syspage::MapWriter`], [`flash::FlashBus`]) so
//! it can be exercised on the host; only [`mpu::v7`]/[`mpu::v8`]'s register
//! encoding and [`flash::flexspi`]'s MMIO access are architecture-specific
//! and untestable without hardware.

#![cfg_attr(not(test), no_std)]

pub(crate) mod log;

pub mod clock;
pub mod config;
pub mod device;
pub mod error;
pub mod flash;
pub mod mpu;
pub mod phfs;
pub mod syspage;

pub use error::{Error, Result};
