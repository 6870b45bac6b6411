//! MPU region allocator (§4.5): translates named memory maps into concrete
//! hardware region descriptors for ARMv7-M/R ([`v7`]) or ARMv8-R ([`v8`])
//! Memory Protection Units.
//!
//! Grounded on `hal/armv7m/mpu.c`; both backends share the same
//! per-program allocation shape (`mpu_getHalProgData`'s "kernel map first,
//! then imaps, then dmaps, skipping already-allocated maps" sequence),
//! factored here as [`alloc_program`] over a [`MapLookup`] implementation.

pub mod v7;
pub mod v8;

use crate::config::MAX_MPU_REGIONS;
use crate::error::{Error, Result};

/// Resolves a named memory map to the `(id, start, end, attr)` tuple an MPU
/// backend needs. Implemented by [`crate::syspage::SyspageBuilder`].
pub trait MapLookup {
    fn resolve_map(&self, name: &str) -> Option<(u8, u32, u32, u8)>;
    fn map_name_containing(&self, addr: u32) -> Option<&str>;
}

impl MapLookup for crate::syspage::SyspageBuilder {
    fn resolve_map(&self, name: &str) -> Option<(u8, u32, u32, u8)> {
        crate::syspage::SyspageBuilder::resolve_map(self, name)
    }
    fn map_name_containing(&self, addr: u32) -> Option<&str> {
        crate::syspage::SyspageBuilder::map_name_containing(self, addr)
    }
}

/// Per-program allocation sequence shared by both MPU architectures: always
/// allocate the map containing `kernel_entry` first (user-mode code still
/// needs to execute the kernel's syscall/signal trampolines, per the
/// original's "FIXME HACK" comment), then each of `imaps`/`dmaps`, skipping
/// any map already allocated for this program.
pub fn program_map_sequence<'a, L: MapLookup>(
    lookup: &'a L,
    kernel_entry: u32,
    imaps: &'a [&'a str],
    dmaps: &'a [&'a str],
) -> Result<impl Iterator<Item = (u8, u32, u32, u8)> + 'a> {
    let kernel_map_name = lookup.map_name_containing(kernel_entry).ok_or(Error::Invalid)?;
    let kernel = lookup.resolve_map(kernel_map_name).ok_or(Error::Invalid)?;

    let mut seen = heapless::Vec::<u8, MAX_MPU_REGIONS>::new();
    let _ = seen.push(kernel.0);
    let seen = core::cell::RefCell::new(seen);

    let rest = imaps.iter().chain(dmaps.iter()).filter_map(move |name| lookup.resolve_map(name));

    Ok(core::iter::once(kernel).chain(rest.filter(move |(id, ..)| {
        // NOTE: dedup against a fixed-size scratch list, matching
        // `mpu_isMapAlloced`'s linear scan; silently drops an entry past
        // `MAX_MPU_REGIONS` distinct maps rather than growing unbounded.
        let mut seen = seen.borrow_mut();
        let already = seen.iter().any(|s| s == id);
        if !already {
            let _ = seen.push(*id);
        }
        !already
    })))
}
