//! ARMv8-R MPU backend: `{rbar, rlar}` addresses `[base, limit]` directly,
//! with no sub-region masking (§4.5). Simpler than [`super::v7`] because the
//! architecture dropped SRD in favour of byte-granular (well, 32-byte
//! aligned) limit addressing — one region per map always suffices here.

use crate::config::MAX_MPU_REGIONS;
use crate::error::{Error, Result};
use crate::syspage::attr;

/// Minimum region size and required alignment on both `base` and `limit`.
const GRANULE: u32 = 32;

/// One hardware region: `rbar` (base address + access permissions + share),
/// `rlar` (limit address + enable + MAIR attribute index).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub struct Region {
    pub rbar: u32,
    pub rlar: u32,
}

/// Encodes a map's attribute bitset into RBAR's non-overlapping AP (bit 1,
/// single-bit)/XN (bit 0)/SH (bit 4) fields, matching `mpu_regionAttrsRbar`.
///
/// ARMv8-R only supports one EL1 privileged AP level that grants both
/// privileged and unprivileged read-write access once write is requested, or
/// read-only for both once only read is requested — there is no separate
/// privileged/unprivileged split here (the original notes this as a known
/// ARMv8-M/R limitation, not something this loader works around).
#[must_use]
pub fn rbar_attrs(map_attr: u8) -> u32 {
    let ap: u32 = u32::from(map_attr & (attr::READ | attr::WRITE) != 0);
    let xn = u32::from(map_attr & attr::EXEC == 0);
    let sh: u32 = u32::from(map_attr & attr::SHAREABLE != 0);
    (sh << 4) | (ap << 1) | xn
}

/// Encodes a map's attribute bitset (plus the region's enable bit) into
/// RLAR's XN/attr-index/enable fields, matching `mpu_regionAttrsRlar`.
/// `attr_indx` packs cacheable (bit 0) and bufferable (bit 1) directly,
/// rather than through a separate MAIR lookup table.
#[must_use]
pub fn rlar_attrs(map_attr: u8, enable: bool) -> u32 {
    let attr_indx: u32 = u32::from(map_attr & attr::CACHEABLE != 0) | (u32::from(map_attr & attr::BUFFERABLE != 0) << 1);
    let exec_never = u32::from(map_attr & attr::EXEC == 0);
    (exec_never << 4) | (attr_indx << 1) | u32::from(enable)
}

/// A per-program MPU region table for ARMv8-R: up to [`MAX_MPU_REGIONS`]
/// `{rbar, rlar}` pairs plus the map ID each belongs to.
pub struct RegionTable {
    regions: heapless::Vec<Region, MAX_MPU_REGIONS>,
    map_ids: heapless::Vec<u32, MAX_MPU_REGIONS>,
    region_max: usize,
}

impl RegionTable {
    #[must_use]
    pub fn new(region_max: usize) -> Self {
        Self {
            regions: heapless::Vec::new(),
            map_ids: heapless::Vec::new(),
            region_max: region_max.min(MAX_MPU_REGIONS),
        }
    }

    #[must_use]
    pub fn regions(&self) -> &[Region] {
        &self.regions
    }

    /// Allocates `[start, end)` for `map_id`. Both ends must be 32-byte
    /// aligned and `end` strictly greater than `start`; `rlar` stores
    /// `end - 1` (the inclusive limit address the hardware expects).
    pub fn alloc_map(&mut self, start: u32, end: u32, attr: u8, map_id: u8) -> Result<()> {
        if end <= start || start % GRANULE != 0 || end % GRANULE != 0 {
            return Err(Error::PermissionDenied);
        }
        if self.regions.len() >= self.region_max {
            return Err(Error::PermissionDenied);
        }

        let rbar = (start & !0x1F) | rbar_attrs(attr);
        let rlar = ((end - 1) & !0x1F) | rlar_attrs(attr, true);

        self.regions.push(Region { rbar, rlar }).map_err(|_| Error::PermissionDenied)?;
        self.map_ids.push(u32::from(map_id)).map_err(|_| Error::PermissionDenied)?;
        Ok(())
    }

    #[must_use]
    pub fn is_map_allocated(&self, map_id: u8) -> bool {
        self.map_ids.iter().any(|m| *m == u32::from(map_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn aligned_range_encodes_one_region() {
        let mut t = RegionTable::new(16);
        t.alloc_map(0x8000_0000, 0x8010_0000, attr::READ | attr::WRITE, 2).unwrap();
        assert_eq!(t.regions().len(), 1);
        assert!(t.is_map_allocated(2));
        assert_eq!(t.regions()[0].rbar & !0x7, 0x8000_0000);
    }

    #[test]
    fn read_exec_region_does_not_collide_ap_into_xn() {
        // attr = READ|EXEC (read-only, executable: kernel text). xn must be
        // clear even though ap is also nonzero; a colliding bit layout would
        // force xn on whenever ap's low bit is set.
        let rbar = rbar_attrs(attr::READ | attr::EXEC);
        assert_eq!(rbar & 0x1, 0); // xn clear: exec is permitted
        assert_eq!((rbar >> 1) & 0x1, 1); // ap set: read requested
    }

    #[test]
    fn rlar_mask_keeps_32_byte_aligned_limit_exact() {
        let mut t = RegionTable::new(16);
        // end = 0x8000_0040 is 32-byte aligned; rlar's limit field must come
        // out as end - 1 rounded down to the granule, i.e. 0x8000_0020, not
        // truncated further by an over-wide mask.
        t.alloc_map(0x8000_0000, 0x8000_0040, attr::READ, 0).unwrap();
        assert_eq!(t.regions()[0].rlar & !0x1F, 0x8000_0020);
    }

    #[test]
    fn unaligned_start_is_rejected() {
        let mut t = RegionTable::new(16);
        let err = t.alloc_map(0x8000_0001, 0x8010_0000, attr::READ, 0).unwrap_err();
        assert_eq!(err, Error::PermissionDenied);
    }

    #[test]
    fn table_exhaustion_is_permission_denied() {
        let mut t = RegionTable::new(1);
        t.alloc_map(0x8000_0000, 0x8000_0020, attr::READ, 0).unwrap();
        let err = t.alloc_map(0x9000_0000, 0x9000_0020, attr::READ, 1).unwrap_err();
        assert_eq!(err, Error::PermissionDenied);
    }
}
