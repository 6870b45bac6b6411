//! ARMv7-M/R MPU backend: `{rbar, rasr}` region pairs, power-of-two sized
//! and sub-region-disable (SRD) masked, with a recursive hole-punching
//! encoder for arbitrary `[start, end)` ranges (§4.5, grounded on
//! `hal/armv7m/mpu.c`'s `mpu_regionGenerate`).

use crate::config::MAX_MPU_REGIONS;
use crate::error::{Error, Result};
use crate::syspage::attr;

/// One hardware region: `rbar` (base + valid + index), `rasr` (enable, size,
/// SRD mask, access permissions, XN, memory-type bits).
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
#[cfg_attr(feature = "log-defmt", derive(defmt::Format))]
pub struct Region {
    pub rbar: u32,
    pub rasr: u32,
}

/// Removes every RASR attribute bit except `ENABLE` — used for the
/// higher-priority "hole" region that carves an unused sub-range back out
/// of a larger allocation, per `HOLE_ATTR`.
const fn hole_attr(rasr_attr: u32) -> u32 {
    rasr_attr & 0x1
}

/// Translates a map's attribute bitset into RASR's AP/XN/TEX/S/C/B bits
/// (`mpu_regionAttrs`). `enable` is folded into bit 0.
#[must_use]
pub fn region_attrs(map_attr: u8, enable: bool) -> u32 {
    let ap: u32 = if map_attr & attr::WRITE != 0 {
        3 // privileged RW, unprivileged RW
    } else if map_attr & attr::READ != 0 {
        2 // privileged RW, unprivileged RO
    } else {
        1 // privileged RW, unprivileged none
    };
    let xn = u32::from(map_attr & attr::EXEC == 0);
    let s = u32::from(map_attr & attr::SHAREABLE != 0);
    let c = u32::from(map_attr & attr::CACHEABLE != 0);
    let b = u32::from(map_attr & attr::BUFFERABLE != 0);

    (xn << 28) | (ap << 24) | (s << 18) | (c << 17) | (b << 16) | u32::from(enable)
}

/// A per-program MPU region table: up to [`MAX_MPU_REGIONS`] region slots
/// plus the map ID each belongs to (`(u32::MAX)` sentinel for "unassigned").
pub struct RegionTable {
    regions: heapless::Vec<Region, MAX_MPU_REGIONS>,
    map_ids: heapless::Vec<u32, MAX_MPU_REGIONS>,
    region_max: usize,
}

const UNASSIGNED: u32 = u32::MAX;

impl RegionTable {
    /// An empty table bounded by `region_max` hardware regions (read from
    /// `MPU_TYPE.DREGION` on real hardware; a parameter here so the
    /// allocator stays host-testable).
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

    fn region_set(&mut self, base_addr: u32, srd_mask: u8, size_bit: u8, rasr_attr: u32) -> Result<()> {
        if size_bit < 5 || self.regions.len() >= self.region_max {
            return Err(Error::PermissionDenied);
        }
        let idx = self.regions.len() as u32;
        let rbar = base_addr | (1 << 4) | (idx & 0xF);
        let rasr = rasr_attr | (u32::from(srd_mask) << 8) | (u32::from(size_bit - 1) & 0x1F) << 1;
        self.regions.push(Region { rbar, rasr }).map_err(|_| Error::PermissionDenied)?;
        self.map_ids.push(UNASSIGNED).map_err(|_| Error::PermissionDenied)?;
        Ok(())
    }

    /// Splits `[start, end)` into one region of `2^size_bit` bytes with an
    /// SRD mask disabling every sub-region outside the requested range
    /// (`mpu_regionCalculateAndSet`).
    fn region_calculate_and_set(&mut self, start: u32, end: u32, size_bit: u8, rasr_attr: u32) -> Result<()> {
        let base_addr = start & !((1u32 << size_bit) - 1);
        let sr_start = ((start >> (size_bit - 3)) & 7) as u8;
        let sr_end_raw = ((end >> (size_bit - 3)) & 7) as u8;
        let sr_end = if sr_end_raw == 0 { 8 } else { sr_end_raw };
        let enabled_mask = ((1u16 << sr_end) - 1) as u8 & (0xFFu8 << sr_start);
        let srd_mask = !enabled_mask;
        self.region_set(base_addr, srd_mask, size_bit, rasr_attr)
    }

    /// Checks whether `[start, end)` overlaps any already-enabled
    /// sub-region of this table (`mpu_checkOverlap`), used before cutting a
    /// "hole" out of a larger region.
    fn check_overlap(&self, start: u32, end: u32) -> bool {
        let end = end.wrapping_sub(1);
        for region in &self.regions {
            if region.rbar & 0x10 == 0 || region.rasr & 0x1 == 0 {
                continue;
            }
            let size_bit = (((region.rasr >> 1) & 0x1F) + 1) as u8;
            let mut sr_start = region.rbar & !((1u32 << size_bit) - 1);
            let mut subregions = ((region.rasr >> 8) & 0xFF) as u8;
            for _ in 0..8 {
                let sr_end = sr_start + (1u32 << (size_bit - 3)) - 1;
                if subregions & 1 == 0 && start <= sr_end && sr_start <= end {
                    return true;
                }
                sr_start = sr_end + 1;
                subregions >>= 1;
            }
        }
        false
    }

    /// Recursively encodes `[start, end)` into at most 2 regions plus SRD
    /// masking, following `mpu_regionGenerate`'s case ladder.
    fn region_generate(&mut self, start: u32, end: u32, rasr_attr: u32) -> Result<()> {
        if end != 0 && end <= start {
            return Err(Error::Invalid);
        }
        let size = end.wrapping_sub(start);

        if size == 0 {
            return self.region_set(0, 0, 32, rasr_attr);
        }

        if size.is_power_of_two() && start & (size - 1) == 0 {
            if size < 32 {
                return Err(Error::PermissionDenied);
            }
            return self.region_set(start, 0, size.trailing_zeros() as u8, rasr_attr);
        }

        let common_trailing_zeroes = (start | end).trailing_zeros();
        if common_trailing_zeroes < 5 {
            return Err(Error::PermissionDenied);
        }

        let common_msb = 32 - (start ^ end.wrapping_sub(1)).leading_zeros();
        let sig_bits = common_msb as i32 - common_trailing_zeroes as i32;

        if sig_bits <= 3 {
            let size_bit = (common_trailing_zeroes + 3) as u8;
            return self.region_calculate_and_set(start, end, size_bit, rasr_attr);
        }

        if sig_bits == 4 {
            let size_bit = (common_trailing_zeroes + 3) as u8;
            let diff_mask = (1u32 << size_bit) - 1;
            let reg1_end = (start & !diff_mask) + diff_mask + 1;
            self.region_calculate_and_set(start, reg1_end, size_bit, rasr_attr)?;
            return self.region_calculate_and_set(reg1_end, end, size_bit, rasr_attr);
        }

        if rasr_attr == hole_attr(rasr_attr) {
            // Already punching a hole; a further cutout would need a third
            // region, which the "≤2 regions per map" budget forbids.
            return Err(Error::PermissionDenied);
        }

        let diff_mask = (1u32 << (common_msb - 3)) - 1;
        let (aligned_start, aligned_end, hole_start, hole_end) = if start & !diff_mask == start {
            (start, (end & !diff_mask) + diff_mask + 1, end, (end & !diff_mask) + diff_mask + 1)
        } else if end & !diff_mask == end {
            (start & !diff_mask, end, start & !diff_mask, start)
        } else {
            // Would need cutting from both ends: unsupported.
            return Err(Error::PermissionDenied);
        };

        if self.check_overlap(hole_start, hole_end) {
            return Err(Error::PermissionDenied);
        }

        self.region_calculate_and_set(aligned_start, aligned_end, common_msb as u8, rasr_attr)?;
        self.region_generate(hole_start, hole_end, hole_attr(rasr_attr))
    }

    /// Allocates `[start, end)` for `map_id` with attributes `attr`; on
    /// failure, rolls back by invalidating any regions written for this
    /// call (`mpu_regionAlloc`'s cleanup path).
    pub fn alloc_map(&mut self, start: u32, end: u32, attr: u8, map_id: u8, enable: bool) -> Result<()> {
        let region_cur = self.regions.len();
        let rasr_attr = region_attrs(attr, enable);

        if let Err(e) = self.region_generate(start, end, rasr_attr) {
            self.invalidate_from(region_cur);
            return Err(e);
        }

        for m in &mut self.map_ids[region_cur..] {
            *m = u32::from(map_id);
        }
        Ok(())
    }

    /// Disables every region at or past `from` and clears its map
    /// assignment, undoing a partial/failed allocation.
    fn invalidate_from(&mut self, from: usize) {
        self.regions.truncate(from);
        self.map_ids.truncate(from);
    }

    /// `true` if `map_id` already has at least one region in this table.
    #[must_use]
    pub fn is_map_allocated(&self, map_id: u8) -> bool {
        self.map_ids.iter().any(|m| *m == u32::from(map_id))
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn power_of_two_aligned_range_is_one_region_no_srd() {
        let mut t = RegionTable::new(16);
        t.alloc_map(0x2000_0000, 0x2000_1000, attr::READ | attr::WRITE, 0, true).unwrap();
        assert_eq!(t.regions().len(), 1);
        assert_eq!(t.regions()[0].rasr & 0xFF00, 0); // SRD mask is 0
    }

    #[test]
    fn sub_32_byte_granularity_fails_with_permission_denied() {
        let mut t = RegionTable::new(16);
        let err = t.alloc_map(0x1000_0001, 0x1000_0011, attr::READ, 0, true).unwrap_err();
        assert_eq!(err, Error::PermissionDenied);
    }

    #[test]
    fn four_significant_bits_yields_two_regions() {
        let mut t = RegionTable::new(16);
        // ctz(start|end) == 5, msb(start ^ (end-1)) == 9 => sigBits == 4.
        t.alloc_map(0x1000_0020, 0x1000_01E0, attr::READ, 0, true).unwrap();
        assert_eq!(t.regions().len(), 2);
    }

    #[test]
    fn failed_allocation_rolls_back_partial_regions() {
        let mut t = RegionTable::new(1);
        // First allocation fills the only region slot.
        t.alloc_map(0x2000_0000, 0x2000_1000, attr::READ, 0, true).unwrap();
        let before = t.regions().len();
        let err = t.alloc_map(0x3000_0000, 0x3000_1000, attr::READ, 1, true).unwrap_err();
        assert_eq!(err, Error::PermissionDenied);
        assert_eq!(t.regions().len(), before);
    }

    #[test]
    fn is_map_allocated_tracks_region_ownership() {
        let mut t = RegionTable::new(16);
        t.alloc_map(0x2000_0000, 0x2000_1000, attr::READ, 3, true).unwrap();
        assert!(t.is_map_allocated(3));
        assert!(!t.is_map_allocated(4));
    }
}
