//! Part sizing for multipart uploads.
//!
//! Pure and deterministic so callers can assert exact part counts.

use crate::{config::MIB, errors::UploadError};
use std::ops::{Range, RangeInclusive};

/// Provider ceiling on the number of parts in one session.
pub const MAX_PARTS: u64 = 10_000;

/// Provider floor on every part except the last.
pub const MIN_PART_SIZE: u64 = 5 * MIB;

const SMALL_FILE_LIMIT: u64 = 100 * MIB;
const MEDIUM_FILE_LIMIT: u64 = 1024 * MIB;

/// How a file is sliced for a multipart upload.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct PartPlan {
    pub file_size: u64,
    pub part_size: u64,
    pub part_count: u32,
}

impl PartPlan {
    /// Plan parts for `file_size` bytes, rejecting empty files and anything
    /// above `max_file_size`.
    pub fn for_size(file_size: u64, max_file_size: u64) -> Result<Self, UploadError> {
        if file_size == 0 || file_size > max_file_size {
            return Err(UploadError::InvalidSize(
                i64::try_from(file_size).unwrap_or(i64::MAX),
            ));
        }

        let mut part_size = if file_size <= SMALL_FILE_LIMIT {
            (8 * MIB).max(MIN_PART_SIZE)
        } else if file_size <= MEDIUM_FILE_LIMIT {
            16 * MIB
        } else {
            32 * MIB
        };

        if file_size.div_ceil(part_size) > MAX_PARTS {
            part_size = file_size.div_ceil(MAX_PARTS).div_ceil(MIB) * MIB;
        }

        let part_count = u32::try_from(file_size.div_ceil(part_size))
            .map_err(|_| UploadError::InvalidSize(i64::try_from(file_size).unwrap_or(i64::MAX)))?;

        Ok(Self {
            file_size,
            part_size,
            part_count,
        })
    }

    /// Byte range of a 1-based part, or `None` outside `1..=part_count`.
    pub fn byte_range(&self, part_number: u32) -> Option<Range<u64>> {
        if part_number == 0 || part_number > self.part_count {
            return None;
        }
        let start = u64::from(part_number - 1) * self.part_size;
        let end = (start + self.part_size).min(self.file_size);
        Some(start..end)
    }

    pub fn part_numbers(&self) -> RangeInclusive<u32> {
        1..=self.part_count
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    const MAX: u64 = 500 * MIB;

    #[test]
    fn boundary_at_one_hundred_mib() {
        let at = PartPlan::for_size(100 * MIB, MAX).unwrap();
        assert_eq!(at.part_size, 8 * MIB);
        assert_eq!(at.part_count, 13);

        let over = PartPlan::for_size(100 * MIB + 1, MAX).unwrap();
        assert_eq!(over.part_size, 16 * MIB);
        assert_eq!(over.part_count, 7);
    }

    #[test]
    fn ceiling_file_uses_sixteen_mib_parts() {
        let plan = PartPlan::for_size(500 * MIB, MAX).unwrap();
        assert_eq!(plan.part_size, 16 * MIB);
        assert_eq!(plan.part_count, 32);
    }

    #[test]
    fn single_byte_is_one_part() {
        let plan = PartPlan::for_size(1, MAX).unwrap();
        assert_eq!(plan.part_count, 1);
        assert_eq!(plan.byte_range(1), Some(0..1));
        assert_eq!(plan.byte_range(2), None);
        assert_eq!(plan.byte_range(0), None);
    }

    #[test]
    fn rejects_empty_and_oversized_files() {
        assert!(matches!(
            PartPlan::for_size(0, MAX),
            Err(UploadError::InvalidSize(0))
        ));
        assert!(matches!(
            PartPlan::for_size(MAX + 1, MAX),
            Err(UploadError::InvalidSize(_))
        ));
    }

    #[test]
    fn plan_covers_file_within_provider_limits() {
        let mut size = 1u64;
        while size <= MAX {
            let plan = PartPlan::for_size(size, MAX).unwrap();
            assert!(u64::from(plan.part_count) * plan.part_size >= size, "size {size}");
            assert!(u64::from(plan.part_count) <= MAX_PARTS);
            assert!(plan.part_size >= MIN_PART_SIZE);
            // Every part but the last is full-sized; the last is non-empty.
            let last = plan.byte_range(plan.part_count).unwrap();
            assert!(last.end == size && last.start < last.end);
            size = size * 3 + 7;
        }
    }

    #[test]
    fn rederives_part_size_above_part_ceiling() {
        // Only reachable with a raised ceiling: 400 GiB at 32 MiB would need
        // 12,800 parts.
        let size = 400 * 1024 * MIB;
        let plan = PartPlan::for_size(size, u64::MAX).unwrap();
        assert_eq!(plan.part_size, 41 * MIB);
        assert!(u64::from(plan.part_count) <= MAX_PARTS);
        assert!(u64::from(plan.part_count) * plan.part_size >= size);
        assert_eq!(plan.part_size % MIB, 0);
    }

    #[test]
    fn byte_ranges_tile_the_file() {
        let plan = PartPlan::for_size(20 * MIB + 3, MAX).unwrap();
        assert_eq!(plan.part_count, 3);
        let ranges: Vec<_> = plan
            .part_numbers()
            .map(|n| plan.byte_range(n).unwrap())
            .collect();
        assert_eq!(ranges[0], 0..8 * MIB);
        assert_eq!(ranges[1], 8 * MIB..16 * MIB);
        assert_eq!(ranges[2], 16 * MIB..20 * MIB + 3);
    }
}
