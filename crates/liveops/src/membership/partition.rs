use std::collections::{BTreeMap, BTreeSet};

use crate::error::LiveOpsError;
use crate::types::ServiceId;

/// Splits `bucket_count` buckets into contiguous ranges over group members.
pub struct PartitionAssigner;

impl PartitionAssigner {
    /// Compute bucket sizes for `members` partitions of `bucket_count`.
    ///
    /// With `normal = ceil(B / N)`, the first `normal * N - B` partitions get
    /// `normal - 1` buckets and the rest get `normal`.
    pub fn sizes(members: usize, bucket_count: u32) -> Result<Vec<u32>, LiveOpsError> {
        if members == 0 {
            return Err(LiveOpsError::InvalidPartition {
                reason: "cannot partition among zero members".to_string(),
            });
        }
        if bucket_count == 0 {
            return Err(LiveOpsError::InvalidPartition {
                reason: "cannot partition zero buckets".to_string(),
            });
        }
        let n = u32::try_from(members).map_err(|_| LiveOpsError::InvalidPartition {
            reason: format!("too many members: {members}"),
        })?;
        if n > bucket_count {
            return Err(LiveOpsError::InvalidPartition {
                reason: format!("{n} members exceed {bucket_count} buckets"),
            });
        }
        let normal = bucket_count.div_ceil(n);
        let smaller = normal * n - bucket_count;
        Ok((0..n)
            .map(|i| if i < smaller { normal - 1 } else { normal })
            .collect())
    }

    /// Assign contiguous bucket ranges to `members` in list order.
    pub fn compute(
        members: &[ServiceId],
        bucket_count: u32,
    ) -> Result<BTreeMap<ServiceId, Vec<u32>>, LiveOpsError> {
        let sizes = Self::sizes(members.len(), bucket_count)?;
        let mut next = 0u32;
        Ok(members
            .iter()
            .zip(sizes)
            .map(|(member, size)| {
                let range: Vec<u32> = (next..next + size).collect();
                next += size;
                (member.clone(), range)
            })
            .collect())
    }

    /// Compare a member's new allocation with what it polls today.
    ///
    /// Returns `(to_acquire, to_release)`.
    pub fn compute_diff(
        desired: &[u32],
        current: &[u32],
    ) -> (BTreeSet<u32>, BTreeSet<u32>) {
        let desired: BTreeSet<u32> = desired.iter().copied().collect();
        let current: BTreeSet<u32> = current.iter().copied().collect();
        let to_acquire = desired.difference(&current).copied().collect();
        let to_release = current.difference(&desired).copied().collect();
        (to_acquire, to_release)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn ids(n: usize) -> Vec<ServiceId> {
        (0..n).map(|i| ServiceId::new(format!("s{i}"))).collect()
    }

    #[test]
    fn three_members_over_256() {
        let table = PartitionAssigner::compute(&ids(3), 256).unwrap();
        let sizes: Vec<usize> = ids(3).iter().map(|id| table[id].len()).collect();
        assert_eq!(sizes, vec![85, 85, 86]);
        // Sorted multiset matches {86, 85, 85}.
        let mut sorted = sizes.clone();
        sorted.sort_unstable_by(|a, b| b.cmp(a));
        assert_eq!(sorted, vec![86, 85, 85]);
    }

    #[test]
    fn ranges_are_contiguous_disjoint_and_complete() {
        for (n, b) in [(1, 256), (3, 256), (7, 256), (5, 5), (4, 10), (2, 3)] {
            let members = ids(n);
            let table = PartitionAssigner::compute(&members, b).unwrap();
            let mut all: Vec<u32> = Vec::new();
            for member in &members {
                let range = &table[member];
                assert!(range.windows(2).all(|w| w[1] == w[0] + 1));
                all.extend(range);
            }
            assert_eq!(all, (0..b).collect::<Vec<_>>(), "n={n} b={b}");
        }
    }

    #[test]
    fn sizes_differ_by_at_most_one() {
        let sizes = PartitionAssigner::sizes(7, 256).unwrap();
        assert_eq!(sizes.iter().sum::<u32>(), 256);
        let max = *sizes.iter().max().unwrap();
        let min = *sizes.iter().min().unwrap();
        assert!(max - min <= 1);
    }

    #[test]
    fn more_members_than_buckets_is_rejected() {
        let err = PartitionAssigner::compute(&ids(5), 4).unwrap_err();
        assert!(matches!(err, LiveOpsError::InvalidPartition { .. }));
        assert!(err.is_config_error());
    }

    #[test]
    fn zero_members_or_buckets_is_rejected() {
        assert!(PartitionAssigner::sizes(0, 256).is_err());
        assert!(PartitionAssigner::sizes(1, 0).is_err());
    }

    #[test]
    fn compute_diff_works() {
        let (acquire, release) = PartitionAssigner::compute_diff(&[2, 3, 4], &[0, 1, 2]);
        assert_eq!(acquire.into_iter().collect::<Vec<_>>(), vec![3, 4]);
        assert_eq!(release.into_iter().collect::<Vec<_>>(), vec![0, 1]);
    }

    #[test]
    fn deterministic() {
        let a = PartitionAssigner::compute(&ids(4), 256).unwrap();
        let b = PartitionAssigner::compute(&ids(4), 256).unwrap();
        assert_eq!(a, b);
    }
}
