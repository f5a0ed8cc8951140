/// DJB2 hash function for consistent bucket assignment.
/// Produces a deterministic hash for any byte slice.
pub fn djb2_hash(bytes: &[u8]) -> u32 {
    let mut hash: u32 = 5381;
    for &b in bytes {
        hash = hash.wrapping_mul(33).wrapping_add(b as u32);
    }
    hash
}

/// Compute the work-queue bucket for a resource key.
///
/// Returns a bucket index in `[0, bucket_count)`. The same resource always
/// lands in the same bucket.
///
/// # Panics
///
/// Panics if `bucket_count` is zero.
pub fn bucket_for_resource(resource: &str, bucket_count: u32) -> u32 {
    assert!(bucket_count >= 1, "bucket_count must be >= 1, got {bucket_count}");
    djb2_hash(resource.as_bytes()) % bucket_count
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn deterministic() {
        assert_eq!(djb2_hash(b"account:abc"), djb2_hash(b"account:abc"));
        assert_eq!(
            bucket_for_resource("account:abc", 256),
            bucket_for_resource("account:abc", 256)
        );
    }

    #[test]
    fn different_inputs_differ() {
        assert_ne!(djb2_hash(b"account:abc"), djb2_hash(b"account:abd"));
    }

    #[test]
    fn distribution() {
        let buckets = 256;
        let num_keys = 20_000;
        let mut counts = vec![0u32; buckets as usize];

        for i in 0..num_keys {
            let key = format!("account:{i}");
            counts[bucket_for_resource(&key, buckets) as usize] += 1;
        }

        let expected = num_keys as f64 / buckets as f64;
        let max_allowed = (expected * 2.0) as u32;
        for (i, &count) in counts.iter().enumerate() {
            assert!(
                count <= max_allowed,
                "bucket {i} has {count} resources, expected at most {max_allowed}"
            );
        }
        assert!(counts.iter().all(|&c| c > 0), "every bucket should be used");
    }

    #[test]
    fn bucket_in_range() {
        for i in 0..1000 {
            let bucket = bucket_for_resource(&format!("guild:{i}"), 7);
            assert!(bucket < 7);
        }
    }

    #[test]
    fn single_bucket_maps_everything_to_zero() {
        assert_eq!(bucket_for_resource("anything", 1), 0);
    }

    #[test]
    #[should_panic(expected = "bucket_count must be >= 1")]
    fn zero_buckets_panics() {
        bucket_for_resource("x", 0);
    }
}
