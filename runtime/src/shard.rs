//! Shard key routing.
//!
//! Maps a caller-chosen key to a lane index so that every mutation sharing
//! the key runs on the same single-worker lane, in submission order. The
//! hash is 64-bit FNV-1a: stable across processes and releases, and defined
//! for every string including the empty one. Collisions only cost
//! throughput.

const FNV_OFFSET_BASIS: u64 = 0xcbf2_9ce4_8422_2325;
const FNV_PRIME: u64 = 0x0000_0100_0000_01b3;

/// Deterministic key-to-lane mapping.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ShardRouter {
    lanes: usize,
}

impl ShardRouter {
    /// Router over `lanes` lanes. Zero is treated as one.
    #[must_use]
    pub const fn new(lanes: usize) -> Self {
        Self {
            lanes: if lanes == 0 { 1 } else { lanes },
        }
    }

    /// Number of lanes.
    #[must_use]
    pub const fn lanes(&self) -> usize {
        self.lanes
    }

    /// Lane index for `key`, in `0..lanes()`.
    #[must_use]
    #[allow(clippy::cast_possible_truncation)] // remainder is below `lanes`
    pub fn index_for(&self, key: &str) -> usize {
        (fnv1a_64(key.as_bytes()) % self.lanes as u64) as usize
    }
}

/// 64-bit FNV-1a hash.
#[must_use]
pub fn fnv1a_64(bytes: &[u8]) -> u64 {
    bytes.iter().fold(FNV_OFFSET_BASIS, |hash, byte| {
        (hash ^ u64::from(*byte)).wrapping_mul(FNV_PRIME)
    })
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;
    use querybus_testing::properties::shard_key;

    #[test]
    fn reference_vectors() {
        assert_eq!(fnv1a_64(b""), 0xcbf2_9ce4_8422_2325);
        assert_eq!(fnv1a_64(b"a"), 0xaf63_dc4c_8601_ec8c);
        assert_eq!(fnv1a_64(b"foobar"), 0x8594_4171_f739_67e8);
    }

    #[test]
    fn single_lane_takes_everything() {
        let router = ShardRouter::new(1);
        assert_eq!(router.index_for("user-42"), 0);
        assert_eq!(router.index_for(""), 0);
        assert_eq!(ShardRouter::new(0).lanes(), 1);
    }

    #[test]
    fn keys_spread_over_lanes() {
        let router = ShardRouter::new(4);
        let mut seen = [false; 4];
        for i in 0..64 {
            seen[router.index_for(&format!("user-{i}"))] = true;
        }
        assert!(seen.iter().all(|hit| *hit));
    }

    proptest! {
        #[test]
        fn index_is_in_range(key in shard_key(), lanes in 1usize..64) {
            let router = ShardRouter::new(lanes);
            prop_assert!(router.index_for(&key) < lanes);
        }

        #[test]
        fn same_key_same_lane(key in shard_key(), lanes in 1usize..64) {
            let first = ShardRouter::new(lanes).index_for(&key);
            let second = ShardRouter::new(lanes).index_for(&key);
            prop_assert_eq!(first, second);
        }
    }
}
