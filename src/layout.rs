//! Maps a digested routing key to its candidate slot offsets.
//!
//! A key may legally occupy up to [`MAX_PROBE`] slots. The probe sequence is
//! quadratic with a prime-ish step over the first eight bytes of the digested
//! key, masked to a non-negative 63-bit value before the modular reduction:
//!
//! ```text
//! offset[i] = ((h + 141*i^2 + 13*i) mod 2^63) mod capacity
//! ```
//!
//! The raw sequence may repeat an offset, so it is uniquified afterwards by
//! linear stepping. For stores smaller than the probe count full uniqueness
//! is impossible and the loop bails instead of spinning.

use byteorder::{BigEndian, ByteOrder};

/// Maximum number of slots probed per key.
pub(crate) const MAX_PROBE: usize = 5;

/// Candidate slot offsets for a digested key in a store of `capacity` slots.
///
/// Deterministic in (key, capacity). Offsets are pairwise distinct whenever
/// `capacity >= MAX_PROBE`.
pub(crate) fn candidate_offsets(digested_key: &[u8; 32], capacity: u64) -> [u64; MAX_PROBE] {
    debug_assert!(capacity > 0);

    let h = BigEndian::read_u64(&digested_key[..8]);
    let mut offsets = [0u64; MAX_PROBE];

    for i in 0..MAX_PROBE {
        let step = i as u64;
        offsets[i] = (h.wrapping_add(141 * step * step + 13 * step) & (i64::MAX as u64)) % capacity;

        loop {
            let mut clear = true;
            for j in 0..i {
                if offsets[i] == offsets[j] {
                    offsets[i] = (offsets[i] + 1) % capacity;
                    clear = false;
                }
            }
            if clear || MAX_PROBE as u64 > capacity {
                break;
            }
        }
    }

    offsets
}

#[cfg(test)]
mod tests {
    use super::*;

    fn key_with_prefix(prefix: u64, fill: u8) -> [u8; 32] {
        let mut key = [fill; 32];
        BigEndian::write_u64(&mut key[..8], prefix);
        key
    }

    #[test]
    fn test_offsets_deterministic() {
        let key = key_with_prefix(0xDEAD_BEEF_CAFE_F00D, 0x42);
        assert_eq!(candidate_offsets(&key, 1024), candidate_offsets(&key, 1024));
    }

    #[test]
    fn test_offsets_distinct_when_capacity_allows() {
        for prefix in [0u64, 1, 5, u64::MAX, 0x8000_0000_0000_0000] {
            let key = key_with_prefix(prefix, 0);
            for capacity in [6u64, 7, 100, 1024, 1 << 40] {
                let offsets = candidate_offsets(&key, capacity);
                for i in 0..MAX_PROBE {
                    assert!(offsets[i] < capacity);
                    for j in 0..i {
                        assert_ne!(offsets[i], offsets[j], "capacity={capacity} prefix={prefix}");
                    }
                }
            }
        }
    }

    #[test]
    fn test_only_prefix_matters() {
        let a = key_with_prefix(99, 0x00);
        let b = key_with_prefix(99, 0xFF);
        assert_eq!(candidate_offsets(&a, 4096), candidate_offsets(&b, 4096));
    }

    #[test]
    fn test_tiny_store_terminates() {
        // Capacity below MAX_PROBE cannot produce distinct offsets; the
        // uniquify loop must still terminate and stay in range.
        let key = key_with_prefix(7, 0);
        for capacity in 1..5u64 {
            let offsets = candidate_offsets(&key, capacity);
            for offset in offsets {
                assert!(offset < capacity);
            }
        }
    }

    #[test]
    fn test_exact_probe_capacity_covers_all_slots() {
        // With capacity == MAX_PROBE every key ends up owning all slots.
        let key = key_with_prefix(123_456_789, 0);
        let mut offsets = candidate_offsets(&key, MAX_PROBE as u64);
        offsets.sort_unstable();
        assert_eq!(offsets, [0, 1, 2, 3, 4]);
    }
}
