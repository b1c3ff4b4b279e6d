//! Deterministic key-to-bucket assignment.
//!
//! The bucket is read from the trailing bytes of the key, masked down to
//! the number of bits needed to address every bucket. When the bucket
//! count is not a power of two, values past the last bucket are folded
//! with a mask one bit narrower instead of taking a modulo.

use crate::error::{GuardianError, GuardianResult};

const BITS_PER_BYTE: u32 = 8;

/// Maps arbitrary keys onto `[0, num_buckets)`.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct BucketIdProvider {
    num_buckets: u32,
    mask_high: u32,
    mask_low: u32,
    bytes_needed: usize,
}

impl BucketIdProvider {
    pub fn new(num_buckets: u32) -> GuardianResult<Self> {
        if num_buckets == 0 {
            return Err(GuardianError::InvalidNumberOfBuckets);
        }

        let (mask_high, mask_low) = masks(num_buckets);

        Ok(Self {
            num_buckets,
            mask_high,
            mask_low,
            bytes_needed: bytes_needed(num_buckets),
        })
    }

    pub fn num_buckets(&self) -> u32 {
        self.num_buckets
    }

    /// Returns the bucket the key belongs to.
    ///
    /// Empty and all-zero keys always land in bucket 0.
    pub fn bucket_for_address(&self, address: &[u8]) -> u32 {
        if address.iter().all(|b| *b == 0) {
            return 0;
        }

        let start = address.len().saturating_sub(self.bytes_needed);
        let value = address[start..]
            .iter()
            .fold(0_u32, |acc, b| (acc << BITS_PER_BYTE) | u32::from(*b));

        let bucket = value & self.mask_high;
        if bucket > self.num_buckets - 1 {
            value & self.mask_low
        } else {
            bucket
        }
    }
}

/// Number of bits needed to address `n` buckets, i.e. `ceil(log2(n))`.
fn bits_for(n: u32) -> u32 {
    if n <= 1 {
        0
    } else {
        u32::BITS - (n - 1).leading_zeros()
    }
}

fn masks(num_buckets: u32) -> (u32, u32) {
    let bits = bits_for(num_buckets);
    let mask = |width: u32| -> u32 {
        // width may be 32, so build the mask in u64 and narrow
        #[allow(clippy::cast_possible_truncation)]
        let m = ((1_u64 << width) - 1) as u32;
        m
    };

    let high = mask(bits);
    let low = if bits == 0 { 0 } else { mask(bits - 1) };
    (high, low)
}

fn bytes_needed(num_buckets: u32) -> usize {
    if num_buckets == 1 {
        return 1;
    }
    // floor(log2(n - 1)) / 8 + 1
    let highest_bit = u32::BITS - 1 - (num_buckets - 1).leading_zeros();
    (highest_bit / BITS_PER_BYTE + 1) as usize
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_zero_buckets_rejected() {
        assert_eq!(
            BucketIdProvider::new(0),
            Err(GuardianError::InvalidNumberOfBuckets)
        );
    }

    #[test]
    fn test_masks_and_bytes() {
        let p = BucketIdProvider::new(1).unwrap();
        assert_eq!((p.mask_high, p.mask_low, p.bytes_needed), (0, 0, 1));

        let p = BucketIdProvider::new(4).unwrap();
        assert_eq!((p.mask_high, p.mask_low, p.bytes_needed), (3, 1, 1));

        let p = BucketIdProvider::new(5).unwrap();
        assert_eq!((p.mask_high, p.mask_low, p.bytes_needed), (7, 3, 1));

        let p = BucketIdProvider::new(256).unwrap();
        assert_eq!((p.mask_high, p.mask_low, p.bytes_needed), (255, 127, 1));

        let p = BucketIdProvider::new(257).unwrap();
        assert_eq!((p.mask_high, p.mask_low, p.bytes_needed), (511, 255, 2));

        let p = BucketIdProvider::new(u32::MAX).unwrap();
        assert_eq!(p.mask_high, u32::MAX);
        assert_eq!(p.bytes_needed, 4);
    }

    #[test]
    fn test_empty_and_zero_address_map_to_first_bucket() {
        let p = BucketIdProvider::new(7).unwrap();
        assert_eq!(p.bucket_for_address(&[]), 0);
        assert_eq!(p.bucket_for_address(&[0; 32]), 0);
    }

    #[test]
    fn test_uses_trailing_bytes() {
        let p = BucketIdProvider::new(4).unwrap();
        assert_eq!(p.bucket_for_address(&[0xff, 0xff, 0x02]), 2);
        assert_eq!(p.bucket_for_address(&[0x00, 0x00, 0x07]), 3);

        // 5 buckets: 0b110 & 7 = 6 > 4, falls back to 0b110 & 3 = 2
        let p = BucketIdProvider::new(5).unwrap();
        assert_eq!(p.bucket_for_address(&[0x01, 0x06]), 2);
        assert_eq!(p.bucket_for_address(&[0x01, 0x04]), 4);
    }

    #[test]
    fn test_every_address_in_range() {
        for n in 1..=70_u32 {
            let p = BucketIdProvider::new(n).unwrap();
            for hi in 0..=255_u8 {
                for lo in (0..=255_u8).step_by(7) {
                    let bucket = p.bucket_for_address(&[0xaa, hi, lo]);
                    assert!(bucket < n, "n={n} bucket={bucket}");
                }
            }
        }
    }

    #[test]
    fn test_distribution_is_roughly_even_for_power_of_two() {
        let p = BucketIdProvider::new(4).unwrap();
        let mut counts = [0_u32; 4];
        for b in 0..=255_u8 {
            counts[p.bucket_for_address(&[1, b]) as usize] += 1;
        }
        assert!(counts.iter().all(|c| *c == 64));
    }
}
