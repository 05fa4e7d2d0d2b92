//! Share difficulty and its relation to hashes and targets.
//!
//! Difficulty is expressed relative to the "difficulty 1" target used by
//! Stratum (`0x00000000ffff0000...`, i.e. `0xffff * 2^208`). A hash `h` has
//! difficulty `DIFF1 / h`; smaller hashes mean higher difficulty. Share
//! difficulties are fractional in practice (regtest, CPU miners), so the
//! value is an `f64`.
//!
//! [`meets_difficulty`] is defined directly in terms of
//! [`hash_to_difficulty`], so the two can never disagree at the boundary.

use std::fmt;

use bitcoin::hashes::Hash;
use bitcoin::BlockHash;
use serde::{Deserialize, Serialize};

/// `0xffff * 2^208` as a float.
const DIFF1: f64 = 65535.0 * 411376139330301510538742295639337626245683966408394965837152256.0;

/// Share difficulty. Always positive and finite once it leaves a
/// constructor.
#[derive(Debug, Clone, Copy, PartialEq, PartialOrd, Serialize, Deserialize)]
#[serde(transparent)]
pub struct Difficulty(f64);

impl Difficulty {
    /// Smallest representable positive difficulty.
    pub const MIN_POSITIVE: Difficulty = Difficulty(f64::MIN_POSITIVE);

    /// Create from a float, rejecting zero, negative, and non-finite values.
    pub fn new(value: f64) -> Option<Self> {
        if value.is_finite() && value > 0.0 {
            Some(Self(value))
        } else {
            None
        }
    }

    pub fn as_f64(self) -> f64 {
        self.0
    }

    /// Clamp into `[min, max]`.
    pub fn clamp(self, min: Difficulty, max: Difficulty) -> Difficulty {
        Difficulty(self.0.clamp(min.0, max.0))
    }

    /// Multiply by a positive factor, saturating at `f64::MAX`.
    pub fn scale(self, factor: f64) -> Difficulty {
        let v = self.0 * factor;
        if v.is_finite() && v > 0.0 {
            Difficulty(v)
        } else if v <= 0.0 {
            Difficulty::MIN_POSITIVE
        } else {
            Difficulty(f64::MAX)
        }
    }

    /// Share target for this difficulty, as little-endian 256-bit bytes.
    pub fn to_target_le(self) -> [u8; 32] {
        f64_to_le_u256(DIFF1 / self.0)
    }

    /// Difficulty for a little-endian 256-bit target.
    pub fn from_target_le(target: &[u8; 32]) -> Difficulty {
        Difficulty(ratio_to_diff1(le_u256_to_f64(target)))
    }
}

impl fmt::Display for Difficulty {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if self.0 >= 1.0 && self.0.fract() == 0.0 && self.0 < 1e15 {
            write!(f, "{}", self.0 as u64)
        } else {
            write!(f, "{}", self.0)
        }
    }
}

impl From<u64> for Difficulty {
    fn from(value: u64) -> Self {
        Difficulty(value.max(1) as f64)
    }
}

/// Difficulty of a block hash.
///
/// The hash is interpreted as a little-endian 256-bit integer, the same way
/// `Target::is_met_by` treats it. A zero hash saturates at `f64::MAX`.
pub fn hash_to_difficulty(hash: &BlockHash) -> Difficulty {
    Difficulty(ratio_to_diff1(le_u256_to_f64(hash.as_byte_array())))
}

/// Whether `hash` meets difficulty `difficulty` (inclusive).
pub fn meets_difficulty(hash: &BlockHash, difficulty: Difficulty) -> bool {
    hash_to_difficulty(hash) >= difficulty
}

fn ratio_to_diff1(value: f64) -> f64 {
    if value <= 0.0 {
        return f64::MAX;
    }
    let d = DIFF1 / value;
    if d.is_finite() {
        d.max(f64::MIN_POSITIVE)
    } else {
        f64::MAX
    }
}

fn le_u256_to_f64(bytes: &[u8; 32]) -> f64 {
    bytes.iter().rev().fold(0.0, |acc, &b| acc * 256.0 + b as f64)
}

fn f64_to_le_u256(value: f64) -> [u8; 32] {
    if !(value >= 1.0) {
        let mut out = [0u8; 32];
        // Sub-unit targets only happen for absurd difficulties; keep the
        // target non-zero so it stays meaningful.
        out[0] = 1;
        return out;
    }
    if value >= 2f64.powi(256) {
        return [0xff; 32];
    }

    let bits = value.to_bits();
    let exponent = ((bits >> 52) & 0x7ff) as i32 - 1075;
    let mantissa = (bits & ((1u64 << 52) - 1)) | (1u64 << 52);

    let mut out = [0u8; 32];
    for i in 0..53 {
        if mantissa & (1u64 << i) == 0 {
            continue;
        }
        let pos = i as i32 + exponent;
        if (0..256).contains(&pos) {
            out[(pos / 8) as usize] |= 1 << (pos % 8);
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;
    use test_case::test_case;

    fn hash_from_be_hex(hex_str: &str) -> BlockHash {
        let mut bytes: [u8; 32] = hex::decode(hex_str).unwrap().try_into().unwrap();
        bytes.reverse();
        BlockHash::from_byte_array(bytes)
    }

    #[test]
    fn test_diff1_hash_is_difficulty_one() {
        let hash = hash_from_be_hex(
            "00000000ffff0000000000000000000000000000000000000000000000000000",
        );
        let d = hash_to_difficulty(&hash);
        assert!((d.as_f64() - 1.0).abs() < 1e-12);
    }

    #[test]
    fn test_smaller_hash_is_higher_difficulty() {
        let a = hash_from_be_hex(
            "00000000ffff0000000000000000000000000000000000000000000000000000",
        );
        let b = hash_from_be_hex(
            "000000000fff0000000000000000000000000000000000000000000000000000",
        );
        assert!(hash_to_difficulty(&b) > hash_to_difficulty(&a));
    }

    #[test]
    fn test_zero_hash_saturates() {
        let hash = BlockHash::all_zeros();
        assert_eq!(hash_to_difficulty(&hash).as_f64(), f64::MAX);
    }

    #[test]
    fn test_meets_difficulty_inclusive_at_equality() {
        let hash = hash_from_be_hex(
            "000000000000ffff000000000000000000000000000000000000000000000000",
        );
        let exact = hash_to_difficulty(&hash);
        assert!(meets_difficulty(&hash, exact));
        assert!(!meets_difficulty(&hash, exact.scale(1.000_001)));
        assert!(meets_difficulty(&hash, exact.scale(0.999_999)));
    }

    #[test_case(1.0; "difficulty one")]
    #[test_case(1024.0; "power of two")]
    #[test_case(0.001; "fractional")]
    #[test_case(123_456_789.0; "large")]
    fn test_target_roundtrip_is_close(d: f64) {
        let difficulty = Difficulty::new(d).unwrap();
        let back = Difficulty::from_target_le(&difficulty.to_target_le());
        assert!((back.as_f64() / d - 1.0).abs() < 1e-9);
    }

    #[test]
    fn test_difficulty_one_target_bytes() {
        let target = Difficulty::new(1.0).unwrap().to_target_le();
        // 0xffff << 208: bytes 26 and 27 (little-endian) are 0xff.
        assert_eq!(target[26], 0xff);
        assert_eq!(target[27], 0xff);
        assert!(target[..26].iter().all(|&b| b == 0));
        assert!(target[28..].iter().all(|&b| b == 0));
    }

    #[test]
    fn test_new_rejects_non_positive() {
        assert!(Difficulty::new(0.0).is_none());
        assert!(Difficulty::new(-1.0).is_none());
        assert!(Difficulty::new(f64::NAN).is_none());
        assert!(Difficulty::new(f64::INFINITY).is_none());
    }

    #[test]
    fn test_clamp_and_scale() {
        let min = Difficulty::new(1.0).unwrap();
        let max = Difficulty::new(100.0).unwrap();
        assert_eq!(Difficulty::new(500.0).unwrap().clamp(min, max), max);
        assert_eq!(Difficulty::new(0.5).unwrap().clamp(min, max), min);
        assert_eq!(Difficulty::new(10.0).unwrap().scale(2.0).as_f64(), 20.0);
    }

    #[test]
    fn test_display() {
        assert_eq!(Difficulty::from(512).to_string(), "512");
        assert_eq!(Difficulty::new(0.5).unwrap().to_string(), "0.5");
    }
}
