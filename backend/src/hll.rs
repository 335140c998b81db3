//! Fixed-parameter HyperLogLog sketch used for approximate unique-client counts.
//!
//! Every sketch in this process uses the same parameters (`p=11`,
//! register width 5 bits, i.e. 2048 registers each capable of storing a run
//! length up to 31). Standardizing on one precision everywhere means
//! `union` never needs to downscale and `IncompatibleParameters` only fires
//! on genuinely foreign/corrupt input.

use thiserror::Error;

/// Register precision: 2^P registers.
pub const P: u8 = 11;
/// Bits per register.
pub const REGISTER_WIDTH: u8 = 5;
/// Wire format version byte.
const WIRE_VERSION: u8 = 1;

const REGISTER_COUNT: usize = 1 << P as usize;
const REGISTER_MASK: u8 = (1 << REGISTER_WIDTH) - 1; // 0b0001_1111 = 31

#[derive(Debug, Error, PartialEq, Eq)]
pub enum HllError {
    #[error("incompatible HLL parameters: p={p_a}/width={w_a} vs p={p_b}/width={w_b}")]
    IncompatibleParameters { p_a: u8, w_a: u8, p_b: u8, w_b: u8 },
    #[error("truncated HLL byte stream")]
    Truncated,
    #[error("unsupported HLL wire version {0}")]
    UnsupportedVersion(u8),
}

/// A HyperLogLog sketch over 64-bit hashes.
#[derive(Clone, Debug, PartialEq, Eq)]
pub struct Hll {
    p: u8,
    width: u8,
    registers: Vec<u8>,
}

impl Default for Hll {
    fn default() -> Self {
        Self::new()
    }
}

impl Hll {
    /// A fresh, empty sketch at the process-wide fixed precision.
    pub fn new() -> Self {
        Self {
            p: P,
            width: REGISTER_WIDTH,
            registers: vec![0u8; REGISTER_COUNT],
        }
    }

    fn register_count(&self) -> usize {
        1usize << self.p as usize
    }

    /// Insert a 64-bit hash. Updates register `h mod 2^p` to
    /// `max(current, leadingZeros(h >> p) + 1)`.
    pub fn add(&mut self, h: u64) {
        let idx = (h & (self.register_count() as u64 - 1)) as usize;
        let rest = h >> self.p;
        // Count leading zeros within the remaining (64-p) bits, then +1.
        let significant_bits = 64 - self.p as u32;
        let rank = if rest == 0 {
            significant_bits as u8 + 1
        } else {
            (rest.leading_zeros() - self.p as u32) as u8 + 1
        };
        let max_rank = (1u8 << self.width) - 1;
        let rank = rank.min(max_rank);
        if rank > self.registers[idx] {
            self.registers[idx] = rank;
        }
    }

    /// Pointwise register-max union with another sketch of identical parameters.
    pub fn union(&mut self, other: &Hll) -> Result<(), HllError> {
        if self.p != other.p || self.width != other.width {
            return Err(HllError::IncompatibleParameters {
                p_a: self.p,
                w_a: self.width,
                p_b: other.p,
                w_b: other.width,
            });
        }
        for (a, b) in self.registers.iter_mut().zip(other.registers.iter()) {
            if *b > *a {
                *a = *b;
            }
        }
        Ok(())
    }

    /// Union-by-value: returns a new sketch without mutating either input.
    pub fn unioned(a: &Hll, b: &Hll) -> Result<Hll, HllError> {
        let mut out = a.clone();
        out.union(b)?;
        Ok(out)
    }

    /// Standard HLL cardinality estimator with small-range linear-counting
    /// correction.
    pub fn cardinality(&self) -> u64 {
        let m = self.register_count() as f64;
        let alpha_m = alpha(m);

        let mut sum_inv = 0.0f64;
        let mut zero_registers = 0usize;
        for &r in &self.registers {
            sum_inv += 2f64.powi(-(r as i32));
            if r == 0 {
                zero_registers += 1;
            }
        }

        let raw_estimate = alpha_m * m * m / sum_inv;

        let estimate = if raw_estimate <= 2.5 * m && zero_registers > 0 {
            // Linear counting for the small-range regime.
            m * (m / zero_registers as f64).ln()
        } else {
            raw_estimate
        };

        estimate.round().max(0.0) as u64
    }

    /// Stable wire layout: 1-byte version, 1-byte p, 1-byte register width,
    /// then packed registers, MSB-first.
    pub fn to_bytes(&self) -> Vec<u8> {
        let mut out = Vec::with_capacity(3 + packed_len(self.register_count(), self.width));
        out.push(WIRE_VERSION);
        out.push(self.p);
        out.push(self.width);
        out.extend(pack_registers(&self.registers, self.width));
        out
    }

    /// Inverse of [`Hll::to_bytes`]. Round-trip law:
    /// `from_bytes(to_bytes(h)) == h`.
    pub fn from_bytes(bytes: &[u8]) -> Result<Hll, HllError> {
        if bytes.len() < 3 {
            return Err(HllError::Truncated);
        }
        let version = bytes[0];
        if version != WIRE_VERSION {
            return Err(HllError::UnsupportedVersion(version));
        }
        let p = bytes[1];
        let width = bytes[2];
        let register_count = 1usize << p as usize;
        let expected_len = packed_len(register_count, width);
        if bytes.len() - 3 < expected_len {
            return Err(HllError::Truncated);
        }
        let registers = unpack_registers(&bytes[3..3 + expected_len], register_count, width);
        Ok(Hll {
            p,
            width,
            registers,
        })
    }
}

fn alpha(m: f64) -> f64 {
    // Standard HLL alpha constants; m=2048 (p=11) always falls in the >=128 branch
    // for this process, but the general formula is kept for clarity and testability.
    if m == 16.0 {
        0.673
    } else if m == 32.0 {
        0.697
    } else if m == 64.0 {
        0.709
    } else {
        0.7213 / (1.0 + 1.079 / m)
    }
}

fn packed_len(register_count: usize, width: u8) -> usize {
    (register_count * width as usize + 7) / 8
}

fn pack_registers(registers: &[u8], width: u8) -> Vec<u8> {
    let total_bits = registers.len() * width as usize;
    let mut out = vec![0u8; (total_bits + 7) / 8];
    let mut bit_pos = 0usize;
    for &r in registers {
        let v = (r & REGISTER_MASK) as u32;
        // Write `width` bits of v, MSB-first, starting at bit_pos.
        for b in (0..width).rev() {
            let bit = (v >> b) & 1;
            let byte_idx = bit_pos / 8;
            let bit_idx = 7 - (bit_pos % 8);
            out[byte_idx] |= (bit as u8) << bit_idx;
            bit_pos += 1;
        }
    }
    out
}

fn unpack_registers(bytes: &[u8], register_count: usize, width: u8) -> Vec<u8> {
    let mut out = Vec::with_capacity(register_count);
    let mut bit_pos = 0usize;
    for _ in 0..register_count {
        let mut v = 0u8;
        for _ in 0..width {
            let byte_idx = bit_pos / 8;
            let bit_idx = 7 - (bit_pos % 8);
            let bit = (bytes[byte_idx] >> bit_idx) & 1;
            v = (v << 1) | bit;
            bit_pos += 1;
        }
        out.push(v);
    }
    out
}

/// Hex-encode sketch bytes with the `\x` wire prefix used in submission
/// payloads and query responses (`clients`/`hll_clients` fields).
pub fn to_hex_wire(bytes: &[u8]) -> String {
    format!("\\x{}", hex::encode(bytes))
}

/// Decode a `\x`-prefixed (or bare) hex string back to raw sketch bytes.
pub fn from_hex_wire(s: &str) -> Result<Vec<u8>, HllError> {
    let stripped = s.strip_prefix("\\x").unwrap_or(s);
    hex::decode(stripped).map_err(|_| HllError::Truncated)
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn empty_sketch_has_zero_cardinality() {
        let h = Hll::new();
        assert_eq!(h.cardinality(), 0);
    }

    #[test]
    fn round_trip_preserves_cardinality() {
        let mut h = Hll::new();
        for i in 0..5000u64 {
            h.add(splitmix(i));
        }
        let bytes = h.to_bytes();
        let back = Hll::from_bytes(&bytes).unwrap();
        assert_eq!(h.cardinality(), back.cardinality());
        assert_eq!(h, back);
    }

    #[test]
    fn cardinality_is_approximately_correct() {
        let mut h = Hll::new();
        let n = 10_000u64;
        for i in 0..n {
            h.add(splitmix(i));
        }
        let est = h.cardinality() as f64;
        // Standard error for p=11 is roughly 1.04/sqrt(2048) ~= 2.3%.
        let rel_err = (est - n as f64).abs() / n as f64;
        assert!(rel_err < 0.1, "relative error too large: {rel_err}");
    }

    #[test]
    fn union_is_commutative() {
        let mut a = Hll::new();
        let mut b = Hll::new();
        for i in 0..1000u64 {
            a.add(splitmix(i));
        }
        for i in 500..1500u64 {
            b.add(splitmix(i));
        }
        let ab = Hll::unioned(&a, &b).unwrap();
        let ba = Hll::unioned(&b, &a).unwrap();
        assert_eq!(ab, ba);
    }

    #[test]
    fn union_is_associative() {
        let mut a = Hll::new();
        let mut b = Hll::new();
        let mut c = Hll::new();
        for i in 0..500u64 {
            a.add(splitmix(i));
        }
        for i in 300..900u64 {
            b.add(splitmix(i));
        }
        for i in 700..1200u64 {
            c.add(splitmix(i));
        }
        let bc = Hll::unioned(&b, &c).unwrap();
        let left = Hll::unioned(&a, &bc).unwrap();
        let ab = Hll::unioned(&a, &b).unwrap();
        let right = Hll::unioned(&ab, &c).unwrap();
        assert_eq!(left, right);
    }

    #[test]
    fn union_rejects_incompatible_parameters() {
        let mut a = Hll::new();
        let b = Hll {
            p: 12,
            width: 5,
            registers: vec![0u8; 1 << 12],
        };
        assert!(a.union(&b).is_err());
    }

    #[test]
    fn wire_hex_round_trips() {
        let mut h = Hll::new();
        h.add(42);
        let hex = to_hex_wire(&h.to_bytes());
        assert!(hex.starts_with("\\x"));
        let decoded = from_hex_wire(&hex).unwrap();
        assert_eq!(decoded, h.to_bytes());
    }

    /// Cheap hash spreader for test inputs (not used in production paths).
    fn splitmix(mut x: u64) -> u64 {
        x = x.wrapping_add(0x9E3779B97F4A7C15);
        let mut z = x;
        z = (z ^ (z >> 30)).wrapping_mul(0xBF58476D1CE4E5B9);
        z = (z ^ (z >> 27)).wrapping_mul(0x94D049BB133111EB);
        z ^ (z >> 31)
    }
}
