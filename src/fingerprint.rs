//! Fixed-length perceptual fingerprints and the Hamming comparator.
//!
//! Fingerprints are only ever compared by counting differing bit positions.
//! Both sides must come from the same hasher, so a length mismatch is treated
//! as a broken invariant and surfaces as a fatal error.

use std::fmt;

use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{Result, VariantError};

/// Immutable bit vector produced by a [`PerceptualHasher`](crate::hasher::PerceptualHasher).
#[derive(Clone, PartialEq, Eq, Hash)]
pub struct Fingerprint {
    bytes: Box<[u8]>,
}

impl Fingerprint {
    pub fn from_bytes(bytes: impl Into<Box<[u8]>>) -> Result<Self> {
        let bytes = bytes.into();
        if bytes.is_empty() {
            return Err(VariantError::InvalidFingerprint("empty fingerprint".into()));
        }
        Ok(Self { bytes })
    }

    pub fn from_hex(hex_str: &str) -> Result<Self> {
        let bytes = hex::decode(hex_str)
            .map_err(|e| VariantError::InvalidFingerprint(format!("invalid hex string: {e}")))?;
        Self::from_bytes(bytes)
    }

    pub fn to_hex(&self) -> String {
        hex::encode(&self.bytes)
    }

    pub fn bits(&self) -> u32 {
        (self.bytes.len() * 8) as u32
    }

    /// Hamming distance to `other`, in `0..=self.bits()`.
    pub fn distance(&self, other: &Fingerprint) -> Result<u32> {
        distance(self, other)
    }

    /// Smallest distance from `self` to any of `others`, with the index of the
    /// closest one. `None` when `others` is empty.
    pub fn nearest<'a, I>(&self, others: I) -> Result<Option<(usize, u32)>>
    where
        I: IntoIterator<Item = &'a Fingerprint>,
    {
        let mut best: Option<(usize, u32)> = None;
        for (i, other) in others.into_iter().enumerate() {
            let d = self.distance(other)?;
            if best.map_or(true, |(_, b)| d < b) {
                best = Some((i, d));
            }
        }
        Ok(best)
    }
}

/// Count of bit positions where `a` and `b` differ.
pub fn distance(a: &Fingerprint, b: &Fingerprint) -> Result<u32> {
    if a.bytes.len() != b.bytes.len() {
        return Err(VariantError::FingerprintLength { left: a.bits(), right: b.bits() });
    }
    Ok(a.bytes
        .iter()
        .zip(b.bytes.iter())
        .map(|(x, y)| (x ^ y).count_ones())
        .sum())
}

impl fmt::Debug for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "Fingerprint({})", self.to_hex())
    }
}

impl fmt::Display for Fingerprint {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.to_hex())
    }
}

impl Serialize for Fingerprint {
    fn serialize<S: Serializer>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error> {
        serializer.serialize_str(&self.to_hex())
    }
}

impl<'de> Deserialize<'de> for Fingerprint {
    fn deserialize<D: Deserializer<'de>>(deserializer: D) -> std::result::Result<Self, D::Error> {
        let s = String::deserialize(deserializer)?;
        Fingerprint::from_hex(&s).map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
pub(crate) fn with_bits(total_bits: usize, set: impl IntoIterator<Item = usize>) -> Fingerprint {
    let mut bytes = vec![0u8; total_bits / 8];
    for bit in set {
        bytes[bit / 8] |= 1 << (bit % 8);
    }
    Fingerprint::from_bytes(bytes).unwrap()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn distance_to_self_is_zero() {
        let a = with_bits(256, [0, 7, 100, 255]);
        assert_eq!(a.distance(&a).unwrap(), 0);
    }

    #[test]
    fn distance_is_symmetric() {
        let a = with_bits(256, 0..40);
        let b = with_bits(256, 20..90);
        assert_eq!(a.distance(&b).unwrap(), b.distance(&a).unwrap());
        assert_eq!(a.distance(&b).unwrap(), 20 + 50);
    }

    #[test]
    fn distance_spans_full_length() {
        let zeros = with_bits(256, []);
        let ones = with_bits(256, 0..256);
        assert_eq!(zeros.distance(&ones).unwrap(), 256);
    }

    #[test]
    fn mismatched_lengths_are_fatal() {
        let a = with_bits(256, []);
        let b = with_bits(64, []);
        match a.distance(&b) {
            Err(VariantError::FingerprintLength { left: 256, right: 64 }) => {}
            other => panic!("expected length mismatch, got {other:?}"),
        }
    }

    #[test]
    fn nearest_reports_closest_index() {
        let probe = with_bits(64, 0..10);
        let others = vec![with_bits(64, 0..30), with_bits(64, 0..12), with_bits(64, 40..64)];
        assert_eq!(probe.nearest(&others).unwrap(), Some((1, 2)));
        assert_eq!(probe.nearest(std::iter::empty()).unwrap(), None);
    }

    #[test]
    fn hex_form_parses_back() {
        let a = with_bits(256, [3, 9, 200]);
        let parsed = Fingerprint::from_hex(&a.to_hex()).unwrap();
        assert_eq!(parsed, a);
        assert!(Fingerprint::from_hex("zz").is_err());
        assert!(Fingerprint::from_hex("").is_err());
    }
}
