use crate::message::{CanMessage, MAX_PAYLOAD_LEN, MessageError};
use rand::Rng;
use std::ops::RangeInclusive;

/// Returns a copy of `data` with one bit inverted.
///
/// Bit `n` lives in byte `n / 8` at position `n % 8`, least significant first.
pub fn flip_bit(data: &[u8], bit: usize) -> Result<Vec<u8>, MessageError> {
    let byte = bit / 8;
    if byte >= data.len() {
        return Err(MessageError::BitOutOfRange {
            bit,
            len: data.len(),
        });
    }
    let mut flipped = data.to_vec();
    flipped[byte] ^= 1 << (bit % 8);
    Ok(flipped)
}

/// A payload of uniformly random length (0 to 8 bytes) and content.
pub fn random_payload<R: Rng + ?Sized>(rng: &mut R) -> Vec<u8> {
    let len = rng.random_range(0..=MAX_PAYLOAD_LEN);
    let mut data = vec![0u8; len];
    rng.fill_bytes(&mut data);
    data
}

/// Single-bit variants of a base frame, one per bit of an inclusive range.
///
/// Every variant is derived from the unmodified base, so at most one bit
/// differs from it at a time.
#[derive(Debug, Clone)]
pub struct BitFlips {
    base: CanMessage,
    bits: RangeInclusive<usize>,
}

impl BitFlips {
    /// Rejects ranges reaching past the payload before anything is generated.
    pub fn new(base: CanMessage, bits: RangeInclusive<usize>) -> Result<Self, MessageError> {
        let bit_len = base.data().len() * 8;
        if bits.start() > bits.end() || *bits.end() >= bit_len {
            return Err(MessageError::BitOutOfRange {
                bit: *bits.end(),
                len: base.data().len(),
            });
        }
        Ok(Self { base, bits })
    }

    pub fn len(&self) -> usize {
        self.bits.clone().count()
    }

    pub fn is_empty(&self) -> bool {
        self.bits.is_empty()
    }
}

impl Iterator for BitFlips {
    type Item = Result<CanMessage, MessageError>;

    fn next(&mut self) -> Option<Self::Item> {
        let bit = self.bits.next()?;
        Some(
            flip_bit(self.base.data(), bit).and_then(|data| self.base.with_data(data)),
        )
    }
}
