//! Tri-state multi-bit pin values.
//!
//! A [`PinState`] carries two masks of the same width: the value bits and the
//! driven bits. A bit that is not driven is Floating, whatever its value bit
//! says. The masks are packed into four `u64` words with `bitvec`, enough for
//! the widest (256-bit) pins.

use std::fmt;
use std::str::FromStr;

use bitvec::prelude::*;
use serde::{Deserialize, Deserializer, Serialize, Serializer};

use crate::error::{ErrorKind, Result, SimError};

type Mask = BitArray<[u64; 4], Lsb0>;

/// The bit widths a pin may be declared with.
pub const SUPPORTED_WIDTHS: [usize; 8] = [1, 4, 8, 16, 32, 64, 128, 256];

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug, Serialize, Deserialize)]
#[serde(try_from = "usize", into = "usize")]
pub struct BitWidth(u16);

impl BitWidth {
    pub const ONE: BitWidth = BitWidth(1);
    pub const FOUR: BitWidth = BitWidth(4);
    pub const EIGHT: BitWidth = BitWidth(8);
    pub const SIXTEEN: BitWidth = BitWidth(16);

    pub fn bits(self) -> usize {
        self.0 as usize
    }
}

impl TryFrom<usize> for BitWidth {
    type Error = SimError;

    fn try_from(bits: usize) -> Result<Self> {
        if SUPPORTED_WIDTHS.contains(&bits) {
            Ok(BitWidth(bits as u16))
        } else {
            Err(SimError::new(
                ErrorKind::InvalidWidth(bits),
                format!(
                    "Unsupported bit width {}. Pins may be {:?} bits wide.",
                    bits, SUPPORTED_WIDTHS
                ),
            ))
        }
    }
}

impl From<BitWidth> for usize {
    fn from(w: BitWidth) -> usize {
        w.bits()
    }
}

impl fmt::Display for BitWidth {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}", self.0)
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash, Debug)]
pub enum BitValue {
    Low,
    High,
    Floating,
}

impl BitValue {
    fn symbol(self) -> char {
        match self {
            BitValue::Low => '0',
            BitValue::High => '1',
            BitValue::Floating => 'Z',
        }
    }
}

impl From<bool> for BitValue {
    fn from(b: bool) -> Self {
        if b {
            BitValue::High
        } else {
            BitValue::Low
        }
    }
}

#[derive(Clone, Copy, PartialEq, Eq, Hash)]
pub struct PinState {
    width: BitWidth,
    value: Mask,
    driven: Mask,
}

impl PinState {
    /// Every bit Floating. This is what an undriven pin reads.
    pub fn floating(width: BitWidth) -> PinState {
        PinState {
            width,
            value: Mask::new([0; 4]),
            driven: Mask::new([0; 4]),
        }
    }

    pub fn low(width: BitWidth) -> PinState {
        let mut s = PinState::floating(width);
        s.driven[..width.bits()].fill(true);
        s
    }

    pub fn high(width: BitWidth) -> PinState {
        let mut s = PinState::low(width);
        s.value[..width.bits()].fill(true);
        s
    }

    /// Fully driven state holding the low `width` bits of `value`.
    pub fn from_u64(width: BitWidth, value: u64) -> PinState {
        let mut s = PinState::low(width);
        let n = width.bits().min(64);
        s.value[..n].store_le(value);
        s
    }

    /// Builds a fully driven state from bits given most significant first.
    pub fn from_bits(bits: &[bool]) -> Result<PinState> {
        let width = BitWidth::try_from(bits.len())?;
        let mut s = PinState::low(width);
        for (i, b) in bits.iter().rev().enumerate() {
            s.value.set(i, *b);
        }
        Ok(s)
    }

    pub fn width(&self) -> BitWidth {
        self.width
    }

    /// Bitwise assign from `source`. Widths must match.
    pub fn copy_from(&mut self, source: &PinState) -> Result<()> {
        if source.width != self.width {
            return Err(SimError::width_mismatch(
                self.width.bits(),
                source.width.bits(),
            ));
        }
        self.value = source.value;
        self.driven = source.driven;
        Ok(())
    }

    /// True when bit 0 is driven High. Used for 1-bit control signals.
    pub fn first_bit_high(&self) -> bool {
        self.driven[0] && self.value[0]
    }

    /// The value of bit `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is not below the pin's width.
    pub fn bit(&self, i: usize) -> BitValue {
        assert!(
            i < self.width.bits(),
            "Attempt to read bit {} of a {}-bit pin.",
            i,
            self.width
        );
        if !self.driven[i] {
            BitValue::Floating
        } else if self.value[i] {
            BitValue::High
        } else {
            BitValue::Low
        }
    }

    /// Drives or floats bit `i`.
    ///
    /// # Panics
    ///
    /// Panics if `i` is not below the pin's width.
    pub fn set_bit(&mut self, i: usize, bit: BitValue) {
        assert!(
            i < self.width.bits(),
            "Attempt to write bit {} of a {}-bit pin.",
            i,
            self.width
        );
        match bit {
            BitValue::Floating => {
                self.driven.set(i, false);
                self.value.set(i, false);
            }
            BitValue::Low => {
                self.driven.set(i, true);
                self.value.set(i, false);
            }
            BitValue::High => {
                self.driven.set(i, true);
                self.value.set(i, true);
            }
        }
    }

    pub fn is_fully_driven(&self) -> bool {
        self.driven[..self.width.bits()].all()
    }

    pub fn is_floating(&self) -> bool {
        self.driven[..self.width.bits()].not_any()
    }

    /// Numeric read of the low 64 bits, or None if any of them floats.
    pub fn value_u64(&self) -> Option<u64> {
        let n = self.width.bits().min(64);
        if !self.driven[..n].all() {
            return None;
        }
        Some(self.value[..n].load_le::<u64>())
    }

    /// Copies `count` bits starting at `from` in `source` into this state
    /// starting at bit `to`.
    pub fn copy_bits(&mut self, to: usize, source: &PinState, from: usize, count: usize) {
        for i in 0..count {
            self.set_bit(to + i, source.bit(from + i));
        }
    }
}

impl fmt::Display for PinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let s: String = (0..self.width.bits())
            .rev()
            .map(|i| self.bit(i).symbol())
            .collect();
        write!(f, "{}", s)
    }
}

impl fmt::Debug for PinState {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "PinState({})", self)
    }
}

/// Parses `0`, `1` and `Z` (or `z`, `?`) characters, most significant first.
impl FromStr for PinState {
    type Err = SimError;

    fn from_str(s: &str) -> Result<Self> {
        let width = BitWidth::try_from(s.chars().count())?;
        let mut state = PinState::floating(width);
        for (i, c) in s.chars().rev().enumerate() {
            let bit = match c {
                '0' => BitValue::Low,
                '1' => BitValue::High,
                'Z' | 'z' | '?' => BitValue::Floating,
                _ => {
                    return Err(SimError::new(
                        ErrorKind::Parse,
                        format!("Unexpected character {:?} in pin value {:?}.", c, s),
                    ))
                }
            };
            state.set_bit(i, bit);
        }
        Ok(state)
    }
}

impl Serialize for PinState {
    fn serialize<S>(&self, serializer: S) -> std::result::Result<S::Ok, S::Error>
    where
        S: Serializer,
    {
        serializer.serialize_str(&self.to_string())
    }
}

impl<'de> Deserialize<'de> for PinState {
    fn deserialize<D>(deserializer: D) -> std::result::Result<Self, D::Error>
    where
        D: Deserializer<'de>,
    {
        let s = String::deserialize(deserializer)?;
        s.parse().map_err(serde::de::Error::custom)
    }
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn test_unsupported_width() {
        assert!(BitWidth::try_from(3).is_err());
        assert!(BitWidth::try_from(0).is_err());
        assert_eq!(BitWidth::try_from(256).unwrap().bits(), 256);
    }

    #[test]
    #[should_panic(expected = "Attempt to read bit 4 of a 4-bit pin.")]
    fn test_bit_out_of_range() {
        PinState::floating(BitWidth::FOUR).bit(4);
    }

    #[test]
    #[should_panic(expected = "Attempt to write bit 1 of a 1-bit pin.")]
    fn test_set_bit_out_of_range() {
        PinState::floating(BitWidth::ONE).set_bit(1, BitValue::High);
    }

    #[test]
    fn test_default_is_floating_not_low() {
        let s = PinState::floating(BitWidth::EIGHT);
        for i in 0..8 {
            assert_eq!(s.bit(i), BitValue::Floating);
        }
        assert_ne!(s, PinState::low(BitWidth::EIGHT));
        assert_eq!(s.to_string(), "ZZZZZZZZ");
        assert_eq!(s.value_u64(), None);
    }

    #[test]
    fn test_eight_independent_bits() {
        let mut s = PinState::floating(BitWidth::EIGHT);
        s.set_bit(0, BitValue::High);
        s.set_bit(3, BitValue::Low);
        s.set_bit(7, BitValue::High);
        assert_eq!(s.bit(0), BitValue::High);
        assert_eq!(s.bit(1), BitValue::Floating);
        assert_eq!(s.bit(3), BitValue::Low);
        assert_eq!(s.bit(7), BitValue::High);
        assert_eq!(s.to_string(), "1ZZZ0ZZ1");

        s.set_bit(7, BitValue::Floating);
        assert_eq!(s.bit(7), BitValue::Floating);
        assert_eq!(s.bit(0), BitValue::High);
    }

    #[test]
    fn test_from_u64_masks_to_width() {
        let s = PinState::from_u64(BitWidth::FOUR, 0xFA);
        assert_eq!(s.value_u64(), Some(0xA));
        assert_eq!(s.to_string(), "1010");
        assert!(s.is_fully_driven());
    }

    #[test]
    fn test_copy_from_width_mismatch() {
        let mut target = PinState::floating(BitWidth::EIGHT);
        let source = PinState::high(BitWidth::FOUR);
        let err = target.copy_from(&source).unwrap_err();
        assert_eq!(
            err.kind,
            ErrorKind::WidthMismatch {
                expected: 8,
                found: 4
            }
        );
        assert!(target.is_floating());
    }

    #[test]
    fn test_first_bit_high() {
        assert!(PinState::high(BitWidth::ONE).first_bit_high());
        assert!(!PinState::low(BitWidth::ONE).first_bit_high());
        assert!(!PinState::floating(BitWidth::ONE).first_bit_high());
    }

    #[test]
    fn test_parse_and_display() {
        let s: PinState = "10Z1".parse().unwrap();
        assert_eq!(s.bit(0), BitValue::High);
        assert_eq!(s.bit(1), BitValue::Floating);
        assert_eq!(s.bit(3), BitValue::High);
        assert_eq!(s.to_string(), "10Z1");
        assert!("101".parse::<PinState>().is_err());
        assert!("10x1".parse::<PinState>().is_err());
    }

    #[test]
    fn test_from_bits_msb_first() {
        let s = PinState::from_bits(&[true, false, false, false]).unwrap();
        assert_eq!(s.value_u64(), Some(8));
    }

    #[test]
    fn test_wide_state() {
        let width = BitWidth::try_from(256).unwrap();
        let mut s = PinState::low(width);
        s.set_bit(255, BitValue::High);
        assert_eq!(s.bit(255), BitValue::High);
        assert_eq!(s.value_u64(), Some(0));
        assert!(s.is_fully_driven());
    }
}
