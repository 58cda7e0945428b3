// Copyright 2022 The Agentd Developers
//
// Licensed under the Apache License, Version 2.0 (the "License");
// you may not use this file except in compliance with the License.
// You may obtain a copy of the License at
//
//   http://www.apache.org/licenses/LICENSE-2.0
//
// Unless required by applicable law or agreed to in writing, software
// distributed under the License is distributed on an "AS IS" BASIS,
// WITHOUT WARRANTIES OR CONDITIONS OF ANY KIND, either express or implied.
// See the License for the specific language governing permissions and
// limitations under the License.

//! Fixed-width capability bitmaps.
//!
//! A bitcap enumerates which operations a context may perform: one bit per
//! operation index. Reductions intersect; set algebra never grows a
//! permission set. The byte encoding is part of the inter-service ABI: bit
//! `i` lives in byte `i / 8` under mask `1 << (i % 8)`, and the encoded
//! length is `ceil(width / 8)` bytes. Peers sharing a bitcap on the wire
//! must agree on the width.

use std::fmt;

/// A fixed-width bitmap of capabilities.
#[derive(Clone, PartialEq, Eq)]
pub struct Bitcap {
    bits: Vec<u8>,
    width: usize,
}

impl Bitcap {
    /// Creates a bitcap of `width` bits, all false.
    pub fn new_false(width: usize) -> Self {
        Self {
            bits: vec![0; (width + 7) / 8],
            width,
        }
    }

    /// Creates a bitcap of `width` bits, all true.
    pub fn new_true(width: usize) -> Self {
        let mut cap = Self::new_false(width);
        for index in 0..width {
            cap.set(index, true);
        }
        cap
    }

    /// The width of this bitcap in bits.
    pub fn width(&self) -> usize {
        self.width
    }

    /// Returns whether bit `index` is set. Out-of-range indices are false.
    pub fn is_set(&self, index: usize) -> bool {
        if index >= self.width {
            return false;
        }
        self.bits[index / 8] & (1 << (index % 8)) != 0
    }

    /// Sets or clears bit `index`. Out-of-range indices are ignored.
    pub fn set(&mut self, index: usize, value: bool) {
        if index >= self.width {
            return;
        }
        let mask = 1 << (index % 8);
        if value {
            self.bits[index / 8] |= mask;
        } else {
            self.bits[index / 8] &= !mask;
        }
    }

    /// Replaces this bitcap with its intersection with `other`.
    ///
    /// Widths must match; this is the reduction primitive, so the result is
    /// always a subset of both inputs.
    pub fn intersect(&mut self, other: &Bitcap) {
        debug_assert_eq!(self.width, other.width);
        for (word, other_word) in self.bits.iter_mut().zip(&other.bits) {
            *word &= *other_word;
        }
    }

    /// Replaces this bitcap with its union with `other`. Widths must match.
    pub fn union(&mut self, other: &Bitcap) {
        debug_assert_eq!(self.width, other.width);
        for (word, other_word) in self.bits.iter_mut().zip(&other.bits) {
            *word |= *other_word;
        }
    }

    /// Returns whether every set bit of `self` is also set in `other`.
    pub fn is_subset_of(&self, other: &Bitcap) -> bool {
        self.bits
            .iter()
            .zip(&other.bits)
            .all(|(word, other_word)| word & !other_word == 0)
    }

    /// The wire encoding of this bitcap.
    pub fn to_bytes(&self) -> Vec<u8> {
        self.bits.clone()
    }

    /// Decodes a bitcap of the given width from its wire encoding.
    ///
    /// Returns `None` when `bytes` is not exactly `ceil(width / 8)` long or
    /// when padding bits beyond `width` are set.
    pub fn from_bytes(width: usize, bytes: &[u8]) -> Option<Self> {
        if bytes.len() != (width + 7) / 8 {
            return None;
        }
        let mut cap = Self {
            bits: bytes.to_vec(),
            width,
        };
        // Clear and verify padding bits so equality stays byte equality.
        let tail_bits = width % 8;
        if tail_bits != 0 {
            let mask = (1u16 << tail_bits) as u8 - 1;
            let last = cap.bits.len() - 1;
            if cap.bits[last] & !mask != 0 {
                return None;
            }
            cap.bits[last] &= mask;
        }
        Some(cap)
    }
}

impl fmt::Debug for Bitcap {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let set: Vec<usize> = (0..self.width).filter(|&i| self.is_set(i)).collect();
        f.debug_struct("Bitcap")
            .field("width", &self.width)
            .field("set", &set)
            .finish()
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn init_false_and_true() {
        let cap = Bitcap::new_false(12);
        for index in 0..12 {
            assert!(!cap.is_set(index));
        }

        let cap = Bitcap::new_true(12);
        for index in 0..12 {
            assert!(cap.is_set(index));
        }
        // Bits beyond the width stay unset.
        assert!(!cap.is_set(12));
    }

    #[test]
    fn set_and_clear() {
        let mut cap = Bitcap::new_false(12);
        assert!(!cap.is_set(7));

        cap.set(7, true);
        assert!(cap.is_set(7));
        for index in (0..12).filter(|&i| i != 7) {
            assert!(!cap.is_set(index));
        }

        cap.set(7, false);
        assert!(!cap.is_set(7));
    }

    #[test]
    fn intersect_reduces() {
        let mut b = Bitcap::new_false(12);
        b.set(7, true);

        let mut c = Bitcap::new_false(12);
        c.set(7, true);
        c.set(8, true);

        b.intersect(&c);
        assert!(b.is_set(7));
        assert!(!b.is_set(8));
    }

    #[test]
    fn union_combines() {
        let mut b = Bitcap::new_false(12);
        b.set(6, true);

        let mut c = Bitcap::new_false(12);
        c.set(7, true);
        c.set(8, true);

        b.union(&c);
        assert!(b.is_set(6));
        assert!(b.is_set(7));
        assert!(b.is_set(8));
    }

    #[test]
    fn reduction_never_grows() {
        let mut full = Bitcap::new_true(16);
        let mut requested = Bitcap::new_false(16);
        requested.set(3, true);
        requested.set(200, true); // out of range, ignored

        full.intersect(&requested);
        assert!(full.is_subset_of(&requested));
        assert!(full.is_set(3));
        assert_eq!((0..16).filter(|&i| full.is_set(i)).count(), 1);
    }

    #[test]
    fn reduce_with_self_is_noop() {
        let mut cap = Bitcap::new_false(12);
        cap.set(2, true);
        cap.set(9, true);
        let copy = cap.clone();
        cap.intersect(&copy);
        assert_eq!(cap, copy);
    }

    #[test]
    fn round_trips_through_bytes() {
        let mut cap = Bitcap::new_false(12);
        cap.set(0, true);
        cap.set(11, true);

        let bytes = cap.to_bytes();
        assert_eq!(bytes.len(), 2);
        let decoded = Bitcap::from_bytes(12, &bytes).unwrap();
        assert_eq!(decoded, cap);
    }

    #[test]
    fn rejects_bad_encodings() {
        assert!(Bitcap::from_bytes(12, &[0u8; 3]).is_none());
        // Padding bits beyond the width must be clear.
        assert!(Bitcap::from_bytes(12, &[0x00, 0xF0]).is_none());
    }
}
