// This Source Code Form is subject to the terms of the Mozilla Public
// License, v. 2.0. If a copy of the MPL was not distributed with this
// file, You can obtain one at http://mozilla.org/MPL/2.0/.

//! A growable set of bit indices, used for RCU masks and subband sets.
//!
//! On the wire a [`BitSet`] is a list of the set indices, e.g. `[0, 1, 5]`.

use serde::{Deserialize, Serialize};
use thiserror::Error;

use crate::constants::MAX_BIT_INDEX;

/// A mask of receiver channel units; bit `2 * antenna + pol` selects the RCU
/// of that antenna and polarisation.
pub type RcuMask = BitSet;

/// A set of subband indices.
pub type SubbandSet = BitSet;

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Debug, Clone, Default, PartialEq, Eq, Hash, Serialize, Deserialize)]
#[serde(try_from = "Vec<usize>", into = "Vec<usize>")]
pub struct BitSet {
    words: Vec<u64>,
}

impl BitSet {
    pub fn new() -> BitSet {
        BitSet::default()
    }

    /// A set with the first `n` bits set.
    pub fn with_first(n: usize) -> BitSet {
        (0..n).collect()
    }

    pub fn insert(&mut self, index: usize) {
        let word = index / WORD_BITS;
        if word >= self.words.len() {
            self.words.resize(word + 1, 0);
        }
        self.words[word] |= 1 << (index % WORD_BITS);
    }

    pub fn remove(&mut self, index: usize) {
        if let Some(w) = self.words.get_mut(index / WORD_BITS) {
            *w &= !(1 << (index % WORD_BITS));
        }
        // Trailing empty words would break the derived equality.
        while self.words.last() == Some(&0) {
            self.words.pop();
        }
    }

    pub fn contains(&self, index: usize) -> bool {
        self.words
            .get(index / WORD_BITS)
            .map(|w| w & (1 << (index % WORD_BITS)) != 0)
            .unwrap_or(false)
    }

    pub fn count(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    pub fn is_empty(&self) -> bool {
        self.words.iter().all(|&w| w == 0)
    }

    /// The largest set index, if any.
    pub fn max(&self) -> Option<usize> {
        self.words
            .iter()
            .enumerate()
            .rev()
            .find(|(_, &w)| w != 0)
            .map(|(i, w)| i * WORD_BITS + (WORD_BITS - 1 - w.leading_zeros() as usize))
    }

    /// Iterate over the set indices in ascending order.
    pub fn iter(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(i_word, &word)| {
            (0..WORD_BITS)
                .filter(move |bit| word & (1 << bit) != 0)
                .map(move |bit| i_word * WORD_BITS + bit)
        })
    }
}

impl FromIterator<usize> for BitSet {
    fn from_iter<I: IntoIterator<Item = usize>>(iter: I) -> Self {
        let mut set = BitSet::new();
        for i in iter {
            set.insert(i);
        }
        set
    }
}

#[derive(Error, Debug, PartialEq, Eq)]
#[error("Bit index {0} is larger than the maximum allowed ({max})", max = MAX_BIT_INDEX)]
pub struct BitIndexError(pub usize);

/// Indices come from clients, so they are bounded before any words are
/// allocated.
impl TryFrom<Vec<usize>> for BitSet {
    type Error = BitIndexError;

    fn try_from(v: Vec<usize>) -> Result<Self, Self::Error> {
        match v.iter().find(|&&i| i > MAX_BIT_INDEX) {
            Some(&i) => Err(BitIndexError(i)),
            None => Ok(v.into_iter().collect()),
        }
    }
}

impl From<BitSet> for Vec<usize> {
    fn from(b: BitSet) -> Self {
        b.iter().collect()
    }
}
