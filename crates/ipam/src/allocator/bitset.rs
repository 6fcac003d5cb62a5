//! Fixed-length bitset over address positions
//!
//! One bit per position, `1` = in use. Backed by `u64` words; bits past
//! `len` in the last word are always zero.

const WORD_BITS: usize = u64::BITS as usize;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct AddressBitset {
    words: Vec<u64>,
    len: usize,
}

impl AddressBitset {
    /// Create a bitset of `len` clear bits
    pub fn new(len: usize) -> Self {
        Self {
            words: vec![0; len.div_ceil(WORD_BITS)],
            len,
        }
    }

    pub fn len(&self) -> usize {
        self.len
    }

    pub fn is_empty(&self) -> bool {
        self.len == 0
    }

    /// Set bit `index`. Returns `false` if it is out of range.
    pub fn set(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index / WORD_BITS] |= 1 << (index % WORD_BITS);
        true
    }

    /// Clear bit `index`. Returns `false` if it is out of range.
    pub fn clear(&mut self, index: usize) -> bool {
        if index >= self.len {
            return false;
        }
        self.words[index / WORD_BITS] &= !(1 << (index % WORD_BITS));
        true
    }

    /// Whether bit `index` is set (out of range reads as clear)
    pub fn test(&self, index: usize) -> bool {
        index < self.len && self.words[index / WORD_BITS] & (1 << (index % WORD_BITS)) != 0
    }

    /// First clear bit at or after `from`
    pub fn next_clear(&self, from: usize) -> Option<usize> {
        if from >= self.len {
            return None;
        }

        let mut word_idx = from / WORD_BITS;
        // Treat bits below `from` in the first word as set
        let mut word = self.words[word_idx] | ((1u64 << (from % WORD_BITS)) - 1);

        loop {
            if word != u64::MAX {
                let index = word_idx * WORD_BITS + (!word).trailing_zeros() as usize;
                return (index < self.len).then_some(index);
            }
            word_idx += 1;
            word = *self.words.get(word_idx)?;
        }
    }

    /// Iterate set bit indices in ascending order
    pub fn iter_ones(&self) -> impl Iterator<Item = usize> + '_ {
        self.words.iter().enumerate().flat_map(|(word_idx, &word)| {
            let mut remaining = word;
            std::iter::from_fn(move || {
                if remaining == 0 {
                    return None;
                }
                let bit = remaining.trailing_zeros() as usize;
                remaining &= remaining - 1;
                Some(word_idx * WORD_BITS + bit)
            })
        })
    }

    /// Number of set bits
    pub fn count_ones(&self) -> usize {
        self.words.iter().map(|w| w.count_ones() as usize).sum()
    }

    /// Number of clear bits
    pub fn count_zeros(&self) -> usize {
        self.len - self.count_ones()
    }
}
