//! Suffix array over one partition of the target and longest-prefix search
//! over it, as used by bsdiff.

use crate::error::{PatchError, Result};

/// Positions are stored as `i32`, so a partition must fit that index type.
pub const MAX_PARTITION_LEN: usize = i32::MAX as usize - 1;

/// Sorted start positions of every non-empty suffix of one byte string.
#[derive(Debug, Clone)]
pub struct SuffixArray {
    sa: Vec<i32>,
}

impl SuffixArray {
    pub fn new(data: &[u8]) -> Result<Self> {
        if data.len() > MAX_PARTITION_LEN {
            return Err(PatchError::PartitionTooLarge {
                len: data.len(),
                max: MAX_PARTITION_LEN,
            });
        }

        let mut sa = vec![0i32; data.len()];
        if !data.is_empty() {
            divsufsort::sort_in_place(data, &mut sa);
        }
        Ok(Self { sa })
    }

    /// Number of indexed bytes.
    pub fn len(&self) -> usize {
        self.sa.len()
    }

    pub fn is_empty(&self) -> bool {
        self.sa.is_empty()
    }

    /// Suffix start positions in sorted order.
    pub fn positions(&self) -> impl Iterator<Item = usize> + '_ {
        self.sa.iter().map(|&p| p as usize)
    }

    /// Find the position in `data` whose suffix shares the longest prefix
    /// with `needle`. Returns `(position, match_length)`.
    ///
    /// `data` must be the slice this array was built from.
    pub fn longest_match(&self, data: &[u8], needle: &[u8]) -> (usize, usize) {
        debug_assert_eq!(data.len(), self.len());
        if self.sa.is_empty() || needle.is_empty() {
            return (0, 0);
        }

        // Narrow down to the two suffixes `needle` sorts between; the longest
        // common prefix is with one of them. A suffix that is a proper prefix
        // of `needle` sorts before it.
        let mut st = 0usize;
        let mut en = self.sa.len() - 1;
        while en - st >= 2 {
            let mid = st + (en - st) / 2;
            if data[self.sa[mid] as usize..] < *needle {
                st = mid;
            } else {
                en = mid;
            }
        }

        let (a, b) = (self.sa[st] as usize, self.sa[en] as usize);
        let len_a = match_len(&data[a..], needle);
        let len_b = match_len(&data[b..], needle);
        if len_a > len_b {
            (a, len_a)
        } else {
            (b, len_b)
        }
    }
}

/// Length of the common prefix of `a` and `b`.
pub fn match_len(a: &[u8], b: &[u8]) -> usize {
    a.iter().zip(b).take_while(|(x, y)| x == y).count()
}
