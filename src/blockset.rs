// SPDX-License-Identifier: Apache-2.0

use crate::constants::BLOCK_SIZE;
use crate::error::{Result, UpdateError};

/// An ordered collection of half-open `[start, end)` block ranges over one
/// partition. Ranges are sorted, non-overlapping and non-empty; all
/// operations are pure.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct BlockSet {
    ranges: Vec<(u64, u64)>,
}

impl BlockSet {
    /// Builds the sorted invariant from arbitrary input order. Adjacent
    /// ranges are kept distinct; overlapping or empty ranges are rejected.
    pub fn new(mut ranges: Vec<(u64, u64)>) -> Result<Self> {
        for &(start, end) in &ranges {
            if end <= start {
                return Err(UpdateError::InvalidRange { start, end });
            }
        }
        ranges.sort_unstable_by_key(|r| r.0);
        for pair in ranges.windows(2) {
            if pair[1].0 < pair[0].1 {
                return Err(UpdateError::InvalidRange {
                    start: pair[1].0,
                    end: pair[1].1,
                });
            }
        }
        Ok(Self { ranges })
    }

    pub fn empty() -> Self {
        Self { ranges: Vec::new() }
    }

    /// Parses the text form used by transfer lists:
    /// `n,start1,end1,...` where `n` is the count of integers that follow.
    pub fn parse(text: &str) -> Result<Self> {
        let nums: Vec<u64> = text
            .split(',')
            .map(|tok| {
                tok.parse::<u64>().map_err(|_| UpdateError::ProgramInvalid(
                    format!("bad block set token {:?}", tok),
                ))
            })
            .collect::<Result<_>>()?;
        let Some((&count, rest)) = nums.split_first() else {
            return Err(UpdateError::ProgramInvalid("empty block set".into()));
        };
        if count as usize != rest.len() || count % 2 != 0 || count == 0 {
            return Err(UpdateError::ProgramInvalid(format!(
                "block set count {} does not match {} fields",
                count,
                rest.len()
            )));
        }
        Self::new(rest.chunks(2).map(|pair| (pair[0], pair[1])).collect())
    }

    /// Serializes back to the transfer-list text form.
    pub fn to_text(&self) -> String {
        let mut out = format!("{}", self.ranges.len() * 2);
        for &(start, end) in &self.ranges {
            out.push_str(&format!(",{},{}", start, end));
        }
        out
    }

    pub fn ranges(&self) -> &[(u64, u64)] {
        &self.ranges
    }

    pub fn range_count(&self) -> usize {
        self.ranges.len()
    }

    /// Total number of blocks covered.
    pub fn block_count(&self) -> u64 {
        self.ranges.iter().map(|&(s, e)| e - s).sum()
    }

    pub fn byte_len(&self) -> u64 {
        self.block_count() * BLOCK_SIZE
    }

    pub fn is_empty(&self) -> bool {
        self.ranges.is_empty()
    }

    /// True when any range of `self` intersects any range of `other`.
    /// Two-pointer merge over both sorted lists.
    pub fn overlaps(&self, other: &BlockSet) -> bool {
        let (mut i, mut j) = (0, 0);
        while i < self.ranges.len() && j < other.ranges.len() {
            let (a_start, a_end) = self.ranges[i];
            let (b_start, b_end) = other.ranges[j];
            if a_start < b_end && b_start < a_end {
                return true;
            }
            if a_end <= b_start {
                i += 1;
            } else {
                j += 1;
            }
        }
        false
    }

    /// The sub-set covering `take` blocks starting at block index `skip`
    /// (indices count blocks within this set, in iteration order).
    pub fn subset(&self, skip: u64, take: u64) -> Result<Self> {
        if skip + take > self.block_count() {
            return Err(UpdateError::InvalidRange {
                start: skip,
                end: skip + take,
            });
        }
        let mut out = Vec::new();
        let mut to_skip = skip;
        let mut to_take = take;
        for &(start, end) in &self.ranges {
            let len = end - start;
            if to_skip >= len {
                to_skip -= len;
                continue;
            }
            let begin = start + to_skip;
            to_skip = 0;
            let avail = end - begin;
            let grab = avail.min(to_take);
            if grab > 0 {
                out.push((begin, begin + grab));
                to_take -= grab;
            }
            if to_take == 0 {
                break;
            }
        }
        Self::new(out)
    }

    /// Yields the covered block indices in ascending order.
    pub fn iter_blocks(&self) -> impl Iterator<Item = u64> + '_ {
        self.ranges.iter().flat_map(|&(s, e)| s..e)
    }
}
