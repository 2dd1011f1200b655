//! Trial-number selections such as `"1,3,4-6"`.

use serde::{Deserialize, Serialize};
use std::collections::BTreeSet;
use std::fmt;
use std::ops::RangeInclusive;
use std::str::FromStr;
use thiserror::Error;

#[derive(Error, Debug, Clone, PartialEq, Eq)]
pub enum SelectionError {
    #[error("empty item in trial selection {input:?}")]
    EmptyItem { input: String },

    #[error("invalid trial number {item:?}")]
    InvalidNumber { item: String },

    #[error("reversed range {start}-{end}")]
    ReversedRange { start: u64, end: u64 },

    #[error("range {start}-{end} is too large")]
    RangeTooLarge { start: u64, end: u64 },
}

/// Widest `a-b` range a selection may spell out.
pub const MAX_RANGE_LEN: u64 = 1_000_000;

/// A sorted, de-duplicated set of trial numbers.
#[derive(Debug, Clone, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct TrialSelection(BTreeSet<u64>);

impl TrialSelection {
    /// Parse a comma-separated list of numbers and inclusive `a-b` ranges.
    pub fn parse(input: &str) -> Result<Self, SelectionError> {
        let mut numbers = BTreeSet::new();
        for item in input.split(',').map(str::trim) {
            if item.is_empty() {
                return Err(SelectionError::EmptyItem {
                    input: input.to_string(),
                });
            }
            match item.split_once('-') {
                Some((start, end)) => {
                    let start = parse_number(start)?;
                    let end = parse_number(end)?;
                    if start > end {
                        return Err(SelectionError::ReversedRange { start, end });
                    }
                    if end - start >= MAX_RANGE_LEN {
                        return Err(SelectionError::RangeTooLarge { start, end });
                    }
                    numbers.extend(start..=end);
                }
                None => {
                    numbers.insert(parse_number(item)?);
                }
            }
        }
        Ok(Self(numbers))
    }

    /// Split into the numbers inside `range` and the ones outside it.
    pub fn within(&self, range: RangeInclusive<u64>) -> (TrialSelection, Vec<u64>) {
        let (kept, dropped): (BTreeSet<u64>, BTreeSet<u64>) =
            self.0.iter().partition(|n| range.contains(*n));
        (Self(kept), dropped.into_iter().collect())
    }

    pub fn iter(&self) -> impl Iterator<Item = u64> + '_ {
        self.0.iter().copied()
    }

    pub fn len(&self) -> usize {
        self.0.len()
    }

    pub fn is_empty(&self) -> bool {
        self.0.is_empty()
    }

    pub fn contains(&self, trial: u64) -> bool {
        self.0.contains(&trial)
    }
}

fn parse_number(item: &str) -> Result<u64, SelectionError> {
    item.trim()
        .parse()
        .map_err(|_| SelectionError::InvalidNumber {
            item: item.trim().to_string(),
        })
}

impl FromStr for TrialSelection {
    type Err = SelectionError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        Self::parse(s)
    }
}

impl FromIterator<u64> for TrialSelection {
    fn from_iter<I: IntoIterator<Item = u64>>(iter: I) -> Self {
        Self(iter.into_iter().collect())
    }
}

/// Compact form with consecutive runs collapsed, e.g. `1-4,7,9-10`.
impl fmt::Display for TrialSelection {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let mut numbers = self.0.iter().copied().peekable();
        let mut first = true;
        while let Some(start) = numbers.next() {
            let mut end = start;
            while let Some(next) = end.checked_add(1) {
                if numbers.peek() != Some(&next) {
                    break;
                }
                end = next;
                numbers.next();
            }

            if !first {
                f.write_str(",")?;
            }
            first = false;
            if start == end {
                write!(f, "{start}")?;
            } else {
                write!(f, "{start}-{end}")?;
            }
        }
        Ok(())
    }
}
