//! Block range parsing: `start:stop`, `start:`, `:stop` or `start`.
//!
//! `stop` is exclusive. A bare `start` and `start:` are open-ended.

use std::fmt;
use std::str::FromStr;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// A half-open range of block numbers.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
pub struct BlockRange {
    /// First block included; `None` = from the beginning.
    pub start: Option<u64>,
    /// First block excluded; `None` = no end.
    pub stop: Option<u64>,
}

#[derive(Debug, Clone, PartialEq, Eq, Error)]
pub enum RangeParseError {
    #[error("invalid block number '{0}'")]
    InvalidNumber(String),
    #[error("range stop {stop} must be greater than start {start}")]
    Empty { start: u64, stop: u64 },
}

impl BlockRange {
    pub fn new(start: Option<u64>, stop: Option<u64>) -> Self {
        Self { start, stop }
    }

    /// Every block.
    pub fn unbounded() -> Self {
        Self::default()
    }

    pub fn contains(&self, block: u64) -> bool {
        self.start.map_or(true, |s| block >= s) && self.stop.map_or(true, |s| block < s)
    }

    /// Returns `true` once `block` is at or beyond `stop`.
    pub fn is_past_end(&self, block: u64) -> bool {
        self.stop.is_some_and(|s| block >= s)
    }
}

fn parse_bound(s: &str) -> Result<Option<u64>, RangeParseError> {
    let s = s.trim();
    if s.is_empty() {
        return Ok(None);
    }
    s.replace('_', "")
        .parse()
        .map(Some)
        .map_err(|_| RangeParseError::InvalidNumber(s.to_string()))
}

impl FromStr for BlockRange {
    type Err = RangeParseError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let (start, stop) = match s.split_once(':') {
            Some((start, stop)) => (parse_bound(start)?, parse_bound(stop)?),
            None => (parse_bound(s)?, None),
        };
        if let (Some(start), Some(stop)) = (start, stop) {
            if stop <= start {
                return Err(RangeParseError::Empty { start, stop });
            }
        }
        Ok(Self { start, stop })
    }
}

impl fmt::Display for BlockRange {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        if let Some(start) = self.start {
            write!(f, "{start}")?;
        }
        write!(f, ":")?;
        if let Some(stop) = self.stop {
            write!(f, "{stop}")?;
        }
        Ok(())
    }
}
