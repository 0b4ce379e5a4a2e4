use crate::error::{DashError, DashResult};

/// A contiguous byte range inside a media resource.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub offset: u64,
    pub length: Option<u64>,
}

impl ByteRange {
    pub fn new(offset: u64, length: Option<u64>) -> Self {
        Self { offset, length }
    }

    /// Last byte position covered by this range, if bounded.
    pub fn last_byte(&self) -> Option<u64> {
        self.length
            .map(|length| self.offset + length.saturating_sub(1))
    }

    pub fn to_http_range(&self) -> String {
        match self.last_byte() {
            Some(last) => format!("bytes={}-{}", self.offset, last),
            None => format!("bytes={}-", self.offset),
        }
    }

    /// Parses an MPD byte range such as `0-499` or `500-`.
    ///
    /// See IETF RFC 7233:2014, subclause 2.1.
    pub fn parse(s: &str) -> DashResult<Self> {
        let invalid = || DashError::MpdParsing(format!("invalid byte range: {s}"));

        let (start, end) = s.trim().split_once('-').ok_or_else(invalid)?;
        let first = start.parse::<u64>().map_err(|_| invalid())?;
        let last = match end {
            "" => None,
            end => Some(end.parse::<u64>().map_err(|_| invalid())?),
        };
        if matches!(last, Some(last) if last < first) {
            return Err(invalid());
        }

        Ok(Self {
            offset: first,
            // 0-499 means 500 bytes
            length: last.map(|last| last - first + 1),
        })
    }
}
