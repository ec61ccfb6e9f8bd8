//! Byte-range requests against a stored object.

use crate::errors::{FilesError, FilesResult};

/// Inclusive byte range resolved against an object size.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct ByteRange {
    pub start: u64,
    pub end: u64,
}

impl ByteRange {
    /// Parse a single `Range` header value (`bytes=a-b`, `bytes=a-`,
    /// `bytes=-n`). Multiple ranges, malformed values, and ranges starting
    /// past the end are not satisfiable.
    pub fn parse(header: &str, size: u64) -> FilesResult<Self> {
        let unsatisfiable = || FilesError::RangeNotSatisfiable { size };

        let set = header
            .trim()
            .strip_prefix("bytes=")
            .ok_or_else(unsatisfiable)?
            .trim();
        if set.contains(',') {
            return Err(unsatisfiable());
        }
        let (first, last) = set.split_once('-').ok_or_else(unsatisfiable)?;
        let parse = |v: &str| v.trim().parse::<u64>().map_err(|_| unsatisfiable());

        if size == 0 {
            return Err(unsatisfiable());
        }

        let range = match (first.trim().is_empty(), last.trim().is_empty()) {
            (true, true) => return Err(unsatisfiable()),
            (true, false) => {
                let suffix = parse(last)?;
                if suffix == 0 {
                    return Err(unsatisfiable());
                }
                Self {
                    start: size.saturating_sub(suffix),
                    end: size - 1,
                }
            }
            (false, true) => Self {
                start: parse(first)?,
                end: size - 1,
            },
            (false, false) => {
                let start = parse(first)?;
                let end = parse(last)?;
                if end < start {
                    return Err(unsatisfiable());
                }
                Self {
                    start,
                    end: end.min(size - 1),
                }
            }
        };

        if range.start >= size {
            return Err(unsatisfiable());
        }
        Ok(range)
    }

    pub fn len(&self) -> u64 {
        self.end - self.start + 1
    }

    /// Value for a `Content-Range` response header.
    pub fn content_range(&self, size: u64) -> String {
        format!("bytes {}-{}/{}", self.start, self.end, size)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn parses_the_three_range_forms() {
        assert_eq!(
            ByteRange::parse("bytes=0-4", 10).unwrap(),
            ByteRange { start: 0, end: 4 }
        );
        assert_eq!(
            ByteRange::parse("bytes=6-", 10).unwrap(),
            ByteRange { start: 6, end: 9 }
        );
        assert_eq!(
            ByteRange::parse("bytes=-3", 10).unwrap(),
            ByteRange { start: 7, end: 9 }
        );
    }

    #[test]
    fn clamps_end_past_object_size() {
        let range = ByteRange::parse("bytes=5-100", 10).unwrap();
        assert_eq!(range, ByteRange { start: 5, end: 9 });
        assert_eq!(range.len(), 5);
        assert_eq!(range.content_range(10), "bytes 5-9/10");

        assert_eq!(
            ByteRange::parse("bytes=-50", 10).unwrap(),
            ByteRange { start: 0, end: 9 }
        );
    }

    #[test]
    fn rejects_malformed_and_unsatisfiable_ranges() {
        for header in [
            "items=0-1",
            "bytes=",
            "bytes=-",
            "bytes=a-b",
            "bytes=5-2",
            "bytes=10-",
            "bytes=-0",
            "bytes=0-1,3-4",
        ] {
            assert!(
                matches!(
                    ByteRange::parse(header, 10),
                    Err(FilesError::RangeNotSatisfiable { size: 10 })
                ),
                "{header} should be rejected"
            );
        }
        assert!(ByteRange::parse("bytes=0-", 0).is_err());
    }
}
