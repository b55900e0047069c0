//! The source module that stores the text to be parsed as code points and maps offsets to line/column positions.
use serde::{Deserialize, Serialize};

/// The sentinel code point returned for out-of-range reads. The high bit
/// keeps it disjoint from every valid Unicode scalar.
pub const EOF_CHAR: u32 = 1 << 31;

/// The error type for [`SourceBuffer`] creation.
#[derive(Debug, thiserror::Error)]
pub enum SourceBufferError {
    #[error("source is not valid UTF-8 at byte {0}")]
    /// The input byte stream failed UTF-8 validation.
    InvalidUtf8(usize),
}

/// The line and column of a code point, with the text of its line.
///
/// Lines and columns are 1-based. A location outside the source resolves
/// to `(-1, -1)` with an empty line.
#[derive(Debug, Clone, PartialEq, Eq, Hash, Serialize, Deserialize)]
pub struct SourcePosition {
    /// 1-based line number.
    pub line_num: i64,
    /// 1-based column number in code points.
    pub column_num: i64,
    /// The full text of the line containing the location.
    pub line: String,
}

/// Source text held as a sequence of code points.
///
/// The rest of the crate sees individual characters as code points and
/// strings as UTF-8. Locations throughout the crate are code-point
/// offsets into a `SourceBuffer`.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct SourceBuffer {
    chars: Vec<char>,
}

impl SourceBuffer {
    /// Create a source buffer from a string slice.
    pub fn new(text: &str) -> SourceBuffer {
        SourceBuffer {
            chars: text.chars().collect(),
        }
    }

    /// Create a source buffer from raw bytes.
    ///
    /// # Errors
    ///
    /// Returns [`SourceBufferError::InvalidUtf8`] if the bytes are not
    /// valid UTF-8.
    pub fn from_bytes(bytes: &[u8]) -> Result<SourceBuffer, SourceBufferError> {
        let text = std::str::from_utf8(bytes)
            .map_err(|e| SourceBufferError::InvalidUtf8(e.valid_up_to()))?;
        Ok(SourceBuffer::new(text))
    }

    /// The number of code points in the source.
    pub fn len(&self) -> i64 {
        self.chars.len() as i64
    }

    /// Whether the source is empty.
    pub fn is_empty(&self) -> bool {
        self.chars.is_empty()
    }

    /// The code point at `location`, or [`EOF_CHAR`] when out of range.
    /// Negative locations count from the end of the source.
    pub fn char_at(&self, mut location: i64) -> u32 {
        if location < 0 {
            location += self.chars.len() as i64;
        }
        if location < 0 || location >= self.chars.len() as i64 {
            return EOF_CHAR;
        }
        self.chars[location as usize] as u32
    }

    /// The UTF-8 text of the half-open range `[first, last)`. A negative
    /// `last` counts from one past the end of the source, so `-1` means
    /// "through the final character".
    pub fn slice(&self, first: i64, mut last: i64) -> String {
        if last < 0 {
            last += self.chars.len() as i64 + 1;
        }
        if last < 0 || last > self.chars.len() as i64 {
            last = self.chars.len() as i64;
        }
        if first < 0 || first >= last {
            return String::new();
        }
        self.chars[first as usize..last as usize].iter().collect()
    }

    /// Resolve a location into a line/column pair for diagnostics.
    pub fn position(&self, mut location: i64) -> SourcePosition {
        if location < 0 {
            location += self.chars.len() as i64;
        }
        if location < 0 || location >= self.chars.len() as i64 {
            return SourcePosition {
                line_num: -1,
                column_num: -1,
                line: String::new(),
            };
        }
        let location = location as usize;
        let mut start = location;
        while start > 0 && self.chars[start - 1] != '\n' {
            start -= 1;
        }
        let mut end = location;
        while end < self.chars.len() && self.chars[end] != '\n' && self.chars[end] != '\r' {
            end += 1;
        }
        let line_num = 1 + self.chars[..location].iter().filter(|&&c| c == '\n').count() as i64;
        SourcePosition {
            line_num,
            column_num: (location - start) as i64 + 1,
            line: self.chars[start..end].iter().collect(),
        }
    }
}

impl From<&str> for SourceBuffer {
    fn from(text: &str) -> SourceBuffer {
        SourceBuffer::new(text)
    }
}

/// Chop a string to printable ASCII for debug listings. Control
/// characters become dots and everything else loses its high bits.
pub(crate) fn to_ascii_chop(text: &str) -> String {
    text.chars()
        .map(|c| {
            if (c as u32) < 0x20 {
                '.'
            } else {
                char::from((c as u32 & 0x7f) as u8)
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn char_access_and_eof() {
        let src = SourceBuffer::new("ab\u{00e9}");
        assert_eq!(src.len(), 3);
        assert_eq!(src.char_at(0), 'a' as u32);
        assert_eq!(src.char_at(2), 0xe9);
        assert_eq!(src.char_at(-1), 0xe9);
        assert_eq!(src.char_at(3), EOF_CHAR);
        assert_eq!(src.char_at(-4), EOF_CHAR);
    }

    #[test]
    fn slicing() {
        let src = SourceBuffer::new("hello");
        assert_eq!(src.slice(0, 2), "he");
        assert_eq!(src.slice(1, -1), "ello");
        assert_eq!(src.slice(3, 2), "");
        assert_eq!(src.slice(0, 99), "hello");
    }

    #[test]
    fn positions() {
        let src = SourceBuffer::new("one\ntwo\nthree");
        let pos = src.position(5);
        assert_eq!(pos.line_num, 2);
        assert_eq!(pos.column_num, 2);
        assert_eq!(pos.line, "two");
        assert_eq!(src.position(99).line_num, -1);
    }

    #[test]
    fn invalid_utf8_is_rejected() {
        assert!(SourceBuffer::from_bytes(&[0x61, 0xff, 0x62]).is_err());
    }
}
