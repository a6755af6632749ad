// Fixed capacity text and byte buffers for records that live in the segment.
// Content that does not fit is truncated, never an error.

use crate::segment::SharedObject;
use log::debug;
use std::fmt;

/// NUL padded UTF-8 string of at most N bytes.
#[repr(C)]
#[derive(Clone, Copy, PartialEq, Eq)]
pub struct FixedString<const N: usize> {
    bytes: [u8; N],
}

unsafe impl<const N: usize> SharedObject for FixedString<N> {
    fn type_tag() -> String {
        return format!("fixed_string<{}>", N);
    }
}

// largest prefix of s that fits in max bytes without splitting a char
fn truncate_str(s: &str, max: usize) -> &str {
    if s.len() <= max {
        return s;
    }
    let mut end = max;
    while !s.is_char_boundary(end) {
        end -= 1;
    }
    return &s[..end];
}

impl<const N: usize> FixedString<N> {
    pub const CAPACITY: usize = N;

    pub fn new(s: &str) -> FixedString<N> {
        let mut out = FixedString::default();
        out.set(s);
        return out;
    }

    /// Returns false if `s` had to be truncated.
    pub fn set(&mut self, s: &str) -> bool {
        // a NUL would end the string early on the way back out
        let s = s.split('\0').next().unwrap_or("");
        let kept = truncate_str(s, N);
        if kept.len() < s.len() {
            debug!("truncated {:?} to {} bytes", s, N);
        }
        self.bytes = [0; N];
        self.bytes[..kept.len()].copy_from_slice(kept.as_bytes());
        return kept.len() == s.len();
    }

    pub fn clear(&mut self) {
        self.bytes = [0; N];
    }

    pub fn len(&self) -> usize {
        return self.bytes.iter().position(|b| *b == 0).unwrap_or(N);
    }

    pub fn is_empty(&self) -> bool {
        return N == 0 || self.bytes[0] == 0;
    }

    pub fn as_str(&self) -> &str {
        let raw = &self.bytes[..self.len()];
        return match std::str::from_utf8(raw) {
            Ok(s) => s,
            // someone wrote garbage into the segment, show what is readable
            Err(e) => std::str::from_utf8(&raw[..e.valid_up_to()]).unwrap_or(""),
        };
    }

    pub fn eq_ignore_case(&self, other: &str) -> bool {
        let mine = self.as_str();
        if mine.is_ascii() && other.is_ascii() {
            return mine.eq_ignore_ascii_case(other);
        }
        return mine.to_lowercase() == other.to_lowercase();
    }
}

impl<const N: usize> Default for FixedString<N> {
    fn default() -> Self {
        return FixedString { bytes: [0; N] };
    }
}

impl<const N: usize> From<&str> for FixedString<N> {
    fn from(s: &str) -> Self {
        return FixedString::new(s);
    }
}

impl<const N: usize> PartialEq<&str> for FixedString<N> {
    fn eq(&self, other: &&str) -> bool {
        return self.as_str() == *other;
    }
}

impl<const N: usize> fmt::Display for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return f.write_str(self.as_str());
    }
}

impl<const N: usize> fmt::Debug for FixedString<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return fmt::Debug::fmt(self.as_str(), f);
    }
}

/// Length prefixed byte buffer of at most N bytes.
#[repr(C)]
#[derive(Clone, Copy)]
pub struct FixedBytes<const N: usize> {
    len: u32,
    data: [u8; N],
}

unsafe impl<const N: usize> SharedObject for FixedBytes<N> {
    fn type_tag() -> String {
        return format!("fixed_bytes<{}>", N);
    }
}

impl<const N: usize> FixedBytes<N> {
    pub const CAPACITY: usize = N;

    /// Returns false if `data` had to be truncated.
    pub fn set(&mut self, data: &[u8]) -> bool {
        let n = data.len().min(N);
        if n < data.len() {
            debug!("truncated {} byte payload to {}", data.len(), N);
        }
        self.data = [0; N];
        self.data[..n].copy_from_slice(&data[..n]);
        self.len = n as u32;
        return n == data.len();
    }

    /// Like set, but never cuts a UTF-8 sequence in half.
    pub fn set_str(&mut self, s: &str) -> bool {
        let kept = truncate_str(s, N);
        self.set(kept.as_bytes());
        return kept.len() == s.len();
    }

    pub fn clear(&mut self) {
        self.data = [0; N];
        self.len = 0;
    }

    pub fn as_slice(&self) -> &[u8] {
        return &self.data[..(self.len as usize).min(N)];
    }

    pub fn len(&self) -> usize {
        return self.as_slice().len();
    }

    pub fn is_empty(&self) -> bool {
        return self.len() == 0;
    }

    pub fn to_string_lossy(&self) -> String {
        return String::from_utf8_lossy(self.as_slice()).into_owned();
    }
}

impl<const N: usize> Default for FixedBytes<N> {
    fn default() -> Self {
        return FixedBytes {
            len: 0,
            data: [0; N],
        };
    }
}

impl<const N: usize> PartialEq for FixedBytes<N> {
    fn eq(&self, other: &Self) -> bool {
        return self.as_slice() == other.as_slice();
    }
}

impl<const N: usize> fmt::Debug for FixedBytes<N> {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        return write!(f, "{:?}", self.to_string_lossy());
    }
}
