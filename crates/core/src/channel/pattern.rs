//! Byte patterns used for prompts, `expect` and death-strings

use crate::error::{Result, TbotError};
use bytes::Bytes;
use regex::bytes::Regex;
use std::fmt;
use std::ops::Range;

/// A literal byte string or a compiled regular expression.
#[derive(Clone)]
pub enum Pattern {
    /// Matches the exact byte sequence
    Literal(Bytes),
    /// Matches a regular expression over raw bytes
    Regex {
        /// Unanchored expression, used by `expect` and death-strings
        re: Regex,
        /// Same expression anchored at the end of the buffer, used for prompts
        at_end: Regex,
    },
}

impl Pattern {
    /// Create a literal pattern
    pub fn literal(bytes: impl Into<Bytes>) -> Self {
        Self::Literal(bytes.into())
    }

    /// Compile a regular expression pattern
    pub fn regex(expr: &str) -> Result<Self> {
        let re = Regex::new(expr)
            .map_err(|e| TbotError::config(format!("invalid pattern {expr:?}: {e}")))?;
        let at_end = Regex::new(&format!("(?:{expr})\\z"))
            .map_err(|e| TbotError::config(format!("invalid pattern {expr:?}: {e}")))?;
        Ok(Self::Regex { re, at_end })
    }

    /// Length of the longest possible match, if bounded
    pub fn max_len(&self) -> Option<usize> {
        match self {
            Self::Literal(bytes) => Some(bytes.len()),
            Self::Regex { .. } => None,
        }
    }

    pub fn is_literal(&self) -> bool {
        matches!(self, Self::Literal(_))
    }

    /// Find the first match in `hay` that ends after `min_end`.
    ///
    /// `min_end` lets callers skip matches that lie entirely in bytes they
    /// already scanned.
    pub fn find(&self, hay: &[u8], min_end: usize) -> Option<Range<usize>> {
        match self {
            Self::Literal(needle) => {
                if needle.is_empty() || hay.len() < needle.len() {
                    return None;
                }
                let start = (min_end + 1).saturating_sub(needle.len());
                if start > hay.len() {
                    return None;
                }
                find_subslice(&hay[start..], needle).map(|pos| {
                    let begin = start + pos;
                    begin..begin + needle.len()
                })
            }
            Self::Regex { re, .. } => re
                .find_iter(hay)
                .find(|m| m.end() > min_end && !m.range().is_empty())
                .map(|m| m.range()),
        }
    }

    /// Find a prompt match.
    ///
    /// Literal prompts may appear anywhere; regex prompts must end at the end
    /// of the buffer so that partial output cannot satisfy them early. An
    /// empty buffer never matches.
    pub fn find_prompt(&self, hay: &[u8]) -> Option<Range<usize>> {
        if hay.is_empty() {
            return None;
        }
        match self {
            Self::Literal(_) => self.find(hay, 0),
            Self::Regex { at_end, .. } => at_end
                .find(hay)
                .filter(|m| !m.range().is_empty())
                .map(|m| m.range()),
        }
    }
}

impl fmt::Debug for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(bytes) => write!(f, "Literal({:?})", String::from_utf8_lossy(bytes)),
            Self::Regex { re, .. } => write!(f, "Regex({:?})", re.as_str()),
        }
    }
}

impl fmt::Display for Pattern {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            Self::Literal(bytes) => write!(f, "{}", String::from_utf8_lossy(bytes)),
            Self::Regex { re, .. } => write!(f, "/{}/", re.as_str()),
        }
    }
}

impl From<&str> for Pattern {
    fn from(s: &str) -> Self {
        Self::Literal(Bytes::copy_from_slice(s.as_bytes()))
    }
}

impl From<String> for Pattern {
    fn from(s: String) -> Self {
        Self::Literal(Bytes::from(s.into_bytes()))
    }
}

impl From<&[u8]> for Pattern {
    fn from(b: &[u8]) -> Self {
        Self::Literal(Bytes::copy_from_slice(b))
    }
}

impl From<Vec<u8>> for Pattern {
    fn from(b: Vec<u8>) -> Self {
        Self::Literal(Bytes::from(b))
    }
}

impl From<Regex> for Pattern {
    fn from(re: Regex) -> Self {
        // Anchoring an already compiled expression cannot fail if the original compiled.
        let at_end = Regex::new(&format!("(?:{})\\z", re.as_str())).unwrap_or_else(|_| re.clone());
        Self::Regex { re, at_end }
    }
}

/// Position of `needle` in `hay`
pub fn find_subslice(hay: &[u8], needle: &[u8]) -> Option<usize> {
    if needle.is_empty() {
        return Some(0);
    }
    hay.windows(needle.len()).position(|w| w == needle)
}

/// Index and span of the pattern that completed first in `hay`.
///
/// Among all patterns the one whose match ends earliest wins; ties go to the
/// lower index.
pub fn first_completed(
    patterns: &[Pattern],
    hay: &[u8],
    min_end: usize,
) -> Option<(usize, Range<usize>)> {
    patterns
        .iter()
        .enumerate()
        .filter_map(|(i, p)| p.find(hay, min_end).map(|r| (i, r)))
        .min_by_key(|(i, r)| (r.end, *i))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_literal_find_respects_min_end() {
        let p = Pattern::from("=> ");
        assert_eq!(p.find(b"abc=> ", 0), Some(3..6));
        // a match ending at or before min_end has been seen already
        assert_eq!(p.find(b"abc=> ", 6), None);
        assert_eq!(p.find(b"=> x=> ", 4), Some(4..7));
    }

    #[test]
    fn test_regex_prompt_is_anchored_at_end() {
        let p = Pattern::regex(r"root@\w+:[^\n]*# ").unwrap();
        assert_eq!(p.find_prompt(b"ls\nroot@board:~# "), Some(3..17));
        assert_eq!(p.find_prompt(b"root@board:~# ls\n"), None);
        assert_eq!(p.find_prompt(b""), None);
    }

    #[test]
    fn test_empty_regex_never_matches_empty_buffer() {
        let p = Pattern::regex(r".*").unwrap();
        assert_eq!(p.find_prompt(b""), None);
        assert_eq!(p.find(b"", 0), None);
    }

    #[test]
    fn test_first_completed_prefers_earliest_end() {
        let patterns = vec![
            Pattern::from("login: "),
            Pattern::regex(r"Autoboot:\s+\d").unwrap(),
        ];
        let hay = b"Autoboot: 3\nlogin: ";
        assert_eq!(first_completed(&patterns, hay, 0).map(|(i, _)| i), Some(1));
    }
}
