//! Detach key sequences.

/// Default detach sequence: Ctrl-P Ctrl-Q.
pub const DEFAULT_DETACH_KEYS: &str = "ctrl-p,ctrl-q";

/// Parse one key in notation form into a byte value.
///
/// Supported formats:
/// - `ctrl-X` or `ctrl+X` - Control character (e.g., `ctrl-p` = 0x10)
/// - `^X` - Control character shorthand (e.g., `^Q` = 0x11)
/// - Single character - Literal character (e.g., `d` = 0x64)
///
/// Besides letters, `ctrl-` accepts `@ [ \ ] ^ _`.
///
/// Returns None if the notation is invalid.
#[must_use]
pub fn parse_key_notation(s: &str) -> Option<u8> {
    let s = s.trim();

    let ctrl = s
        .get(..5)
        .filter(|p| p.eq_ignore_ascii_case("ctrl-") || p.eq_ignore_ascii_case("ctrl+"))
        .map(|_| &s[5..])
        .or_else(|| s.strip_prefix('^'));

    if let Some(rest) = ctrl {
        let mut chars = rest.chars();
        let (Some(c), None) = (chars.next(), chars.next()) else {
            return None;
        };
        return match c.to_ascii_lowercase() {
            // ctrl-a = 0x01, ctrl-z = 0x1a
            c @ 'a'..='z' => Some(c as u8 - b'a' + 1),
            '@' => Some(0x00),
            '[' => Some(0x1b),
            '\\' => Some(0x1c),
            ']' => Some(0x1d),
            '^' => Some(0x1e),
            '_' => Some(0x1f),
            _ => None,
        };
    }

    // Single character
    if s.len() == 1 {
        return Some(s.as_bytes()[0]);
    }

    None
}

/// A configured detach sequence.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DetachKeys {
    notation: String,
    bytes: Vec<u8>,
}

impl DetachKeys {
    /// Parse a comma-separated key list such as `ctrl-p,ctrl-q`.
    #[must_use]
    pub fn parse(notation: &str) -> Option<Self> {
        let bytes = notation
            .split(',')
            .map(parse_key_notation)
            .collect::<Option<Vec<u8>>>()?;
        if bytes.is_empty() {
            return None;
        }
        Some(Self {
            notation: notation.trim().to_string(),
            bytes,
        })
    }

    /// The notation as given, passed through to the engine.
    #[must_use]
    pub fn notation(&self) -> &str {
        &self.notation
    }

    #[must_use]
    pub fn bytes(&self) -> &[u8] {
        &self.bytes
    }
}

impl Default for DetachKeys {
    fn default() -> Self {
        Self {
            notation: DEFAULT_DETACH_KEYS.to_string(),
            bytes: vec![0x10, 0x11],
        }
    }
}

/// Result of scanning a chunk of input.
#[derive(Debug, Default, PartialEq, Eq)]
pub struct Scan {
    /// Bytes safe to forward to the container.
    pub forward: Vec<u8>,
    /// The full sequence was seen. Input after it is discarded.
    pub detach: bool,
}

/// Byte-level matcher for the detach sequence.
///
/// Bytes that could still be the start of the sequence are held back until
/// the match either completes or fails, so a detach never leaks a partial
/// sequence into the container.
#[derive(Debug)]
pub struct DetachMatcher {
    sequence: Vec<u8>,
    /// Length of the sequence prefix currently held back.
    matched: usize,
}

impl DetachMatcher {
    #[must_use]
    pub fn new(keys: &DetachKeys) -> Self {
        Self {
            sequence: keys.bytes().to_vec(),
            matched: 0,
        }
    }

    /// Feed input bytes.
    pub fn feed(&mut self, input: &[u8]) -> Scan {
        let mut scan = Scan {
            forward: Vec::with_capacity(input.len()),
            detach: false,
        };
        if self.sequence.is_empty() {
            scan.forward.extend_from_slice(input);
            return scan;
        }

        for &byte in input {
            if byte == self.sequence[self.matched] {
                self.matched += 1;
                if self.matched == self.sequence.len() {
                    self.matched = 0;
                    scan.detach = true;
                    return scan;
                }
                continue;
            }

            // Mismatch: release held bytes until the remainder plus this
            // byte is again a prefix of the sequence.
            let mut pending = self.sequence[..self.matched].to_vec();
            pending.push(byte);
            let mut start = 0;
            while start < pending.len() && !self.sequence.starts_with(&pending[start..]) {
                scan.forward.push(pending[start]);
                start += 1;
            }
            self.matched = pending.len() - start;
        }
        scan
    }

    /// Release any held-back bytes, e.g. at end of input.
    pub fn flush(&mut self) -> Vec<u8> {
        let held = self.sequence[..self.matched].to_vec();
        self.matched = 0;
        held
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn matcher(notation: &str) -> DetachMatcher {
        DetachMatcher::new(&DetachKeys::parse(notation).unwrap())
    }

    #[test]
    fn test_parse_key_notation_ctrl_format() {
        assert_eq!(parse_key_notation("ctrl-a"), Some(0x01));
        assert_eq!(parse_key_notation("ctrl-p"), Some(0x10));
        assert_eq!(parse_key_notation("ctrl-q"), Some(0x11));
        assert_eq!(parse_key_notation("ctrl+a"), Some(0x01));
        assert_eq!(parse_key_notation("CTRL-A"), Some(0x01));
        assert_eq!(parse_key_notation("ctrl-["), Some(0x1b));
        assert_eq!(parse_key_notation("ctrl-@"), Some(0x00));
    }

    #[test]
    fn test_parse_key_notation_caret_format() {
        assert_eq!(parse_key_notation("^P"), Some(0x10));
        assert_eq!(parse_key_notation("^q"), Some(0x11));
    }

    #[test]
    fn test_parse_key_notation_single_char_keeps_case() {
        assert_eq!(parse_key_notation("d"), Some(b'd'));
        assert_eq!(parse_key_notation("D"), Some(b'D'));
    }

    #[test]
    fn test_parse_key_notation_invalid() {
        assert_eq!(parse_key_notation("ctrl-"), None);
        assert_eq!(parse_key_notation("ctrl-ab"), None);
        assert_eq!(parse_key_notation("ctrl-1"), None);
        assert_eq!(parse_key_notation("^"), None);
        assert_eq!(parse_key_notation("ab"), None);
        assert_eq!(parse_key_notation(""), None);
    }

    #[test]
    fn test_detach_keys_parse() {
        let keys = DetachKeys::parse("ctrl-p,ctrl-q").unwrap();
        assert_eq!(keys.bytes(), &[0x10, 0x11]);
        assert_eq!(keys, DetachKeys::default());
        assert_eq!(DetachKeys::parse("ctrl-a,d").unwrap().bytes(), &[0x01, b'd']);
        assert!(DetachKeys::parse("ctrl-p,,ctrl-q").is_none());
        assert!(DetachKeys::parse("nope").is_none());
    }

    #[test]
    fn test_plain_input_passes_through() {
        let mut m = matcher("ctrl-p,ctrl-q");
        let scan = m.feed(b"ls -la\r");
        assert_eq!(scan.forward, b"ls -la\r");
        assert!(!scan.detach);
    }

    #[test]
    fn test_sequence_detaches_and_is_swallowed() {
        let mut m = matcher("ctrl-p,ctrl-q");
        let scan = m.feed(b"abc\x10\x11trailing");
        assert_eq!(scan.forward, b"abc");
        assert!(scan.detach);
    }

    #[test]
    fn test_sequence_split_across_reads() {
        let mut m = matcher("ctrl-p,ctrl-q");
        let first = m.feed(b"x\x10");
        assert_eq!(first.forward, b"x");
        assert!(!first.detach);

        let second = m.feed(b"\x11");
        assert!(second.forward.is_empty());
        assert!(second.detach);
    }

    #[test]
    fn test_failed_prefix_is_released() {
        let mut m = matcher("ctrl-p,ctrl-q");
        assert!(m.feed(b"\x10").forward.is_empty());
        let scan = m.feed(b"a");
        assert_eq!(scan.forward, b"\x10a");
        assert!(!scan.detach);
    }

    #[test]
    fn test_repeated_prefix_byte() {
        let mut m = matcher("ctrl-p,ctrl-q");
        let scan = m.feed(b"\x10\x10\x11");
        assert_eq!(scan.forward, b"\x10");
        assert!(scan.detach);
    }

    #[test]
    fn test_overlapping_sequence() {
        // a a b: after "a a" fails on the second 'a', the held "a" is kept
        let mut m = matcher("a,a,b");
        let scan = m.feed(b"aaab");
        assert_eq!(scan.forward, b"a");
        assert!(scan.detach);
    }

    #[test]
    fn test_flush_releases_partial_match() {
        let mut m = matcher("ctrl-p,ctrl-q");
        assert!(m.feed(b"\x10").forward.is_empty());
        assert_eq!(m.flush(), vec![0x10]);
        assert!(m.flush().is_empty());
    }
}
