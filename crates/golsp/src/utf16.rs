//
// utf16.rs
//
// Mapping between LSP positions (UTF-16 columns) and byte/char offsets
//

use tower_lsp::lsp_types::{Position, Range};

/// Convert a UTF-16 column offset (from LSP Position.character) to a byte
/// offset within the given line. Tree-sitter Points expect byte offsets, not
/// UTF-16 code units. Columns past the end clamp to the line length.
pub fn utf16_column_to_byte_offset(line: &str, utf16_col: u32) -> usize {
    let mut utf16_count = 0;
    for (byte_idx, ch) in line.char_indices() {
        if utf16_count >= utf16_col as usize {
            return byte_idx;
        }
        utf16_count += ch.len_utf16();
    }
    line.len()
}

/// Strict variant used when validating edits: returns the char offset for a
/// UTF-16 column, or `None` if the column is past the end of the line or
/// lands inside a surrogate pair.
pub fn utf16_offset_to_char_offset(line: &str, utf16_offset: usize) -> Option<usize> {
    let mut utf16_count = 0;
    for (char_count, ch) in line.chars().enumerate() {
        if utf16_count == utf16_offset {
            return Some(char_count);
        }
        if utf16_count > utf16_offset {
            return None;
        }
        utf16_count += ch.len_utf16();
    }
    (utf16_count == utf16_offset).then(|| line.chars().count())
}

/// Strip a trailing `\n`, `\r\n` or `\r` from a line.
pub fn trim_line_ending(line: &str) -> &str {
    let line = line.strip_suffix('\n').unwrap_or(line);
    line.strip_suffix('\r').unwrap_or(line)
}

/// Line start table for a text. Methods take the text the index was built
/// from; passing any other text gives meaningless answers.
#[derive(Debug, Clone, Default)]
pub struct LineIndex {
    line_starts: Vec<usize>,
    len: usize,
}

impl LineIndex {
    pub fn new(text: &str) -> Self {
        // Line breaks are `\n`, `\r\n` and a lone `\r`
        let bytes = text.as_bytes();
        let mut line_starts = vec![0];
        for (idx, &byte) in bytes.iter().enumerate() {
            let breaks = match byte {
                b'\n' => true,
                b'\r' => bytes.get(idx + 1) != Some(&b'\n'),
                _ => false,
            };
            if breaks {
                line_starts.push(idx + 1);
            }
        }
        Self {
            line_starts,
            len: text.len(),
        }
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    fn line_bounds(&self, line: usize) -> Option<(usize, usize)> {
        let start = *self.line_starts.get(line)?;
        let end = self
            .line_starts
            .get(line + 1)
            .copied()
            .unwrap_or(self.len);
        Some((start, end))
    }

    /// Text of a line without its terminator.
    pub fn line_text<'a>(&self, text: &'a str, line: usize) -> Option<&'a str> {
        let (start, end) = self.line_bounds(line)?;
        Some(trim_line_ending(&text[start..end]))
    }

    /// LSP position of a byte offset. Offsets inside a multi-byte character
    /// snap back to the character start.
    pub fn position(&self, text: &str, offset: usize) -> Position {
        let mut offset = offset.min(self.len);
        while offset > 0 && !text.is_char_boundary(offset) {
            offset -= 1;
        }
        let line = self.line_starts.partition_point(|&start| start <= offset) - 1;
        let start = self.line_starts[line];
        let character = text[start..offset].encode_utf16().count();
        Position::new(line as u32, character as u32)
    }

    pub fn range(&self, text: &str, start: usize, end: usize) -> Range {
        Range::new(self.position(text, start), self.position(text, end))
    }

    /// Byte offset of an LSP position, or `None` when the position is
    /// outside the text.
    pub fn offset(&self, text: &str, position: Position) -> Option<usize> {
        let line = position.line as usize;
        let (start, _) = self.line_bounds(line)?;
        let line_text = self.line_text(text, line)?;
        let char_offset = utf16_offset_to_char_offset(line_text, position.character as usize)?;
        let byte_offset = line_text
            .char_indices()
            .nth(char_offset)
            .map(|(idx, _)| idx)
            .unwrap_or(line_text.len());
        Some(start + byte_offset)
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_byte_offset_ascii() {
        assert_eq!(utf16_column_to_byte_offset("hello", 0), 0);
        assert_eq!(utf16_column_to_byte_offset("hello", 3), 3);
        assert_eq!(utf16_column_to_byte_offset("hello", 10), 5);
    }

    #[test]
    fn test_byte_offset_surrogate_pair() {
        // U+1F600 is two UTF-16 units and four UTF-8 bytes
        let line = "a😀b";
        assert_eq!(utf16_column_to_byte_offset(line, 1), 1);
        assert_eq!(utf16_column_to_byte_offset(line, 3), 5);
    }

    #[test]
    fn test_strict_offset_rejects_split_pair() {
        let line = "a😀b";
        assert_eq!(utf16_offset_to_char_offset(line, 1), Some(1));
        assert_eq!(utf16_offset_to_char_offset(line, 2), None);
        assert_eq!(utf16_offset_to_char_offset(line, 3), Some(2));
        assert_eq!(utf16_offset_to_char_offset(line, 4), Some(3));
        assert_eq!(utf16_offset_to_char_offset(line, 5), None);
    }

    #[test]
    fn test_line_index_positions() {
        let text = "package a\n\nfunc A() {}\n";
        let index = LineIndex::new(text);
        assert_eq!(index.line_count(), 4);
        assert_eq!(index.position(text, 0), Position::new(0, 0));
        assert_eq!(index.position(text, 16), Position::new(2, 5));
        assert_eq!(index.offset(text, Position::new(2, 5)), Some(16));
        assert_eq!(index.offset(text, Position::new(3, 0)), Some(text.len()));
        assert_eq!(index.offset(text, Position::new(4, 0)), None);
        assert_eq!(index.offset(text, Position::new(0, 10)), None);
    }

    #[test]
    fn test_line_index_crlf() {
        let text = "a\r\nbc\r\n";
        let index = LineIndex::new(text);
        assert_eq!(index.line_text(text, 0), Some("a"));
        assert_eq!(index.line_text(text, 1), Some("bc"));
        assert_eq!(index.offset(text, Position::new(1, 2)), Some(5));
        assert_eq!(index.offset(text, Position::new(1, 3)), None);
    }

    #[test]
    fn test_line_index_lone_carriage_return() {
        let text = "a\rbc\r\nd\u{2028}e";
        let index = LineIndex::new(text);
        assert_eq!(index.line_count(), 3);
        assert_eq!(index.line_text(text, 0), Some("a"));
        assert_eq!(index.line_text(text, 1), Some("bc"));
        // U+2028 is not a line break
        assert_eq!(index.line_text(text, 2), Some("d\u{2028}e"));
        assert_eq!(index.offset(text, Position::new(1, 2)), Some(4));
        assert_eq!(index.position(text, 6), Position::new(2, 0));
    }

    #[test]
    fn test_line_index_multibyte() {
        let text = "x := \"é😀\"\n";
        let index = LineIndex::new(text);
        let emoji_start = text.find('😀').unwrap();
        let pos = index.position(text, emoji_start);
        assert_eq!(pos, Position::new(0, 7));
        assert_eq!(index.offset(text, pos), Some(emoji_start));
        // Inside the emoji snaps back to its start
        assert_eq!(index.position(text, emoji_start + 2), pos);
    }
}

#[cfg(test)]
mod property_tests {
    use super::*;
    use proptest::prelude::*;

    proptest! {
        #![proptest_config(ProptestConfig::with_cases(200))]

        /// Every char boundary maps to a position that maps back to it.
        #[test]
        fn prop_position_offset_inverse(text in "[a-zé😀\\n ]{0,40}") {
            let index = LineIndex::new(&text);
            for (offset, _) in text.char_indices().chain(std::iter::once((text.len(), ' '))) {
                let pos = index.position(&text, offset);
                prop_assert_eq!(index.offset(&text, pos), Some(offset));
            }
        }
    }
}
