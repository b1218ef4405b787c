//! Editable text buffers addressed by 1-based line/column coordinates.
//!
//! Coordinates follow the browser editor model: columns count UTF-16 code
//! units, and column `n + 1` is the position after the last unit of an
//! `n`-unit line. Lines end at `\n`; a `\r` right before it belongs to the
//! line ending, not to the line.

use crate::protocol::{CursorPosition, EditOperation, EditRange};

/// The local editing surface the reconciler drives.
pub trait EditorBuffer {
    /// Whole content.
    fn value(&self) -> &str;

    fn line_count(&self) -> u32;

    /// One past the last column of `line` (1-based). Out-of-range lines
    /// report 1.
    fn line_max_column(&self, line: u32) -> u32;

    /// Apply edits whose ranges all refer to the buffer as it was before the
    /// call. Ranges are clamped to the buffer first; the clamped operations
    /// actually applied are returned.
    fn apply_edits(&mut self, edits: &[EditOperation]) -> Vec<EditOperation>;

    /// Replace the whole content.
    fn set_value(&mut self, value: &str);

    /// Clamp a range into the buffer, normalizing reversed ranges.
    fn clamp_range(&self, range: &EditRange) -> EditRange {
        let start = self.clamp_position(range.start());
        let end = self.clamp_position(range.end());
        let (start, end) = if start <= end { (start, end) } else { (end, start) };
        EditRange::new(start.line_number, start.column, end.line_number, end.column)
    }

    /// Positions before the first line snap to the document start, past the
    /// last line to the document end.
    fn clamp_position(&self, pos: CursorPosition) -> CursorPosition {
        let last = self.line_count().max(1);
        if pos.line_number < 1 {
            return CursorPosition::new(1, 1);
        }
        if pos.line_number > last {
            return CursorPosition::new(last, self.line_max_column(last));
        }
        let column = pos.column.clamp(1, self.line_max_column(pos.line_number));
        CursorPosition::new(pos.line_number, column)
    }
}

/// `String`-backed buffer with a line index.
#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct TextBuffer {
    text: String,
    /// Byte offset of the first character of each line
    line_starts: Vec<usize>,
}

impl TextBuffer {
    pub fn new(text: impl Into<String>) -> Self {
        let mut buffer = Self {
            text: text.into(),
            line_starts: Vec::new(),
        };
        buffer.reindex();
        buffer
    }

    fn reindex(&mut self) {
        self.line_starts.clear();
        self.line_starts.push(0);
        self.line_starts
            .extend(self.text.match_indices('\n').map(|(i, _)| i + 1));
    }

    /// Text of a line without its terminator.
    pub fn line(&self, line: u32) -> Option<&str> {
        let idx = (line as usize).checked_sub(1)?;
        let start = *self.line_starts.get(idx)?;
        let end = self
            .line_starts
            .get(idx + 1)
            .map_or(self.text.len(), |next| next - 1);
        let text = &self.text[start..end];
        Some(text.strip_suffix('\r').unwrap_or(text))
    }

    /// Byte offset of a clamped position. A column inside a surrogate pair
    /// snaps to the start of its character.
    fn offset_of(&self, pos: CursorPosition) -> usize {
        let pos = self.clamp_position(pos);
        let Some(line) = self.line(pos.line_number) else {
            return self.text.len();
        };
        let line_start = self.line_starts[(pos.line_number - 1) as usize];
        let target = (pos.column - 1) as usize;
        let mut units = 0;
        for (i, c) in line.char_indices() {
            if units >= target {
                return line_start + i;
            }
            units += c.len_utf16();
            if units > target {
                return line_start + i;
            }
        }
        line_start + line.len()
    }
}

impl From<&str> for TextBuffer {
    fn from(text: &str) -> Self {
        Self::new(text)
    }
}

impl EditorBuffer for TextBuffer {
    fn value(&self) -> &str {
        &self.text
    }

    fn line_count(&self) -> u32 {
        self.line_starts.len() as u32
    }

    fn line_max_column(&self, line: u32) -> u32 {
        self.line(line).map_or(1, |l| l.encode_utf16().count() as u32 + 1)
    }

    fn apply_edits(&mut self, edits: &[EditOperation]) -> Vec<EditOperation> {
        struct Span<'a> {
            index: usize,
            start: usize,
            end: usize,
            text: &'a str,
        }

        let applied: Vec<EditOperation> = edits
            .iter()
            .map(|e| EditOperation::new(self.clamp_range(&e.range), e.text.as_str()))
            .collect();

        let mut spans: Vec<Span<'_>> = applied
            .iter()
            .enumerate()
            .map(|(index, e)| Span {
                index,
                start: self.offset_of(e.range.start()),
                end: self.offset_of(e.range.end()),
                text: e.text.as_str(),
            })
            .collect();
        spans.sort_by_key(|s| (s.start, s.index));

        // Overlapping ranges are trimmed so each byte is replaced at most once.
        for i in 1..spans.len() {
            let next_start = spans[i].start;
            let prev = &mut spans[i - 1];
            prev.end = prev.end.min(next_start).max(prev.start);
        }

        let mut text = std::mem::take(&mut self.text);
        for span in spans.iter().rev() {
            text.replace_range(span.start..span.end, span.text);
        }
        self.text = text;
        self.reindex();
        applied
    }

    fn set_value(&mut self, value: &str) {
        self.text.clear();
        self.text.push_str(value);
        self.reindex();
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_line_index() {
        let buf = TextBuffer::new("ab\ncde\n");
        assert_eq!(buf.line_count(), 3);
        assert_eq!(buf.line(1), Some("ab"));
        assert_eq!(buf.line(2), Some("cde"));
        assert_eq!(buf.line(3), Some(""));
        assert_eq!(buf.line(4), None);
        assert_eq!(buf.line_max_column(2), 4);
        assert_eq!(buf.line_max_column(9), 1);
    }

    #[test]
    fn test_insert_and_replace() {
        let mut buf = TextBuffer::new("hello world");
        buf.apply_edits(&[EditOperation::new(EditRange::new(1, 7, 1, 12), "rust")]);
        assert_eq!(buf.value(), "hello rust");
        buf.apply_edits(&[EditOperation::insert(1, 11, "!\nbye")]);
        assert_eq!(buf.value(), "hello rust!\nbye");
        assert_eq!(buf.line_count(), 2);
    }

    #[test]
    fn test_multi_line_delete() {
        let mut buf = TextBuffer::new("one\ntwo\nthree");
        buf.apply_edits(&[EditOperation::delete(EditRange::new(1, 4, 3, 1))]);
        assert_eq!(buf.value(), "onethree");
    }

    #[test]
    fn test_out_of_bounds_range_is_clamped() {
        let mut buf = TextBuffer::new("abc\nde");
        let applied = buf.apply_edits(&[EditOperation::new(EditRange::new(2, 2, 40, 99), "X")]);
        assert_eq!(applied[0].range, EditRange::new(2, 2, 2, 3));
        assert_eq!(buf.value(), "abc\ndX");

        let applied = buf.apply_edits(&[EditOperation::insert(0, 0, ">")]);
        assert_eq!(applied[0].range, EditRange::caret(1, 1));
        assert_eq!(buf.value(), ">abc\ndX");
    }

    #[test]
    fn test_reversed_range_is_normalized() {
        let buf = TextBuffer::new("abcdef");
        assert_eq!(buf.clamp_range(&EditRange::new(1, 5, 1, 2)), EditRange::new(1, 2, 1, 5));
    }

    #[test]
    fn test_edits_refer_to_original_coordinates() {
        let mut buf = TextBuffer::new("aaa\nbbb\nccc");
        buf.apply_edits(&[
            EditOperation::new(EditRange::new(1, 1, 1, 4), "first line\nsplit"),
            EditOperation::new(EditRange::new(3, 1, 3, 4), "C"),
        ]);
        assert_eq!(buf.value(), "first line\nsplit\nbbb\nC");
    }

    #[test]
    fn test_same_position_inserts_keep_order() {
        let mut buf = TextBuffer::new("xy");
        buf.apply_edits(&[EditOperation::insert(1, 2, "1"), EditOperation::insert(1, 2, "2")]);
        assert_eq!(buf.value(), "x12y");
    }

    #[test]
    fn test_overlapping_edits_do_not_panic() {
        let mut buf = TextBuffer::new("abcdef");
        buf.apply_edits(&[
            EditOperation::new(EditRange::new(1, 1, 1, 5), "X"),
            EditOperation::new(EditRange::new(1, 3, 1, 7), "Y"),
        ]);
        assert_eq!(buf.value(), "XY");
    }

    #[test]
    fn test_multibyte_columns() {
        let mut buf = TextBuffer::new("héllo");
        assert_eq!(buf.line_max_column(1), 6);
        buf.apply_edits(&[EditOperation::new(EditRange::new(1, 2, 1, 3), "e")]);
        assert_eq!(buf.value(), "hello");
    }

    #[test]
    fn test_position_past_last_line_snaps_to_end() {
        let mut buf = TextBuffer::new("keep\nimportant line");
        let applied = buf.apply_edits(&[EditOperation::insert(5, 1, "X")]);
        assert_eq!(applied[0].range, EditRange::caret(2, 15));
        assert_eq!(buf.value(), "keep\nimportant lineX");

        let mut buf = TextBuffer::new("short");
        buf.apply_edits(&[EditOperation::new(EditRange::new(7, 1, 9, 9), "!")]);
        assert_eq!(buf.value(), "short!");
    }

    #[test]
    fn test_columns_count_utf16_units() {
        let mut buf = TextBuffer::new("a😀b");
        assert_eq!(buf.line_max_column(1), 5);
        buf.apply_edits(&[EditOperation::new(EditRange::new(1, 4, 1, 5), "c")]);
        assert_eq!(buf.value(), "a😀c");
        // Inside the surrogate pair: snaps to the start of the emoji
        buf.apply_edits(&[EditOperation::insert(1, 3, "|")]);
        assert_eq!(buf.value(), "a|😀c");
    }

    #[test]
    fn test_crlf_is_one_line_ending() {
        let mut buf = TextBuffer::new("ab\r\ncd");
        assert_eq!(buf.line(1), Some("ab"));
        assert_eq!(buf.line_max_column(1), 3);
        buf.apply_edits(&[EditOperation::insert(1, 3, "!")]);
        assert_eq!(buf.value(), "ab!\r\ncd");
        buf.apply_edits(&[EditOperation::delete(EditRange::new(1, 4, 2, 1))]);
        assert_eq!(buf.value(), "ab!cd");
    }

    #[test]
    fn test_set_value_reindexes() {
        let mut buf = TextBuffer::new("");
        assert_eq!(buf.line_count(), 1);
        buf.set_value("a\nb\nc");
        assert_eq!(buf.line_count(), 3);
        assert_eq!(buf.line(3), Some("c"));
    }
}
