/// Line index over newline-normalized source text.
pub struct SourceMap {
    line_starts: Vec<usize>,
}

impl SourceMap {
    pub fn new(source: &str) -> Self {
        let line_starts = std::iter::once(0)
            .chain(source.match_indices('\n').map(|(i, _)| i + 1))
            .collect();
        SourceMap { line_starts }
    }

    /// Returns (line, col) for a byte offset, both 1-based.
    pub fn position(&self, offset: usize) -> (u32, u32) {
        let line = match self.line_starts.binary_search(&offset) {
            Ok(i) => i,
            Err(i) => i.saturating_sub(1),
        };
        let col = offset.saturating_sub(self.line_starts[line]);
        (line as u32 + 1, col as u32 + 1)
    }

    pub fn line_count(&self) -> usize {
        self.line_starts.len()
    }

    /// Text of a 1-based line without its terminator; empty when out of range.
    pub fn line_text<'a>(&self, source: &'a str, line: u32) -> &'a str {
        let line = line as usize;
        if line == 0 || line > self.line_starts.len() {
            return "";
        }
        let start = self.line_starts[line - 1];
        let end = self.line_starts.get(line).map_or(source.len(), |next| next - 1);
        source.get(start..end.max(start)).unwrap_or("")
    }
}

/// Folds `\r\n` and lone `\r` into `\n`.
pub fn normalize_newlines(source: &str) -> String {
    source.replace("\r\n", "\n").replace('\r', "\n")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn positions_on_one_line() {
        let src = "var x = 1;";
        let sm = SourceMap::new(src);
        assert_eq!(sm.position(0), (1, 1));
        assert_eq!(sm.position(4), (1, 5));
    }

    #[test]
    fn positions_across_lines() {
        let src = "a = 1;\nb = 2;\nreturn a;";
        let sm = SourceMap::new(src);
        assert_eq!(sm.line_count(), 3);
        assert_eq!(sm.position(6), (1, 7)); // the first '\n'
        assert_eq!(sm.position(7), (2, 1));
        assert_eq!(sm.position(14), (3, 1));
    }

    #[test]
    fn line_text_strips_terminator() {
        let src = "first\nsecond\n";
        let sm = SourceMap::new(src);
        assert_eq!(sm.line_text(src, 1), "first");
        assert_eq!(sm.line_text(src, 2), "second");
        assert_eq!(sm.line_text(src, 3), "");
        assert_eq!(sm.line_text(src, 0), "");
        assert_eq!(sm.line_text(src, 40), "");
    }

    #[test]
    fn carriage_returns_are_folded() {
        assert_eq!(normalize_newlines("a\r\nb\rc\n"), "a\nb\nc\n");
    }
}
