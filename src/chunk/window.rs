//! Fixed-size line windows for files without a usable syntax tree.

use super::Span;
use crate::models::UnitKind;

/// Overlapping line windows over `lines`.
///
/// Windows are `window_lines` tall and advance by `window_lines - overlap`
/// rows. Windows made only of whitespace are dropped. Rows are 0-based.
pub fn line_windows(lines: &[&str], window_lines: usize, overlap: usize) -> Vec<Span> {
    let window = window_lines.max(1);
    let step = window.saturating_sub(overlap).max(1);
    let mut spans = Vec::new();

    let mut start = 0;
    while start < lines.len() {
        let end = (start + window).min(lines.len()) - 1;
        if lines[start..=end].iter().any(|l| !l.trim().is_empty()) {
            spans.push(Span {
                start,
                end,
                kind: UnitKind::Window,
            });
        }
        if end + 1 >= lines.len() {
            break;
        }
        start += step;
    }
    spans
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn test_windows_overlap() {
        let lines: Vec<String> = (0..25).map(|i| format!("line {i}")).collect();
        let refs: Vec<&str> = lines.iter().map(String::as_str).collect();
        let spans = line_windows(&refs, 10, 2);
        let ranges: Vec<(usize, usize)> = spans.iter().map(|s| (s.start, s.end)).collect();
        assert_eq!(ranges, vec![(0, 9), (8, 17), (16, 24)]);
    }

    #[test]
    fn test_short_file_single_window() {
        let spans = line_windows(&["a", "b"], 40, 5);
        assert_eq!(spans.len(), 1);
        assert_eq!((spans[0].start, spans[0].end), (0, 1));
    }

    #[test]
    fn test_blank_windows_dropped() {
        let spans = line_windows(&["", "  ", "x"], 2, 0);
        assert_eq!(spans.len(), 1);
        assert_eq!(spans[0].start, 2);
    }
}
