//! Caret-safety primitives.
//!
//! Every mutation of the session text passes through [`is_caret_safe`]. All
//! offsets are UTF-8 byte offsets into the text.

use unicode_segmentation::GraphemeCursor;

/// True iff an edit of `start..end` never reaches the caret.
#[inline]
pub fn is_caret_safe(start: usize, end: usize, caret: usize) -> bool {
    start <= end && end <= caret
}

/// Whether `pos` sits between two grapheme clusters of `text`.
///
/// Offsets outside the text or inside a UTF-8 sequence are never boundaries.
pub fn is_grapheme_boundary(text: &str, pos: usize) -> bool {
    if pos == 0 || pos == text.len() {
        return true;
    }
    if pos > text.len() || !text.is_char_boundary(pos) {
        return false;
    }

    let mut cursor = GraphemeCursor::new(pos, text.len(), true);
    match cursor.is_boundary(text, 0) {
        Ok(is_boundary) => is_boundary,
        Err(_) => heuristic_boundary(text, pos),
    }
}

/// Fallback used when cluster segmentation cannot decide: a position is a
/// boundary unless the next char extends the previous cluster.
fn heuristic_boundary(text: &str, pos: usize) -> bool {
    let next = text[pos..].chars().next();
    let prev = text[..pos].chars().next_back();
    match (prev, next) {
        (Some(p), Some(n)) => !(is_extending(n) || p == '\u{200D}' || (p == '\r' && n == '\n')),
        _ => true,
    }
}

fn is_extending(c: char) -> bool {
    matches!(c as u32,
        0x0300..=0x036F        // combining diacritical marks
        | 0x1AB0..=0x1AFF
        | 0x1DC0..=0x1DFF
        | 0x20D0..=0x20FF
        | 0xFE00..=0xFE0F      // variation selectors
        | 0xFE20..=0xFE2F
        | 0x1F3FB..=0x1F3FF    // skin tone modifiers
        | 0xE0100..=0xE01EF
        | 0x200D)
}

/// Whether `pos` can start or end a region in `text`.
#[inline]
pub fn align_to_grapheme_boundary(text: &str, pos: usize) -> bool {
    is_grapheme_boundary(text, pos)
}

/// Walk `start` left and `end` right until both are grapheme boundaries.
///
/// Total: out-of-range input is clamped to the text, and a reversed range
/// collapses onto `start`.
pub fn align_range(text: &str, start: usize, end: usize) -> (usize, usize) {
    let len = text.len();
    let mut start = start.min(len);
    let mut end = end.min(len).max(start);

    while start > 0 && !is_grapheme_boundary(text, start) {
        start -= 1;
    }
    while end < len && !is_grapheme_boundary(text, end) {
        end += 1;
    }

    (start, end)
}

/// Largest grapheme boundary that is `<= pos`.
pub fn floor_boundary(text: &str, pos: usize) -> usize {
    let mut pos = pos.min(text.len());
    while pos > 0 && !is_grapheme_boundary(text, pos) {
        pos -= 1;
    }
    pos
}

#[cfg(test)]
mod tests {
    use super::*;
    use proptest::prelude::*;

    #[test]
    fn caret_safety_is_end_le_caret() {
        assert!(is_caret_safe(0, 5, 5));
        assert!(is_caret_safe(3, 3, 3));
        assert!(!is_caret_safe(0, 6, 5));
        assert!(!is_caret_safe(4, 2, 10));
    }

    #[test]
    fn ascii_positions_are_boundaries() {
        let text = "hello";
        for pos in 0..=text.len() {
            assert!(is_grapheme_boundary(text, pos));
        }
        assert!(!is_grapheme_boundary(text, 6));
    }

    #[test]
    fn combining_mark_is_not_split() {
        // "e" + COMBINING ACUTE ACCENT
        let text = "cafe\u{301} ok";
        let mark = "cafe".len();
        assert!(!is_grapheme_boundary(text, mark));
        assert!(!is_grapheme_boundary(text, mark + 1));
        assert!(is_grapheme_boundary(text, mark + 2));
    }

    #[test]
    fn mid_utf8_sequence_is_not_a_boundary() {
        let text = "né";
        assert!(!is_grapheme_boundary(text, 2));
        assert!(is_grapheme_boundary(text, 3));
    }

    #[test]
    fn zwj_emoji_sequence_is_one_cluster() {
        let family = "\u{1F468}\u{200D}\u{1F469}\u{200D}\u{1F467}";
        let text = format!("a{}b", family);
        let inner = 1 + "\u{1F468}".len();
        assert!(!is_grapheme_boundary(&text, inner));
        assert!(is_grapheme_boundary(&text, 1 + family.len()));
    }

    #[test]
    fn align_range_walks_outward() {
        let text = "xe\u{301}y";
        // start inside the accent, end inside the accent
        let (start, end) = align_range(text, 3, 3);
        assert_eq!((start, end), (1, 4));
        assert!(is_grapheme_boundary(text, start));
        assert!(is_grapheme_boundary(text, end));
    }

    #[test]
    fn align_range_is_total() {
        assert_eq!(align_range("abc", 10, 20), (3, 3));
        assert_eq!(align_range("abc", 2, 1), (2, 2));
        assert_eq!(align_range("", 0, 0), (0, 0));
    }

    #[test]
    fn floor_boundary_moves_left() {
        let text = "ae\u{301}";
        assert_eq!(floor_boundary(text, 3), 1);
        assert_eq!(floor_boundary(text, 99), text.len());
    }

    proptest! {
        #[test]
        fn aligned_ranges_are_on_boundaries(
            text in "\\PC{0,40}",
            a in 0usize..200,
            b in 0usize..200,
        ) {
            let (start, end) = align_range(&text, a.min(b), a.max(b));
            prop_assert!(start <= end);
            prop_assert!(end <= text.len());
            prop_assert!(is_grapheme_boundary(&text, start));
            prop_assert!(is_grapheme_boundary(&text, end));
        }
    }
}
