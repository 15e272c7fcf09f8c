//! Message splitting and the edit diff.
//!
//! Text is cut on `char` boundaries of the unescaped text, so a chunk never
//! ends inside a multi-byte character. Platform escaping is applied per
//! chunk by the sender, after the cut, which keeps escape sequences whole.

use rb_channels::LengthUnit;

/// Partition `text` into chunks of at most `limit`, measured in `unit`.
///
/// With [`LengthUnit::Chars`] a text of `L` characters yields exactly
/// `ceil(L / limit)` chunks; the empty text yields none. A single character
/// wider than `limit` still gets a chunk of its own.
pub fn split_chunks(text: &str, limit: usize, unit: LengthUnit) -> Vec<&str> {
    let limit = limit.max(1);
    let mut chunks = Vec::new();
    let mut start = 0;
    let mut used = 0;
    for (idx, c) in text.char_indices() {
        let width = unit.width(c);
        if used > 0 && used + width > limit {
            chunks.push(&text[start..idx]);
            start = idx;
            used = 0;
        }
        used += width;
    }
    if start < text.len() {
        chunks.push(&text[start..]);
    }
    chunks
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum EditOp<'a> {
    /// Replace the text of the already rendered message at `index`.
    Edit { index: usize, text: &'a str },
    /// Append a new message after the existing ones.
    Create { text: &'a str },
}

/// Decide which network calls bring `existing` rendered messages from
/// `previous` to `current`.
///
/// Chunks identical in both partitions are skipped, so the number of calls
/// follows the changed content rather than the total length.
pub fn plan_edits<'a>(
    previous: &str,
    current: &'a str,
    existing: usize,
    limit: usize,
    unit: LengthUnit,
) -> Vec<EditOp<'a>> {
    let before = split_chunks(previous, limit, unit);
    split_chunks(current, limit, unit)
        .into_iter()
        .enumerate()
        .filter_map(|(index, text)| {
            if index >= existing {
                Some(EditOp::Create { text })
            } else if before.get(index) != Some(&text) {
                Some(EditOp::Edit { index, text })
            } else {
                None
            }
        })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn chunk_count_is_ceil_of_length_over_limit() {
        for (len, limit, expected) in [
            (0, 4, 0),
            (1, 4, 1),
            (4, 4, 1),
            (5, 4, 2),
            (8, 4, 2),
            (9, 4, 3),
            (9000, 4096, 3),
            (8192, 4096, 2),
        ] {
            let text = "x".repeat(len);
            let chunks = split_chunks(&text, limit, LengthUnit::Chars);
            assert_eq!(chunks.len(), expected, "len={len} limit={limit}");
            assert!(chunks.iter().all(|c| !c.is_empty() && c.chars().count() <= limit));
            assert_eq!(chunks.concat(), text);
        }
    }

    #[test]
    fn multibyte_characters_are_never_cut() {
        let text = "héllo wörld 🎉🎉";
        let chunks = split_chunks(text, 3, LengthUnit::Chars);
        assert_eq!(chunks.concat(), text);
        assert_eq!(chunks.len(), text.chars().count().div_ceil(3));
        assert_eq!(chunks[1], "lo ");
        assert_eq!(chunks.last(), Some(&"🎉🎉"));
    }

    #[test]
    fn utf16_limit_counts_astral_characters_twice() {
        let text = "🎉".repeat(4096);
        let chunks = split_chunks(&text, 4096, LengthUnit::Utf16);
        assert_eq!(chunks.len(), 2);
        assert!(chunks.iter().all(|c| LengthUnit::Utf16.measure(c) <= 4096));
        assert_eq!(chunks.concat(), text);

        // A surrogate pair never straddles the cut.
        let chunks = split_chunks("ab🎉", 3, LengthUnit::Utf16);
        assert_eq!(chunks, vec!["ab", "🎉"]);
        let chunks = split_chunks("🎉🎉", 1, LengthUnit::Utf16);
        assert_eq!(chunks, vec!["🎉", "🎉"]);
    }

    #[test]
    fn utf16_plan_creates_overflow_for_emoji_text() {
        let text = "🎉".repeat(3);
        let ops = plan_edits("", &text, 1, 4, LengthUnit::Utf16);
        assert_eq!(
            ops,
            vec![
                EditOp::Edit {
                    index: 0,
                    text: "🎉🎉"
                },
                EditOp::Create { text: "🎉" },
            ]
        );
    }

    #[test]
    fn identical_text_plans_nothing() {
        let text = "a".repeat(10);
        assert!(plan_edits(&text, &text, 3, 4, LengthUnit::Chars).is_empty());
        assert!(plan_edits("", "", 1, 4, LengthUnit::Chars).is_empty());
    }

    #[test]
    fn single_message_that_fits_is_edited_once() {
        assert_eq!(
            plan_edits("", "hello", 1, 4096, LengthUnit::Chars),
            vec![EditOp::Edit {
                index: 0,
                text: "hello"
            }]
        );
        assert_eq!(
            plan_edits("hel", "hello", 1, 4096, LengthUnit::Chars),
            vec![EditOp::Edit {
                index: 0,
                text: "hello"
            }]
        );
    }

    #[test]
    fn growing_past_the_limit_edits_the_tail_and_creates_the_rest() {
        // previous: "abcd" "ef"  current: "abcd" "efgh" "ij"
        let ops = plan_edits("abcdef", "abcdefghij", 2, 4, LengthUnit::Chars);
        assert_eq!(
            ops,
            vec![
                EditOp::Edit {
                    index: 1,
                    text: "efgh"
                },
                EditOp::Create { text: "ij" },
            ]
        );
    }

    #[test]
    fn exact_multiple_does_not_create_an_empty_message() {
        let ops = plan_edits("abc", "abcd", 1, 4, LengthUnit::Chars);
        assert_eq!(ops, vec![EditOp::Edit { index: 0, text: "abcd" }]);
        let ops = plan_edits("abcd", "abcde", 1, 4, LengthUnit::Chars);
        assert_eq!(ops, vec![EditOp::Create { text: "e" }]);
    }
}
