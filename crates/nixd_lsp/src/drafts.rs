use std::collections::HashMap;
use std::sync::Arc;

use tower_lsp::lsp_types::{Position, TextDocumentContentChangeEvent};

/// Authoritative text of one open document.
#[derive(Debug, Clone)]
pub struct Draft {
    pub contents: Arc<String>,
    pub version: String,
    pub numeric_version: Option<i64>,
}

/// Per-path store of open documents. The text held for a path is always
/// the result of every change received for its current open session,
/// applied in order; a failed edit removes the draft entirely.
#[derive(Debug, Default)]
pub struct DraftStore {
    drafts: HashMap<String, Draft>,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct InvalidRange;

impl DraftStore {
    pub fn add(&mut self, path: &str, version: &str, contents: String) {
        self.drafts.insert(
            path.to_string(),
            Draft {
                contents: Arc::new(contents),
                version: version.to_string(),
                numeric_version: Self::decode_version(version),
            },
        );
    }

    pub fn get(&self, path: &str) -> Option<Draft> {
        self.drafts.get(path).cloned()
    }

    pub fn remove(&mut self, path: &str) {
        self.drafts.remove(path);
    }

    pub fn snapshot(&self) -> Vec<(String, Draft)> {
        let mut entries: Vec<(String, Draft)> = self
            .drafts
            .iter()
            .map(|(path, draft)| (path.clone(), draft.clone()))
            .collect();
        entries.sort_by(|a, b| a.0.cmp(&b.0));
        entries
    }

    /// Protocol version strings are opaque; empty means absent.
    pub fn decode_version(version: &str) -> Option<i64> {
        if version.is_empty() {
            return None;
        }
        version.parse().ok()
    }

    pub fn encode_version(version: Option<i64>) -> String {
        version.map(|v| v.to_string()).unwrap_or_default()
    }
}

/// Apply one LSP content change: either a whole-document replacement or
/// a range edit addressed in UTF-16 code units.
pub fn apply_change(
    text: &str,
    change: &TextDocumentContentChangeEvent,
) -> Result<String, InvalidRange> {
    let Some(range) = change.range else {
        return Ok(change.text.clone());
    };
    let start = offset_at(text, range.start).ok_or(InvalidRange)?;
    let end = offset_at(text, range.end).ok_or(InvalidRange)?;
    if start > end {
        return Err(InvalidRange);
    }
    let mut updated = String::with_capacity(text.len() + change.text.len());
    updated.push_str(&text[..start]);
    updated.push_str(&change.text);
    updated.push_str(&text[end..]);
    Ok(updated)
}

/// Byte offset of an LSP position, or `None` when the position does not
/// address a location inside `text`.
pub fn offset_at(text: &str, position: Position) -> Option<usize> {
    let mut offset = 0usize;
    let mut line = 0u32;
    for chunk in text.split_inclusive('\n') {
        if line == position.line {
            return offset_in_line(chunk, position.character).map(|o| offset + o);
        }
        offset += chunk.len();
        line += 1;
    }
    // A position on the line after a trailing newline, or in an empty
    // document, addresses the very end.
    if line == position.line && position.character == 0 {
        return Some(offset);
    }
    None
}

fn offset_in_line(line: &str, character: u32) -> Option<usize> {
    let mut units = 0u32;
    let mut end = line.len();
    for (index, ch) in line.char_indices() {
        if ch == '\n' || ch == '\r' {
            end = index;
            break;
        }
        if units == character {
            return Some(index);
        }
        units += ch.len_utf16() as u32;
    }
    (units == character).then_some(end)
}

#[cfg(test)]
mod tests {
    use super::*;
    use tower_lsp::lsp_types::Range;

    fn change(range: Option<Range>, text: &str) -> TextDocumentContentChangeEvent {
        TextDocumentContentChangeEvent {
            range,
            range_length: None,
            text: text.to_string(),
        }
    }

    fn range(sl: u32, sc: u32, el: u32, ec: u32) -> Range {
        Range::new(Position::new(sl, sc), Position::new(el, ec))
    }

    #[test]
    fn store_add_get_remove() {
        let mut store = DraftStore::default();
        store.add("/ws/a.nix", "3", "let x = 1; in x".to_string());
        let draft = store.get("/ws/a.nix").expect("draft exists");
        assert_eq!(draft.numeric_version, Some(3));
        store.remove("/ws/a.nix");
        assert!(store.get("/ws/a.nix").is_none());
    }

    #[test]
    fn version_decoding() {
        assert_eq!(DraftStore::decode_version(""), None);
        assert_eq!(DraftStore::decode_version("42"), Some(42));
        assert_eq!(DraftStore::decode_version("nope"), None);
        assert_eq!(DraftStore::encode_version(Some(7)), "7");
        assert_eq!(DraftStore::encode_version(None), "");
    }

    #[test]
    fn whole_document_replacement() {
        let updated = apply_change("old", &change(None, "new")).unwrap();
        assert_eq!(updated, "new");
    }

    #[test]
    fn range_replacement_single_line() {
        let updated = apply_change("let x = 1; in x", &change(Some(range(0, 8, 0, 9)), "2")).unwrap();
        assert_eq!(updated, "let x = 2; in x");
    }

    #[test]
    fn range_replacement_across_lines() {
        let text = "line one\nline two\nline three";
        let updated = apply_change(text, &change(Some(range(0, 5, 2, 5)), "")).unwrap();
        assert_eq!(updated, "line three");
    }

    #[test]
    fn insertion_at_end_of_line() {
        let updated = apply_change("ab\ncd", &change(Some(range(0, 2, 0, 2)), "X")).unwrap();
        assert_eq!(updated, "abX\ncd");
    }

    #[test]
    fn offsets_count_utf16_units() {
        // '😀' is two UTF-16 code units and four UTF-8 bytes.
        let text = "a😀b";
        assert_eq!(offset_at(text, Position::new(0, 0)), Some(0));
        assert_eq!(offset_at(text, Position::new(0, 1)), Some(1));
        assert_eq!(offset_at(text, Position::new(0, 3)), Some(5));
        assert_eq!(offset_at(text, Position::new(0, 2)), None);
        let updated = apply_change(text, &change(Some(range(0, 1, 0, 3)), "_")).unwrap();
        assert_eq!(updated, "a_b");
    }

    #[test]
    fn invalid_ranges_are_rejected() {
        assert_eq!(
            apply_change("short", &change(Some(range(0, 0, 0, 99)), "x")),
            Err(InvalidRange)
        );
        assert_eq!(
            apply_change("one line", &change(Some(range(5, 0, 5, 0)), "x")),
            Err(InvalidRange)
        );
    }

    #[test]
    fn edit_sequences_compose() {
        // A whole-document baseline followed by range edits must land on
        // the same text as applying them one by one.
        let steps = [
            change(None, "let x = 1;\nin x"),
            change(Some(range(0, 8, 0, 9)), "100"),
            change(Some(range(1, 3, 1, 4)), "x + x"),
            change(Some(range(0, 0, 0, 0)), "# header\n"),
        ];
        let mut text = String::new();
        for step in &steps {
            text = apply_change(&text, step).unwrap();
        }
        assert_eq!(text, "# header\nlet x = 100;\nin x + x");
    }
}
