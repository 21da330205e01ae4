//! Head+tail previews for oversized tool arguments and outputs.

use super::events::Preview;

/// Keep the first `head` and last `tail` characters of `text`.
///
/// Texts that fit within `head + tail` characters are returned whole.
/// Truncation never splits a character.
#[must_use]
pub fn bounded_preview(text: &str, head: usize, tail: usize) -> Preview {
    let original_chars = text.chars().count();
    if original_chars <= head.saturating_add(tail) {
        return Preview {
            text: text.to_owned(),
            truncated: false,
            original_chars,
        };
    }

    let head_end = text.char_indices().nth(head).map_or(text.len(), |(i, _)| i);
    let tail_start = if tail == 0 {
        text.len()
    } else {
        text.char_indices()
            .nth(original_chars - tail)
            .map_or(text.len(), |(i, _)| i)
    };
    let omitted = original_chars - head - tail;

    Preview {
        text: format!(
            "{}\n[... {omitted} characters omitted ...]\n{}",
            &text[..head_end],
            &text[tail_start..]
        ),
        truncated: true,
        original_chars,
    }
}

/// Preview of a JSON value rendered compactly.
#[must_use]
pub fn json_preview(value: &serde_json::Value, head: usize, tail: usize) -> Preview {
    let text = match value {
        serde_json::Value::Null => String::new(),
        other => other.to_string(),
    };
    bounded_preview(&text, head, tail)
}
