//! Splits answers into message-sized segments.
//!
//! Lengths are counted in `char`s, which is how the messaging platform
//! measures its text limit.

use serde::Serialize;

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct MessageSegment {
    pub index: usize,
    pub text: String,
}

/// Cuts `text` into segments of at most `max_length` chars.
///
/// Each cut prefers the last newline inside the window, then the last space;
/// a break point in the first half of the window is ignored and the window
/// is cut at exactly `max_length`. Whitespace around cuts is dropped; text
/// that fits is returned as is, even when it is only whitespace.
pub fn split(text: &str, max_length: usize) -> Vec<MessageSegment> {
    let mut segments = Vec::new();
    if max_length == 0 {
        return segments;
    }

    let mut remaining = text;
    while let Some(window_end) = byte_index_of_char(remaining, max_length) {
        let cut = break_point(&remaining[..window_end], max_length).unwrap_or(window_end);
        push_segment(&mut segments, remaining[..cut].trim_end());
        remaining = remaining[cut..].trim_start();
    }
    push_segment(&mut segments, remaining);
    segments
}

fn push_segment(segments: &mut Vec<MessageSegment>, text: &str) {
    if text.is_empty() {
        return;
    }
    segments.push(MessageSegment {
        index: segments.len(),
        text: text.to_string(),
    });
}

/// Byte offset of the `n`th char, or `None` when `text` has `n` chars or fewer.
fn byte_index_of_char(text: &str, n: usize) -> Option<usize> {
    let (offset, _) = text.char_indices().nth(n)?;
    Some(offset)
}

fn break_point(window: &str, max_length: usize) -> Option<usize> {
    // A newline wins over any space, even one that would have been usable.
    let at = window.rfind('\n').or_else(|| window.rfind(' '))?;
    if window[..at].chars().count() < max_length / 2 {
        return None;
    }
    Some(at)
}
