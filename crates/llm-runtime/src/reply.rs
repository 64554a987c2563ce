//! Accumulates raw token bytes into reply text.
//!
//! Byte-fallback tokens can split one UTF-8 character across several tokens,
//! so pieces are kept as bytes and only the complete prefix is ever decoded.

use std::borrow::Cow;

#[derive(Debug, Default, Clone)]
pub struct ReplyBuffer {
    bytes: Vec<u8>,
}

impl ReplyBuffer {
    pub fn new() -> Self {
        Self::default()
    }

    pub fn push(&mut self, piece: &[u8]) {
        self.bytes.extend_from_slice(piece);
    }

    /// Text decoded so far. An incomplete trailing character is held back
    /// until the bytes that finish it arrive; invalid bytes elsewhere become
    /// U+FFFD.
    pub fn text(&self) -> Cow<'_, str> {
        match std::str::from_utf8(&self.bytes) {
            Ok(s) => Cow::Borrowed(s),
            Err(e) if e.error_len().is_none() => {
                String::from_utf8_lossy(&self.bytes[..e.valid_up_to()])
            }
            Err(_) => String::from_utf8_lossy(&self.bytes),
        }
    }

    /// The decoded text cut before the earliest stop sequence, if one has
    /// appeared.
    pub fn stopped_text(&self, stops: &[String]) -> Option<String> {
        let text = self.text();
        stop_position(&text, stops).map(|cut| text[..cut].to_string())
    }

    pub fn into_text(self) -> String {
        self.text().into_owned()
    }
}

/// Byte offset of the earliest stop sequence in `text`, if any.
pub fn stop_position(text: &str, stops: &[String]) -> Option<usize> {
    stops
        .iter()
        .filter(|s| !s.is_empty())
        .filter_map(|s| text.find(s.as_str()))
        .min()
}
