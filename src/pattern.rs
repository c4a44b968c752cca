//! Marker-bracketed pattern extraction.

use regex::Regex;

use crate::error::Result;

/// Finds `<start><alphanumeric body><end>` in payload text.
#[derive(Debug, Clone)]
pub struct PatternExtractor {
    regex: Regex,
}

impl PatternExtractor {
    pub fn new(start_marker: &str, end_marker: &str) -> Result<Self> {
        // Lazy body so the first end marker closes the match.
        let pattern = format!(
            "{}[[:alnum:]]+?{}",
            regex::escape(start_marker),
            regex::escape(end_marker)
        );
        Ok(Self {
            regex: Regex::new(&pattern)?,
        })
    }

    /// First match in the payload, if any. Invalid UTF-8 is replaced before
    /// scanning.
    pub fn extract(&self, payload: &[u8]) -> Option<String> {
        let text = String::from_utf8_lossy(payload);
        self.regex.find(&text).map(|m| m.as_str().to_string())
    }
}
