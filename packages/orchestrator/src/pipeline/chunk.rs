//! Chunk stage: text -> ordered, overlapping chunks.

use once_cell::sync::Lazy;
use regex::Regex;
use serde::{Deserialize, Serialize};

static SENTENCE_BOUNDARY: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"[.!?]+\s+").expect("sentence regex"));

/// One piece of a chunked document.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
pub struct Chunk {
    pub index: usize,
    pub text: String,
}

#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum ChunkMode {
    /// Greedy split on the configured separator list
    Separator,
    /// Split on sentence boundaries instead
    Sentence,
}

#[derive(Debug, Clone)]
pub struct ChunkConfig {
    /// Target chunk size in characters
    pub size: usize,
    /// Trailing characters carried into the next chunk
    pub overlap: usize,
    /// Tried in order; the first separator present in the text wins
    pub separators: Vec<String>,
    pub mode: ChunkMode,
}

impl Default for ChunkConfig {
    fn default() -> Self {
        Self {
            size: 512,
            overlap: 50,
            separators: vec!["\n\n".to_string(), "\n".to_string(), ". ".to_string()],
            mode: ChunkMode::Separator,
        }
    }
}

pub struct Chunker {
    config: ChunkConfig,
}

impl Chunker {
    pub fn new(config: ChunkConfig) -> Self {
        Self { config }
    }

    /// Split `text` into ordered chunks. Empty input yields no chunks; the
    /// last chunk may be under-size.
    pub fn chunk(&self, text: &str) -> Vec<Chunk> {
        if text.trim().is_empty() {
            return Vec::new();
        }

        let pieces = match self.config.mode {
            ChunkMode::Separator => self.split_with_separators(text, 0),
            ChunkMode::Sentence => self.split_sentences(text),
        };

        pieces
            .into_iter()
            .filter(|p| !p.is_empty())
            .enumerate()
            .map(|(index, text)| Chunk { index, text })
            .collect()
    }

    /// Greedy accumulation of separator-delimited parts. Parts larger than
    /// the chunk size fall through to the next separator, bottoming out in
    /// character splitting.
    fn split_with_separators(&self, text: &str, sep_index: usize) -> Vec<String> {
        let Some(separator) = self.config.separators.get(sep_index) else {
            return self.split_chars(text);
        };
        if !text.contains(separator.as_str()) {
            return self.split_with_separators(text, sep_index + 1);
        }

        let mut chunks = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_len = 0;

        for part in text.split(separator.as_str()) {
            let part = part.trim();
            if part.is_empty() {
                continue;
            }

            if part.chars().count() > self.config.size {
                if !current.is_empty() {
                    chunks.push(current.join(separator.as_str()));
                    current.clear();
                    current_len = 0;
                }
                chunks.extend(self.split_with_separators(part, sep_index + 1));
                continue;
            }

            let part_len = part.chars().count();
            let extra = if current.is_empty() {
                part_len
            } else {
                part_len + separator.chars().count()
            };

            if current_len + extra > self.config.size && !current.is_empty() {
                chunks.push(current.join(separator.as_str()));

                // Carry the last part forward as overlap when it fits the
                // overlap budget.
                let carry = current
                    .last()
                    .copied()
                    .filter(|p| p.chars().count() <= self.config.overlap);
                current.clear();
                current_len = 0;
                if let Some(carried) = carry {
                    current.push(carried);
                    current_len = carried.chars().count();
                }
            }

            current_len += if current.is_empty() {
                part_len
            } else {
                part_len + separator.chars().count()
            };
            current.push(part);
        }

        if !current.is_empty() {
            chunks.push(current.join(separator.as_str()));
        }

        chunks
    }

    /// Character-window fallback with word-boundary snapping in the trailing
    /// tenth of each window.
    fn split_chars(&self, text: &str) -> Vec<String> {
        let chars: Vec<char> = text.chars().collect();
        let size = self.config.size.max(1);
        let overlap = self.config.overlap.min(size.saturating_sub(1));

        let mut chunks = Vec::new();
        let mut start = 0;

        while start < chars.len() {
            let mut end = (start + size).min(chars.len());

            if end < chars.len() {
                let floor = start.max(end.saturating_sub(size / 10));
                if let Some(space) = (floor..end).rev().find(|&i| chars[i] == ' ') {
                    if space > start {
                        end = space + 1;
                    }
                }
            }

            let piece: String = chars[start..end].iter().collect();
            let piece = piece.trim().to_string();
            if !piece.is_empty() {
                chunks.push(piece);
            }

            start = (start + 1).max(end.saturating_sub(overlap));
        }

        chunks
    }

    fn split_sentences(&self, text: &str) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut current: Vec<&str> = Vec::new();
        let mut current_len = 0;

        for sentence in SENTENCE_BOUNDARY.split(text) {
            let sentence = sentence.trim();
            if sentence.is_empty() {
                continue;
            }

            let len = sentence.chars().count();
            if current_len + len > self.config.size && !current.is_empty() {
                chunks.push(current.join(" "));

                let carry = current
                    .last()
                    .copied()
                    .filter(|s| s.chars().count() <= self.config.overlap);
                current.clear();
                current_len = 0;
                if let Some(carried) = carry {
                    current.push(carried);
                    current_len = carried.chars().count();
                }
            }

            current.push(sentence);
            current_len += len;
        }

        if !current.is_empty() {
            chunks.push(current.join(" "));
        }

        chunks
    }
}
