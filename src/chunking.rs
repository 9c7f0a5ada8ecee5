//! Message chunking for transports with a size budget.
//!
//! Long messages are split at sentence boundaries first, then at clause
//! punctuation, then at whitespace, and only as a last resort at raw
//! character offsets. Lengths are counted in characters so a split never
//! lands inside a multi-byte UTF-8 sequence.

use chrono::Utc;
use serde::{Deserialize, Serialize};
use serde_json::Value;
use uuid::Uuid;

use crate::error::RelayError;

/// Messages at or below this many characters are sent as one standard
/// fragment regardless of the configured chunk size.
pub const STANDARD_MESSAGE_LIMIT: usize = 200;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;

/// Upper bound on `total_chunks` accepted from the wire.
pub const MAX_TOTAL_CHUNKS: usize = 10_000;

/// Average fill ratio of a chunk once word-boundary slack is accounted for.
const ESTIMATE_FILL_RATIO: f64 = 0.9;

/// One piece of a (possibly) chunked message, as it appears on the wire.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(tag = "type", rename_all = "snake_case")]
pub enum Fragment {
    Standard {
        sender: String,
        timestamp: String,
        content: String,
    },
    Chunked {
        message_id: String,
        chunk_index: usize,
        total_chunks: usize,
        sender: String,
        timestamp: String,
        content: String,
    },
}

impl Fragment {
    pub fn sender(&self) -> &str {
        match self {
            Fragment::Standard { sender, .. } | Fragment::Chunked { sender, .. } => sender,
        }
    }

    pub fn content(&self) -> &str {
        match self {
            Fragment::Standard { content, .. } | Fragment::Chunked { content, .. } => content,
        }
    }

    pub fn message_id(&self) -> Option<&str> {
        match self {
            Fragment::Standard { .. } => None,
            Fragment::Chunked { message_id, .. } => Some(message_id),
        }
    }

    pub fn is_chunked(&self) -> bool {
        matches!(self, Fragment::Chunked { .. })
    }

    /// Structural checks beyond what deserialization already enforces.
    pub fn validate(&self) -> Result<(), RelayError> {
        if self.content().is_empty() {
            return Err(RelayError::InvalidFragment("empty content".into()));
        }
        if self.sender().is_empty() {
            return Err(RelayError::InvalidFragment("missing sender".into()));
        }
        if let Fragment::Chunked {
            message_id,
            chunk_index,
            total_chunks,
            ..
        } = self
        {
            if message_id.is_empty() {
                return Err(RelayError::InvalidFragment("missing message_id".into()));
            }
            if *total_chunks > MAX_TOTAL_CHUNKS {
                return Err(RelayError::InvalidFragment(format!(
                    "total_chunks {total_chunks} exceeds limit {MAX_TOTAL_CHUNKS}"
                )));
            }
            if chunk_index >= total_chunks {
                return Err(RelayError::InvalidFragment(format!(
                    "chunk_index {chunk_index} out of range for total_chunks {total_chunks}"
                )));
            }
        }
        Ok(())
    }

    /// Parse and validate an untrusted JSON fragment.
    pub fn from_value(value: &Value) -> Result<Self, RelayError> {
        let fragment: Fragment = serde_json::from_value(value.clone())
            .map_err(|e| RelayError::InvalidFragment(e.to_string()))?;
        fragment.validate()?;
        Ok(fragment)
    }
}

/// True if `value` is a well-formed fragment of either kind.
pub fn validate_fragment(value: &Value) -> bool {
    Fragment::from_value(value).is_ok()
}

/// True if `bytes` are valid UTF-8.
pub fn is_utf8_safe(bytes: &[u8]) -> bool {
    std::str::from_utf8(bytes).is_ok()
}

#[derive(Debug, Clone)]
pub struct ChunkCodec {
    chunk_size: usize,
}

impl Default for ChunkCodec {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE)
    }
}

impl ChunkCodec {
    pub fn new(chunk_size: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
        }
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_message(&self, message: &str, sender: &str) -> Vec<Fragment> {
        let timestamp = Utc::now().to_rfc3339();
        if message.chars().count() <= STANDARD_MESSAGE_LIMIT {
            return vec![standard(message, sender, timestamp)];
        }

        let pieces = self.split(message);
        if pieces.is_empty() {
            return vec![standard(message, sender, timestamp)];
        }

        let message_id = Uuid::new_v4().simple().to_string();
        let total_chunks = pieces.len();
        tracing::debug!(
            target = "tmux_relay::chunking",
            message_id = %message_id,
            total_chunks,
            chars = message.chars().count(),
            "chunked message"
        );

        pieces
            .into_iter()
            .enumerate()
            .map(|(chunk_index, content)| Fragment::Chunked {
                message_id: message_id.clone(),
                chunk_index,
                total_chunks,
                sender: sender.to_string(),
                timestamp: timestamp.clone(),
                content,
            })
            .collect()
    }

    /// Rough chunk count for pre-flight sizing.
    pub fn estimate_chunks(&self, message_length: usize) -> usize {
        if message_length <= STANDARD_MESSAGE_LIMIT {
            return 1;
        }
        let per_chunk = self.chunk_size as f64 * ESTIMATE_FILL_RATIO;
        (message_length as f64 / per_chunk).ceil() as usize
    }

    /// Split `message` into trimmed, non-empty pieces of at most
    /// `chunk_size` characters each.
    pub fn split(&self, message: &str) -> Vec<String> {
        let mut builder = ChunkBuilder::new(self.chunk_size);
        for sentence in split_after(message, is_sentence_end) {
            builder.push(sentence, Boundary::Sentence);
        }
        builder.finish()
    }
}

fn standard(message: &str, sender: &str, timestamp: String) -> Fragment {
    Fragment::Standard {
        sender: sender.to_string(),
        timestamp,
        content: message.to_string(),
    }
}

#[derive(Debug, Clone, Copy)]
enum Boundary {
    Sentence,
    Clause,
    Word,
}

struct ChunkBuilder {
    limit: usize,
    chunks: Vec<String>,
    current: String,
    current_len: usize,
}

impl ChunkBuilder {
    fn new(limit: usize) -> Self {
        Self {
            limit,
            chunks: Vec::new(),
            current: String::new(),
            current_len: 0,
        }
    }

    fn push(&mut self, piece: &str, boundary: Boundary) {
        let piece = piece.trim();
        if piece.is_empty() {
            return;
        }
        let piece_len = piece.chars().count();
        let separator = usize::from(!self.current.is_empty());

        if self.current_len + separator + piece_len <= self.limit {
            if separator == 1 {
                self.current.push(' ');
            }
            self.current.push_str(piece);
            self.current_len += separator + piece_len;
            return;
        }

        if piece_len <= self.limit {
            self.flush();
            self.current.push_str(piece);
            self.current_len = piece_len;
            return;
        }

        match boundary {
            Boundary::Sentence => {
                for clause in split_after(piece, is_clause_end) {
                    self.push(clause, Boundary::Clause);
                }
            }
            Boundary::Clause => {
                for word in piece.split_whitespace() {
                    self.push(word, Boundary::Word);
                }
            }
            Boundary::Word => {
                tracing::debug!(
                    target = "tmux_relay::chunking",
                    chars = piece_len,
                    limit = self.limit,
                    "force-splitting oversized token"
                );
                self.flush();
                for part in hard_split(piece, self.limit) {
                    self.push(&part, Boundary::Word);
                }
            }
        }
    }

    fn flush(&mut self) {
        if !self.current.is_empty() {
            self.chunks.push(std::mem::take(&mut self.current));
        }
        self.current_len = 0;
    }

    fn finish(mut self) -> Vec<String> {
        self.flush();
        self.chunks
    }
}

fn is_sentence_end(ch: char) -> bool {
    matches!(ch, '.' | '!' | '?')
}

fn is_clause_end(ch: char) -> bool {
    matches!(ch, ',' | ';' | ':')
}

/// Split after every boundary character that is followed by whitespace.
/// Pieces keep their leading whitespace; callers trim.
fn split_after(text: &str, is_boundary: fn(char) -> bool) -> Vec<&str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    let mut chars = text.char_indices().peekable();
    while let Some((_, ch)) = chars.next() {
        if !is_boundary(ch) {
            continue;
        }
        if let Some(&(next_idx, next)) = chars.peek() {
            if next.is_whitespace() {
                pieces.push(&text[start..next_idx]);
                start = next_idx;
            }
        }
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

fn hard_split(word: &str, limit: usize) -> Vec<String> {
    let chars: Vec<char> = word.chars().collect();
    chars
        .chunks(limit)
        .map(|part| part.iter().collect())
        .collect()
}
