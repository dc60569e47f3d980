use std::collections::VecDeque;

pub const DEFAULT_CHUNK_SIZE: usize = 1000;
pub const DEFAULT_CHUNK_OVERLAP: usize = 200;

/// Paragraph, line, sentence and word boundaries, tried in that order.
/// When none of them occurs the text is cut between characters.
pub const DEFAULT_SEPARATORS: &[&str] = &["\n\n", "\n", ". ", " "];

/// Splits text into overlapping chunks of bounded size.
///
/// Lengths are counted in characters, not bytes. Each separator stays attached
/// to the end of the piece it terminates, so merged chunks reproduce the
/// original text before trimming.
#[derive(Debug, Clone)]
pub struct TextChunker {
    chunk_size: usize,
    chunk_overlap: usize,
    separators: Vec<String>,
}

impl Default for TextChunker {
    fn default() -> Self {
        Self::new(DEFAULT_CHUNK_SIZE, DEFAULT_CHUNK_OVERLAP)
    }
}

impl TextChunker {
    /// `chunk_overlap` must be smaller than `chunk_size`; the config layer
    /// rejects anything else before a chunker is built.
    pub fn new(chunk_size: usize, chunk_overlap: usize) -> Self {
        Self {
            chunk_size: chunk_size.max(1),
            chunk_overlap,
            separators: DEFAULT_SEPARATORS.iter().map(|s| s.to_string()).collect(),
        }
    }

    pub fn with_separators(mut self, separators: Vec<String>) -> Self {
        self.separators = separators.into_iter().filter(|s| !s.is_empty()).collect();
        self
    }

    pub fn chunk_size(&self) -> usize {
        self.chunk_size
    }

    pub fn chunk_overlap(&self) -> usize {
        self.chunk_overlap
    }

    /// Split text into trimmed, non-empty chunks.
    pub fn split(&self, text: &str) -> Vec<String> {
        if text.trim().is_empty() {
            return vec![];
        }
        self.split_recursive(text, &self.separators)
    }

    fn split_recursive(&self, text: &str, separators: &[String]) -> Vec<String> {
        // First separator that actually occurs wins; the rest are kept for
        // pieces that are still too large.
        let position = separators.iter().position(|s| text.contains(s.as_str()));
        let (pieces, finer) = match position {
            Some(i) => (split_keep_end(text, &separators[i]), &separators[i + 1..]),
            None => (split_chars(text), &separators[separators.len()..]),
        };

        let mut chunks = Vec::new();
        let mut pending: Vec<(&str, usize)> = Vec::new();

        for piece in pieces {
            let len = char_len(piece);
            if len <= self.chunk_size {
                pending.push((piece, len));
                continue;
            }
            if !pending.is_empty() {
                chunks.extend(self.merge(&pending));
                pending.clear();
            }
            chunks.extend(self.split_recursive(piece, finer));
        }

        if !pending.is_empty() {
            chunks.extend(self.merge(&pending));
        }
        chunks
    }

    /// Greedily pack pieces into chunks, carrying at most `chunk_overlap`
    /// characters of trailing pieces into the next chunk.
    fn merge(&self, pieces: &[(&str, usize)]) -> Vec<String> {
        let mut chunks = Vec::new();
        let mut window: VecDeque<(&str, usize)> = VecDeque::new();
        let mut total = 0;

        for &(piece, len) in pieces {
            if total + len > self.chunk_size && !window.is_empty() {
                push_joined(&mut chunks, &window);
                while total > self.chunk_overlap || (total > 0 && total + len > self.chunk_size) {
                    match window.pop_front() {
                        Some((_, dropped)) => total -= dropped,
                        None => break,
                    }
                }
            }
            window.push_back((piece, len));
            total += len;
        }

        push_joined(&mut chunks, &window);
        chunks
    }
}

fn push_joined(chunks: &mut Vec<String>, window: &VecDeque<(&str, usize)>) {
    let joined: String = window.iter().map(|(piece, _)| *piece).collect();
    let trimmed = joined.trim();
    if !trimmed.is_empty() {
        chunks.push(trimmed.to_string());
    }
}

fn split_keep_end<'a>(text: &'a str, separator: &str) -> Vec<&'a str> {
    let mut pieces = Vec::new();
    let mut start = 0;
    for (idx, matched) in text.match_indices(separator) {
        let end = idx + matched.len();
        pieces.push(&text[start..end]);
        start = end;
    }
    if start < text.len() {
        pieces.push(&text[start..]);
    }
    pieces
}

fn split_chars(text: &str) -> Vec<&str> {
    text.char_indices()
        .map(|(idx, c)| &text[idx..idx + c.len_utf8()])
        .collect()
}

fn char_len(text: &str) -> usize {
    text.chars().count()
}
