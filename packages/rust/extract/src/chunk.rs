//! Paragraph-aware chunking with overlap for oversize paragraphs.
//!
//! Paragraph boundaries are blank lines or a sentence end followed by two or
//! more spaces. Paragraphs are greedily packed into chunks up to
//! `chunk_size` characters; a single paragraph longer than `chunk_size` is
//! sliced into fixed windows that overlap by `overlap` characters.

use std::sync::LazyLock;

use regex::Regex;

/// Chunking parameters. Sizes are in characters, not bytes.
#[derive(Debug, Clone)]
pub struct ChunkOptions {
    pub chunk_size: usize,
    pub overlap: usize,
}

impl Default for ChunkOptions {
    fn default() -> Self {
        Self {
            chunk_size: 1500,
            overlap: 150,
        }
    }
}

static SENTENCE_GAP_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"([.!?]) {2,}").expect("valid regex"));

static PARAGRAPH_RE: LazyLock<Regex> =
    LazyLock::new(|| Regex::new(r"\n[ \t]*\n").expect("valid regex"));

/// Split `text` into ordered, non-empty chunks.
///
/// Every chunk is at most `chunk_size + overlap` characters, and the
/// concatenation of all chunks preserves every non-whitespace character of
/// the input.
pub fn chunk_text(text: &str, opts: &ChunkOptions) -> Vec<String> {
    let chunk_size = opts.chunk_size.max(1);
    let overlap = opts.overlap.min(chunk_size.saturating_sub(1));

    let mut chunks = Vec::new();
    let mut buffer = String::new();
    let mut buffer_chars = 0usize;

    for paragraph in split_paragraphs(text) {
        let para_chars = paragraph.chars().count();

        if para_chars > chunk_size {
            flush(&mut chunks, &mut buffer, &mut buffer_chars);
            chunks.extend(slice_windows(paragraph, chunk_size, overlap));
            continue;
        }

        // +2 accounts for the paragraph separator.
        if buffer_chars > 0 && buffer_chars + 2 + para_chars > chunk_size {
            flush(&mut chunks, &mut buffer, &mut buffer_chars);
        }

        if buffer_chars > 0 {
            buffer.push_str("\n\n");
            buffer_chars += 2;
        }
        buffer.push_str(paragraph);
        buffer_chars += para_chars;
    }

    flush(&mut chunks, &mut buffer, &mut buffer_chars);
    chunks
}

/// Split into trimmed, non-empty paragraphs.
fn split_paragraphs(text: &str) -> impl Iterator<Item = &str> {
    // Rewriting sentence-gap boundaries as blank lines would copy the text;
    // instead, split on blank lines first, then on sentence gaps within.
    PARAGRAPH_RE
        .split(text)
        .flat_map(|block| {
            let mut parts = Vec::new();
            let mut start = 0usize;
            for m in SENTENCE_GAP_RE.find_iter(block) {
                // The sentence terminator stays with the left paragraph.
                let end = m.start() + 1;
                parts.push(&block[start..end]);
                start = m.end();
            }
            parts.push(&block[start..]);
            parts
        })
        .map(str::trim)
        .filter(|p| !p.is_empty())
}

fn flush(chunks: &mut Vec<String>, buffer: &mut String, buffer_chars: &mut usize) {
    if !buffer.is_empty() {
        chunks.push(std::mem::take(buffer));
        *buffer_chars = 0;
    }
}

/// Slice an oversize paragraph into `chunk_size` windows; every window after
/// the first starts `overlap` characters before a `chunk_size` stride, and
/// windows are emitted until the last one ends exactly at the text's end.
fn slice_windows(text: &str, chunk_size: usize, overlap: usize) -> Vec<String> {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    let mut windows = Vec::new();

    let mut k = 0usize;
    loop {
        let start = if k == 0 { 0 } else { k * chunk_size - overlap };
        if start >= total {
            break;
        }
        let end = (start + chunk_size).min(total);
        windows.push(chars[start..end].iter().collect());
        if end == total {
            break;
        }
        k += 1;
    }

    windows
}
