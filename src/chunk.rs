//! Bounded greedy text chunker.
//!
//! Splits fetched page text into chunks no longer than a configured byte
//! budget so each chunk stays comfortably inside the embedding service's
//! token limits. Packing is greedy on paragraph boundaries (`\n\n`),
//! falling back to sentence boundaries for oversized paragraphs, then to
//! whitespace, and finally to the nearest character boundary for
//! pathological unbroken runs — a split never lands inside a multi-byte
//! character.
//!
//! An empty or whitespace-only input yields an empty sequence: the page
//! contributed no content, which callers treat as `empty`, not an error.

/// Split `text` into non-empty chunks, each at most `max_chars` bytes.
/// Chunks are returned in document order.
pub fn split_text(text: &str, max_chars: usize) -> Vec<String> {
    if text.trim().is_empty() || max_chars == 0 {
        return Vec::new();
    }

    let mut chunks = Vec::new();
    let mut buf = String::new();

    for para in text.split("\n\n") {
        let para = para.trim();
        if para.is_empty() {
            continue;
        }

        // Would appending this paragraph overflow the buffer?
        let projected = if buf.is_empty() {
            para.len()
        } else {
            buf.len() + 2 + para.len() // +2 for the \n\n separator
        };

        if projected > max_chars && !buf.is_empty() {
            chunks.push(std::mem::take(&mut buf));
        }

        if para.len() > max_chars {
            if !buf.is_empty() {
                chunks.push(std::mem::take(&mut buf));
            }
            pack_sentences(para, max_chars, &mut chunks, &mut buf);
        } else {
            if !buf.is_empty() {
                buf.push_str("\n\n");
            }
            buf.push_str(para);
        }
    }

    if !buf.is_empty() {
        chunks.push(buf);
    }

    chunks
}

/// Pack the sentences of one oversized paragraph into `chunks`, leaving any
/// trailing partial chunk in `buf` so following paragraphs can join it.
fn pack_sentences(para: &str, max_chars: usize, chunks: &mut Vec<String>, buf: &mut String) {
    for sentence in split_sentences(para) {
        let sentence = sentence.trim();
        if sentence.is_empty() {
            continue;
        }

        let projected = if buf.is_empty() {
            sentence.len()
        } else {
            buf.len() + 1 + sentence.len()
        };

        if projected > max_chars && !buf.is_empty() {
            chunks.push(std::mem::take(buf));
        }

        if sentence.len() > max_chars {
            if !buf.is_empty() {
                chunks.push(std::mem::take(buf));
            }
            hard_split(sentence, max_chars, chunks);
        } else {
            if !buf.is_empty() {
                buf.push(' ');
            }
            buf.push_str(sentence);
        }
    }
}

/// Split on sentence terminators (`.`, `!`, `?` followed by whitespace) and
/// line breaks. The terminator stays with its sentence.
fn split_sentences(text: &str) -> Vec<&str> {
    let mut out = Vec::new();
    let mut start = 0;
    let mut prev: Option<char> = None;

    for (i, c) in text.char_indices() {
        let after_terminator =
            c.is_whitespace() && matches!(prev, Some('.') | Some('!') | Some('?'));
        if (after_terminator || c == '\n') && i > start {
            out.push(&text[start..i]);
            start = i;
        }
        prev = Some(c);
    }
    if start < text.len() {
        out.push(&text[start..]);
    }
    out
}

/// Last-resort split for a single run longer than the budget. Prefers the
/// nearest whitespace below the limit, otherwise the nearest char boundary.
fn hard_split(text: &str, max_chars: usize, chunks: &mut Vec<String>) {
    let mut remaining = text;
    while !remaining.is_empty() {
        if remaining.len() <= max_chars {
            let piece = remaining.trim();
            if !piece.is_empty() {
                chunks.push(piece.to_string());
            }
            break;
        }

        let cut = floor_char_boundary(remaining, max_chars);
        let split_at = remaining[..cut]
            .rfind(char::is_whitespace)
            .map(|pos| pos + 1)
            .filter(|&pos| !remaining[..pos].trim().is_empty())
            .unwrap_or(cut);

        let piece = remaining[..split_at].trim();
        if !piece.is_empty() {
            chunks.push(piece.to_string());
        }
        remaining = &remaining[split_at..];
    }
}

/// Largest byte index `<= max` that is a char boundary of `s`.
fn floor_char_boundary(s: &str, max: usize) -> usize {
    let mut i = max.min(s.len());
    while i > 0 && !s.is_char_boundary(i) {
        i -= 1;
    }
    i
}
