//! Outbound reply chunking
//!
//! Separator first, then sentence boundaries, then words. Lengths are
//! counted in characters.

use crate::config::DeliveryConfig;

/// Split a reply into the messages actually sent
pub fn split_message(text: &str, config: &DeliveryConfig) -> Vec<String> {
    let text = text.trim();
    if text.is_empty() {
        return Vec::new();
    }
    if !config.enable_multi_message {
        return vec![text.to_string()];
    }

    let max = config.max_chunk_length.max(1);
    let separator = config.chunk_separator.as_str();
    let pieces: Vec<&str> = if separator.is_empty() {
        vec![text]
    } else {
        text.split(separator).map(str::trim).filter(|p| !p.is_empty()).collect()
    };

    let mut chunks = Vec::new();
    for piece in pieces {
        if char_len(piece) <= max {
            chunks.push(piece.to_string());
            continue;
        }
        let mut units = Vec::new();
        for sentence in sentences(piece) {
            if char_len(sentence) <= max {
                units.push(sentence);
            } else {
                units.extend(sentence.split_whitespace());
            }
        }
        chunks.extend(pack(units, max));
    }

    chunks.truncate(config.max_chunks_per_response.max(1));
    chunks
}

fn char_len(s: &str) -> usize {
    s.chars().count()
}

/// Split after `.`, `!` or `?` followed by whitespace and a capital letter
fn sentences(text: &str) -> Vec<&str> {
    let chars: Vec<(usize, char)> = text.char_indices().collect();
    let mut out = Vec::new();
    let mut start = 0;

    for i in 0..chars.len() {
        if !matches!(chars[i].1, '.' | '!' | '?') {
            continue;
        }
        let mut j = i + 1;
        while j < chars.len() && chars[j].1.is_whitespace() {
            j += 1;
        }
        if j > i + 1 && j < chars.len() && chars[j].1.is_uppercase() && chars[j].0 > start {
            let sentence = text[start..chars[i + 1].0].trim();
            if !sentence.is_empty() {
                out.push(sentence);
            }
            start = chars[j].0;
        }
    }

    let rest = text[start..].trim();
    if !rest.is_empty() {
        out.push(rest);
    }
    out
}

/// Join units with spaces while they fit; an over-long unit stands alone
fn pack(units: Vec<&str>, max: usize) -> Vec<String> {
    let mut chunks = Vec::new();
    let mut current = String::new();
    let mut current_len = 0;

    for unit in units {
        let len = char_len(unit);
        if current.is_empty() {
            current.push_str(unit);
            current_len = len;
        } else if current_len + 1 + len <= max {
            current.push(' ');
            current.push_str(unit);
            current_len += 1 + len;
        } else {
            chunks.push(std::mem::take(&mut current));
            current.push_str(unit);
            current_len = len;
        }
    }
    if !current.is_empty() {
        chunks.push(current);
    }
    chunks
}
