//! Token counting for context budgets.
//!
//! Counts with the `cl100k_base` BPE and falls back to `ceil(chars / 4)` if
//! the tokenizer cannot be initialized.

use once_cell::sync::Lazy;
use tiktoken_rs::{cl100k_base, CoreBPE};

static TOKENIZER: Lazy<Option<CoreBPE>> = Lazy::new(|| cl100k_base().ok());

/// Tokens in `text`.
pub fn count(text: &str) -> usize {
    match TOKENIZER.as_ref() {
        Some(bpe) => bpe.encode_with_special_tokens(text).len(),
        None => heuristic(text),
    }
}

fn heuristic(text: &str) -> usize {
    text.chars().count().div_ceil(4)
}

/// Longest prefix of `text` that fits in `max` tokens, cut on a token
/// boundary.
pub fn truncate(text: &str, max: usize) -> String {
    if max == 0 {
        return String::new();
    }
    let Some(bpe) = TOKENIZER.as_ref() else {
        return text.chars().take(max * 4).collect();
    };
    let tokens = bpe.encode_with_special_tokens(text);
    if tokens.len() <= max {
        return text.to_string();
    }
    // A boundary can fall inside a multi-byte character; back off until the
    // prefix decodes.
    let mut end = max;
    while end > 0 {
        if let Ok(prefix) = bpe.decode(tokens[..end].to_vec()) {
            return prefix;
        }
        end -= 1;
    }
    String::new()
}
