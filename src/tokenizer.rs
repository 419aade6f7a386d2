//! Token counting shared by the Chunker and the Assembler. A single
//! `cl100k_base` BPE encoding, loaded once, backs both.

use std::sync::OnceLock;
use tiktoken_rs::CoreBPE;

fn encoder() -> &'static CoreBPE {
    static ENCODER: OnceLock<CoreBPE> = OnceLock::new();
    ENCODER.get_or_init(|| tiktoken_rs::cl100k_base().expect("cl100k_base encoding is bundled"))
}

pub fn count_tokens(text: &str) -> usize {
    encoder().encode_with_special_tokens(text).len()
}

/// Truncate `text` to `max_tokens`, replacing the dropped tail with `...`
/// (three tokens reserved for the ellipsis).
pub fn truncate_to_budget(text: &str, max_tokens: usize) -> String {
    let bpe = encoder();
    let tokens = bpe.encode_with_special_tokens(text);
    if tokens.len() <= max_tokens {
        return text.to_string();
    }
    let keep = max_tokens.saturating_sub(3);
    let truncated = bpe
        .decode(tokens[..keep].to_vec())
        .unwrap_or_default();
    format!("{truncated}...")
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn short_text_is_unchanged() {
        let text = "hello world";
        assert_eq!(truncate_to_budget(text, 1000), text);
    }

    #[test]
    fn long_text_is_truncated_with_ellipsis() {
        let text = "word ".repeat(500);
        let truncated = truncate_to_budget(&text, 10);
        assert!(truncated.ends_with("..."));
        assert!(count_tokens(&truncated) <= 10 + 3);
    }

    #[test]
    fn count_tokens_is_positive_for_nonempty_text() {
        assert!(count_tokens("authentication login flow") > 0);
        assert_eq!(count_tokens(""), 0);
    }
}
