//! Word tokenization for the identifier features.
//!
//! A small `basic_english`-style tokenizer: lowercases, keeps alphanumeric
//! runs together, and emits punctuation as single-character tokens. Cutoffs
//! from the root context bound how much of each node is preserved.

use crate::parsing::is_whitespace_char;

/// Tokenizes `text` into lowercase word and punctuation tokens.
pub fn tokenize(text: &str) -> Vec<String> {
  let mut tokens = Vec::new();
  let mut current = String::new();
  for c in text.chars() {
    if is_whitespace_char(c) {
      if !current.is_empty() {
        tokens.push(std::mem::take(&mut current));
      }
    } else if c.is_alphanumeric() {
      current.extend(c.to_lowercase());
    } else {
      if !current.is_empty() {
        tokens.push(std::mem::take(&mut current));
      }
      tokens.push(c.to_string());
    }
  }
  if !current.is_empty() {
    tokens.push(current);
  }
  tokens
}

/// Truncates a token to at most `limit` characters.
pub fn truncate_token(token: &str, limit: Option<u32>) -> String {
  match limit {
    Some(limit) => token.chars().take(limit as usize).collect(),
    None => token.to_string(),
  }
}

#[cfg(test)]
mod tests {
  use super::*;

  #[test]
  fn tokenize_lowercases_and_splits_punctuation() {
    assert_eq!(tokenize("Hello, World"), vec!["hello", ",", "world"]);
  }

  #[test]
  fn tokenize_keeps_digits_and_dollar_separate() {
    assert_eq!(tokenize("$5 World"), vec!["$", "5", "world"]);
  }

  #[test]
  fn tokenize_treats_zero_width_space_as_separator() {
    assert_eq!(tokenize("a\u{200b}b"), vec!["a", "b"]);
  }

  #[test]
  fn tokenize_empty_is_empty() {
    assert!(tokenize("  \t ").is_empty());
  }

  #[test]
  fn truncate_token_is_char_based() {
    assert_eq!(truncate_token("příliš", Some(3)), "pří");
    assert_eq!(truncate_token("word", None), "word");
  }
}
