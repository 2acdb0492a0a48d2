use std::collections::BTreeSet;
use std::sync::LazyLock;

use regex::Regex;

/// Runs of letters and digits; everything else separates words.
static WORD: LazyLock<Regex> = LazyLock::new(|| {
    Regex::new(r"[\p{L}\p{N}]+").unwrap_or_else(|_| unreachable!("word pattern is valid"))
});

/// Lowercase words of `text` in order of appearance, without duplicates.
#[must_use]
pub fn tokenize(text: &str) -> Vec<String> {
    let mut seen = BTreeSet::new();
    WORD.find_iter(text)
        .map(|m| m.as_str().to_lowercase())
        .filter(|word| seen.insert(word.clone()))
        .collect()
}

/// The distinct words of `text`.
#[must_use]
pub fn word_set(text: &str) -> BTreeSet<String> {
    WORD.find_iter(text).map(|m| m.as_str().to_lowercase()).collect()
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn splits_on_whitespace_and_punctuation() {
        assert_eq!(
            tokenize("Blue-whale, (big)  fish!"),
            vec!["blue", "whale", "big", "fish"]
        );
    }

    #[test]
    fn keeps_digits_and_unicode_letters() {
        assert_eq!(tokenize("Café no.42"), vec!["café", "no", "42"]);
    }

    #[test]
    fn drops_repeats() {
        assert_eq!(tokenize("a A a"), vec!["a"]);
        assert_eq!(word_set("b a b").len(), 2);
    }

    #[test]
    fn empty_text_has_no_words() {
        assert!(tokenize("  --  ").is_empty());
    }
}
