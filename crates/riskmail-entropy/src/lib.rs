//! C7: Shannon entropy of an email local-part. Pure and deterministic —
//! no I/O, no cache, nothing to fail.
use std::collections::HashMap;
use unicode_segmentation::UnicodeSegmentation;

const DEFAULT_THRESHOLD: f64 = 4.5;

/// Grapheme-frequency Shannon entropy, in bits: `-sum(p_i * log2(p_i))`.
/// Empty input has zero entropy.
pub fn shannon_entropy(s: &str) -> f64 {
    let graphemes: Vec<&str> = s.graphemes(true).collect();
    let len = graphemes.len();
    if len == 0 {
        return 0.0;
    }

    let mut counts: HashMap<&str, usize> = HashMap::new();
    for g in &graphemes {
        *counts.entry(g).or_insert(0) += 1;
    }

    counts
        .values()
        .map(|&count| {
            let p = count as f64 / len as f64;
            -p * p.log2()
        })
        .sum()
}

/// `entropy > threshold` per §4.7/§4.11. `threshold` is configurable;
/// pass `None` to use the spec default of 4.5.
pub fn is_high_entropy(entropy: f64, threshold: Option<f64>) -> bool {
    entropy > threshold.unwrap_or(DEFAULT_THRESHOLD)
}

#[cfg(test)]
mod test {
    use super::*;

    #[test]
    fn empty_string_has_zero_entropy() {
        assert_eq!(shannon_entropy(""), 0.0);
    }

    #[test]
    fn repeated_character_has_zero_entropy() {
        assert_eq!(shannon_entropy("aaaaaa"), 0.0);
    }

    #[test]
    fn uniform_distribution_has_max_entropy_for_alphabet_size() {
        // 4 distinct characters, equally likely: entropy == log2(4) == 2.0
        let entropy = shannon_entropy("abcd");
        assert!((entropy - 2.0).abs() < 1e-9);
    }

    #[test]
    fn random_looking_local_part_is_high_entropy() {
        let entropy = shannon_entropy("a8f3k2x9q1");
        assert!(is_high_entropy(entropy, None));
    }

    #[test]
    fn ordinary_name_is_not_high_entropy() {
        let entropy = shannon_entropy("john.doe");
        assert!(!is_high_entropy(entropy, None));
    }

    #[test]
    fn custom_threshold_is_honored() {
        let entropy = shannon_entropy("john.doe");
        assert!(is_high_entropy(entropy, Some(0.1)));
    }
}
