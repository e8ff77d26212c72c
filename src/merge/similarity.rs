use std::collections::BTreeSet;

/// Scores two normalized names in `[0, 1]`.
pub trait NameSimilarity: Send + Sync {
    fn similarity(&self, a: &str, b: &str) -> f64;

    /// Keys used to skip pairs that cannot score above zero. Two names that
    /// share no key must score `0.0`.
    fn blocking_keys(&self, name: &str) -> BTreeSet<String>;
}

/// pg_trgm compatible trigram similarity.
#[derive(Debug, Default, Clone, Copy)]
pub struct TrigramSimilarity;

impl NameSimilarity for TrigramSimilarity {
    fn similarity(&self, a: &str, b: &str) -> f64 {
        let ta = trigrams(a);
        let tb = trigrams(b);
        if ta.is_empty() || tb.is_empty() {
            return 0.0;
        }
        let shared = ta.intersection(&tb).count();
        let union = ta.len() + tb.len() - shared;
        shared as f64 / union as f64
    }

    fn blocking_keys(&self, name: &str) -> BTreeSet<String> {
        trigrams(name)
    }
}

/// Each alphanumeric word is lower-cased, padded as `"  word "` and cut into
/// 3-character windows.
pub fn trigrams(s: &str) -> BTreeSet<String> {
    let mut out = BTreeSet::new();
    for word in s
        .split(|c: char| !c.is_alphanumeric())
        .filter(|w| !w.is_empty())
    {
        let padded: Vec<char> = format!("  {} ", word.to_lowercase()).chars().collect();
        for window in padded.windows(3) {
            out.insert(window.iter().collect());
        }
    }
    out
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn trigrams_follow_pg_trgm_padding() {
        let t = trigrams("cat");
        let expected: BTreeSet<String> = ["  c", " ca", "cat", "at "]
            .into_iter()
            .map(String::from)
            .collect();
        assert_eq!(t, expected);
    }

    #[test]
    fn identical_names_score_one() {
        let s = TrigramSimilarity.similarity("maria garcia", "maria garcia");
        assert!((s - 1.0).abs() < f64::EPSILON);
    }

    #[test]
    fn disjoint_names_score_zero() {
        assert_eq!(TrigramSimilarity.similarity("abc", "xyz"), 0.0);
        assert_eq!(TrigramSimilarity.similarity("", "maria"), 0.0);
    }

    #[test]
    fn partial_overlap_is_jaccard() {
        // "maria garcia" has 12 distinct trigrams, "lopez" adds 6 more.
        let s = TrigramSimilarity.similarity("maria garcia", "maria garcia lopez");
        assert!((s - 12.0 / 18.0).abs() < 1e-9);
    }

    #[test]
    fn similarity_is_symmetric() {
        let a = TrigramSimilarity.similarity("jon smith", "john smyth");
        let b = TrigramSimilarity.similarity("john smyth", "jon smith");
        assert_eq!(a, b);
        assert!(a > 0.0 && a < 1.0);
    }
}
