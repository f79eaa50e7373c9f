use std::collections::HashSet;

/// Acceptance thresholds for the fuzzy phase. Tuned values, not derived.
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct MatchThresholds {
    pub similarity: f64,
    pub jaccard: f64,
}

impl Default for MatchThresholds {
    fn default() -> Self {
        Self {
            similarity: 0.62,
            jaccard: 0.62,
        }
    }
}

/// Scores captured phrases against a round's accepted answers.
#[derive(Debug, Clone, Copy, Default)]
pub struct Matcher {
    thresholds: MatchThresholds,
}

impl Matcher {
    pub fn new(thresholds: MatchThresholds) -> Self {
        Self { thresholds }
    }

    /// Returns true if any heard phrase matches any accepted answer.
    ///
    /// Exact equality after normalization is checked across every pair first,
    /// so a fuzzy pass only runs when nothing matches outright.
    pub fn matches(&self, heard: &[String], accepted: &[String]) -> bool {
        let heard: Vec<String> = heard
            .iter()
            .map(|p| normalize(p))
            .filter(|p| !p.is_empty())
            .collect();
        let accepted: Vec<String> = accepted
            .iter()
            .map(|a| normalize(a))
            .filter(|a| !a.is_empty())
            .collect();

        if heard.iter().any(|h| accepted.contains(h)) {
            return true;
        }

        heard.iter().any(|h| {
            accepted
                .iter()
                .any(|a| self.fuzzy_pair_accepted(h, a))
        })
    }

    fn fuzzy_pair_accepted(&self, heard: &str, answer: &str) -> bool {
        if jaccard(heard, answer) >= self.thresholds.jaccard {
            return true;
        }
        // The edit distance is at least the length difference, which caps the
        // best similarity this pair could reach.
        let heard_len = heard.chars().count();
        let answer_len = answer.chars().count();
        let max_len = heard_len.max(answer_len);
        let ceiling = 1.0 - heard_len.abs_diff(answer_len) as f64 / max_len as f64;
        if ceiling < self.thresholds.similarity {
            return false;
        }
        similarity(heard, answer) >= self.thresholds.similarity
    }
}

/// Lowercases, drops everything that is not alphanumeric or whitespace,
/// collapses runs of whitespace and trims.
pub fn normalize(text: &str) -> String {
    let stripped: String = text
        .to_lowercase()
        .chars()
        .filter(|c| c.is_alphanumeric() || c.is_whitespace())
        .collect();
    stripped.split_whitespace().collect::<Vec<_>>().join(" ")
}

/// `1 - distance / max_len` over characters. Two empty strings are identical.
pub fn similarity(a: &str, b: &str) -> f64 {
    let max_len = a.chars().count().max(b.chars().count());
    if max_len == 0 {
        return 1.0;
    }
    1.0 - levenshtein(a, b) as f64 / max_len as f64
}

pub fn levenshtein(a: &str, b: &str) -> usize {
    let a: Vec<char> = a.chars().collect();
    let b: Vec<char> = b.chars().collect();
    if a.is_empty() {
        return b.len();
    }
    if b.is_empty() {
        return a.len();
    }

    let mut previous: Vec<usize> = (0..=b.len()).collect();
    let mut current = vec![0; b.len() + 1];
    for (i, ca) in a.iter().enumerate() {
        current[0] = i + 1;
        for (j, cb) in b.iter().enumerate() {
            let substitution = previous[j] + usize::from(ca != cb);
            current[j + 1] = substitution.min(previous[j + 1] + 1).min(current[j] + 1);
        }
        std::mem::swap(&mut previous, &mut current);
    }
    previous[b.len()]
}

/// Word-set overlap: `|A ∩ B| / |A ∪ B|`, zero when both are empty.
pub fn jaccard(a: &str, b: &str) -> f64 {
    let a: HashSet<&str> = a.split_whitespace().collect();
    let b: HashSet<&str> = b.split_whitespace().collect();
    let union = a.union(&b).count();
    if union == 0 {
        return 0.0;
    }
    a.intersection(&b).count() as f64 / union as f64
}

#[cfg(test)]
mod tests {
    use super::*;

    fn phrases(items: &[&str]) -> Vec<String> {
        items.iter().map(|s| s.to_string()).collect()
    }

    #[test]
    fn exact_match_after_normalization() {
        let matcher = Matcher::default();
        assert!(matcher.matches(&phrases(&["apple"]), &phrases(&["Apple!"])));
    }

    #[test]
    fn fuzzy_match_on_small_misspelling() {
        let matcher = Matcher::default();
        assert!(matcher.matches(&phrases(&["aple"]), &phrases(&["apple"])));
    }

    #[test]
    fn unrelated_word_is_rejected() {
        let matcher = Matcher::default();
        assert!(!matcher.matches(&phrases(&["banana"]), &phrases(&["apple"])));
    }

    #[test]
    fn word_overlap_accepts_reordered_phrases() {
        let matcher = Matcher::default();
        // Edit distance is large, but the word sets are identical.
        assert!(matcher.matches(&phrases(&["york new"]), &phrases(&["New York"])));
    }

    #[test]
    fn any_buffered_phrase_can_match() {
        let matcher = Matcher::default();
        let heard = phrases(&["um", "hold on", "the eiffel tower"]);
        assert!(matcher.matches(&heard, &phrases(&["Eiffel Tower", "la tour eiffel"])));
    }

    #[test]
    fn empty_inputs_never_match() {
        let matcher = Matcher::default();
        assert!(!matcher.matches(&[], &phrases(&["apple"])));
        assert!(!matcher.matches(&phrases(&["?!"]), &phrases(&["..."])));
    }

    #[test]
    fn thresholds_are_configurable() {
        let strict = Matcher::new(MatchThresholds {
            similarity: 0.95,
            jaccard: 0.95,
        });
        assert!(!strict.matches(&phrases(&["aple"]), &phrases(&["apple"])));
    }

    #[test]
    fn normalize_strips_punctuation_and_collapses_whitespace() {
        assert_eq!(normalize("  It's   a  DOG! "), "its a dog");
    }

    #[test]
    fn levenshtein_distances() {
        assert_eq!(levenshtein("kitten", "sitting"), 3);
        assert_eq!(levenshtein("", "abc"), 3);
        assert_eq!(levenshtein("same", "same"), 0);
    }
}
