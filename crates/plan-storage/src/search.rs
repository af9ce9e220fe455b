use plan_core::SearchHit;
use std::cmp::Ordering;

pub const SNIPPET_WINDOW_CHARS: usize = 100;
pub const SCORE_SATURATION_COUNT: usize = 10;
const ELLIPSIS: &str = "...";

/// Case-insensitive needle prepared once per query.
#[derive(Debug, Clone)]
pub struct SearchTerm {
    folded: Vec<char>,
}

impl SearchTerm {
    pub fn new(query: &str) -> Option<Self> {
        let folded = fold(query.trim());
        if folded.is_empty() {
            None
        } else {
            Some(Self { folded })
        }
    }

    /// Char offsets of non-overlapping matches.
    pub fn match_offsets(&self, text: &str) -> Vec<usize> {
        let haystack = fold(text);
        let needle = &self.folded;
        let mut offsets = Vec::new();
        if needle.len() > haystack.len() {
            return offsets;
        }
        let mut index = 0;
        while index + needle.len() <= haystack.len() {
            if haystack[index..index + needle.len()] == needle[..] {
                offsets.push(index);
                index += needle.len();
            } else {
                index += 1;
            }
        }
        offsets
    }

    pub fn len(&self) -> usize {
        self.folded.len()
    }

    pub fn is_empty(&self) -> bool {
        self.folded.is_empty()
    }
}

/// Linear in the occurrence count, saturating at ten hits.
pub fn score_for_count(count: usize) -> f64 {
    (count as f64 / SCORE_SATURATION_COUNT as f64).min(1.0)
}

pub fn snippet_around(text: &str, offset: usize, match_len: usize) -> String {
    let chars: Vec<char> = text.chars().collect();
    let total = chars.len();
    if total <= SNIPPET_WINDOW_CHARS {
        return flatten_whitespace(text);
    }

    let center = offset + match_len / 2;
    let mut start = center.saturating_sub(SNIPPET_WINDOW_CHARS / 2);
    let end = (start + SNIPPET_WINDOW_CHARS).min(total);
    if end - start < SNIPPET_WINDOW_CHARS {
        start = end.saturating_sub(SNIPPET_WINDOW_CHARS);
    }

    let body: String = chars[start..end].iter().collect();
    let mut snippet = String::new();
    if start > 0 {
        snippet.push_str(ELLIPSIS);
    }
    snippet.push_str(&flatten_whitespace(&body));
    if end < total {
        snippet.push_str(ELLIPSIS);
    }
    snippet
}

/// Highest score first; ties keep their collection order.
pub fn rank_hits(hits: &mut [SearchHit]) {
    hits.sort_by(|a, b| b.score.partial_cmp(&a.score).unwrap_or(Ordering::Equal));
}

fn fold(text: &str) -> Vec<char> {
    text.chars()
        .map(|c| c.to_lowercase().next().unwrap_or(c))
        .collect()
}

fn flatten_whitespace(text: &str) -> String {
    text.chars()
        .map(|c| if c == '\n' || c == '\r' || c == '\t' { ' ' } else { c })
        .collect()
}

#[cfg(test)]
mod tests {
    use super::*;
    use plan_core::SearchHitKind;

    fn hit(id: &str, score: f64) -> SearchHit {
        SearchHit {
            kind: SearchHitKind::Step,
            id: id.to_string(),
            title: id.to_string(),
            snippet: String::new(),
            score,
        }
    }

    #[test]
    fn matching_ignores_case_and_does_not_overlap() {
        let term = SearchTerm::new("Cache").expect("term");
        assert_eq!(term.match_offsets("cache CACHE cAcHe"), vec![0, 6, 12]);
        let term = SearchTerm::new("aa").expect("term");
        assert_eq!(term.match_offsets("aaaa").len(), 2);
        assert!(SearchTerm::new("   ").is_none());
    }

    #[test]
    fn score_saturates_at_ten_occurrences() {
        assert!(score_for_count(1) < score_for_count(5));
        assert_eq!(score_for_count(10), 1.0);
        assert_eq!(score_for_count(25), 1.0);
        assert!((score_for_count(3) - 0.3).abs() < f64::EPSILON);
    }

    #[test]
    fn short_text_snippet_has_no_ellipsis() {
        assert_eq!(snippet_around("rotate\nkeys", 0, 6), "rotate keys");
    }

    #[test]
    fn long_text_snippet_is_windowed_with_ellipses() {
        let text = format!("{}needle{}", "a".repeat(200), "b".repeat(200));
        let snippet = snippet_around(&text, 200, 6);
        assert!(snippet.starts_with("..."));
        assert!(snippet.ends_with("..."));
        assert!(snippet.contains("needle"));
        assert_eq!(snippet.chars().count(), SNIPPET_WINDOW_CHARS + 6);
    }

    #[test]
    fn snippet_at_start_only_trails_with_ellipsis() {
        let text = format!("needle{}", "z".repeat(300));
        let snippet = snippet_around(&text, 0, 6);
        assert!(snippet.starts_with("needle"));
        assert!(snippet.ends_with("..."));
    }

    #[test]
    fn ranking_is_descending_and_stable() {
        let mut hits = vec![hit("a", 0.1), hit("b", 0.5), hit("c", 0.1), hit("d", 1.0)];
        rank_hits(&mut hits);
        let order: Vec<&str> = hits.iter().map(|h| h.id.as_str()).collect();
        assert_eq!(order, vec!["d", "b", "a", "c"]);
    }
}
