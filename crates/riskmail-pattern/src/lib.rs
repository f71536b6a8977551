//! C8: the three pattern/similarity sub-checks and the per-domain
//! `RecentEmailWindow` they compare against (§4.8).
use regex::Regex;
use riskmail_store::Store;
use riskmail_types::keys::recent_key;
use riskmail_types::PatternKind;
use std::sync::LazyLock;

/// Default bound on the per-domain recent-email window (§3).
pub const DEFAULT_WINDOW_SIZE: usize = 500;
const SIMILARITY_THRESHOLD: f64 = 0.85;
const SEQUENTIAL_SEARCH_RADIUS: i64 = 5;

static NUMBER_SUFFIX_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"[A-Za-z].*\d{2,}$").unwrap());
static TRAILING_DIGITS_RE: LazyLock<Regex> = LazyLock::new(|| Regex::new(r"^(.*?)(\d+)$").unwrap());

#[derive(Debug, Clone, Default)]
pub struct PatternResult {
    pub has_number_suffix: bool,
    pub is_sequential: bool,
    pub is_similar_to_recent: bool,
    pub detected: Option<PatternKind>,
}

impl PatternResult {
    /// First positive in the fixed precedence order SEQUENTIAL,
    /// NUMBER_SUFFIX, SIMILAR_TO_RECENT (§4.8), while leaving all three
    /// booleans independently reported.
    fn finalize(mut self) -> Self {
        self.detected = if self.is_sequential {
            Some(PatternKind::Sequential)
        } else if self.has_number_suffix {
            Some(PatternKind::NumberSuffix)
        } else if self.is_similar_to_recent {
            Some(PatternKind::SimilarToRecent)
        } else {
            None
        };
        self
    }
}

pub struct PatternDetector<'a> {
    store: &'a dyn Store,
    window_size: usize,
}

impl<'a> PatternDetector<'a> {
    pub fn new(store: &'a dyn Store) -> Self {
        Self {
            store,
            window_size: DEFAULT_WINDOW_SIZE,
        }
    }

    pub fn with_window_size(mut self, window_size: usize) -> Self {
        self.window_size = window_size;
        self
    }

    /// Runs all three sub-checks against `local_part`/`normalized`
    /// (domain-local so the caller passes in the same normalized email
    /// used everywhere else). Read-only: doesn't touch the window
    /// itself — call [`Self::remember`] after scoring decides the
    /// input isn't a hard rejection.
    pub async fn detect(&self, normalized_email: &str, local_part: &str, domain: &str) -> PatternResult {
        let has_number_suffix = NUMBER_SUFFIX_RE.is_match(local_part);

        let recent = self
            .store
            .list_recent(&recent_key(domain), self.window_size)
            .await
            .unwrap_or_default();

        let is_sequential = self.check_sequential(local_part, domain, &recent);
        let is_similar_to_recent = self.check_similarity(normalized_email, &recent);

        PatternResult {
            has_number_suffix,
            is_sequential,
            is_similar_to_recent,
            detected: None,
        }
        .finalize()
    }

    /// Insert `normalized_email` into its domain's recent window.
    /// Callers must only do this after scoring decides the final
    /// disposition is not HARD_REJECT (§4.8).
    pub async fn remember(&self, normalized_email: &str, domain: &str) {
        if let Err(err) = self
            .store
            .list_push_bounded(&recent_key(domain), normalized_email, self.window_size)
            .await
        {
            tracing::debug!(domain, error = %err, "failed to record email in recent window");
        }
    }

    fn check_sequential(&self, local_part: &str, domain: &str, recent: &[String]) -> bool {
        let Some(captures) = TRAILING_DIGITS_RE.captures(local_part) else {
            return false;
        };
        let stem = captures.get(1).unwrap().as_str();
        let Ok(n) = captures.get(2).unwrap().as_str().parse::<i64>() else {
            return false;
        };

        let lo = (n - SEQUENTIAL_SEARCH_RADIUS).max(1);
        let hi = n + SEQUENTIAL_SEARCH_RADIUS;
        for candidate in lo..=hi {
            if candidate == n {
                continue;
            }
            let candidate_email = format!("{stem}{candidate}@{domain}");
            if recent.iter().any(|e| e.eq_ignore_ascii_case(&candidate_email)) {
                return true;
            }
        }
        false
    }

    fn check_similarity(&self, normalized_email: &str, recent: &[String]) -> bool {
        recent.iter().any(|candidate| {
            let max_len = normalized_email.chars().count().max(candidate.chars().count());
            if max_len == 0 {
                return false;
            }
            let dist = levenshtein::levenshtein(normalized_email, candidate);
            let similarity = 1.0 - (dist as f64 / max_len as f64);
            similarity >= SIMILARITY_THRESHOLD
        })
    }
}

#[cfg(test)]
mod test {
    use super::*;
    use riskmail_store::MemoryStore;

    #[tokio::test]
    async fn number_suffix_flags_two_or_more_trailing_digits() {
        let store = MemoryStore::new();
        let detector = PatternDetector::new(&store);
        let result = detector.detect("testuser123@yahoo.com", "testuser123", "yahoo.com").await;
        assert!(result.has_number_suffix);
    }

    #[tokio::test]
    async fn single_trailing_digit_is_not_a_number_suffix() {
        let store = MemoryStore::new();
        let detector = PatternDetector::new(&store);
        let result = detector.detect("user1@example.com", "user1", "example.com").await;
        assert!(!result.has_number_suffix);
    }

    #[tokio::test]
    async fn sequential_detection_finds_neighboring_siblings() {
        let store = MemoryStore::new();
        let detector = PatternDetector::new(&store);
        for n in 1..=4 {
            let email = format!("user{n}@example.com");
            detector.remember(&email, "example.com").await;
        }
        let result = detector.detect("user5@example.com", "user5", "example.com").await;
        assert!(result.is_sequential);
        assert_eq!(result.detected, Some(PatternKind::Sequential));
    }

    #[tokio::test]
    async fn similarity_flags_near_duplicate_emails() {
        let store = MemoryStore::new();
        let detector = PatternDetector::new(&store);
        detector.remember("johnsmith@example.com", "example.com").await;
        let result = detector
            .detect("johnsmiht@example.com", "johnsmiht", "example.com")
            .await;
        assert!(result.is_similar_to_recent);
    }

    #[tokio::test]
    async fn unrelated_email_has_no_hits() {
        let store = MemoryStore::new();
        let detector = PatternDetector::new(&store);
        detector.remember("alice@example.com", "example.com").await;
        let result = detector.detect("bob@example.com", "bob", "example.com").await;
        assert!(!result.is_sequential);
        assert!(!result.is_similar_to_recent);
        assert!(result.detected.is_none());
    }

    #[tokio::test]
    async fn sequential_takes_precedence_over_number_suffix() {
        let store = MemoryStore::new();
        let detector = PatternDetector::new(&store);
        detector.remember("user11@example.com", "example.com").await;
        // user12 has a two-digit trailing run (number-suffix match) and sits
        // within user11's sequential search radius, so both fire; precedence
        // must still resolve to SEQUENTIAL.
        let result = detector.detect("user12@example.com", "user12", "example.com").await;
        assert!(result.has_number_suffix);
        assert!(result.is_sequential);
        assert_eq!(result.detected, Some(PatternKind::Sequential));
    }

    #[tokio::test]
    async fn remember_respects_window_bound() {
        let store = MemoryStore::new();
        let detector = PatternDetector::new(&store).with_window_size(2);
        for n in 0..5 {
            detector.remember(&format!("user{n}@example.com"), "example.com").await;
        }
        let recent = store.list_recent("recent:example.com", 100).await.unwrap();
        assert_eq!(recent.len(), 2);
    }
}
