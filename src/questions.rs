//! Question content and the age gate in front of restricted categories.

use std::sync::atomic::{AtomicBool, Ordering};

use futures::future::BoxFuture;
use indexmap::IndexMap;
use rand::seq::SliceRandom;
use tracing::debug;

use crate::{dao::storage::StoreResult, state::game::Question};

/// Provider of question content.
pub trait QuestionSource: Send + Sync {
    /// Up to `count` shuffled questions drawn from `categories`.
    fn load_questions(
        &self,
        categories: &[String],
        count: usize,
    ) -> BoxFuture<'static, StoreResult<Vec<Question>>>;
}

/// Grants access to age-restricted content.
pub trait AgeVerifier: Send + Sync {
    /// Whether the local user passed the age check.
    fn is_verified(&self) -> bool;
}

/// Verifier used when none is configured: restricted content stays locked.
#[derive(Debug, Default, Clone, Copy)]
pub struct DenyAgeVerifier;

impl AgeVerifier for DenyAgeVerifier {
    fn is_verified(&self) -> bool {
        false
    }
}

/// Verifier whose grant is toggled explicitly.
#[derive(Debug, Default)]
pub struct StaticAgeVerifier {
    verified: AtomicBool,
}

impl StaticAgeVerifier {
    /// Verifier starting out as `verified`.
    pub fn new(verified: bool) -> Self {
        Self {
            verified: AtomicBool::new(verified),
        }
    }

    /// Grant or revoke access.
    pub fn set_verified(&self, verified: bool) {
        self.verified.store(verified, Ordering::SeqCst);
    }
}

impl AgeVerifier for StaticAgeVerifier {
    fn is_verified(&self) -> bool {
        self.verified.load(Ordering::SeqCst)
    }
}

/// In-process catalog grouped by category.
#[derive(Debug, Clone, Default)]
pub struct CatalogQuestionSource {
    by_category: IndexMap<String, Vec<Question>>,
}

impl CatalogQuestionSource {
    /// Catalog of `questions`, grouped by lowercase category. Category order follows
    /// the first appearance in `questions`.
    pub fn new(questions: impl IntoIterator<Item = Question>) -> Self {
        let mut by_category: IndexMap<String, Vec<Question>> = IndexMap::new();
        for question in questions {
            by_category
                .entry(question.category.to_ascii_lowercase())
                .or_default()
                .push(question);
        }
        Self { by_category }
    }

    /// Catalog shipped with the crate.
    pub fn builtin() -> Self {
        Self::new(BUILTIN.iter().map(|(id, category, age_level, text)| Question {
            id: (*id).to_string(),
            text: (*text).to_string(),
            category: (*category).to_string(),
            age_level: *age_level,
        }))
    }

    /// Number of questions in `category`.
    pub fn len_of(&self, category: &str) -> usize {
        self.by_category
            .get(&category.to_ascii_lowercase())
            .map_or(0, Vec::len)
    }
}

impl QuestionSource for CatalogQuestionSource {
    fn load_questions(
        &self,
        categories: &[String],
        count: usize,
    ) -> BoxFuture<'static, StoreResult<Vec<Question>>> {
        let mut pool: Vec<Question> = categories
            .iter()
            .filter_map(|category| self.by_category.get(&category.to_ascii_lowercase()))
            .flatten()
            .cloned()
            .collect();
        pool.shuffle(&mut rand::rng());
        pool.truncate(count);
        debug!(?categories, loaded = pool.len(), "loaded questions from catalog");
        Box::pin(async move { Ok(pool) })
    }
}

const BUILTIN: &[(&str, &str, u8, &str)] = &[
    ("fsk0-01", "fsk0", 0, "Have you ever fallen asleep in a cinema?"),
    ("fsk0-02", "fsk0", 0, "Have you ever sung in the shower this week?"),
    ("fsk0-03", "fsk0", 0, "Do you still own your first mobile phone?"),
    ("fsk0-04", "fsk0", 0, "Have you ever pretended to know a song you have never heard?"),
    ("fsk0-05", "fsk0", 0, "Have you ever eaten pizza for breakfast?"),
    ("fsk0-06", "fsk0", 0, "Can you whistle with your fingers?"),
    ("fsk0-07", "fsk0", 0, "Have you ever missed a flight or a train?"),
    ("fsk0-08", "fsk0", 0, "Do you talk to your plants?"),
    ("fsk0-09", "fsk0", 0, "Have you ever laughed at a funeral?"),
    ("fsk0-10", "fsk0", 0, "Have you ever re-gifted a present?"),
    ("fsk16-01", "fsk16", 16, "Have you ever lied about your age?"),
    ("fsk16-02", "fsk16", 16, "Have you ever stalked an ex online?"),
    ("fsk16-03", "fsk16", 16, "Have you ever been kicked out of a bar?"),
    ("fsk16-04", "fsk16", 16, "Have you ever sent a message to the wrong person?"),
    ("fsk16-05", "fsk16", 16, "Have you ever called in sick when you were not?"),
    ("fsk16-06", "fsk16", 16, "Have you ever had a crush on a friend's partner?"),
    ("fsk16-07", "fsk16", 16, "Have you ever ghosted someone?"),
    ("fsk16-08", "fsk16", 16, "Have you ever woken up not knowing where you were?"),
    ("fsk18-01", "fsk18", 18, "Have you ever skinny-dipped?"),
    ("fsk18-02", "fsk18", 18, "Have you ever had a one-night stand?"),
    ("fsk18-03", "fsk18", 18, "Have you ever sent a risky photo?"),
    ("fsk18-04", "fsk18", 18, "Have you ever kissed a stranger at a party?"),
    ("fsk18-05", "fsk18", 18, "Have you ever been caught in an awkward moment by a parent?"),
    ("fsk18-06", "fsk18", 18, "Have you ever used a dating app while in a relationship?"),
];

#[cfg(test)]
mod tests {
    use super::*;

    #[tokio::test]
    async fn loads_only_requested_categories() {
        let source = CatalogQuestionSource::builtin();
        let questions = source
            .load_questions(&["fsk0".to_string()], 100)
            .await
            .unwrap();

        assert_eq!(questions.len(), source.len_of("fsk0"));
        assert!(questions.iter().all(|q| q.category == "fsk0"));
        assert!(questions.iter().all(|q| !q.is_age_restricted()));
    }

    #[tokio::test]
    async fn count_limits_the_deck() {
        let source = CatalogQuestionSource::builtin();
        let questions = source
            .load_questions(&["fsk0".to_string(), "FSK16".to_string()], 5)
            .await
            .unwrap();
        assert_eq!(questions.len(), 5);
    }

    #[tokio::test]
    async fn unknown_category_yields_empty_deck() {
        let source = CatalogQuestionSource::builtin();
        let questions = source
            .load_questions(&["trivia".to_string()], 5)
            .await
            .unwrap();
        assert!(questions.is_empty());
    }

    #[test]
    fn verifiers_grant_as_configured() {
        assert!(!DenyAgeVerifier.is_verified());
        let verifier = StaticAgeVerifier::new(false);
        verifier.set_verified(true);
        assert!(verifier.is_verified());
    }
}
