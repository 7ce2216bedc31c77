//! Scoring of a completed round.

use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::dao::models::AnswerEntity;

/// Outcome of one player's answer.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct PlayerResult {
    /// Player the answer belongs to.
    pub player_id: String,
    /// The yes/no answer.
    pub value: bool,
    /// How many yes answers the player expected.
    pub estimation: u32,
    /// Distance between the estimation and the actual number of yes answers.
    pub difference: u32,
    /// The estimation matched exactly.
    pub is_correct: bool,
    /// `difference × multiplier`, zero for a correct estimation.
    pub penalty: u32,
}

/// Results of a round together with the figures they were derived from.
#[derive(Debug, Clone, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct RoundSummary {
    /// Yes answers among the scored players.
    pub actual_yes_count: u32,
    /// Number of scored players.
    pub player_count: usize,
    /// Per-player outcome, worst penalty first.
    pub results: Vec<PlayerResult>,
}

/// Score every answer of a round.
///
/// Ordered by penalty descending, ties by player id ascending, so every client derives the
/// same list from the same answers.
pub fn compute(answers: &BTreeMap<String, AnswerEntity>, multiplier: u32) -> Vec<PlayerResult> {
    let actual_yes = yes_count(answers);

    let mut results: Vec<PlayerResult> = answers
        .iter()
        .map(|(player_id, answer)| {
            let difference = answer.estimation.abs_diff(actual_yes);
            PlayerResult {
                player_id: player_id.clone(),
                value: answer.value,
                estimation: answer.estimation,
                difference,
                is_correct: difference == 0,
                penalty: difference.saturating_mul(multiplier),
            }
        })
        .collect();

    results.sort_by(|a, b| {
        b.penalty
            .cmp(&a.penalty)
            .then_with(|| a.player_id.cmp(&b.player_id))
    });
    results
}

/// [`compute`] plus the yes count and number of answers.
pub fn summarize(answers: &BTreeMap<String, AnswerEntity>, multiplier: u32) -> RoundSummary {
    RoundSummary {
        actual_yes_count: yes_count(answers),
        player_count: answers.len(),
        results: compute(answers, multiplier),
    }
}

fn yes_count(answers: &BTreeMap<String, AnswerEntity>) -> u32 {
    answers.values().filter(|answer| answer.value).count() as u32
}
