use std::collections::BTreeMap;

use serde::{Deserialize, Serialize};

use crate::{
    services::results::PlayerResult,
    state::game::{GameSettings, Question},
};

/// Lifecycle status of a game as stored in the realtime tree.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum GameStatus {
    /// Players are joining; settings may change.
    Lobby,
    /// Rounds are being played.
    Playing,
    /// The host ended the game.
    Finished,
}

/// Stage of the current round, published by the host for late joiners.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "lowercase")]
pub enum RoundStage {
    /// Answers are being collected.
    Answering,
    /// Results of the round are published.
    Results,
}

/// Game node stored at `games/{gameId}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct GameEntity {
    /// User id of the current host; the only source of truth for the host role.
    pub host_id: String,
    /// Lifecycle status.
    pub status: GameStatus,
    /// Number of the active round (0 while in the lobby).
    #[serde(default)]
    pub current_round: u32,
    /// Stage of the active round.
    #[serde(default)]
    pub phase: Option<RoundStage>,
    /// Participants keyed by user id.
    #[serde(default)]
    pub players: BTreeMap<String, PlayerEntity>,
    /// Host-controlled settings.
    pub settings: GameSettings,
    /// Server timestamp (ms) the countdown is measured from.
    #[serde(default)]
    pub timer_start_time: Option<i64>,
    /// Whether the host paused the countdown.
    #[serde(default)]
    pub timer_paused: bool,
    /// Remaining milliseconds frozen by the last pause.
    #[serde(default)]
    pub timer_remaining: Option<i64>,
    /// Server timestamp (ms) of creation, used by the retention policy.
    #[serde(default)]
    pub created_at: i64,
}

impl GameEntity {
    /// Number of registered players.
    pub fn player_count(&self) -> usize {
        self.players.len()
    }
}

/// Player node stored at `games/{gameId}/players/{userId}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PlayerEntity {
    /// Display name.
    #[serde(default)]
    pub name: String,
    /// Mirrors `hostId == userId`; exactly one player carries it.
    #[serde(default)]
    pub is_host: bool,
    /// Written by the owning player only.
    #[serde(default)]
    pub is_ready: bool,
    /// Written by the owning player only.
    #[serde(default)]
    pub is_online: bool,
    /// Accumulated penalty sips, host-writable.
    #[serde(default)]
    pub score: i64,
    /// Server timestamp (ms) of joining.
    #[serde(default)]
    pub joined_at: i64,
}

/// Round node stored at `games/{gameId}/rounds/round_{n}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq)]
#[serde(rename_all = "camelCase")]
pub struct RoundEntity {
    /// Question asked this round.
    pub question: Question,
    /// Append-only answers keyed by player id.
    #[serde(default)]
    pub answers: BTreeMap<String, AnswerEntity>,
    /// Server timestamp (ms) the round started at.
    #[serde(default)]
    pub started_at: i64,
    /// Countdown length in milliseconds.
    #[serde(default)]
    pub timer_duration: u64,
    /// Results published by the host once every player answered.
    #[serde(default)]
    pub results: Option<Vec<PlayerResult>>,
}

/// Answer node stored at `games/{gameId}/rounds/round_{n}/answers/{playerId}`.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct AnswerEntity {
    /// Yes/no answer to the question.
    pub value: bool,
    /// Guess of how many players answered yes.
    pub estimation: u32,
    /// Server timestamp (ms) of the submission.
    #[serde(default)]
    pub timestamp: i64,
    /// Default answer submitted because the countdown expired.
    #[serde(default, skip_serializing_if = "std::ops::Not::not")]
    pub timed_out: bool,
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::{
        dao::{realtime_store::decode, storage::StoreError},
        error::CoreError,
    };
    use serde_json::json;

    #[test]
    fn game_entity_reads_sparse_store_nodes() {
        let value = json!({
            "hostId": "U1",
            "status": "playing",
            "currentRound": 2,
            "settings": {
                "categories": ["fsk0"],
                "difficulty": "medium",
                "maxPlayers": 8,
                "alcoholMode": true,
                "rounds": 10
            },
            "players": {
                "U1": { "name": "Host", "isHost": true, "score": 3 },
                "U2": { "name": "Guest" }
            },
            "rounds": { "round_1": { "ignored": true } }
        });

        let game: GameEntity = serde_json::from_value(value).unwrap();
        assert_eq!(game.status, GameStatus::Playing);
        assert_eq!(game.current_round, 2);
        assert_eq!(game.player_count(), 2);
        assert!(game.players["U1"].is_host);
        assert!(!game.players["U2"].is_ready);
        assert!(!game.timer_paused);
        assert_eq!(game.timer_start_time, None);
    }

    #[test]
    fn timed_out_flag_is_omitted_when_false() {
        let answer = AnswerEntity {
            value: true,
            estimation: 2,
            timestamp: 10,
            timed_out: false,
        };
        let value = serde_json::to_value(&answer).unwrap();
        assert_eq!(value, json!({ "value": true, "estimation": 2, "timestamp": 10 }));
    }

    #[test]
    fn negative_estimations_are_corrupt_answers() {
        let path = "games/ABC123/rounds/round_1/answers/U1";
        let stored = json!({ "value": true, "estimation": -1, "timestamp": 10 });

        let err = decode::<AnswerEntity>(path, Some(stored)).unwrap_err();
        assert!(matches!(err, StoreError::Decode { path: ref p, .. } if p == path));
        assert!(matches!(CoreError::from(err), CoreError::Corrupt(_)));
    }
}
