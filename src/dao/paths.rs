//! Store layout for games, players and rounds.

use crate::state::game::GameId;

const GAMES_ROOT: &str = "games";

/// Root node holding every game.
pub fn games() -> &'static str {
    GAMES_ROOT
}

/// Node of one game.
pub fn game(game_id: &GameId) -> String {
    format!("{GAMES_ROOT}/{game_id}")
}

/// Top-level `field` of a game node.
pub fn game_field(game_id: &GameId, field: &str) -> String {
    format!("{GAMES_ROOT}/{game_id}/{field}")
}

/// Node of one player inside a game.
pub fn player(game_id: &GameId, player_id: &str) -> String {
    format!("{GAMES_ROOT}/{game_id}/players/{player_id}")
}

/// `field` of a player node.
pub fn player_field(game_id: &GameId, player_id: &str, field: &str) -> String {
    format!("{GAMES_ROOT}/{game_id}/players/{player_id}/{field}")
}

/// Key of a round under `rounds/`.
pub fn round_key(round: u32) -> String {
    format!("round_{round}")
}

/// Node of one round, keyed by [`round_key`].
pub fn round(game_id: &GameId, round: u32) -> String {
    format!("{GAMES_ROOT}/{game_id}/rounds/{}", round_key(round))
}

/// `field` of a round node.
pub fn round_field(game_id: &GameId, round_no: u32, field: &str) -> String {
    format!("{}/{field}", round(game_id, round_no))
}

/// Answers of a round, keyed by player id.
pub fn answers(game_id: &GameId, round_no: u32) -> String {
    round_field(game_id, round_no, "answers")
}

/// Answer of one player in a round.
pub fn answer(game_id: &GameId, round_no: u32, player_id: &str) -> String {
    format!("{}/{player_id}", answers(game_id, round_no))
}
