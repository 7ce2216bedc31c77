use std::{fmt, str::FromStr};

use rand::Rng;
use serde::{Deserialize, Serialize};
use serde_with::{DeserializeFromStr, SerializeDisplay};
use thiserror::Error;
use validator::Validate;

/// Stable user identifier issued by the authentication provider.
pub type PlayerId = String;

/// Category whose questions require an age check before they are shown.
pub const AGE_RESTRICTED_CATEGORY: &str = "fsk18";

const GAME_ID_LENGTH: usize = 6;
/// Characters used for generated ids; visually ambiguous glyphs (0/O, 1/I) are left out.
const GENERATED_ALPHABET: &[u8] = b"ABCDEFGHJKLMNPQRSTUVWXYZ23456789";

/// Returned when a string is not a valid game code.
#[derive(Debug, Clone, PartialEq, Eq, Error)]
#[error("invalid game id `{0}`: expected 6 uppercase letters or digits")]
pub struct InvalidGameId(pub String);

/// Six character uppercase alphanumeric code identifying a game.
///
/// Parsing trims surrounding whitespace and uppercases the input so codes typed in lowercase
/// are accepted.
#[derive(
    Debug, Clone, PartialEq, Eq, PartialOrd, Ord, Hash, SerializeDisplay, DeserializeFromStr,
)]
pub struct GameId(String);

impl GameId {
    /// Draw a fresh random code. Uniqueness is checked against the store by the caller.
    pub fn generate() -> Self {
        let mut rng = rand::rng();
        let code = (0..GAME_ID_LENGTH)
            .map(|_| GENERATED_ALPHABET[rng.random_range(0..GENERATED_ALPHABET.len())] as char)
            .collect();
        Self(code)
    }

    /// The code as a string slice.
    pub fn as_str(&self) -> &str {
        &self.0
    }
}

impl fmt::Display for GameId {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(&self.0)
    }
}

impl FromStr for GameId {
    type Err = InvalidGameId;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let code = s.trim().to_ascii_uppercase();
        if code.len() == GAME_ID_LENGTH && code.chars().all(|c| c.is_ascii_alphanumeric()) {
            Ok(Self(code))
        } else {
            Err(InvalidGameId(s.to_string()))
        }
    }
}

/// Question shown to every player during a round.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct Question {
    /// Catalog id.
    pub id: String,
    /// Statement the players answer yes or no to.
    pub text: String,
    /// Category the question was drawn from.
    pub category: String,
    /// Minimum age the content is rated for.
    #[serde(default)]
    pub age_level: u8,
}

impl Question {
    /// Whether showing this question requires a prior age check.
    pub fn is_age_restricted(&self) -> bool {
        is_age_restricted_category(&self.category) || self.age_level >= 18
    }
}

/// Whether the category is gated behind an age check.
pub fn is_age_restricted_category(category: &str) -> bool {
    category.eq_ignore_ascii_case(AGE_RESTRICTED_CATEGORY)
}

/// How harshly estimation errors are punished.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash, Default)]
#[serde(rename_all = "lowercase")]
pub enum Difficulty {
    /// Mildest penalty multiplier.
    Easy,
    /// Default multiplier.
    #[default]
    Medium,
    /// Steepest penalty multiplier.
    Hard,
}

/// Host-controlled game settings.
#[derive(Debug, Clone, Serialize, Deserialize, PartialEq, Eq, Validate)]
#[serde(rename_all = "camelCase")]
pub struct GameSettings {
    /// Question categories drawn from.
    #[validate(length(min = 1, message = "at least one category must be selected"))]
    pub categories: Vec<String>,
    #[serde(default)]
    /// Penalty multiplier applied to estimation errors.
    pub difficulty: Difficulty,
    #[validate(range(min = 2, max = 12))]
    /// Upper bound on joined players.
    pub max_players: u32,
    /// Penalties are announced as sips instead of points.
    #[serde(default)]
    pub alcohol_mode: bool,
    /// Number of rounds before the game ends on its own.
    #[validate(range(min = 1, max = 50))]
    #[serde(default = "default_rounds")]
    pub rounds: u32,
}

fn default_rounds() -> u32 {
    10
}

impl GameSettings {
    /// Whether any selected category needs an age check.
    pub fn has_age_restricted_category(&self) -> bool {
        self.categories
            .iter()
            .any(|category| is_age_restricted_category(category))
    }
}

impl Default for GameSettings {
    fn default() -> Self {
        Self {
            categories: vec!["fsk0".into(), "fsk16".into()],
            difficulty: Difficulty::Medium,
            max_players: 8,
            alcohol_mode: false,
            rounds: default_rounds(),
        }
    }
}

/// Answer the local player entered but that is not stored yet.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq)]
#[serde(rename_all = "camelCase")]
pub struct PendingAnswer {
    /// Yes or no.
    pub value: bool,
    /// Guessed number of yes answers.
    pub estimation: u32,
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generated_ids_parse_back() {
        for _ in 0..100 {
            let id = GameId::generate();
            assert_eq!(id.as_str().len(), 6);
            assert_eq!(id.as_str().parse::<GameId>().unwrap(), id);
        }
    }

    #[test]
    fn parsing_normalizes_case_and_whitespace() {
        let id: GameId = " abc12z ".parse().unwrap();
        assert_eq!(id.as_str(), "ABC12Z");
    }

    #[test]
    fn parsing_rejects_malformed_codes() {
        assert!("ABC12".parse::<GameId>().is_err());
        assert!("ABC1234".parse::<GameId>().is_err());
        assert!("ABC-12".parse::<GameId>().is_err());
        assert!("".parse::<GameId>().is_err());
    }

    #[test]
    fn game_id_serializes_as_string() {
        let id: GameId = "XYZ789".parse().unwrap();
        assert_eq!(serde_json::to_string(&id).unwrap(), "\"XYZ789\"");
        assert!(serde_json::from_str::<GameId>("\"bad\"").is_err());
    }

    #[test]
    fn age_restriction_uses_category_and_level() {
        let mut question = Question {
            id: "q1".into(),
            text: "...".into(),
            category: "fsk16".into(),
            age_level: 16,
        };
        assert!(!question.is_age_restricted());

        question.age_level = 18;
        assert!(question.is_age_restricted());

        question.age_level = 0;
        question.category = "FSK18".into();
        assert!(question.is_age_restricted());
    }

    #[test]
    fn settings_validation_bounds() {
        let mut settings = GameSettings::default();
        assert!(settings.validate().is_ok());

        settings.max_players = 1;
        assert!(settings.validate().is_err());

        settings.max_players = 4;
        settings.categories.clear();
        assert!(settings.validate().is_err());

        settings.categories.push("fsk18".into());
        assert!(settings.validate().is_ok());
        assert!(settings.has_age_restricted_category());

        settings.rounds = 0;
        assert!(settings.validate().is_err());
    }
}
