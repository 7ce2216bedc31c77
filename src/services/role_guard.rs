//! Host/guest role, always derived from server data.

use crate::{
    dao::models::GameEntity,
    error::CoreError,
    state::{SharedSession, game::GameId},
};

/// Role of a user within one game.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Role {
    /// Whether the user is the game's host.
    pub is_host: bool,
}

/// Derive the role from the game's `hostId`; the local `isHost` flag is never trusted.
pub fn derive_role(game: &GameEntity, user_id: &str) -> Role {
    Role {
        is_host: game.host_id == user_id,
    }
}

/// Reject host-only operations for guests.
pub fn guard(operation: &str, role: Role) -> Result<(), CoreError> {
    if role.is_host {
        Ok(())
    } else {
        Err(CoreError::permission(operation))
    }
}

/// Read the game, check that the local user hosts it and return the fresh snapshot.
pub async fn require_host(
    session: &SharedSession,
    game_id: &GameId,
    operation: &str,
) -> Result<GameEntity, CoreError> {
    let user_id = session.user_id()?;
    let game = session.fetch_game(game_id).await?;
    guard(operation, derive_role(&game, &user_id))?;
    Ok(game)
}

#[cfg(test)]
mod tests {
    use super::*;
    use serde_json::json;

    fn game(host: &str) -> GameEntity {
        serde_json::from_value(json!({
            "hostId": host,
            "status": "lobby",
            "settings": { "categories": ["fsk0"], "maxPlayers": 4 },
            "players": {
                "A": { "name": "A", "isHost": false },
                "B": { "name": "B", "isHost": true }
            }
        }))
        .unwrap()
    }

    #[test]
    fn role_follows_host_id_not_player_flag() {
        let game = game("A");
        assert!(derive_role(&game, "A").is_host);
        assert!(!derive_role(&game, "B").is_host);
    }

    #[test]
    fn guests_are_rejected_with_operation_name() {
        let err = guard("advance_round", Role { is_host: false }).unwrap_err();
        assert!(matches!(err, CoreError::Permission { ref operation } if operation == "advance_round"));
        assert!(guard("advance_round", Role { is_host: true }).is_ok());
    }
}
