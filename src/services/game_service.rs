//! Lobby-level operations: creating, joining, leaving and administrating games.

use std::{collections::BTreeMap, io, time::Duration};

use serde_json::{Value, json};
use tracing::{info, warn};
use validator::Validate;

use crate::{
    dao::{
        models::{GameEntity, GameStatus},
        paths,
        storage::StoreError,
    },
    error::CoreError,
    services::{role_guard, round_coordinator},
    state::{
        SharedSession,
        game::{GameId, GameSettings, PlayerId},
        state_machine::GameEvent,
    },
};

/// Result of leaving a game.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum LeaveOutcome {
    /// A guest left.
    Left,
    /// The host left and the role moved to the earliest-joined remaining player.
    HostHandedOver {
        /// New host.
        to: PlayerId,
    },
    /// The last player left; the game was removed.
    GameDeleted,
}

fn player_node(session: &SharedSession, name: &str, is_host: bool) -> Value {
    json!({
        "name": name,
        "isHost": is_host,
        "isReady": false,
        "isOnline": true,
        "score": 0,
        "joinedAt": session.store().server_timestamp(),
    })
}

fn ensure_settings_allowed(session: &SharedSession, settings: &GameSettings) -> Result<(), CoreError> {
    settings.validate()?;
    if settings.has_age_restricted_category() && !session.age_verifier().is_verified() {
        return Err(CoreError::permission("settings: age verification required"));
    }
    Ok(())
}

/// Create a game hosted by the local user and join it. Returns the new game code.
pub async fn create_game(
    session: &SharedSession,
    name: &str,
    settings: GameSettings,
) -> Result<GameId, CoreError> {
    let user_id = session.user_id()?;
    ensure_settings_allowed(session, &settings)?;

    let attempts = session.config().game_id_attempts;
    for attempt in 1..=attempts {
        let game_id = GameId::generate();
        let taken = session
            .fetch::<Value>(&paths::game_field(&game_id, "hostId"))
            .await?
            .is_some();
        if taken {
            warn!(game_id = %game_id, attempt, "game id collision; drawing another");
            continue;
        }

        let now = session.store().server_timestamp();
        let game = json!({
            "hostId": user_id,
            "status": GameStatus::Lobby,
            "currentRound": 0,
            "settings": settings,
            "timerPaused": false,
            "createdAt": now,
            "players": { user_id.as_str(): player_node(session, name, true) },
        });
        session
            .write("create_game", &paths::game(&game_id), game)
            .await?;
        round_coordinator::join(session, &game_id).await?;
        info!(game_id = %game_id, host = %user_id, "game created");
        return Ok(game_id);
    }

    Err(CoreError::TransientStore {
        attempts,
        source: StoreError::unavailable(
            "no free game id".into(),
            io::Error::other(format!("{attempts} generated ids were all taken")),
        ),
    })
}

/// Register the local user in a lobby and follow the game.
///
/// Re-joining a game the user already belongs to only marks them online again.
pub async fn join_game(
    session: &SharedSession,
    game_id: &GameId,
    name: &str,
) -> Result<GameEntity, CoreError> {
    let user_id = session.user_id()?;
    let game = session.fetch_game(game_id).await?;

    if game.players.contains_key(&user_id) {
        session
            .write(
                "join_game",
                &paths::player_field(game_id, &user_id, "isOnline"),
                Value::Bool(true),
            )
            .await?;
    } else {
        if game.status != GameStatus::Lobby {
            return Err(CoreError::InvalidState("game already started".into()));
        }
        if game.player_count() >= game.settings.max_players as usize {
            return Err(CoreError::InvalidState(format!(
                "game is full ({} players)",
                game.settings.max_players
            )));
        }
        session
            .write(
                "join_game",
                &paths::player(game_id, &user_id),
                player_node(session, name, false),
            )
            .await?;
        info!(game_id = %game_id, user_id = %user_id, "joined lobby");
    }

    round_coordinator::join(session, game_id).await
}

/// Flip the local player's ready flag.
pub async fn set_ready(session: &SharedSession, game_id: &GameId, ready: bool) -> Result<(), CoreError> {
    let user_id = session.user_id()?;
    session
        .write(
            "set_ready",
            &paths::player_field(game_id, &user_id, "isReady"),
            Value::Bool(ready),
        )
        .await
}

/// Flip the local player's presence flag.
pub async fn set_online(session: &SharedSession, game_id: &GameId, online: bool) -> Result<(), CoreError> {
    let user_id = session.user_id()?;
    session
        .write(
            "set_online",
            &paths::player_field(game_id, &user_id, "isOnline"),
            Value::Bool(online),
        )
        .await
}

/// Remove the local player from the game and drop every listener of it.
pub async fn leave_game(session: &SharedSession, game_id: &GameId) -> Result<LeaveOutcome, CoreError> {
    let user_id = session.user_id()?;
    let game = session.fetch_game(game_id).await?;
    if !game.players.contains_key(&user_id) {
        return Err(CoreError::NotFound(format!(
            "player `{user_id}` in game `{game_id}`"
        )));
    }

    let successor = game
        .players
        .iter()
        .filter(|(id, _)| **id != user_id)
        .min_by(|(a_id, a), (b_id, b)| a.joined_at.cmp(&b.joined_at).then_with(|| a_id.cmp(b_id)))
        .map(|(id, _)| id.clone());

    let outcome = match successor {
        None => {
            session
                .write("leave_game", &paths::game(game_id), Value::Null)
                .await?;
            LeaveOutcome::GameDeleted
        }
        Some(successor) if game.host_id == user_id => {
            let updates = BTreeMap::from([
                (paths::player(game_id, &user_id), Value::Null),
                (paths::game_field(game_id, "hostId"), json!(successor)),
                (
                    paths::player_field(game_id, &successor, "isHost"),
                    Value::Bool(true),
                ),
            ]);
            session.update("leave_game", updates).await?;
            LeaveOutcome::HostHandedOver { to: successor }
        }
        Some(_) => {
            session
                .write("leave_game", &paths::player(game_id, &user_id), Value::Null)
                .await?;
            LeaveOutcome::Left
        }
    };

    session.reset_local().await;
    info!(game_id = %game_id, user_id = %user_id, ?outcome, "left game");
    Ok(outcome)
}

/// Host-only: hand the host role to another player.
///
/// A plain multi-path update; two hosts transferring at once resolve by last write.
pub async fn transfer_host(
    session: &SharedSession,
    game_id: &GameId,
    new_host: &str,
) -> Result<(), CoreError> {
    let game = role_guard::require_host(session, game_id, "transfer_host").await?;
    if !game.players.contains_key(new_host) {
        return Err(CoreError::NotFound(format!(
            "player `{new_host}` in game `{game_id}`"
        )));
    }
    if game.host_id == new_host {
        return Ok(());
    }

    let updates = BTreeMap::from([
        (paths::game_field(game_id, "hostId"), json!(new_host)),
        (
            paths::player_field(game_id, &game.host_id, "isHost"),
            Value::Bool(false),
        ),
        (
            paths::player_field(game_id, new_host, "isHost"),
            Value::Bool(true),
        ),
    ]);
    session.update("transfer_host", updates).await?;
    info!(game_id = %game_id, from = %game.host_id, to = new_host, "host transferred");
    Ok(())
}

/// Host-only: replace the settings while the game is in the lobby.
pub async fn update_settings(
    session: &SharedSession,
    game_id: &GameId,
    settings: GameSettings,
) -> Result<(), CoreError> {
    let game = role_guard::require_host(session, game_id, "update_settings").await?;
    if game.status != GameStatus::Lobby {
        return Err(CoreError::InvalidState(
            "settings can only change in the lobby".into(),
        ));
    }
    ensure_settings_allowed(session, &settings)?;
    if (settings.max_players as usize) < game.player_count() {
        return Err(CoreError::Validation(format!(
            "maxPlayers {} is below the {} joined players",
            settings.max_players,
            game.player_count()
        )));
    }

    session
        .write(
            "update_settings",
            &paths::game_field(game_id, "settings"),
            json!(settings),
        )
        .await
}

/// Host-only: leave the lobby and start round 1. Returns the started round.
pub async fn start_game(session: &SharedSession, game_id: &GameId) -> Result<u32, CoreError> {
    let game = role_guard::require_host(session, game_id, "start_game").await?;
    if game.status != GameStatus::Lobby {
        return Err(CoreError::InvalidState("game already started".into()));
    }
    if game.player_count() < 2 {
        return Err(CoreError::InvalidState(
            "at least 2 players are needed to start".into(),
        ));
    }
    ensure_settings_allowed(session, &game.settings)?;

    let deck = round_coordinator::load_deck(session, &game.settings).await?;
    if deck.is_empty() {
        return Err(CoreError::InvalidState(
            "no questions available for the selected categories".into(),
        ));
    }
    session.round().write().await.deck = deck.into();
    let Some(question) = round_coordinator::next_question(session, &game.settings).await? else {
        return Err(CoreError::InvalidState("question deck is empty".into()));
    };

    session
        .run_transition(GameEvent::StartGame, || async {
            let status = BTreeMap::from([("status", json!(GameStatus::Playing))]);
            round_coordinator::start_round_with(session, game_id, 1, question, status).await
        })
        .await?;
    info!(game_id = %game_id, players = game.player_count(), "game started");
    Ok(1)
}

/// Host-only: remove the game for everyone.
pub async fn delete_game(session: &SharedSession, game_id: &GameId) -> Result<(), CoreError> {
    role_guard::require_host(session, game_id, "delete_game").await?;
    session
        .write("delete_game", &paths::game(game_id), Value::Null)
        .await?;
    session.reset_local().await;
    info!(game_id = %game_id, "game deleted");
    Ok(())
}

/// Remove every game created more than `retention` ago. Returns the removed ids.
///
/// Nodes whose key is not a valid game id or that carry no creation time are left alone.
pub async fn cleanup_expired_games(
    session: &SharedSession,
    retention: Duration,
) -> Result<Vec<GameId>, CoreError> {
    let games: BTreeMap<String, Value> = session
        .fetch(paths::games())
        .await?
        .unwrap_or_default();
    let cutoff = session.clock().now_ms() - retention.as_millis() as i64;

    let mut removed = Vec::new();
    for (key, game) in games {
        let Ok(game_id) = key.parse::<GameId>() else {
            continue;
        };
        let Some(created_at) = game.get("createdAt").and_then(Value::as_i64) else {
            continue;
        };
        if created_at >= cutoff {
            continue;
        }
        session
            .write("cleanup_expired_games", &paths::game(&game_id), Value::Null)
            .await?;
        removed.push(game_id);
    }

    if !removed.is_empty() {
        info!(count = removed.len(), "removed expired games");
    }
    Ok(removed)
}
