//! nocap-sim: one host and two guests playing a full game against the in-process store.

use std::{env, sync::Arc, time::Duration};

use anyhow::{Context, bail};
use rand::Rng;
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::timeout,
};
use tracing::{info, warn};
use tracing_subscriber::{layer::SubscriberExt, util::SubscriberInitExt};

use nocap_sync::{
    auth::StaticAuth,
    clock::{Clock, SystemClock},
    config::AppConfig,
    dao::memory::{MemoryBackend, MemoryStore},
    questions::CatalogQuestionSource,
    services::{
        connection_supervisor::{self, ConnectionStatus},
        game_service,
        round_coordinator::{self, AdvanceOutcome},
    },
    state::{
        Session, SessionEvent, SharedSession,
        game::{GameId, GameSettings},
    },
};

const DEFAULT_ROUNDS: u32 = 3;
const DEFAULT_LATENCY_MS: u64 = 20;
const EVENT_TIMEOUT: Duration = Duration::from_secs(30);
/// Round in which the last guest loses its connection before answering.
const OFFLINE_ROUND: u32 = 2;

struct Player {
    name: &'static str,
    session: SharedSession,
    store: MemoryStore,
    events: broadcast::Receiver<SessionEvent>,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    init_tracing();

    let mut config = AppConfig::load();
    config.retry.max_attempts = 2;
    config.retry.base_delay = Duration::from_millis(50);

    let rounds = env_or("NOCAP_SIM_ROUNDS", DEFAULT_ROUNDS);
    let latency = Duration::from_millis(env_or("NOCAP_SIM_LATENCY_MS", DEFAULT_LATENCY_MS));

    let clock: Arc<dyn Clock> = Arc::new(SystemClock);
    let backend = MemoryBackend::new(clock.clone());
    backend.set_latency(latency);
    let mut players: Vec<Player> = ["host", "guest-1", "guest-2"]
        .into_iter()
        .map(|name| player(&backend, &clock, &config, name))
        .collect();

    let settings = GameSettings {
        rounds,
        ..GameSettings::default()
    };
    let game_id = game_service::create_game(&players[0].session, players[0].name, settings)
        .await
        .context("creating game")?;
    for guest in &players[1..] {
        game_service::join_game(&guest.session, &game_id, guest.name)
            .await
            .with_context(|| format!("{} joining {game_id}", guest.name))?;
        game_service::set_ready(&guest.session, &game_id, true)
            .await
            .with_context(|| format!("{} getting ready", guest.name))?;
    }

    game_service::start_game(&players[0].session, &game_id)
        .await
        .context("starting game")?;

    let mut round = 1;
    loop {
        play_round(&mut players, &game_id, round).await?;
        match round_coordinator::advance_round(&players[0].session, &game_id)
            .await
            .with_context(|| format!("advancing past round {round}"))?
        {
            AdvanceOutcome::Started { round: next } => round = next,
            AdvanceOutcome::Finished => break,
        }
    }

    let game = players[0]
        .session
        .fetch_game(&game_id)
        .await
        .context("reading final scores")?;
    for (player_id, entity) in &game.players {
        info!(player_id = %player_id, name = %entity.name, score = entity.score, "final score");
    }
    info!(game_id = %game_id, rounds = round, "simulation finished");
    Ok(())
}

fn player(
    backend: &Arc<MemoryBackend>,
    clock: &Arc<dyn Clock>,
    config: &AppConfig,
    name: &'static str,
) -> Player {
    let store = backend.client();
    let session = Session::builder(
        Arc::new(store.clone()),
        Arc::new(StaticAuth::signed_in(name)),
        Arc::new(CatalogQuestionSource::builtin()),
    )
    .clock(clock.clone())
    .config(config.clone())
    .build();
    let events = session.events().subscribe();
    connection_supervisor::spawn(&session);
    Player {
        name,
        session,
        store,
        events,
    }
}

async fn play_round(players: &mut [Player], game_id: &GameId, round: u32) -> anyhow::Result<()> {
    let total = players.len() as u32;
    let last = players.len() - 1;

    for (index, player) in players.iter_mut().enumerate() {
        wait_for(player, |event| {
            matches!(event, SessionEvent::RoundStarted { round: started, .. } if *started == round)
        })
        .await?;

        let (value, estimation) = {
            let mut rng = rand::rng();
            (rng.random_bool(0.5), rng.random_range(0..=total))
        };

        if index == last && round == OFFLINE_ROUND {
            player.store.set_online(false);
            wait_for(player, |event| {
                matches!(event, SessionEvent::Connection(ConnectionStatus::Disconnected))
            })
            .await?;
            match round_coordinator::submit_answer(
                &player.session,
                game_id,
                round,
                player.name,
                value,
                estimation,
            )
            .await
            {
                Ok(()) => bail!("{} answered while offline", player.name),
                Err(err) => warn!(player = player.name, error = %err, "answer kept for reconnect"),
            }
            player.store.set_online(true);
            wait_for(player, |event| {
                matches!(event, SessionEvent::Connection(ConnectionStatus::Connected))
            })
            .await?;
            continue;
        }

        round_coordinator::submit_answer(
            &player.session,
            game_id,
            round,
            player.name,
            value,
            estimation,
        )
        .await
        .with_context(|| format!("{} answering round {round}", player.name))?;
    }

    let event = wait_for(&mut players[0], |event| {
        matches!(event, SessionEvent::RoundCompleted { round: done, .. } if *done == round)
    })
    .await?;
    if let SessionEvent::RoundCompleted { summary, .. } = event {
        info!(round, yes = summary.actual_yes_count, players = summary.player_count, "round complete");
        for result in &summary.results {
            info!(
                round,
                player_id = %result.player_id,
                estimation = result.estimation,
                penalty = result.penalty,
                "result"
            );
        }
    }
    Ok(())
}

async fn wait_for(
    player: &mut Player,
    matches: impl Fn(&SessionEvent) -> bool,
) -> anyhow::Result<SessionEvent> {
    let name = player.name;
    let events = &mut player.events;
    timeout(EVENT_TIMEOUT, async move {
        loop {
            match events.recv().await {
                Ok(event) if matches(&event) => return Ok(event),
                Ok(_) => {}
                Err(RecvError::Lagged(skipped)) => {
                    warn!(player = name, skipped, "event stream lagged");
                }
                Err(RecvError::Closed) => bail!("event stream of {name} closed"),
            }
        }
    })
    .await
    .with_context(|| format!("{name} waiting for an event"))?
}

fn env_or<T: std::str::FromStr>(key: &str, default: T) -> T {
    env::var(key)
        .ok()
        .and_then(|value| value.parse().ok())
        .unwrap_or(default)
}

fn init_tracing() {
    let env_filter = tracing_subscriber::EnvFilter::try_from_default_env()
        .unwrap_or_else(|_| "info".into());
    tracing_subscriber::registry()
        .with(env_filter)
        .with(tracing_subscriber::fmt::layer())
        .init();
}
