#![allow(dead_code)]

use std::{future::Future, sync::Arc, time::Duration};

use nocap_sync::{
    auth::StaticAuth,
    clock::ManualClock,
    config::AppConfig,
    dao::{
        local_storage::MemoryStorage,
        memory::{MemoryBackend, MemoryStore},
    },
    questions::{CatalogQuestionSource, StaticAgeVerifier},
    state::{
        Session, SessionEvent, SharedSession,
        game::{GameId, GameSettings},
    },
};
use tokio::{
    sync::broadcast::{self, error::RecvError},
    time::{sleep, timeout},
};

pub const START_MS: i64 = 1_700_000_000_000;
const WAIT: Duration = Duration::from_secs(5);

/// Shared store plus clock for several simulated devices.
pub struct World {
    pub clock: Arc<ManualClock>,
    pub backend: Arc<MemoryBackend>,
}

pub struct Client {
    pub user_id: String,
    pub session: SharedSession,
    pub store: MemoryStore,
    pub storage: Arc<MemoryStorage>,
    pub auth: Arc<StaticAuth>,
    pub age: Arc<StaticAgeVerifier>,
    pub events: broadcast::Receiver<SessionEvent>,
}

pub fn config() -> AppConfig {
    let mut config = AppConfig::default();
    config.store_timeout = Duration::from_secs(1);
    config.retry.max_attempts = 2;
    config.retry.base_delay = Duration::from_millis(5);
    config.retry.jitter = 0.0;
    config
}

pub fn settings(rounds: u32) -> GameSettings {
    GameSettings {
        categories: vec!["fsk0".into()],
        rounds,
        ..GameSettings::default()
    }
}

impl World {
    pub fn new() -> Self {
        let clock = Arc::new(ManualClock::new(START_MS));
        let backend = MemoryBackend::new(clock.clone());
        Self { clock, backend }
    }

    pub fn client(&self, user_id: &str) -> Client {
        self.client_with(user_id, config(), Arc::new(MemoryStorage::new()))
    }

    /// A device for `user_id` with the given config and local storage.
    pub fn client_with(&self, user_id: &str, config: AppConfig, storage: Arc<MemoryStorage>) -> Client {
        let store = self.backend.client();
        let auth = Arc::new(StaticAuth::signed_in(user_id));
        let age = Arc::new(StaticAgeVerifier::new(false));
        let session = Session::builder(
            Arc::new(store.clone()),
            auth.clone(),
            Arc::new(CatalogQuestionSource::builtin()),
        )
        .age_verifier(age.clone())
        .local_storage(storage.clone())
        .clock(self.clock.clone())
        .config(config)
        .build();
        let events = session.events().subscribe();
        Client {
            user_id: user_id.to_string(),
            session,
            store,
            storage,
            auth,
            age,
            events,
        }
    }
}

impl Client {
    /// Next event matching `matches`, skipping the rest. Panics after a few seconds.
    pub async fn expect_event(&mut self, matches: impl Fn(&SessionEvent) -> bool) -> SessionEvent {
        let user = self.user_id.as_str();
        let events = &mut self.events;
        let received = timeout(WAIT, async {
            loop {
                match events.recv().await {
                    Ok(event) if matches(&event) => return event,
                    Ok(_) | Err(RecvError::Lagged(_)) => {}
                    Err(RecvError::Closed) => panic!("event stream of {user} closed"),
                }
            }
        })
        .await;
        received.unwrap_or_else(|_| panic!("{user} did not see the expected event"))
    }

    pub async fn round_started(&mut self, round: u32) {
        self.expect_event(|event| {
            matches!(event, SessionEvent::RoundStarted { round: r, .. } if *r == round)
        })
        .await;
    }

    pub async fn round_completed(&mut self, round: u32) -> nocap_sync::services::results::RoundSummary {
        match self
            .expect_event(|event| {
                matches!(event, SessionEvent::RoundCompleted { round: r, .. } if *r == round)
            })
            .await
        {
            SessionEvent::RoundCompleted { summary, .. } => summary,
            other => unreachable!("unexpected event {other:?}"),
        }
    }
}

/// Poll `condition` until it holds. Panics after a few seconds.
pub async fn eventually<F, Fut>(what: &str, mut condition: F)
where
    F: FnMut() -> Fut,
    Fut: Future<Output = bool>,
{
    let polled = timeout(WAIT, async {
        while !condition().await {
            sleep(Duration::from_millis(5)).await;
        }
    })
    .await;
    assert!(polled.is_ok(), "timed out waiting for {what}");
}

/// Host creates a game and every guest joins it.
pub async fn lobby(host: &Client, guests: &[&Client], settings: GameSettings) -> GameId {
    let game_id = nocap_sync::services::game_service::create_game(&host.session, "Host", settings)
        .await
        .unwrap();
    for guest in guests {
        nocap_sync::services::game_service::join_game(&guest.session, &game_id, &guest.user_id)
            .await
            .unwrap();
    }
    game_id
}
