pub mod events;
/// Game identifiers, settings and questions.
pub mod game;
pub mod state_machine;

use std::{
    collections::{BTreeMap, HashMap, VecDeque},
    future::Future,
    sync::Arc,
};

use dashmap::DashMap;
use serde::de::DeserializeOwned;
use serde_json::Value;
use tokio::{
    sync::{Mutex, RwLock, watch},
    task::JoinHandle,
    time::timeout,
};
use tracing::warn;

use crate::{
    auth::AuthProvider,
    clock::{Clock, SystemClock},
    config::AppConfig,
    dao::{
        local_storage::{LocalStorage, MemoryStorage},
        models::GameEntity,
        paths,
        realtime_store::{RealtimeStore, read_typed},
    },
    error::CoreError,
    questions::{AgeVerifier, DenyAgeVerifier, QuestionSource},
    services::{
        connection_supervisor::ConnectionSupervisor, results::RoundSummary, retry::with_retry,
        timer::TimerController,
    },
};

pub use self::events::{EventHub, SessionEvent};
pub use self::state_machine::{Snapshot, TransitionError};
use self::{
    game::{GameId, PendingAnswer, PlayerId, Question},
    state_machine::{GameEvent, GamePhase, GameStateMachine},
};

/// Handle every service function takes.
pub type SharedSession = Arc<Session>;
const EVENT_CAPACITY: usize = 256;

/// Progress of the local player's answer for one round.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum SubmissionState {
    /// The write is in progress; the slot is claimed.
    InFlight,
    /// The answer is stored.
    Stored,
}

type SubmissionKey = (GameId, u32, PlayerId);

/// Per-client view of the active round.
#[derive(Debug, Clone, Default)]
pub struct RoundState {
    /// Game this client takes part in.
    pub game_id: Option<GameId>,
    /// Round the client currently shows.
    pub current_round: u32,
    /// Question of the current round, hidden when it is age-restricted and not unlocked.
    pub question: Option<Question>,
    /// Answer entered locally that is not confirmed by the store yet.
    pub pending_answer: Option<PendingAnswer>,
    /// Last round whose completion was handled.
    pub completed_round: Option<u32>,
    /// Results of the last completed round.
    pub last_summary: Option<RoundSummary>,
    pub(crate) deck: VecDeque<Question>,
    submissions: HashMap<SubmissionKey, SubmissionState>,
}

impl RoundState {
    /// Fresh state for a client that just joined `game_id`.
    pub(crate) fn for_game(game_id: GameId) -> Self {
        Self {
            game_id: Some(game_id),
            ..Self::default()
        }
    }

    /// Local submission record of `player_id` for `round`, if any.
    pub fn submission(&self, game_id: &GameId, round: u32, player_id: &str) -> Option<SubmissionState> {
        self.submissions
            .get(&(game_id.clone(), round, player_id.to_string()))
            .copied()
    }

    /// Claim the submission slot; `false` when it is already taken.
    pub(crate) fn claim_submission(&mut self, game_id: &GameId, round: u32, player_id: &str) -> bool {
        let key = (game_id.clone(), round, player_id.to_string());
        if self.submissions.contains_key(&key) {
            return false;
        }
        self.submissions.insert(key, SubmissionState::InFlight);
        true
    }

    pub(crate) fn mark_stored(&mut self, game_id: &GameId, round: u32, player_id: &str) {
        self.submissions.insert(
            (game_id.clone(), round, player_id.to_string()),
            SubmissionState::Stored,
        );
    }

    pub(crate) fn release_submission(&mut self, game_id: &GameId, round: u32, player_id: &str) {
        let key = (game_id.clone(), round, player_id.to_string());
        if self.submissions.get(&key) == Some(&SubmissionState::InFlight) {
            self.submissions.remove(&key);
        }
    }

    /// Switch to `round`, resetting the per-round flags. Returns `false` if already there.
    pub(crate) fn enter(&mut self, game_id: &GameId, round: u32, question: Option<Question>) -> bool {
        if self.game_id.as_ref() == Some(game_id) && self.current_round == round {
            return false;
        }
        self.game_id = Some(game_id.clone());
        self.current_round = round;
        self.question = question;
        self.pending_answer = None;
        true
    }
}

/// Slots of background tasks owned by a session.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Hash)]
pub enum ListenerKind {
    /// Game node listener installed by joining.
    Game,
    /// Answers listener of the active round.
    Round,
    /// Countdown redraw loop.
    Countdown,
    /// Connectivity watcher.
    Connectivity,
}

/// Background task aborted when the guard is dropped.
pub struct ListenerGuard {
    path: String,
    handle: JoinHandle<()>,
}

impl ListenerGuard {
    /// Run `task` on the Tokio runtime, labelled with the store `path` it follows.
    pub fn spawn<F>(path: impl Into<String>, task: F) -> Self
    where
        F: Future<Output = ()> + Send + 'static,
    {
        Self {
            path: path.into(),
            handle: tokio::spawn(task),
        }
    }

    /// Store path the task follows.
    pub fn path(&self) -> &str {
        &self.path
    }

    /// Whether the task ended on its own.
    pub fn is_finished(&self) -> bool {
        self.handle.is_finished()
    }
}

impl Drop for ListenerGuard {
    fn drop(&mut self) {
        self.handle.abort();
    }
}

/// Services and state of one client, shared by `Arc` with every service function.
pub struct Session {
    store: Arc<dyn RealtimeStore>,
    auth: Arc<dyn AuthProvider>,
    questions: Arc<dyn QuestionSource>,
    age_verifier: Arc<dyn AgeVerifier>,
    local_storage: Arc<dyn LocalStorage>,
    clock: Arc<dyn Clock>,
    config: AppConfig,
    round: RwLock<RoundState>,
    machine: RwLock<GameStateMachine>,
    transition_gate: Mutex<()>,
    timer: TimerController,
    connection: ConnectionSupervisor,
    game: watch::Sender<Option<Arc<GameEntity>>>,
    listeners: DashMap<ListenerKind, ListenerGuard>,
    events: EventHub,
}

/// Collects the collaborators of a [`Session`]; optional ones fall back to defaults.
pub struct SessionBuilder {
    store: Arc<dyn RealtimeStore>,
    auth: Arc<dyn AuthProvider>,
    questions: Arc<dyn QuestionSource>,
    age_verifier: Option<Arc<dyn AgeVerifier>>,
    local_storage: Option<Arc<dyn LocalStorage>>,
    clock: Option<Arc<dyn Clock>>,
    config: Option<AppConfig>,
}

impl SessionBuilder {
    /// Use `verifier` for age-restricted content.
    pub fn age_verifier(mut self, verifier: Arc<dyn AgeVerifier>) -> Self {
        self.age_verifier = Some(verifier);
        self
    }

    /// Persist offline snapshots to `storage`.
    pub fn local_storage(mut self, storage: Arc<dyn LocalStorage>) -> Self {
        self.local_storage = Some(storage);
        self
    }

    /// Read local time from `clock`.
    pub fn clock(mut self, clock: Arc<dyn Clock>) -> Self {
        self.clock = Some(clock);
        self
    }

    /// Override the default timeouts and retry policy.
    pub fn config(mut self, config: AppConfig) -> Self {
        self.config = Some(config);
        self
    }

    /// Build the session. Age verification defaults to deny, storage to process memory.
    pub fn build(self) -> SharedSession {
        let clock = self.clock.unwrap_or_else(|| Arc::new(SystemClock));
        let (game, _rx) = watch::channel(None);
        Arc::new(Session {
            store: self.store,
            auth: self.auth,
            questions: self.questions,
            age_verifier: self
                .age_verifier
                .unwrap_or_else(|| Arc::new(DenyAgeVerifier)),
            local_storage: self
                .local_storage
                .unwrap_or_else(|| Arc::new(MemoryStorage::new())),
            timer: TimerController::new(clock.clone()),
            clock,
            config: self.config.unwrap_or_default(),
            round: RwLock::new(RoundState::default()),
            machine: RwLock::new(GameStateMachine::new()),
            transition_gate: Mutex::new(()),
            connection: ConnectionSupervisor::new(),
            game,
            listeners: DashMap::new(),
            events: EventHub::new(EVENT_CAPACITY),
        })
    }
}

impl Session {
    /// Start building a session around its three mandatory collaborators.
    pub fn builder(
        store: Arc<dyn RealtimeStore>,
        auth: Arc<dyn AuthProvider>,
        questions: Arc<dyn QuestionSource>,
    ) -> SessionBuilder {
        SessionBuilder {
            store,
            auth,
            questions,
            age_verifier: None,
            local_storage: None,
            clock: None,
            config: None,
        }
    }

    /// Realtime store client.
    pub fn store(&self) -> &Arc<dyn RealtimeStore> {
        &self.store
    }

    /// Where round questions come from.
    pub fn questions(&self) -> &Arc<dyn QuestionSource> {
        &self.questions
    }

    /// Gate in front of age-restricted questions.
    pub fn age_verifier(&self) -> &Arc<dyn AgeVerifier> {
        &self.age_verifier
    }

    /// Device storage holding the offline snapshot.
    pub fn local_storage(&self) -> &Arc<dyn LocalStorage> {
        &self.local_storage
    }

    /// Local clock.
    pub fn clock(&self) -> &Arc<dyn Clock> {
        &self.clock
    }

    /// Timeouts, retry policy and scoring settings.
    pub fn config(&self) -> &AppConfig {
        &self.config
    }

    /// Countdown of the active round.
    pub fn timer(&self) -> &TimerController {
        &self.timer
    }

    /// Connectivity status of this client.
    pub fn connection(&self) -> &ConnectionSupervisor {
        &self.connection
    }

    /// Hub to subscribe to for UI notifications.
    pub fn events(&self) -> &EventHub {
        &self.events
    }

    /// Local round state of this client.
    pub fn round(&self) -> &RwLock<RoundState> {
        &self.round
    }

    /// Id of the signed-in user; operations without one are rejected.
    pub fn user_id(&self) -> Result<PlayerId, CoreError> {
        self.auth
            .current_user_id()
            .ok_or_else(|| CoreError::permission("unauthenticated"))
    }

    /// Last game snapshot delivered by the store.
    pub fn game_snapshot(&self) -> Option<Arc<GameEntity>> {
        self.game.borrow().clone()
    }

    /// Observe game snapshots.
    pub fn game_watcher(&self) -> watch::Receiver<Option<Arc<GameEntity>>> {
        self.game.subscribe()
    }

    /// Replace the cached game snapshot, returning the previous one.
    pub(crate) fn set_game(&self, game: Option<Arc<GameEntity>>) -> Option<Arc<GameEntity>> {
        self.game.send_replace(game)
    }

    /// Whether the cached snapshot names the local user as host.
    pub fn is_host(&self) -> bool {
        match (self.game_snapshot(), self.auth.current_user_id()) {
            (Some(game), Some(user)) => game.host_id == user,
            _ => false,
        }
    }

    /// Snapshot the current local phase.
    pub async fn phase(&self) -> GamePhase {
        self.machine.read().await.phase()
    }

    /// Phase together with its version and pending transition.
    pub async fn snapshot(&self) -> Snapshot {
        self.machine.read().await.snapshot()
    }

    /// Apply a transition that needs no store work.
    pub(crate) async fn fire(&self, event: GameEvent) -> Result<GamePhase, TransitionError> {
        self.machine.write().await.fire(event)
    }

    /// Align the local phase with server data; `true` when it changed.
    pub(crate) async fn sync_phase(&self, phase: GamePhase) -> bool {
        self.machine.write().await.sync_to(phase)
    }

    /// Move the local phase with `event` once `work` has succeeded.
    ///
    /// The transition is reserved before `work` runs, so a second local action cannot start
    /// meanwhile. A failed or timed out `work` leaves the phase where it was.
    pub async fn run_transition<F, Fut, T>(
        &self,
        event: GameEvent,
        work: F,
    ) -> Result<(T, GamePhase), CoreError>
    where
        F: FnOnce() -> Fut,
        Fut: Future<Output = Result<T, CoreError>>,
    {
        let _gate = self.transition_gate.lock().await;
        let ticket = self.machine.write().await.reserve(event)?.ticket;

        let result = timeout(self.config.transition_timeout, work())
            .await
            .unwrap_or(Err(CoreError::Timeout));

        let mut machine = self.machine.write().await;
        match result {
            Ok(value) => Ok((value, machine.commit(ticket)?)),
            Err(err) => {
                if let Err(cancel_err) = machine.cancel(ticket) {
                    warn!(?event, ticket, error = %cancel_err, "could not release phase transition");
                }
                Err(err)
            }
        }
    }

    /// Run a store operation under the configured timeout and retry policy.
    pub async fn retrying<F, Fut, T>(&self, operation: &str, op: F) -> Result<T, CoreError>
    where
        F: FnMut() -> Fut,
        Fut: Future<Output = crate::dao::storage::StoreResult<T>>,
    {
        with_retry(&self.config.retry, self.config.store_timeout, operation, op).await
    }

    /// Read and decode `path`.
    pub async fn fetch<T: DeserializeOwned>(&self, path: &str) -> Result<Option<T>, CoreError> {
        self.retrying("read", || read_typed(self.store.as_ref(), path))
            .await
    }

    /// Read the game node, failing with `NotFound` when it does not exist.
    pub async fn fetch_game(&self, game_id: &GameId) -> Result<GameEntity, CoreError> {
        self.fetch(&paths::game(game_id))
            .await?
            .ok_or_else(|| CoreError::NotFound(format!("game `{game_id}`")))
    }

    /// Replace the node at `path`, retried like every store call.
    pub async fn write(&self, operation: &str, path: &str, value: Value) -> Result<(), CoreError> {
        self.retrying(operation, || self.store.write(path, value.clone()))
            .await
    }

    /// Apply several paths atomically.
    pub async fn update(
        &self,
        operation: &str,
        updates: BTreeMap<String, Value>,
    ) -> Result<(), CoreError> {
        self.retrying(operation, || self.store.update(updates.clone()))
            .await
    }

    /// Install a background task, replacing (and aborting) the previous one of that kind.
    pub fn install_listener(&self, kind: ListenerKind, guard: ListenerGuard) {
        let previous = self.listeners.insert(kind, guard);
        drop(previous);
    }

    /// Abort the background task of that kind, if any.
    pub fn remove_listener(&self, kind: ListenerKind) {
        let removed = self.listeners.remove(&kind);
        drop(removed);
    }

    /// Whether a background task of that kind is installed and still running.
    pub fn has_listener(&self, kind: ListenerKind) -> bool {
        self.listeners
            .get(&kind)
            .is_some_and(|guard| !guard.is_finished())
    }

    /// Drop every game-scoped listener and the local round state.
    pub async fn reset_local(&self) {
        for kind in [ListenerKind::Game, ListenerKind::Round, ListenerKind::Countdown] {
            self.remove_listener(kind);
        }
        self.timer.stop();
        self.set_game(None);
        *self.round.write().await = RoundState::default();
        *self.machine.write().await = GameStateMachine::new();
    }
}
