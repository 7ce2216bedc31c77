//! Round countdown measured against the server start time.

use std::{
    collections::BTreeMap,
    sync::{Arc, Mutex, MutexGuard, PoisonError},
    time::Duration,
};

use serde_json::{Value, json};
use tokio::{
    sync::watch,
    time::{MissedTickBehavior, interval},
};
use tracing::{debug, warn};

use crate::{
    clock::Clock,
    dao::{models::GameEntity, paths},
    error::CoreError,
    services::{role_guard, round_coordinator},
    state::{ListenerGuard, ListenerKind, SessionEvent, SharedSession, game::GameId},
};

#[derive(Debug, Default)]
struct Countdown {
    start_ms: Option<i64>,
    duration_ms: i64,
    frozen_ms: Option<i64>,
    expiry_taken: bool,
}

/// Local countdown of the active round.
///
/// `remaining = duration - (now - start)`, floored at zero and frozen while paused. Every
/// client computes the same value from the shared start time.
pub struct TimerController {
    clock: Arc<dyn Clock>,
    state: Mutex<Countdown>,
    remaining: watch::Sender<i64>,
}

impl TimerController {
    /// Idle countdown reading time from `clock`.
    pub fn new(clock: Arc<dyn Clock>) -> Self {
        let (remaining, _rx) = watch::channel(0);
        Self {
            clock,
            state: Mutex::new(Countdown::default()),
            remaining,
        }
    }

    fn lock(&self) -> MutexGuard<'_, Countdown> {
        self.state.lock().unwrap_or_else(PoisonError::into_inner)
    }

    /// Start counting down `duration` from `server_start_ms`.
    pub fn start(&self, server_start_ms: i64, duration: Duration) {
        {
            let mut state = self.lock();
            *state = Countdown {
                start_ms: Some(server_start_ms),
                duration_ms: duration.as_millis() as i64,
                frozen_ms: None,
                expiry_taken: false,
            };
        }
        self.publish();
    }

    /// Stop the countdown; `remaining_ms` drops to 0.
    pub fn stop(&self) {
        *self.lock() = Countdown::default();
        self.publish();
    }

    /// Whether a countdown was started and not stopped.
    pub fn is_running(&self) -> bool {
        self.lock().start_ms.is_some()
    }

    /// Whether the countdown is frozen by a host pause.
    pub fn is_paused(&self) -> bool {
        self.lock().frozen_ms.is_some()
    }

    /// Remaining milliseconds, 0 when no countdown runs.
    pub fn remaining_ms(&self) -> i64 {
        let state = self.lock();
        self.remaining_of(&state)
    }

    fn remaining_of(&self, state: &Countdown) -> i64 {
        match (state.start_ms, state.frozen_ms) {
            (None, _) => 0,
            (Some(_), Some(frozen)) => frozen,
            (Some(start), None) => {
                let elapsed = self.clock.now_ms() - start;
                (state.duration_ms - elapsed).max(0)
            }
        }
    }

    /// Freeze the countdown and return the frozen remaining time.
    pub fn pause(&self) -> Option<i64> {
        let remaining = {
            let mut state = self.lock();
            state.start_ms?;
            if state.frozen_ms.is_none() {
                state.frozen_ms = Some(self.remaining_of(&state));
            }
            state.frozen_ms
        };
        self.publish();
        remaining
    }

    /// Continue a paused countdown; returns the re-baselined start time.
    pub fn resume(&self) -> Option<i64> {
        let start = {
            let mut state = self.lock();
            let remaining = state.frozen_ms.take()?;
            let start = self.clock.now_ms() - (state.duration_ms - remaining);
            state.start_ms = Some(start);
            start
        };
        self.publish();
        Some(start)
    }

    /// Apply the pause state the host broadcast through the game node.
    pub fn sync_from_game(&self, game: &GameEntity) {
        let mut state = self.lock();
        if state.start_ms.is_none() {
            return;
        }
        if game.timer_paused {
            if state.frozen_ms.is_none() {
                let remaining = game
                    .timer_remaining
                    .unwrap_or_else(|| self.remaining_of(&state));
                state.frozen_ms = Some(remaining.max(0));
            }
        } else if let Some(start) = game.timer_start_time {
            state.frozen_ms = None;
            state.start_ms = Some(start);
        }
        drop(state);
        self.publish();
    }

    /// `true` exactly once per started countdown, when it reaches zero while running.
    pub fn take_expiry(&self) -> bool {
        let mut state = self.lock();
        if state.start_ms.is_none() || state.frozen_ms.is_some() || state.expiry_taken {
            return false;
        }
        if self.remaining_of(&state) > 0 {
            return false;
        }
        state.expiry_taken = true;
        true
    }

    /// Remaining time as published to renderers.
    pub fn watch(&self) -> watch::Receiver<i64> {
        self.remaining.subscribe()
    }

    /// Push the current remaining time to watchers when it changed.
    pub fn publish(&self) {
        let remaining = self.remaining_ms();
        self.remaining.send_if_modified(|current| {
            let changed = *current != remaining;
            *current = remaining;
            changed
        });
    }
}

/// Run the redraw loop of the local countdown and auto-submit when it expires.
pub fn spawn_countdown(session: &SharedSession, game_id: GameId, round: u32) {
    let weak = Arc::downgrade(session);
    let frame = session.config().frame_interval;

    let guard = ListenerGuard::spawn(format!("countdown/{game_id}/{round}"), async move {
        let mut ticker = interval(frame);
        ticker.set_missed_tick_behavior(MissedTickBehavior::Skip);
        loop {
            ticker.tick().await;
            let Some(session) = weak.upgrade() else {
                break;
            };
            let timer = session.timer();
            timer.publish();
            if !timer.take_expiry() {
                continue;
            }

            debug!(game_id = %game_id, round, "round countdown expired");
            session
                .events()
                .broadcast(SessionEvent::TimerExpired { round });
            match round_coordinator::auto_submit_timeout(&session, &game_id, round).await {
                Ok(_) => {}
                Err(err) => {
                    warn!(game_id = %game_id, round, error = %err, "timeout answer failed");
                    session.events().broadcast(SessionEvent::ListenerFailed {
                        path: paths::answers(&game_id, round),
                        message: err.to_string(),
                    });
                }
            }
            break;
        }
    });
    session.install_listener(ListenerKind::Countdown, guard);
}

/// Host-only: pause the countdown for every client. Returns the frozen remaining time.
pub async fn pause_round_timer(session: &SharedSession, game_id: &GameId) -> Result<i64, CoreError> {
    role_guard::require_host(session, game_id, "pause_timer").await?;
    let timer = session.timer();
    let remaining = timer
        .pause()
        .ok_or_else(|| CoreError::InvalidState("no countdown is running".into()))?;

    let updates = BTreeMap::from([
        (paths::game_field(game_id, "timerPaused"), Value::Bool(true)),
        (paths::game_field(game_id, "timerRemaining"), json!(remaining)),
    ]);
    if let Err(err) = session.update("pause_timer", updates).await {
        timer.resume();
        return Err(err);
    }
    Ok(remaining)
}

/// Host-only: resume the countdown for every client. Returns the new start time.
pub async fn resume_round_timer(session: &SharedSession, game_id: &GameId) -> Result<i64, CoreError> {
    role_guard::require_host(session, game_id, "resume_timer").await?;
    let timer = session.timer();
    let Some(start) = timer.resume() else {
        return Err(CoreError::InvalidState("countdown is not paused".into()));
    };

    let updates = BTreeMap::from([
        (paths::game_field(game_id, "timerPaused"), Value::Bool(false)),
        (paths::game_field(game_id, "timerRemaining"), Value::Null),
        (paths::game_field(game_id, "timerStartTime"), json!(start)),
    ]);
    if let Err(err) = session.update("resume_timer", updates).await {
        timer.pause();
        return Err(err);
    }
    Ok(start)
}
