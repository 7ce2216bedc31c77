//! Connectivity tracking with an offline snapshot replayed on reconnect.

use std::sync::{Arc, Mutex, PoisonError};

use serde::{Deserialize, Serialize};
use tokio::sync::watch;
use tokio_stream::{StreamExt, wrappers::WatchStream};
use tracing::{info, warn};

use crate::{
    clock::format_ms,
    error::CoreError,
    services::round_coordinator,
    state::{
        ListenerGuard, ListenerKind, SessionEvent, SharedSession,
        game::{GameId, PendingAnswer, PlayerId, Question},
        state_machine::GamePhase,
    },
};

/// Local storage key of the offline snapshot.
pub const SNAPSHOT_KEY: &str = "nocap.offline_snapshot";

/// Connectivity as seen by the rest of the client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "lowercase")]
pub enum ConnectionStatus {
    /// The store is reachable.
    Connected,
    /// Writes fail fast until the connection returns.
    Disconnected,
    /// Back online, replaying the offline snapshot.
    Recovering,
}

/// State persisted when the connection drops in the middle of a game.
#[derive(Debug, Clone, PartialEq, Serialize, Deserialize)]
#[serde(rename_all = "camelCase")]
pub struct OfflineSnapshot {
    /// Game the client was in.
    pub game_id: GameId,
    /// Local user at the time of saving.
    pub player_id: PlayerId,
    /// Round that was active locally.
    pub current_round: u32,
    /// Local phase, restored on reconnect.
    pub phase: GamePhase,
    /// Answer picked but not confirmed by the store.
    pub pending_answer: Option<PendingAnswer>,
    /// Question shown when the connection dropped.
    pub current_question: Option<Question>,
    /// Local clock (ms) at the time of saving.
    pub saved_at: i64,
}

/// What happened when the connection came back.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RecoveryOutcome {
    /// Nothing was saved.
    NoSnapshot,
    /// The snapshot was older than the validity window and was discarded.
    Stale {
        /// How old the snapshot was.
        age_ms: i64,
    },
    /// Local state was restored and the game re-joined.
    Restored {
        /// Local phase after the restore.
        phase: GamePhase,
        /// Whether a pending answer was submitted again.
        resubmitted: bool,
    },
}

type StatusCallback = Box<dyn Fn(ConnectionStatus) + Send + Sync>;

/// Connection status holder of a session.
pub struct ConnectionSupervisor {
    status: watch::Sender<ConnectionStatus>,
    callbacks: Mutex<Vec<StatusCallback>>,
}

impl Default for ConnectionSupervisor {
    fn default() -> Self {
        Self::new()
    }
}

impl ConnectionSupervisor {
    /// Supervisor starting out connected.
    pub fn new() -> Self {
        let (status, _rx) = watch::channel(ConnectionStatus::Connected);
        Self {
            status,
            callbacks: Mutex::new(Vec::new()),
        }
    }

    /// Current status.
    pub fn status(&self) -> ConnectionStatus {
        *self.status.borrow()
    }

    /// Observe status changes.
    pub fn watch(&self) -> watch::Receiver<ConnectionStatus> {
        self.status.subscribe()
    }

    /// Register a callback invoked, in registration order, on every status change.
    pub fn on_change(&self, callback: impl Fn(ConnectionStatus) + Send + Sync + 'static) {
        self.callbacks
            .lock()
            .unwrap_or_else(PoisonError::into_inner)
            .push(Box::new(callback));
    }

    fn set(&self, status: ConnectionStatus) -> bool {
        let previous = self.status.send_replace(status);
        if previous == status {
            return false;
        }
        let callbacks = self.callbacks.lock().unwrap_or_else(PoisonError::into_inner);
        for callback in callbacks.iter() {
            callback(status);
        }
        true
    }
}

fn set_status(session: &SharedSession, status: ConnectionStatus) {
    if session.connection().set(status) {
        session
            .events()
            .broadcast(SessionEvent::Connection(status));
    }
}

/// Watch the store's connectivity signal for the lifetime of the session.
///
/// The first signal is treated like a reconnect so a snapshot left behind by an earlier
/// process is recovered too.
pub fn spawn(session: &SharedSession) {
    let weak = Arc::downgrade(session);
    let mut signal = WatchStream::new(session.store().connectivity());

    let guard = ListenerGuard::spawn("connectivity", async move {
        let mut last = None;
        while let Some(online) = signal.next().await {
            if last == Some(online) {
                continue;
            }
            last = Some(online);
            let Some(session) = weak.upgrade() else {
                break;
            };

            if online {
                match handle_reconnect(&session).await {
                    Ok(outcome) => info!(?outcome, "connection established"),
                    Err(err) => warn!(error = %err, "recovery after reconnect failed"),
                }
            } else if let Err(err) = handle_disconnect(&session).await {
                warn!(error = %err, "failed to persist offline snapshot");
            }
        }
    });
    session.install_listener(ListenerKind::Connectivity, guard);
}

/// Mark the session offline and persist the snapshot when a game is running.
/// Returns whether a snapshot was written.
pub async fn handle_disconnect(session: &SharedSession) -> Result<bool, CoreError> {
    set_status(session, ConnectionStatus::Disconnected);
    let Some(snapshot) = capture_snapshot(session).await else {
        return Ok(false);
    };
    save_snapshot(session, &snapshot)?;
    info!(
        game_id = %snapshot.game_id,
        round = snapshot.current_round,
        pending = snapshot.pending_answer.is_some(),
        "saved offline snapshot"
    );
    Ok(true)
}

/// Restore the offline snapshot if it is still fresh, re-join and resubmit a pending answer.
pub async fn handle_reconnect(session: &SharedSession) -> Result<RecoveryOutcome, CoreError> {
    let Some(snapshot) = load_snapshot(session)? else {
        set_status(session, ConnectionStatus::Connected);
        return Ok(RecoveryOutcome::NoSnapshot);
    };

    let age_ms = session.clock().now_ms() - snapshot.saved_at;
    let validity_ms = session.config().snapshot_validity.as_millis() as i64;
    if age_ms > validity_ms {
        warn!(
            game_id = %snapshot.game_id,
            saved_at = %format_ms(snapshot.saved_at),
            age_ms,
            "discarding stale offline snapshot"
        );
        clear_snapshot(session)?;
        set_status(session, ConnectionStatus::Connected);
        return Ok(RecoveryOutcome::Stale { age_ms });
    }

    set_status(session, ConnectionStatus::Recovering);
    match recover(session, &snapshot).await {
        Ok(resubmitted) => {
            clear_snapshot(session)?;
            set_status(session, ConnectionStatus::Connected);
            let phase = session.phase().await;
            info!(game_id = %snapshot.game_id, ?phase, resubmitted, "recovered offline state");
            Ok(RecoveryOutcome::Restored { phase, resubmitted })
        }
        Err(err) => {
            set_status(session, ConnectionStatus::Connected);
            Err(err)
        }
    }
}

async fn recover(session: &SharedSession, snapshot: &OfflineSnapshot) -> Result<bool, CoreError> {
    session.sync_phase(snapshot.phase).await;
    let game = round_coordinator::join(session, &snapshot.game_id).await?;
    let pending = {
        let mut state = session.round().write().await;
        if state.current_round != snapshot.current_round {
            None
        } else {
            if state.pending_answer.is_none() {
                state.pending_answer = snapshot.pending_answer;
            }
            state.pending_answer
        }
    };

    let Some(pending) = pending else {
        return Ok(false);
    };
    if game.current_round != snapshot.current_round {
        info!(
            game_id = %snapshot.game_id,
            round = snapshot.current_round,
            "round moved on while offline; dropping pending answer"
        );
        return Ok(false);
    }

    match round_coordinator::submit_answer(
        session,
        &snapshot.game_id,
        snapshot.current_round,
        &snapshot.player_id,
        pending.value,
        pending.estimation,
    )
    .await
    {
        Ok(()) => Ok(true),
        Err(err) if err.is_already_submitted() => Ok(true),
        Err(err) => Err(err),
    }
}

async fn capture_snapshot(session: &SharedSession) -> Option<OfflineSnapshot> {
    let player_id = session.user_id().ok()?;
    let phase = session.phase().await;
    let state = session.round().read().await;
    let game_id = state.game_id.clone()?;
    Some(OfflineSnapshot {
        game_id,
        player_id,
        current_round: state.current_round,
        phase,
        pending_answer: state.pending_answer,
        current_question: state.question.clone(),
        saved_at: session.clock().now_ms(),
    })
}

/// Persist `snapshot` to local storage, replacing any earlier one.
pub fn save_snapshot(session: &SharedSession, snapshot: &OfflineSnapshot) -> Result<(), CoreError> {
    let encoded = serde_json::to_string(snapshot)
        .map_err(|err| CoreError::InvalidState(format!("unserializable snapshot: {err}")))?;
    session.local_storage().set(SNAPSHOT_KEY, &encoded)?;
    Ok(())
}

/// Read the saved snapshot; an unreadable one is discarded.
pub fn load_snapshot(session: &SharedSession) -> Result<Option<OfflineSnapshot>, CoreError> {
    let Some(raw) = session.local_storage().get(SNAPSHOT_KEY)? else {
        return Ok(None);
    };
    match serde_json::from_str(&raw) {
        Ok(snapshot) => Ok(Some(snapshot)),
        Err(err) => {
            warn!(error = %err, "discarding unreadable offline snapshot");
            clear_snapshot(session)?;
            Ok(None)
        }
    }
}

/// Forget the saved snapshot.
pub fn clear_snapshot(session: &SharedSession) -> Result<(), CoreError> {
    session.local_storage().remove(SNAPSHOT_KEY)?;
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::state::state_machine::RoundPhase;
    use std::sync::atomic::{AtomicUsize, Ordering};

    #[test]
    fn callbacks_run_in_order_on_every_change() {
        let supervisor = ConnectionSupervisor::new();
        let seen = Arc::new(Mutex::new(Vec::new()));
        for tag in ["first", "second"] {
            let seen = seen.clone();
            supervisor.on_change(move |status| seen.lock().unwrap().push((tag, status)));
        }

        assert!(supervisor.set(ConnectionStatus::Disconnected));
        assert!(!supervisor.set(ConnectionStatus::Disconnected));
        assert!(supervisor.set(ConnectionStatus::Recovering));

        assert_eq!(
            *seen.lock().unwrap(),
            [
                ("first", ConnectionStatus::Disconnected),
                ("second", ConnectionStatus::Disconnected),
                ("first", ConnectionStatus::Recovering),
                ("second", ConnectionStatus::Recovering),
            ]
        );
    }

    #[test]
    fn duplicate_callbacks_are_kept() {
        let supervisor = ConnectionSupervisor::new();
        let calls = Arc::new(AtomicUsize::new(0));
        for _ in 0..2 {
            let calls = calls.clone();
            supervisor.on_change(move |_| {
                calls.fetch_add(1, Ordering::SeqCst);
            });
        }
        supervisor.set(ConnectionStatus::Disconnected);
        assert_eq!(calls.load(Ordering::SeqCst), 2);
        assert_eq!(*supervisor.watch().borrow(), ConnectionStatus::Disconnected);
    }

    #[test]
    fn snapshot_serializes_with_camel_case_fields() {
        let snapshot = OfflineSnapshot {
            game_id: "ABC123".parse().unwrap(),
            player_id: "U1".into(),
            current_round: 2,
            phase: GamePhase::Playing(RoundPhase::Answering),
            pending_answer: Some(PendingAnswer {
                value: true,
                estimation: 1,
            }),
            current_question: None,
            saved_at: 42,
        };
        let value = serde_json::to_value(&snapshot).unwrap();
        assert_eq!(value["gameId"], "ABC123");
        assert_eq!(value["phase"], serde_json::json!({ "playing": "answering" }));
        assert_eq!(value["pendingAnswer"]["estimation"], 1);

        let back: OfflineSnapshot = serde_json::from_value(value).unwrap();
        assert_eq!(back, snapshot);
    }
}
