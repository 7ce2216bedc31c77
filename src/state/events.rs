//! Notifications a session pushes to the UI layer.

use std::sync::Arc;

use tokio::sync::broadcast;

use crate::{
    dao::models::GameEntity,
    services::{connection_supervisor::ConnectionStatus, results::RoundSummary},
    state::game::Question,
};

/// Typed notifications a UI layer renders from.
#[derive(Debug, Clone, PartialEq)]
pub enum SessionEvent {
    /// Fresh server snapshot of the joined game.
    GameUpdated(Arc<GameEntity>),
    /// The local user gained or lost the host role.
    RoleChanged {
        /// Role after the change.
        is_host: bool,
    },
    /// A new round is active locally. The question is withheld when it is age-restricted and
    /// not unlocked on this client.
    RoundStarted {
        /// Round number, starting at 1.
        round: u32,
        /// Question to show, if allowed.
        question: Option<Question>,
    },
    /// Answers of the active round changed.
    AnswersUpdated {
        /// Round the answers belong to.
        round: u32,
        /// Answers stored by players still in the game.
        answered: usize,
        /// Players currently in the game.
        total: usize,
    },
    /// Every player answered; results are final.
    RoundCompleted {
        /// Completed round.
        round: u32,
        /// Scores derived from the answers.
        summary: RoundSummary,
    },
    /// The countdown of a round ran out.
    TimerExpired {
        /// Round whose countdown ended.
        round: u32,
    },
    /// The game ended, either after the last round or by the host.
    GameFinished,
    /// The game node disappeared from the store.
    GameDeleted,
    /// Connectivity to the store changed.
    Connection(ConnectionStatus),
    /// A background listener hit an error it could not propagate.
    ListenerFailed {
        /// Store path the listener follows.
        path: String,
        /// Rendered error.
        message: String,
    },
}

/// Fan-out of [`SessionEvent`]s from one session to every UI observer.
pub struct EventHub {
    sender: broadcast::Sender<SessionEvent>,
}

impl EventHub {
    /// Hub keeping at most `capacity` undelivered events per observer. Observers that fall
    /// further behind skip the oldest ones.
    pub fn new(capacity: usize) -> Self {
        let (sender, _receiver) = broadcast::channel(capacity);
        Self { sender }
    }

    /// Start observing. Events published before this call are not replayed.
    pub fn subscribe(&self) -> broadcast::Receiver<SessionEvent> {
        self.sender.subscribe()
    }

    /// Publish `event` to the observers attached right now. With nobody listening the event
    /// is dropped; session logic never waits on the UI.
    pub fn broadcast(&self, event: SessionEvent) {
        let _ = self.sender.send(event);
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use tokio::sync::broadcast::error::{RecvError, TryRecvError};

    #[test]
    fn events_without_observers_are_dropped() {
        let hub = EventHub::new(4);
        hub.broadcast(SessionEvent::GameFinished);

        let mut rx = hub.subscribe();
        assert_eq!(rx.try_recv().unwrap_err(), TryRecvError::Empty);
        hub.broadcast(SessionEvent::GameDeleted);
        assert_eq!(rx.try_recv().unwrap(), SessionEvent::GameDeleted);
    }

    #[tokio::test]
    async fn slow_observers_skip_the_oldest_events() {
        let hub = EventHub::new(2);
        let mut rx = hub.subscribe();
        for round in 1..=3 {
            hub.broadcast(SessionEvent::TimerExpired { round });
        }

        assert_eq!(rx.recv().await.unwrap_err(), RecvError::Lagged(1));
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::TimerExpired { round: 2 });
        assert_eq!(rx.recv().await.unwrap(), SessionEvent::TimerExpired { round: 3 });
    }
}
