//! Local phase of one client, moved by its own actions or aligned with server data.

use std::time::Instant;

use serde::{Deserialize, Serialize};
use thiserror::Error;

/// High-level phases of the local client.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Default, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum GamePhase {
    /// Waiting in the lobby for the host to start.
    #[default]
    Lobby,
    /// A round is in progress.
    Playing(RoundPhase),
    /// The game is over.
    Finished,
}

/// Fine-grained phase while a round is in progress.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize, Deserialize)]
#[serde(rename_all = "snake_case")]
pub enum RoundPhase {
    /// The question is shown and the local player has not answered yet.
    Answering,
    /// The local answer is stored; waiting for the other players.
    Waiting,
    /// Every player answered and the round results are shown.
    Results,
}

/// Local actions that move the phase.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum GameEvent {
    /// Host starts the first round from the lobby.
    StartGame,
    /// The local answer has been stored.
    AnswerSubmitted,
    /// Every player of the round answered.
    AllAnswered,
    /// Move on to the next round after the results.
    NextRound,
    /// Game is over.
    EndGame,
}

/// Ticket handed out by [`GameStateMachine::reserve`].
pub type Ticket = u64;

/// Why the local phase could not move.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Error)]
pub enum TransitionError {
    /// A transition is already reserved.
    #[error("another phase transition is in progress")]
    Busy,
    /// `event` has no transition out of `from`.
    #[error("{event:?} is not allowed while in {from:?}")]
    NotAllowed {
        /// Phase at the time of the request.
        from: GamePhase,
        /// Rejected action.
        event: GameEvent,
    },
    /// Commit or cancel without a reservation.
    #[error("no phase transition is reserved")]
    NothingReserved,
    /// The ticket belongs to another reservation.
    #[error("ticket {got} does not match the reserved transition {reserved}")]
    WrongTicket {
        /// Ticket of the held reservation.
        reserved: Ticket,
        /// Ticket that was presented.
        got: Ticket,
    },
    /// The phase was changed underneath the reservation.
    #[error("phase moved from {expected:?} to {actual:?} during the transition")]
    PhaseMoved {
        /// Phase the reservation was taken in.
        expected: GamePhase,
        /// Phase found at commit time.
        actual: GamePhase,
    },
}

/// Transition validated by [`GameStateMachine::reserve`] and waiting for its store work.
#[derive(Debug, Clone)]
pub struct Reservation {
    /// Handle to pass back to `commit` or `cancel`.
    pub ticket: Ticket,
    /// Phase the transition leaves.
    pub from: GamePhase,
    /// Phase the transition enters.
    pub to: GamePhase,
    /// Action that asked for the transition.
    pub event: GameEvent,
    /// When the reservation was taken.
    pub since: Instant,
}

/// Point-in-time view of the machine.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Snapshot {
    /// Current phase.
    pub phase: GamePhase,
    /// Bumped on every phase change, local or synced.
    pub version: usize,
    /// Target phase of the reserved transition, if any.
    pub pending: Option<GamePhase>,
}

/// Local phase tracking for one client.
///
/// Local actions go through `reserve`/`commit` so the phase only moves once the matching store
/// write succeeded. Changes observed on the server are applied with `sync_to`.
#[derive(Debug, Clone, Default)]
pub struct GameStateMachine {
    phase: GamePhase,
    version: usize,
    next_ticket: Ticket,
    reserved: Option<Reservation>,
}

impl GameStateMachine {
    /// Machine in the lobby.
    pub fn new() -> Self {
        Self::default()
    }

    /// Current phase.
    pub fn phase(&self) -> GamePhase {
        self.phase
    }

    /// Phase, version and pending target in one copy.
    pub fn snapshot(&self) -> Snapshot {
        Snapshot {
            phase: self.phase,
            version: self.version,
            pending: self.reserved.as_ref().map(|reservation| reservation.to),
        }
    }

    /// Check that `event` is allowed now and hold the transition until it is committed or
    /// cancelled. Only one transition can be reserved at a time.
    pub fn reserve(&mut self, event: GameEvent) -> Result<Reservation, TransitionError> {
        if self.reserved.is_some() {
            return Err(TransitionError::Busy);
        }
        let to = next_phase(self.phase, event)?;

        self.next_ticket += 1;
        let reservation = Reservation {
            ticket: self.next_ticket,
            from: self.phase,
            to,
            event,
            since: Instant::now(),
        };
        self.reserved = Some(reservation.clone());
        Ok(reservation)
    }

    /// Move to the reserved phase. A wrong ticket leaves the reservation in place.
    pub fn commit(&mut self, ticket: Ticket) -> Result<GamePhase, TransitionError> {
        let reservation = self.take_reserved(ticket)?;
        if self.phase != reservation.from {
            return Err(TransitionError::PhaseMoved {
                expected: reservation.from,
                actual: self.phase,
            });
        }
        self.set_phase(reservation.to);
        Ok(self.phase)
    }

    /// Release the reservation without moving.
    pub fn cancel(&mut self, ticket: Ticket) -> Result<(), TransitionError> {
        self.take_reserved(ticket).map(drop)
    }

    /// Reserve and commit in one step, for transitions that need no store work.
    pub fn fire(&mut self, event: GameEvent) -> Result<GamePhase, TransitionError> {
        if self.reserved.is_some() {
            return Err(TransitionError::Busy);
        }
        let to = next_phase(self.phase, event)?;
        self.set_phase(to);
        Ok(to)
    }

    /// Force the phase to match what the server (or a restored snapshot) says.
    ///
    /// Returns `false` without changing anything while a transition is reserved, or when the
    /// phase already matches.
    pub fn sync_to(&mut self, phase: GamePhase) -> bool {
        if self.reserved.is_some() || self.phase == phase {
            return false;
        }
        self.set_phase(phase);
        true
    }

    fn take_reserved(&mut self, ticket: Ticket) -> Result<Reservation, TransitionError> {
        match self.reserved.take() {
            None => Err(TransitionError::NothingReserved),
            Some(reservation) if reservation.ticket != ticket => {
                let reserved = reservation.ticket;
                self.reserved = Some(reservation);
                Err(TransitionError::WrongTicket {
                    reserved,
                    got: ticket,
                })
            }
            Some(reservation) => Ok(reservation),
        }
    }

    fn set_phase(&mut self, phase: GamePhase) {
        self.phase = phase;
        self.version += 1;
    }
}

fn next_phase(from: GamePhase, event: GameEvent) -> Result<GamePhase, TransitionError> {
    use GamePhase::{Finished, Lobby, Playing};
    use RoundPhase::{Answering, Results, Waiting};

    Ok(match (from, event) {
        (Lobby, GameEvent::StartGame) => Playing(Answering),
        (Playing(Answering), GameEvent::AnswerSubmitted) => Playing(Waiting),
        // Results may arrive before the local answer was confirmed.
        (Playing(Answering | Waiting), GameEvent::AllAnswered) => Playing(Results),
        (Playing(Results), GameEvent::NextRound) => Playing(Answering),
        (Lobby | Playing(_), GameEvent::EndGame) => Finished,
        (from, event) => return Err(TransitionError::NotAllowed { from, event }),
    })
}
