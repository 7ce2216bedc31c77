/// Connectivity tracking and offline snapshot recovery.
pub mod connection_supervisor;
/// Lobby operations: create, join, leave, host hand-over and cleanup.
pub mod game_service;
/// Round scoring.
pub mod results;
/// Timeout and backoff around store operations.
pub mod retry;
/// Host/guest role derivation and gating.
pub mod role_guard;
/// Round lifecycle and answer collection.
pub mod round_coordinator;
/// Server-epoch countdown with host pause/resume.
pub mod timer;
