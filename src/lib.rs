//! Round synchronization core of the No-Cap party game, exposing modules for the simulation
//! binary and integration tests.

pub mod auth;
pub mod clock;
pub mod config;
/// Store access: the realtime tree, node models and local storage.
pub mod dao;
/// Error taxonomy of the public operations.
pub mod error;
pub mod questions;
/// Game, round, timer and connectivity operations.
pub mod services;
/// Per-client session state shared by the services.
pub mod state;
