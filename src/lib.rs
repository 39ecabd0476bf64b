//! Library crate for match-ledger: match result submission, timeout
//! orchestration and monthly ratings.

pub mod clock;
pub mod config;
/// Persistence traits, models and the in-memory store.
pub mod dao;
/// Errors surfaced by service operations.
pub mod error;
pub mod messaging;
pub mod rating;
/// Business services and timer plumbing.
pub mod services;
/// Shared application state and match transitions.
pub mod state;

#[cfg(test)]
mod test_support;
