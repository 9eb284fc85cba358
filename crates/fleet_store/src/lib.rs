//! SQLite persistence for the fleet service.
//!
//! [`SqliteStore`] implements every repository trait from `fleet_core` plus
//! the vault's [`fleet_core::SecretBackend`], so one database file holds the
//! whole service state.

pub mod sqlite;

pub use sqlite::SqliteStore;

#[cfg(test)]
mod tests;
