//! Database module: row models and SQL repositories.
//!
//! This module is split into two submodules:
//! - `model`: typed rows and view models returned by repositories.
//! - `repo`: SQL-only functions that map rows into those types.
//!
//! External modules should import from `tg_starbot::db`; the repository API and
//! commonly used models are re-exported here.

pub mod model;
pub mod repo;

pub use repo::*;

pub use model::{DigestQueueEntry, TrackedRelease};
