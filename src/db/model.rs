//! Row and view models returned by repositories.
//!
//! Keep these structs focused on the data returned by queries. Business logic
//! should live in higher layers.

use chrono::{DateTime, Utc};

use crate::model::Destination;

/// One pending digest item.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DigestQueueEntry {
    pub repo_full_name: String,
    pub added_at: DateTime<Utc>,
}

/// A repository under release tracking together with every destination
/// subscribed to it.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct TrackedRelease {
    pub repo_full_name: String,
    pub last_release_tag: Option<String>,
    pub subscriptions: Vec<Destination>,
}

