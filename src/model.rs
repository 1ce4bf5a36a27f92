use serde::{Deserialize, Serialize};
use std::fmt;
use std::str::FromStr;
use std::time::Duration;

/// Smallest monitor interval accepted, in seconds.
pub const MIN_MONITOR_INTERVAL_SECS: u64 = 60;

/// How newly starred repositories reach the destinations.
#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum DeliveryMode {
    /// Send as soon as the star is detected. Stored as `off` (digest off).
    #[default]
    Instant,
    Daily,
    Weekly,
}

impl DeliveryMode {
    pub fn as_str(&self) -> &'static str {
        match self {
            DeliveryMode::Instant => "off",
            DeliveryMode::Daily => "daily",
            DeliveryMode::Weekly => "weekly",
        }
    }

    pub fn parse_mode(s: &str) -> Option<Self> {
        match s.trim().to_ascii_lowercase().as_str() {
            "off" | "instant" => Some(DeliveryMode::Instant),
            "daily" => Some(DeliveryMode::Daily),
            "weekly" => Some(DeliveryMode::Weekly),
            _ => None,
        }
    }

    /// The digest cadence this mode batches for, if any.
    pub fn cadence(&self) -> Option<Cadence> {
        match self {
            DeliveryMode::Instant => None,
            DeliveryMode::Daily => Some(Cadence::Daily),
            DeliveryMode::Weekly => Some(Cadence::Weekly),
        }
    }
}

impl fmt::Display for DeliveryMode {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.write_str(self.as_str())
    }
}

#[derive(Debug, Clone, Copy, Default, Serialize, Deserialize, PartialEq, Eq)]
pub enum MonitoringState {
    #[default]
    Active,
    Paused,
}

impl MonitoringState {
    pub fn is_paused(&self) -> bool {
        matches!(self, MonitoringState::Paused)
    }
}

/// Digest trigger cadence.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Cadence {
    Daily,
    Weekly,
}

impl Cadence {
    pub fn as_str(&self) -> &'static str {
        match self {
            Cadence::Daily => "daily",
            Cadence::Weekly => "weekly",
        }
    }
}

/// A chat to deliver to, optionally narrowed to a forum topic.
#[derive(Debug, Clone, Copy, Serialize, Deserialize, PartialEq, Eq, Hash)]
pub struct Destination {
    pub chat_id: i64,
    pub thread_id: Option<i32>,
}

impl Destination {
    pub fn chat(chat_id: i64) -> Self {
        Self {
            chat_id,
            thread_id: None,
        }
    }

    pub fn topic(chat_id: i64, thread_id: i32) -> Self {
        Self {
            chat_id,
            thread_id: Some(thread_id),
        }
    }
}

impl fmt::Display for Destination {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self.thread_id {
            Some(thread) => write!(f, "{}/{}", self.chat_id, thread),
            None => write!(f, "{}", self.chat_id),
        }
    }
}

#[derive(Debug, Clone, PartialEq, Eq, thiserror::Error)]
#[error("invalid destination '{0}': expected chatId or chatId/threadId")]
pub struct ParseDestinationError(pub String);

impl FromStr for Destination {
    type Err = ParseDestinationError;

    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let trimmed = s.trim();
        let err = || ParseDestinationError(trimmed.to_string());
        match trimmed.split_once('/') {
            Some((chat, thread)) => {
                let chat_id = chat.trim().parse::<i64>().map_err(|_| err())?;
                let thread_id = thread.trim().parse::<i32>().map_err(|_| err())?;
                Ok(Destination::topic(chat_id, thread_id))
            }
            None => {
                let chat_id = trimmed.parse::<i64>().map_err(|_| err())?;
                Ok(Destination::chat(chat_id))
            }
        }
    }
}

/// Clamp a requested monitor interval to the accepted floor.
pub fn clamp_interval(secs: u64) -> u64 {
    secs.max(MIN_MONITOR_INTERVAL_SECS)
}

pub fn interval_duration(secs: u64) -> Duration {
    Duration::from_secs(clamp_interval(secs))
}

/// Split `owner/repo` into its two non-empty halves.
pub fn split_full_name(full_name: &str) -> Option<(&str, &str)> {
    let (owner, repo) = full_name.split_once('/')?;
    if owner.is_empty() || repo.is_empty() || repo.contains('/') {
        return None;
    }
    Some((owner, repo))
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn delivery_mode_round_trips_storage_names() {
        assert_eq!(DeliveryMode::parse_mode("off"), Some(DeliveryMode::Instant));
        assert_eq!(DeliveryMode::parse_mode(" Weekly "), Some(DeliveryMode::Weekly));
        assert_eq!(DeliveryMode::parse_mode("hourly"), None);
        assert_eq!(DeliveryMode::Daily.cadence(), Some(Cadence::Daily));
        assert_eq!(DeliveryMode::Instant.cadence(), None);
    }

    #[test]
    fn destination_parses_chat_and_topic() {
        assert_eq!("-1001".parse::<Destination>().unwrap(), Destination::chat(-1001));
        assert_eq!(
            "-1001/42".parse::<Destination>().unwrap(),
            Destination::topic(-1001, 42)
        );
        assert_eq!(Destination::topic(-5, 7).to_string(), "-5/7");
        assert!("abc".parse::<Destination>().is_err());
        assert!("1/x".parse::<Destination>().is_err());
    }

    #[test]
    fn interval_is_floored() {
        assert_eq!(clamp_interval(10), 60);
        assert_eq!(clamp_interval(600), 600);
        assert_eq!(interval_duration(0), Duration::from_secs(60));
    }

    #[test]
    fn full_name_split() {
        assert_eq!(split_full_name("rust-lang/rust"), Some(("rust-lang", "rust")));
        assert_eq!(split_full_name("nope"), None);
        assert_eq!(split_full_name("a/b/c"), None);
        assert_eq!(split_full_name("/b"), None);
    }
}
