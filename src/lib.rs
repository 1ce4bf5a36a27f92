pub mod config;
pub mod db;
pub mod digest;
pub mod format;
pub mod github;
pub mod handlers;
pub mod model;
pub mod monitor;
pub mod notifier;
pub mod summarizer;
