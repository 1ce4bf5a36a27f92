#![allow(dead_code)]

use anyhow::{anyhow, Result};
use async_trait::async_trait;
use chrono::{DateTime, TimeZone, Utc};
use reqwest::StatusCode;
use std::collections::{HashMap, HashSet};
use std::sync::Arc;
use tg_starbot::github::model::Owner;
use tg_starbot::github::{GitHubError, GitHubService, Languages, Release, Repository, StarEvent};
use tg_starbot::model::Destination;
use tg_starbot::notifier::Notify;
use tokio::sync::Mutex;

pub async fn setup_pool() -> sqlx::SqlitePool {
    let pool = sqlx::sqlite::SqlitePoolOptions::new()
        .max_connections(1)
        .connect("sqlite::memory:")
        .await
        .unwrap();
    sqlx::migrate!("./migrations").run(&pool).await.unwrap();
    pool
}

pub fn ts(minute: u32) -> DateTime<Utc> {
    Utc.with_ymd_and_hms(2024, 5, 1, 12, minute, 0).unwrap()
}

pub fn repo(full_name: &str) -> Repository {
    let (owner, name) = full_name.split_once('/').unwrap();
    Repository {
        full_name: full_name.to_string(),
        name: name.to_string(),
        owner: Owner {
            login: owner.to_string(),
            avatar_url: None,
        },
        html_url: format!("https://github.com/{}", full_name),
        description: None,
        stargazers_count: 1,
        forks_count: 0,
        open_issues_count: 0,
        pushed_at: None,
        default_branch: "main".into(),
    }
}

pub fn star(full_name: &str, minute: u32) -> StarEvent {
    StarEvent {
        starred_at: ts(minute),
        repo: repo(full_name),
    }
}

pub fn release(tag: &str) -> Release {
    Release {
        tag_name: tag.to_string(),
        name: None,
        html_url: format!("https://github.com/x/y/releases/tag/{}", tag),
        body: None,
        published_at: None,
        prerelease: false,
    }
}

/// Scripted upstream. Unknown repositories answer 404.
#[derive(Clone, Default)]
pub struct FakeGitHub {
    feed: Arc<Mutex<Vec<StarEvent>>>,
    feed_status: Arc<Mutex<Option<u16>>>,
    releases: Arc<Mutex<HashMap<String, Result<Option<Release>, u16>>>>,
    missing_repos: Arc<Mutex<HashSet<String>>>,
    pub feed_calls: Arc<Mutex<usize>>,
}

impl FakeGitHub {
    pub async fn set_feed(&self, feed: Vec<StarEvent>) {
        *self.feed.lock().await = feed;
        *self.feed_status.lock().await = None;
    }

    pub async fn fail_feed(&self, status: u16) {
        *self.feed_status.lock().await = Some(status);
    }

    pub async fn set_release(&self, full_name: &str, release: Option<Release>) {
        self.releases
            .lock()
            .await
            .insert(full_name.to_string(), Ok(release));
    }

    pub async fn fail_release(&self, full_name: &str, status: u16) {
        self.releases
            .lock()
            .await
            .insert(full_name.to_string(), Err(status));
    }

    pub async fn remove_repo(&self, full_name: &str) {
        self.missing_repos.lock().await.insert(full_name.to_string());
    }
}

fn status_error(status: u16) -> GitHubError {
    GitHubError::status(
        StatusCode::from_u16(status).unwrap(),
        format!("scripted {}", status),
    )
}

#[async_trait]
impl GitHubService for FakeGitHub {
    async fn starred_feed(&self, _per_page: u32) -> Result<Vec<StarEvent>, GitHubError> {
        *self.feed_calls.lock().await += 1;
        if let Some(status) = *self.feed_status.lock().await {
            return Err(status_error(status));
        }
        Ok(self.feed.lock().await.clone())
    }

    async fn repository(&self, full_name: &str) -> Result<Repository, GitHubError> {
        if self.missing_repos.lock().await.contains(full_name) {
            return Err(status_error(404));
        }
        Ok(repo(full_name))
    }

    async fn latest_release(&self, full_name: &str) -> Result<Option<Release>, GitHubError> {
        match self.releases.lock().await.get(full_name) {
            Some(Ok(r)) => Ok(r.clone()),
            Some(Err(status)) => Err(status_error(*status)),
            None => Ok(None),
        }
    }

    async fn languages(&self, _full_name: &str) -> Result<Languages, GitHubError> {
        Ok(Languages::new())
    }

    async fn readme(&self, _full_name: &str) -> Result<Option<String>, GitHubError> {
        Ok(None)
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct SentRelease {
    pub repo: String,
    pub tag: String,
    pub destinations: Vec<Destination>,
}

#[derive(Clone, Default)]
pub struct RecordingNotifier {
    repos: Arc<Mutex<Vec<String>>>,
    releases: Arc<Mutex<Vec<SentRelease>>>,
    alerts: Arc<Mutex<Vec<String>>>,
    failing: Arc<Mutex<HashSet<String>>>,
}

impl RecordingNotifier {
    pub async fn fail_for(&self, full_name: &str) {
        self.failing.lock().await.insert(full_name.to_string());
    }

    pub async fn repos(&self) -> Vec<String> {
        self.repos.lock().await.clone()
    }

    pub async fn releases(&self) -> Vec<SentRelease> {
        self.releases.lock().await.clone()
    }

    pub async fn alerts(&self) -> Vec<String> {
        self.alerts.lock().await.clone()
    }
}

#[async_trait]
impl Notify for RecordingNotifier {
    async fn send_repo_notification(&self, repo: &Repository) -> Result<()> {
        if self.failing.lock().await.contains(&repo.full_name) {
            return Err(anyhow!("scripted send failure for {}", repo.full_name));
        }
        self.repos.lock().await.push(repo.full_name.clone());
        Ok(())
    }

    async fn send_release_notification(
        &self,
        release: &Release,
        repo: &Repository,
        destinations: &[Destination],
    ) -> Result<()> {
        if self.failing.lock().await.contains(&repo.full_name) {
            return Err(anyhow!("scripted send failure for {}", repo.full_name));
        }
        self.releases.lock().await.push(SentRelease {
            repo: repo.full_name.clone(),
            tag: release.tag_name.clone(),
            destinations: destinations.to_vec(),
        });
        Ok(())
    }

    async fn alert_owner(&self, text: &str) -> Result<()> {
        self.alerts.lock().await.push(text.to_string());
        Ok(())
    }
}
