//! Star and release change detection.
//!
//! Both passes read all their state from the database at the top of each
//! cycle, so the two loops and the chat commands never share in-process
//! state. A failed upstream call leaves the stored state untouched and the
//! next cycle retries from the same watermark.

use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config::Config;
use crate::db::{self, Pool, TrackedRelease};
use crate::github::{GitHubError, GitHubService};
use crate::model::{interval_duration, DeliveryMode, MonitoringState};
use crate::notifier::Notify;

pub const TOKEN_ERROR_MESSAGE: &str =
    "Your GitHub token is invalid or has expired. Monitoring has been automatically paused.";

const TOKEN_ALERT: &str = "⚠️ <b>GitHub Token Error</b>\n\n\
    Your GitHub token is either invalid or has expired. \
    The bot has paused monitoring your stars.\n\n\
    Generate a new token and send it to resume:\n<code>/settoken &lt;token&gt;</code>";

#[derive(Debug, Clone)]
pub struct MonitorSettings {
    pub star_page_size: u32,
    /// Pause between consecutive instant notifications.
    pub send_delay: Duration,
    /// Sleep after a cycle that failed unexpectedly.
    pub error_backoff: Duration,
    /// Interval used until one is stored with `/setinterval`.
    pub default_interval_secs: u64,
}

impl MonitorSettings {
    pub fn from_config(cfg: &Config) -> Self {
        Self {
            star_page_size: cfg.github.star_page_size,
            send_delay: Duration::from_millis(cfg.app.send_delay_ms),
            error_backoff: Duration::from_secs(cfg.app.error_backoff_seconds),
            default_interval_secs: cfg.app.monitor_interval_seconds,
        }
    }
}

/// Outcome of one star detection pass.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum StarPass {
    /// The feed had no items.
    Empty,
    /// First run: the watermark was seeded and nothing was treated as new.
    Baseline(DateTime<Utc>),
    /// Repositories starred after the watermark, oldest first.
    Processed { new: Vec<String>, mode: DeliveryMode },
    /// The token was rejected; monitoring is now paused.
    AuthFailed,
    /// Any other upstream failure; nothing was changed.
    UpstreamFailed,
}

#[derive(Debug, Clone, Default, PartialEq, Eq)]
pub struct ReleasePass {
    pub checked: usize,
    pub notified: usize,
    pub failed: usize,
}

#[derive(Debug, Clone, Copy)]
enum PassKind {
    Stars,
    Releases,
}

impl PassKind {
    fn as_str(&self) -> &'static str {
        match self {
            PassKind::Stars => "stars",
            PassKind::Releases => "releases",
        }
    }
}

pub struct Monitor {
    pool: Pool,
    github: Arc<dyn GitHubService>,
    notifier: Arc<dyn Notify>,
    settings: MonitorSettings,
}

impl Monitor {
    pub fn new(
        pool: Pool,
        github: Arc<dyn GitHubService>,
        notifier: Arc<dyn Notify>,
        settings: MonitorSettings,
    ) -> Self {
        Self {
            pool,
            github,
            notifier,
            settings,
        }
    }

    #[instrument(skip_all)]
    pub async fn check_for_new_stars(&self) -> Result<StarPass> {
        let feed = match self.github.starred_feed(self.settings.star_page_size).await {
            Ok(feed) => feed,
            Err(err) if err.is_unauthorized() => {
                self.handle_auth_failure(&err).await?;
                return Ok(StarPass::AuthFailed);
            }
            Err(err) => {
                warn!(%err, status = err.status_code(), "star feed unavailable; will retry");
                return Ok(StarPass::UpstreamFailed);
            }
        };

        let Some(newest) = feed.iter().map(|e| e.starred_at).max() else {
            debug!("star feed is empty");
            return Ok(StarPass::Empty);
        };

        let Some(watermark) = db::last_check_timestamp(&self.pool).await? else {
            db::set_last_check_timestamp(&self.pool, newest).await?;
            db::clear_last_error(&self.pool).await?;
            info!(%newest, "first run; baseline watermark established");
            return Ok(StarPass::Baseline(newest));
        };

        // The whole page is filtered rather than cut at the first older item,
        // so an out-of-order feed cannot hide a new star.
        let mut fresh: Vec<_> = feed.iter().filter(|e| e.starred_at > watermark).collect();
        fresh.sort_by_key(|e| e.starred_at);
        let names: Vec<String> = fresh.iter().map(|e| e.repo.full_name.clone()).collect();

        let mode = db::delivery_mode(&self.pool).await?;
        if fresh.is_empty() {
            debug!("no new starred repositories");
        } else if mode == DeliveryMode::Instant {
            info!(count = fresh.len(), "new stars; notifying now");
            for (i, event) in fresh.iter().enumerate() {
                if i > 0 {
                    tokio::time::sleep(self.settings.send_delay).await;
                }
                if let Err(err) = self.notifier.send_repo_notification(&event.repo).await {
                    warn!(?err, repo = %event.repo.full_name, "failed to notify");
                }
            }
        } else {
            info!(count = fresh.len(), %mode, "new stars; queueing for digest");
            for name in &names {
                if !db::enqueue_digest(&self.pool, name).await? {
                    debug!(repo = %name, "already queued");
                }
            }
        }

        db::set_last_check_timestamp(&self.pool, newest.max(watermark)).await?;
        db::clear_last_error(&self.pool).await?;
        Ok(StarPass::Processed { new: names, mode })
    }

    async fn handle_auth_failure(&self, err: &GitHubError) -> Result<()> {
        error!(%err, "GitHub token rejected; pausing monitoring");
        db::set_monitoring_state(&self.pool, MonitoringState::Paused).await?;
        db::set_last_error(&self.pool, TOKEN_ERROR_MESSAGE).await?;
        match self.notifier.alert_owner(TOKEN_ALERT).await {
            Ok(()) => info!("owner alerted about token failure"),
            Err(alert_err) => error!(?alert_err, "failed to alert owner about token failure"),
        }
        Ok(())
    }

    #[instrument(skip_all)]
    pub async fn check_for_new_releases(&self) -> Result<ReleasePass> {
        let tracked = db::tracked_releases_with_subscriptions(&self.pool).await?;
        let mut pass = ReleasePass::default();

        for repo in tracked.iter().filter(|t| !t.subscriptions.is_empty()) {
            pass.checked += 1;
            match self.check_release(repo).await {
                Ok(true) => pass.notified += 1,
                Ok(false) => {}
                Err(err) => {
                    pass.failed += 1;
                    warn!(?err, repo = %repo.repo_full_name, "release check failed");
                }
            }
        }
        debug!(?pass, "release pass finished");
        Ok(pass)
    }

    /// One tracked repository. Returns true when a new release was announced.
    async fn check_release(&self, tracked: &TrackedRelease) -> Result<bool> {
        let Some(release) = self.github.latest_release(&tracked.repo_full_name).await? else {
            return Ok(false);
        };
        if tracked.last_release_tag.as_deref() == Some(release.tag_name.as_str()) {
            return Ok(false);
        }

        info!(repo = %tracked.repo_full_name, tag = %release.tag_name, "new release");
        let repo = self.github.repository(&tracked.repo_full_name).await?;
        self.notifier
            .send_release_notification(&release, &repo, &tracked.subscriptions)
            .await?;
        db::update_last_release_tag(&self.pool, &tracked.repo_full_name, &release.tag_name)
            .await?;
        Ok(true)
    }

    pub async fn run_stars_loop(&self, shutdown: CancellationToken) {
        self.run_loop(PassKind::Stars, shutdown).await
    }

    pub async fn run_releases_loop(&self, shutdown: CancellationToken) {
        self.run_loop(PassKind::Releases, shutdown).await
    }

    /// Runs until `shutdown` fires. Cancellation interrupts the sleep, never
    /// an in-flight pass.
    async fn run_loop(&self, kind: PassKind, shutdown: CancellationToken) {
        info!(pass = kind.as_str(), "monitor loop started");
        loop {
            let pause = match self.cycle(kind).await {
                Ok(()) => self.current_interval().await,
                Err(err) => {
                    error!(?err, pass = kind.as_str(), "monitor cycle failed; backing off");
                    self.settings.error_backoff
                }
            };
            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(pause) => {}
            }
        }
        info!(pass = kind.as_str(), "monitor loop stopped");
    }

    async fn cycle(&self, kind: PassKind) -> Result<()> {
        if db::monitoring_state(&self.pool).await?.is_paused() {
            debug!(pass = kind.as_str(), "monitoring paused; skipping");
            return Ok(());
        }
        if !db::github_token_exists(&self.pool).await? {
            debug!(pass = kind.as_str(), "no GitHub token; skipping");
            return Ok(());
        }
        match kind {
            PassKind::Stars => self.check_for_new_stars().await.map(|_| ()),
            PassKind::Releases => self.check_for_new_releases().await.map(|_| ()),
        }
    }

    /// Re-read every cycle so `/setinterval` applies from the next sleep.
    async fn current_interval(&self) -> Duration {
        match db::monitor_interval(&self.pool, self.settings.default_interval_secs).await {
            Ok(secs) => interval_duration(secs),
            Err(err) => {
                warn!(?err, "failed to read monitor interval");
                interval_duration(self.settings.default_interval_secs)
            }
        }
    }
}
