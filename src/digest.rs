use anyhow::{anyhow, Result};
use chrono::{
    DateTime, Datelike, Duration as ChronoDuration, FixedOffset, NaiveTime, TimeZone, Utc, Weekday,
};
use std::sync::Arc;
use std::time::Duration;
use tokio_util::sync::CancellationToken;
use tracing::{debug, error, info, instrument, warn};

use crate::config;
use crate::db::{self, Pool};
use crate::github::GitHubService;
use crate::model::{Cadence, DeliveryMode};
use crate::notifier::Notify;

/// When the daily and weekly digests fire, in a fixed UTC offset.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct DigestSchedule {
    time: NaiveTime,
    weekday: Weekday,
    offset: FixedOffset,
}

impl DigestSchedule {
    pub fn new(hour: u32, minute: u32, weekday: Weekday, utc_offset_hours: i32) -> Result<Self> {
        let time = NaiveTime::from_hms_opt(hour, minute, 0)
            .ok_or_else(|| anyhow!("invalid digest time {:02}:{:02}", hour, minute))?;
        let offset = FixedOffset::east_opt(utc_offset_hours * 3600)
            .ok_or_else(|| anyhow!("invalid digest UTC offset {}", utc_offset_hours))?;
        Ok(Self {
            time,
            weekday,
            offset,
        })
    }

    pub fn from_config(cfg: &config::Digest) -> Result<Self> {
        Self::new(cfg.hour, cfg.minute, cfg.weekday, cfg.utc_offset_hours)
    }

    /// First trigger strictly after `now`.
    pub fn next_fire(&self, cadence: Cadence, now: DateTime<Utc>) -> DateTime<Utc> {
        let local_now = now.with_timezone(&self.offset);
        let mut date = local_now.date_naive();
        for _ in 0..8 {
            let local = date.and_time(self.time);
            let utc = Utc.from_utc_datetime(
                &(local - ChronoDuration::seconds(self.offset.local_minus_utc() as i64)),
            );
            let day_matches = cadence == Cadence::Daily || date.weekday() == self.weekday;
            if utc > now && day_matches {
                return utc;
            }
            match date.succ_opt() {
                Some(next) => date = next,
                None => break,
            }
        }
        now + ChronoDuration::days(7)
    }
}

/// What a digest trigger did.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum DigestOutcome {
    /// The stored delivery mode does not batch for this cadence.
    Skipped { mode: DeliveryMode },
    Delivered {
        drained: usize,
        sent: usize,
        failed: usize,
    },
}

pub struct DigestScheduler {
    pool: Pool,
    github: Arc<dyn GitHubService>,
    notifier: Arc<dyn Notify>,
    schedule: DigestSchedule,
    send_delay: Duration,
}

impl DigestScheduler {
    pub fn new(
        pool: Pool,
        github: Arc<dyn GitHubService>,
        notifier: Arc<dyn Notify>,
        schedule: DigestSchedule,
        send_delay: Duration,
    ) -> Self {
        Self {
            pool,
            github,
            notifier,
            schedule,
            send_delay,
        }
    }

    pub fn schedule(&self) -> &DigestSchedule {
        &self.schedule
    }

    /// A trigger for `cadence`. Does nothing unless the stored mode batches
    /// for exactly this cadence; changing the mode never reschedules.
    #[instrument(skip_all, fields(cadence = cadence.as_str()))]
    pub async fn fire(&self, cadence: Cadence) -> Result<DigestOutcome> {
        let mode = db::delivery_mode(&self.pool).await?;
        if mode.cadence() != Some(cadence) {
            debug!(%mode, "digest mode does not match trigger; skipping");
            return Ok(DigestOutcome::Skipped { mode });
        }
        info!("running digest");
        self.flush_now().await
    }

    /// Drain the queue and deliver every entry in enqueue order, regardless
    /// of the delivery mode. One entry failing does not stop the others.
    #[instrument(skip_all)]
    pub async fn flush_now(&self) -> Result<DigestOutcome> {
        let entries = db::drain_digest_queue(&self.pool).await?;
        if entries.is_empty() {
            info!("digest queue is empty");
            return Ok(DigestOutcome::Delivered {
                drained: 0,
                sent: 0,
                failed: 0,
            });
        }

        info!(count = entries.len(), "dispatching digest");
        let (mut sent, mut failed) = (0, 0);
        for (i, entry) in entries.iter().enumerate() {
            if i > 0 {
                tokio::time::sleep(self.send_delay).await;
            }
            match self.dispatch(&entry.repo_full_name).await {
                Ok(()) => sent += 1,
                Err(err) => {
                    failed += 1;
                    warn!(?err, repo = %entry.repo_full_name, "digest item failed; skipping");
                }
            }
        }
        info!(sent, failed, "digest finished");
        Ok(DigestOutcome::Delivered {
            drained: entries.len(),
            sent,
            failed,
        })
    }

    async fn dispatch(&self, full_name: &str) -> Result<()> {
        let repo = match self.github.repository(full_name).await {
            Ok(repo) => repo,
            Err(err) if err.is_not_found() => {
                info!(repo = full_name, "queued repository no longer exists");
                return Err(err.into());
            }
            Err(err) => return Err(err.into()),
        };
        self.notifier.send_repo_notification(&repo).await
    }

    /// Sleep until each trigger for `cadence` and fire it, until `shutdown`.
    pub async fn run(&self, cadence: Cadence, shutdown: CancellationToken) {
        loop {
            let now = Utc::now();
            let next = self.schedule.next_fire(cadence, now);
            let wait = (next - now).to_std().unwrap_or(Duration::ZERO);
            info!(cadence = cadence.as_str(), %next, "next digest trigger");

            tokio::select! {
                _ = shutdown.cancelled() => break,
                _ = tokio::time::sleep(wait) => {}
            }
            if let Err(err) = self.fire(cadence).await {
                error!(?err, cadence = cadence.as_str(), "digest trigger failed");
            }
        }
        info!(cadence = cadence.as_str(), "digest loop stopped");
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    fn schedule() -> DigestSchedule {
        DigestSchedule::new(21, 0, Weekday::Sun, 3).unwrap()
    }

    fn utc(y: i32, m: u32, d: u32, h: u32, min: u32) -> DateTime<Utc> {
        Utc.with_ymd_and_hms(y, m, d, h, min, 0).unwrap()
    }

    #[test]
    fn daily_fires_at_local_time_today_or_tomorrow() {
        // 2024-06-05 is a Wednesday. 21:00 at +03:00 is 18:00 UTC.
        let s = schedule();
        assert_eq!(s.next_fire(Cadence::Daily, utc(2024, 6, 5, 10, 0)), utc(2024, 6, 5, 18, 0));
        assert_eq!(s.next_fire(Cadence::Daily, utc(2024, 6, 5, 18, 0)), utc(2024, 6, 6, 18, 0));
        // Local date is already the 6th here.
        assert_eq!(s.next_fire(Cadence::Daily, utc(2024, 6, 5, 22, 30)), utc(2024, 6, 6, 18, 0));
    }

    #[test]
    fn weekly_waits_for_the_weekday() {
        let s = schedule();
        // Wednesday -> Sunday 2024-06-09.
        assert_eq!(s.next_fire(Cadence::Weekly, utc(2024, 6, 5, 10, 0)), utc(2024, 6, 9, 18, 0));
        // Sunday after the trigger -> next Sunday.
        assert_eq!(s.next_fire(Cadence::Weekly, utc(2024, 6, 9, 18, 1)), utc(2024, 6, 16, 18, 0));
    }

    #[test]
    fn rejects_bad_times() {
        assert!(DigestSchedule::new(24, 0, Weekday::Sun, 0).is_err());
        assert!(DigestSchedule::new(10, 0, Weekday::Sun, 30).is_err());
    }
}
