use super::model::{DigestQueueEntry, TrackedRelease};
use crate::model::{clamp_interval, DeliveryMode, Destination, MonitoringState};
use anyhow::{Context, Result};
use chrono::{DateTime, SecondsFormat, Utc};
use sqlx::sqlite::{SqliteConnectOptions, SqliteJournalMode, SqliteSynchronous};
use sqlx::{Row, SqlitePool};
use std::str::FromStr;
use tracing::{info, instrument, warn};

pub type Pool = SqlitePool;

const KEY_GITHUB_TOKEN: &str = "github_token";
const KEY_LAST_CHECK: &str = "last_check_timestamp";
const KEY_PAUSED: &str = "monitoring_paused";
const KEY_DIGEST_MODE: &str = "digest_mode";
const KEY_MONITOR_INTERVAL: &str = "monitor_interval";
const KEY_LAST_ERROR: &str = "last_error_message";
const KEY_AI_FEATURES: &str = "ai_features_enabled";
const KEY_AI_MEDIA: &str = "ai_media_selection_enabled";

pub async fn init_pool(database_url: &str) -> Result<Pool> {
    let normalized = prepare_sqlite_url(database_url);
    let options = SqliteConnectOptions::from_str(&normalized)
        .with_context(|| format!("invalid database url {}", normalized))?
        .create_if_missing(true)
        .journal_mode(SqliteJournalMode::Wal)
        .synchronous(SqliteSynchronous::Full);
    let pool = SqlitePool::connect_with(options).await?;
    Ok(pool)
}

/// For a file-backed SQLite URL, expand a leading `~/` and make sure the parent
/// directory exists. In-memory and non-sqlite URLs pass through untouched.
fn prepare_sqlite_url(url: &str) -> String {
    let Some(rest) = url.strip_prefix("sqlite:") else {
        return url.to_string();
    };
    if rest.starts_with(":memory") {
        return url.to_string();
    }
    let rest = rest.strip_prefix("//").unwrap_or(rest);
    let (path, query) = match rest.split_once('?') {
        Some((p, q)) => (p, Some(q)),
        None => (rest, None),
    };
    if path.is_empty() {
        return url.to_string();
    }

    let path = match (path.strip_prefix("~/"), std::env::var("HOME")) {
        (Some(tail), Ok(home)) => format!("{}/{}", home.trim_end_matches('/'), tail),
        _ => path.to_string(),
    };
    if let Some(parent) = std::path::Path::new(&path).parent() {
        if !parent.as_os_str().is_empty() {
            let _ = std::fs::create_dir_all(parent);
        }
    }

    match query {
        Some(q) => format!("sqlite://{}?{}", path, q),
        None => format!("sqlite://{}", path),
    }
}

pub async fn run_migrations(pool: &Pool) -> Result<()> {
    sqlx::migrate!("./migrations").run(pool).await?;
    Ok(())
}

// ---------------------------------------------------------------------------
// Scalar settings
// ---------------------------------------------------------------------------

async fn get_setting(pool: &Pool, key: &str) -> Result<Option<String>> {
    let value = sqlx::query_scalar::<_, String>("SELECT value FROM bot_state WHERE key = ?")
        .bind(key)
        .fetch_optional(pool)
        .await
        .with_context(|| format!("failed to read setting {}", key))?;
    Ok(value)
}

async fn set_setting(pool: &Pool, key: &str, value: &str) -> Result<()> {
    sqlx::query(
        "INSERT INTO bot_state (key, value) VALUES (?, ?) \
         ON CONFLICT(key) DO UPDATE SET value = excluded.value",
    )
    .bind(key)
    .bind(value)
    .execute(pool)
    .await
    .with_context(|| format!("failed to write setting {}", key))?;
    Ok(())
}

async fn delete_setting(pool: &Pool, key: &str) -> Result<bool> {
    let res = sqlx::query("DELETE FROM bot_state WHERE key = ?")
        .bind(key)
        .execute(pool)
        .await
        .with_context(|| format!("failed to delete setting {}", key))?;
    Ok(res.rows_affected() > 0)
}

async fn get_flag(pool: &Pool, key: &str, default: bool) -> Result<bool> {
    Ok(get_setting(pool, key)
        .await?
        .map(|v| v == "1")
        .unwrap_or(default))
}

async fn set_flag(pool: &Pool, key: &str, value: bool) -> Result<()> {
    set_setting(pool, key, if value { "1" } else { "0" }).await
}

pub async fn github_token(pool: &Pool) -> Result<Option<String>> {
    get_setting(pool, KEY_GITHUB_TOKEN).await
}

#[instrument(skip_all)]
pub async fn set_github_token(pool: &Pool, token: &str) -> Result<()> {
    set_setting(pool, KEY_GITHUB_TOKEN, token.trim()).await
}

#[instrument(skip_all)]
pub async fn remove_github_token(pool: &Pool) -> Result<bool> {
    delete_setting(pool, KEY_GITHUB_TOKEN).await
}

pub async fn github_token_exists(pool: &Pool) -> Result<bool> {
    Ok(github_token(pool).await?.is_some())
}

/// Star watermark. An unparseable stored value reads as absent so the next
/// pass re-establishes a baseline instead of failing forever.
pub async fn last_check_timestamp(pool: &Pool) -> Result<Option<DateTime<Utc>>> {
    let Some(raw) = get_setting(pool, KEY_LAST_CHECK).await? else {
        return Ok(None);
    };
    match DateTime::parse_from_rfc3339(&raw) {
        Ok(ts) => Ok(Some(ts.with_timezone(&Utc))),
        Err(err) => {
            warn!(%raw, ?err, "discarding unparseable watermark");
            Ok(None)
        }
    }
}

#[instrument(skip_all)]
pub async fn set_last_check_timestamp(pool: &Pool, ts: DateTime<Utc>) -> Result<()> {
    set_setting(
        pool,
        KEY_LAST_CHECK,
        &ts.to_rfc3339_opts(SecondsFormat::Secs, true),
    )
    .await
}

pub async fn monitoring_state(pool: &Pool) -> Result<MonitoringState> {
    let paused = get_flag(pool, KEY_PAUSED, false).await?;
    Ok(if paused {
        MonitoringState::Paused
    } else {
        MonitoringState::Active
    })
}

#[instrument(skip_all)]
pub async fn set_monitoring_state(pool: &Pool, state: MonitoringState) -> Result<()> {
    set_flag(pool, KEY_PAUSED, state.is_paused()).await?;
    info!(?state, "monitoring state changed");
    Ok(())
}

pub async fn delivery_mode(pool: &Pool) -> Result<DeliveryMode> {
    let raw = get_setting(pool, KEY_DIGEST_MODE).await?;
    Ok(raw
        .as_deref()
        .and_then(DeliveryMode::parse_mode)
        .unwrap_or_default())
}

#[instrument(skip_all)]
pub async fn set_delivery_mode(pool: &Pool, mode: DeliveryMode) -> Result<()> {
    set_setting(pool, KEY_DIGEST_MODE, mode.as_str()).await?;
    info!(%mode, "digest mode set");
    Ok(())
}

/// Effective monitor interval in seconds, falling back to `default_secs` and
/// never below the floor.
pub async fn monitor_interval(pool: &Pool, default_secs: u64) -> Result<u64> {
    let stored = get_setting(pool, KEY_MONITOR_INTERVAL)
        .await?
        .and_then(|v| v.parse::<u64>().ok());
    Ok(clamp_interval(stored.unwrap_or(default_secs)))
}

/// Stores the clamped interval and returns it.
#[instrument(skip_all)]
pub async fn set_monitor_interval(pool: &Pool, requested_secs: u64) -> Result<u64> {
    let effective = clamp_interval(requested_secs);
    set_setting(pool, KEY_MONITOR_INTERVAL, &effective.to_string()).await?;
    info!(requested_secs, effective, "monitor interval set");
    Ok(effective)
}

pub async fn last_error(pool: &Pool) -> Result<Option<String>> {
    get_setting(pool, KEY_LAST_ERROR).await
}

pub async fn set_last_error(pool: &Pool, message: &str) -> Result<()> {
    set_setting(pool, KEY_LAST_ERROR, message).await
}

pub async fn clear_last_error(pool: &Pool) -> Result<()> {
    delete_setting(pool, KEY_LAST_ERROR).await?;
    Ok(())
}

pub async fn ai_features_enabled(pool: &Pool) -> Result<bool> {
    get_flag(pool, KEY_AI_FEATURES, true).await
}

pub async fn set_ai_features_enabled(pool: &Pool, enabled: bool) -> Result<()> {
    set_flag(pool, KEY_AI_FEATURES, enabled).await
}

pub async fn ai_media_selection_enabled(pool: &Pool) -> Result<bool> {
    get_flag(pool, KEY_AI_MEDIA, true).await
}

pub async fn set_ai_media_selection_enabled(pool: &Pool, enabled: bool) -> Result<()> {
    set_flag(pool, KEY_AI_MEDIA, enabled).await
}

// ---------------------------------------------------------------------------
// Destinations
// ---------------------------------------------------------------------------

#[instrument(skip_all)]
pub async fn add_destination(pool: &Pool, dest: Destination) -> Result<bool> {
    let res = sqlx::query("INSERT OR IGNORE INTO destinations (target) VALUES (?)")
        .bind(dest.to_string())
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

#[instrument(skip_all)]
pub async fn remove_destination(pool: &Pool, dest: Destination) -> Result<bool> {
    let res = sqlx::query("DELETE FROM destinations WHERE target = ?")
        .bind(dest.to_string())
        .execute(pool)
        .await?;
    Ok(res.rows_affected() > 0)
}

pub async fn list_destinations(pool: &Pool) -> Result<Vec<Destination>> {
    let targets: Vec<String> =
        sqlx::query_scalar("SELECT target FROM destinations ORDER BY created_at, target")
            .fetch_all(pool)
            .await?;
    Ok(targets
        .into_iter()
        .filter_map(|t| match t.parse::<Destination>() {
            Ok(d) => Some(d),
            Err(err) => {
                warn!(%err, "skipping malformed destination row");
                None
            }
        })
        .collect())
}

// ---------------------------------------------------------------------------
// Digest queue
// ---------------------------------------------------------------------------

/// Queue a repository for the next digest. Returns false if it was already queued.
#[instrument(skip_all)]
pub async fn enqueue_digest(pool: &Pool, repo_full_name: &str) -> Result<bool> {
    let res =
        sqlx::query("INSERT OR IGNORE INTO digest_queue (repo_full_name, added_at) VALUES (?, ?)")
            .bind(repo_full_name)
            .bind(Utc::now())
            .execute(pool)
            .await?;
    Ok(res.rows_affected() > 0)
}

/// Remove and return every queued entry, oldest first.
///
/// A single `DELETE .. RETURNING` statement: concurrent enqueues either land
/// before it (and are returned) or after it (and wait for the next drain).
#[instrument(skip_all)]
pub async fn drain_digest_queue(pool: &Pool) -> Result<Vec<DigestQueueEntry>> {
    let rows = sqlx::query("DELETE FROM digest_queue RETURNING id, repo_full_name, added_at")
        .fetch_all(pool)
        .await
        .context("failed to drain digest queue")?;

    let mut entries = rows
        .into_iter()
        .map(|row| {
            let id: i64 = row.get("id");
            let entry = DigestQueueEntry {
                repo_full_name: row.get("repo_full_name"),
                added_at: row.get("added_at"),
            };
            (id, entry)
        })
        .collect::<Vec<_>>();
    // RETURNING order is unspecified; the autoincrement id is the enqueue order.
    entries.sort_by_key(|(id, _)| *id);
    Ok(entries.into_iter().map(|(_, e)| e).collect())
}

pub async fn digest_queue_count(pool: &Pool) -> Result<i64> {
    let count: i64 = sqlx::query_scalar("SELECT COUNT(*) FROM digest_queue")
        .fetch_one(pool)
        .await?;
    Ok(count)
}

// ---------------------------------------------------------------------------
// Release tracking
// ---------------------------------------------------------------------------

/// Subscribe `dest` to releases of `repo_full_name`, creating the tracked row
/// if needed. Returns false if the subscription already existed.
#[instrument(skip_all)]
pub async fn add_release_subscription(
    pool: &Pool,
    repo_full_name: &str,
    dest: Destination,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    sqlx::query("INSERT OR IGNORE INTO tracked_releases (repo_full_name) VALUES (?)")
        .bind(repo_full_name)
        .execute(&mut *tx)
        .await?;
    let res = sqlx::query(
        "INSERT OR IGNORE INTO release_subscriptions \
         (repo_full_name, destination_chat_id, destination_thread_id) VALUES (?, ?, ?)",
    )
    .bind(repo_full_name)
    .bind(dest.chat_id)
    .bind(dest.thread_id)
    .execute(&mut *tx)
    .await?;
    tx.commit().await?;

    let added = res.rows_affected() > 0;
    if added {
        info!(repo = repo_full_name, %dest, "release subscription added");
    }
    Ok(added)
}

/// Remove one subscription. When it was the last one for the repository the
/// tracked row goes too, in the same transaction.
#[instrument(skip_all)]
pub async fn remove_release_subscription(
    pool: &Pool,
    repo_full_name: &str,
    dest: Destination,
) -> Result<bool> {
    let mut tx = pool.begin().await?;
    let res = sqlx::query(
        "DELETE FROM release_subscriptions \
         WHERE repo_full_name = ? AND destination_chat_id = ? \
           AND IFNULL(destination_thread_id, -1) = IFNULL(?, -1)",
    )
    .bind(repo_full_name)
    .bind(dest.chat_id)
    .bind(dest.thread_id)
    .execute(&mut *tx)
    .await?;
    if res.rows_affected() == 0 {
        tx.rollback().await?;
        return Ok(false);
    }

    let remaining: i64 =
        sqlx::query_scalar("SELECT COUNT(*) FROM release_subscriptions WHERE repo_full_name = ?")
            .bind(repo_full_name)
            .fetch_one(&mut *tx)
            .await?;
    if remaining == 0 {
        sqlx::query("DELETE FROM tracked_releases WHERE repo_full_name = ?")
            .bind(repo_full_name)
            .execute(&mut *tx)
            .await?;
        info!(repo = repo_full_name, "no subscriptions left; stopped tracking");
    }
    tx.commit().await?;
    Ok(true)
}

/// Every tracked repository with its subscriptions grouped in.
pub async fn tracked_releases_with_subscriptions(pool: &Pool) -> Result<Vec<TrackedRelease>> {
    let rows = sqlx::query(
        "SELECT t.repo_full_name, t.last_release_tag, \
                s.destination_chat_id, s.destination_thread_id \
         FROM tracked_releases t \
         LEFT JOIN release_subscriptions s ON s.repo_full_name = t.repo_full_name \
         ORDER BY t.repo_full_name, s.id",
    )
    .fetch_all(pool)
    .await?;

    let mut out: Vec<TrackedRelease> = Vec::new();
    for row in rows {
        let name: String = row.get("repo_full_name");
        let chat_id: Option<i64> = row.get("destination_chat_id");
        let thread_id: Option<i32> = row.get("destination_thread_id");

        if out.last().map(|t| t.repo_full_name != name).unwrap_or(true) {
            out.push(TrackedRelease {
                repo_full_name: name,
                last_release_tag: row.get("last_release_tag"),
                subscriptions: Vec::new(),
            });
        }
        if let (Some(current), Some(chat_id)) = (out.last_mut(), chat_id) {
            current.subscriptions.push(Destination { chat_id, thread_id });
        }
    }
    Ok(out)
}

#[instrument(skip_all)]
pub async fn update_last_release_tag(pool: &Pool, repo_full_name: &str, tag: &str) -> Result<()> {
    sqlx::query("UPDATE tracked_releases SET last_release_tag = ? WHERE repo_full_name = ?")
        .bind(tag)
        .bind(repo_full_name)
        .execute(pool)
        .await
        .context("failed to persist release tag")?;
    Ok(())
}
