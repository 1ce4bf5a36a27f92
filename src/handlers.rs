use anyhow::Result;
use chrono::{DateTime, Utc};
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::ParseMode;
use teloxide::utils::html::escape;
use tracing::{debug, info, instrument, warn};

use crate::db::{self, Pool};
use crate::digest::{DigestOutcome, DigestScheduler};
use crate::format::{self, format_duration};
use crate::github::GitHubClient;
use crate::model::{DeliveryMode, Destination, MonitoringState};

const REMOVE_DEST_USAGE: &str = "Usage: <code>/remove_dest &lt;chatId[/threadId]|me&gt;</code>";
const UNTRACK_USAGE: &str = "Usage: <code>/untrack owner/repo [chatId[/threadId]]</code>";

const HELP: &str = "<b>GitHub star notifier</b>\n\n\
    /settoken &lt;token&gt; - store and verify a GitHub token\n\
    /removetoken - delete the token and pause monitoring\n\
    /status - account, limits and settings\n\
    /setinterval &lt;seconds&gt; - check interval (min 60)\n\
    /pause, /resume - stop or restart monitoring\n\
    /digest off|daily|weekly - instant or batched delivery\n\
    /flush - deliver the digest queue now\n\
    /add_dest &lt;chatId[/threadId]&gt; - add a destination\n\
    /remove_dest &lt;chatId[/threadId]|me&gt; - remove a destination\n\
    /list_dest - list destinations\n\
    /track owner/repo [chatId[/threadId]] - release notifications\n\
    /untrack owner/repo [chatId[/threadId]] - stop them\n\
    /releases - tracked repositories\n\
    /ai on|off - README summaries\n\
    /aimedia on|off - README media in previews";

/// Everything a command needs, shared across updates.
pub struct BotContext {
    pub pool: Pool,
    pub github: GitHubClient,
    pub digest: Arc<DigestScheduler>,
    pub owner_user_id: i64,
    pub default_interval_secs: u64,
    /// A Gemini key is configured; without one the AI toggles are inert.
    pub ai_configured: bool,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Command {
    Start,
    Help,
    SetToken(String),
    RemoveToken,
    Status,
    SetInterval(String),
    Pause,
    Resume,
    Digest(String),
    Flush,
    AddDest(String),
    RemoveDest(String),
    ListDest,
    Track(String),
    Untrack(String),
    Releases,
    Ai(String),
    AiMedia(String),
    Unknown(String),
}

/// `None` for anything that is not a slash command.
pub fn parse_command(text: &str) -> Option<Command> {
    let trimmed = text.trim();
    if !trimmed.starts_with('/') {
        return None;
    }
    let (head, args) = match trimmed.split_once(char::is_whitespace) {
        Some((h, a)) => (h, a.trim().to_string()),
        None => (trimmed, String::new()),
    };
    // `/status@my_bot` in groups.
    let name = head.split('@').next().unwrap_or(head).to_ascii_lowercase();
    let cmd = match name.as_str() {
        "/start" => Command::Start,
        "/help" => Command::Help,
        "/settoken" => Command::SetToken(args),
        "/removetoken" => Command::RemoveToken,
        "/status" => Command::Status,
        "/setinterval" => Command::SetInterval(args),
        "/pause" => Command::Pause,
        "/resume" => Command::Resume,
        "/digest" => Command::Digest(args),
        "/flush" => Command::Flush,
        "/add_dest" => Command::AddDest(args),
        "/remove_dest" => Command::RemoveDest(args),
        "/list_dest" => Command::ListDest,
        "/track" => Command::Track(args),
        "/untrack" => Command::Untrack(args),
        "/releases" => Command::Releases,
        "/ai" => Command::Ai(args),
        "/aimedia" => Command::AiMedia(args),
        other => Command::Unknown(other.to_string()),
    };
    Some(cmd)
}

/// `on`/`off` style switch argument.
pub fn parse_switch(args: &str) -> Option<bool> {
    match args.trim().to_ascii_lowercase().as_str() {
        "on" | "enable" | "true" | "1" => Some(true),
        "off" | "disable" | "false" | "0" => Some(false),
        _ => None,
    }
}

/// `owner/repo [destination]`; the destination defaults to `here`.
pub fn parse_track_args(args: &str, here: Destination) -> Option<(String, Destination)> {
    let mut parts = args.split_whitespace();
    let (owner, repo) = format::parse_repo_input(parts.next()?)?;
    let dest = match parts.next() {
        Some(raw) => raw.parse::<Destination>().ok()?,
        None => here,
    };
    if parts.next().is_some() {
        return None;
    }
    Some((format!("{}/{}", owner, repo), dest))
}

fn current_destination(msg: &Message) -> Destination {
    Destination {
        chat_id: msg.chat.id.0,
        thread_id: msg.thread_id,
    }
}

async fn reply(bot: &Bot, msg: &Message, text: impl Into<String>) {
    let mut req = bot
        .send_message(msg.chat.id, text)
        .parse_mode(ParseMode::Html)
        .disable_web_page_preview(true);
    if let Some(thread) = msg.thread_id {
        req = req.message_thread_id(thread);
    }
    if let Err(err) = req.await {
        warn!(?err, "failed to send reply");
    }
}

#[instrument(skip_all)]
pub async fn handle_update(bot: &Bot, ctx: &BotContext, msg: &Message) -> Result<()> {
    let Some(user) = msg.from() else {
        return Ok(());
    };
    let Some(text) = msg.text() else {
        return Ok(());
    };
    let Some(command) = parse_command(text) else {
        return Ok(());
    };
    if user.id.0 as i64 != ctx.owner_user_id {
        debug!(user_id = user.id.0, "ignoring command from non-owner");
        return Ok(());
    }

    match command {
        Command::Start | Command::Help => reply(bot, msg, HELP).await,
        Command::SetToken(token) => set_token(bot, ctx, msg, &token).await?,
        Command::RemoveToken => {
            db::remove_github_token(&ctx.pool).await?;
            db::set_monitoring_state(&ctx.pool, MonitoringState::Paused).await?;
            info!("GitHub token removed");
            let text = "🗑️ <b>Token removed.</b>\n\n\
                        Monitoring is paused. Use /settoken to add a new one.";
            reply(bot, msg, text).await;
        }
        Command::Status => status(bot, ctx, msg).await?,
        Command::SetInterval(args) => match args.parse::<u64>() {
            Ok(requested) => {
                let effective = db::set_monitor_interval(&ctx.pool, requested).await?;
                let note = if effective != requested {
                    " (raised to the minimum)"
                } else {
                    ""
                };
                let text = format!(
                    "✅ Interval set to {}{}. Applies from the next cycle.",
                    format_duration(effective),
                    note
                );
                reply(bot, msg, text).await;
            }
            Err(_) => reply(bot, msg, "Usage: <code>/setinterval &lt;seconds&gt;</code>").await,
        },
        Command::Pause => {
            db::set_monitoring_state(&ctx.pool, MonitoringState::Paused).await?;
            reply(bot, msg, "⏸ Monitoring paused.").await;
        }
        Command::Resume => {
            db::set_monitoring_state(&ctx.pool, MonitoringState::Active).await?;
            reply(bot, msg, "▶️ Monitoring resumed.").await;
        }
        Command::Digest(args) if args.is_empty() => {
            let mode = db::delivery_mode(&ctx.pool).await?;
            let queued = db::digest_queue_count(&ctx.pool).await?;
            let text = format!(
                "📬 Digest mode: <b>{}</b> ({} queued)\n\
                 Usage: <code>/digest off|daily|weekly</code>",
                mode, queued
            );
            reply(bot, msg, text).await;
        }
        Command::Digest(args) => match DeliveryMode::parse_mode(&args) {
            Some(mode) => {
                db::set_delivery_mode(&ctx.pool, mode).await?;
                reply(bot, msg, format!("✅ Digest mode set to <b>{}</b>.", mode)).await;
            }
            None => reply(bot, msg, "Usage: <code>/digest off|daily|weekly</code>").await,
        },
        Command::Flush => {
            let text = match ctx.digest.flush_now().await? {
                DigestOutcome::Delivered { drained: 0, .. } => {
                    "The digest queue is empty.".to_string()
                }
                DigestOutcome::Delivered {
                    drained,
                    sent,
                    failed,
                } => format!(
                    "📬 Digest delivered: {} of {} sent, {} failed.",
                    sent, drained, failed
                ),
                DigestOutcome::Skipped { mode } => format!("Digest skipped (mode {}).", mode),
            };
            reply(bot, msg, text).await;
        }
        Command::AddDest(args) => add_destination(bot, ctx, msg, &args).await?,
        Command::RemoveDest(args) => {
            let target = if args.eq_ignore_ascii_case("me") {
                Ok(Destination::chat(ctx.owner_user_id))
            } else {
                args.parse::<Destination>()
            };
            let Ok(dest) = target else {
                reply(bot, msg, REMOVE_DEST_USAGE).await;
                return Ok(());
            };
            let text = if db::remove_destination(&ctx.pool, dest).await? {
                format!("✅ Destination <code>{}</code> removed.", dest)
            } else {
                format!("❌ Destination <code>{}</code> not found.", dest)
            };
            reply(bot, msg, text).await;
        }
        Command::ListDest => {
            let dests = db::list_destinations(&ctx.pool).await?;
            if dests.is_empty() {
                let text = "There are no notification destinations configured.";
                reply(bot, msg, text).await;
            } else {
                let lines = dests
                    .iter()
                    .map(|d| format!("<code>{}</code>", d))
                    .collect::<Vec<_>>()
                    .join("\n");
                reply(bot, msg, format!("📍 <b>Destinations</b>\n\n{}", lines)).await;
            }
        }
        Command::Track(args) => track(bot, ctx, msg, &args).await?,
        Command::Untrack(args) => match parse_track_args(&args, current_destination(msg)) {
            Some((repo, dest)) => {
                let text = if db::remove_release_subscription(&ctx.pool, &repo, dest).await? {
                    format!(
                        "✅ Stopped release notifications for <b>{}</b> in <code>{}</code>.",
                        escape(&repo),
                        dest
                    )
                } else {
                    format!(
                        "❌ <b>{}</b> is not tracked for <code>{}</code>.",
                        escape(&repo),
                        dest
                    )
                };
                reply(bot, msg, text).await;
            }
            None => reply(bot, msg, UNTRACK_USAGE).await,
        },
        Command::Releases => {
            let tracked = db::tracked_releases_with_subscriptions(&ctx.pool).await?;
            if tracked.is_empty() {
                reply(bot, msg, "No repositories are tracked for releases.").await;
            } else {
                let lines = tracked
                    .iter()
                    .map(|t| {
                        let dests = t
                            .subscriptions
                            .iter()
                            .map(|d| d.to_string())
                            .collect::<Vec<_>>()
                            .join(", ");
                        format!(
                            "• <b>{}</b> ({}) → {}",
                            escape(&t.repo_full_name),
                            escape(t.last_release_tag.as_deref().unwrap_or("no release seen")),
                            dests
                        )
                    })
                    .collect::<Vec<_>>()
                    .join("\n");
                reply(bot, msg, format!("🚀 <b>Tracked releases</b>\n\n{}", lines)).await;
            }
        }
        Command::Ai(args) => set_ai(bot, ctx, msg, AiSetting::Summary, &args).await?,
        Command::AiMedia(args) => set_ai(bot, ctx, msg, AiSetting::Media, &args).await?,
        Command::Unknown(name) => {
            debug!(command = %name, "unknown command");
            reply(bot, msg, "Unknown command. See /help.").await;
        }
    }
    Ok(())
}

async fn set_token(bot: &Bot, ctx: &BotContext, msg: &Message, token: &str) -> Result<()> {
    if token.is_empty() {
        reply(bot, msg, "Usage: <code>/settoken &lt;token&gt;</code>").await;
        return Ok(());
    }
    // The token should not linger in the chat history.
    if let Err(err) = bot.delete_message(msg.chat.id, msg.id).await {
        warn!(?err, "could not delete token message");
    }

    db::set_github_token(&ctx.pool, token).await?;
    match ctx.github.get_authenticated_user().await {
        Ok(user) => {
            db::clear_last_error(&ctx.pool).await?;
            db::set_monitoring_state(&ctx.pool, MonitoringState::Active).await?;
            db::add_destination(&ctx.pool, Destination::chat(ctx.owner_user_id)).await?;
            info!(login = %user.login, "GitHub token validated");
            reply(
                bot,
                msg,
                format!(
                    "✅ <b>Token validated!</b>\n\n\
                     Connected to <b>@{}</b>. Your DM is a notification destination.",
                    escape(&user.login)
                ),
            )
            .await;
        }
        Err(err) if err.is_unauthorized() => {
            db::remove_github_token(&ctx.pool).await?;
            warn!("rejected GitHub token");
            reply(bot, msg, "❌ <b>Invalid token.</b>").await;
        }
        Err(err) => {
            warn!(%err, "could not verify GitHub token");
            reply(
                bot,
                msg,
                format!("⚠️ Token saved but could not be verified: {}", escape(&err.to_string())),
            )
            .await;
        }
    }
    Ok(())
}

/// Everything `/status` shows once the upstream lookups are done.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct StatusReport {
    pub account: String,
    pub rate_limit: String,
    pub interval_secs: u64,
    pub state: MonitoringState,
    pub mode: DeliveryMode,
    pub queued: i64,
    pub next_digest: Option<DateTime<Utc>>,
    pub destinations: usize,
    pub tracked: usize,
    pub ai_summaries: bool,
    pub ai_media: bool,
    pub last_error: Option<String>,
}

fn on_off(enabled: bool) -> &'static str {
    if enabled {
        "on"
    } else {
        "off"
    }
}

impl StatusReport {
    pub fn render(&self) -> String {
        let paused = self.state.is_paused();
        let mut text = format!(
            "📊 <b>Status</b>\n\n\
             👤 Account: {}\n\
             ⏱ Rate limit: {}\n\
             🔁 Interval: {}\n\
             {} Monitoring: {}\n\
             📬 Digest: {} ({} queued)",
            self.account,
            self.rate_limit,
            format_duration(self.interval_secs),
            if paused { "⏸" } else { "▶️" },
            if paused { "paused" } else { "active" },
            self.mode,
            self.queued,
        );
        if let Some(next) = self.next_digest {
            text.push_str(&format!(
                "\n🗓 Next digest: {}",
                next.format("%Y-%m-%d %H:%M UTC")
            ));
        }
        text.push_str(&format!(
            "\n📍 Destinations: {}\n\
             🚀 Tracked releases: {}\n\
             🤖 AI summaries: {}, media: {}",
            self.destinations,
            self.tracked,
            on_off(self.ai_summaries),
            on_off(self.ai_media),
        ));
        if let Some(err) = &self.last_error {
            text.push_str(&format!("\n\n⚠️ <b>Last error:</b> {}", escape(err)));
        }
        text
    }
}

async fn status(bot: &Bot, ctx: &BotContext, msg: &Message) -> Result<()> {
    if !db::github_token_exists(&ctx.pool).await? {
        reply(bot, msg, "No GitHub token is set. Use /settoken.").await;
        return Ok(());
    }

    let (user, limit) = tokio::join!(
        ctx.github.get_authenticated_user(),
        ctx.github.get_rate_limit()
    );
    let account = match user {
        Ok(u) => format!("@{}", escape(&u.login)),
        Err(err) => format!("unavailable ({})", err.status_code()),
    };
    let rate_limit = match limit {
        Ok(l) => {
            let core = l.resources.core;
            let reset_in = (core.reset - Utc::now().timestamp()).max(0) as u64;
            format!(
                "{}/{} (resets in {})",
                core.remaining,
                core.limit,
                format_duration(reset_in)
            )
        }
        Err(err) => format!("unavailable ({})", err.status_code()),
    };

    let mode = db::delivery_mode(&ctx.pool).await?;
    let report = StatusReport {
        account,
        rate_limit,
        interval_secs: db::monitor_interval(&ctx.pool, ctx.default_interval_secs).await?,
        state: db::monitoring_state(&ctx.pool).await?,
        mode,
        queued: db::digest_queue_count(&ctx.pool).await?,
        next_digest: mode
            .cadence()
            .map(|c| ctx.digest.schedule().next_fire(c, Utc::now())),
        destinations: db::list_destinations(&ctx.pool).await?.len(),
        tracked: db::tracked_releases_with_subscriptions(&ctx.pool)
            .await?
            .len(),
        ai_summaries: db::ai_features_enabled(&ctx.pool).await?,
        ai_media: db::ai_media_selection_enabled(&ctx.pool).await?,
        last_error: db::last_error(&ctx.pool).await?,
    };
    reply(bot, msg, report.render()).await;
    Ok(())
}

#[derive(Debug, Clone, Copy)]
enum AiSetting {
    Summary,
    Media,
}

async fn set_ai(
    bot: &Bot,
    ctx: &BotContext,
    msg: &Message,
    setting: AiSetting,
    args: &str,
) -> Result<()> {
    let (label, usage) = match setting {
        AiSetting::Summary => ("AI README summaries", "/ai on|off"),
        AiSetting::Media => ("AI preview media", "/aimedia on|off"),
    };
    let Some(enabled) = parse_switch(args) else {
        let current = match setting {
            AiSetting::Summary => db::ai_features_enabled(&ctx.pool).await?,
            AiSetting::Media => db::ai_media_selection_enabled(&ctx.pool).await?,
        };
        let text = format!(
            "{}: <b>{}</b>\nUsage: <code>{}</code>",
            label,
            on_off(current),
            usage
        );
        reply(bot, msg, text).await;
        return Ok(());
    };

    match setting {
        AiSetting::Summary => db::set_ai_features_enabled(&ctx.pool, enabled).await?,
        AiSetting::Media => db::set_ai_media_selection_enabled(&ctx.pool, enabled).await?,
    }
    info!(?setting, enabled, "AI setting changed");
    let mut text = format!("✅ {} turned <b>{}</b>.", label, on_off(enabled));
    if enabled && !ctx.ai_configured {
        text.push_str("\nNo Gemini key is configured, so nothing changes until one is added.");
    }
    reply(bot, msg, text).await;
    Ok(())
}

/// Verifies the bot can post to the target before storing it.
async fn add_destination(bot: &Bot, ctx: &BotContext, msg: &Message, args: &str) -> Result<()> {
    let Ok(dest) = args.parse::<Destination>() else {
        reply(
            bot,
            msg,
            "Usage: <code>/add_dest &lt;chatId[/threadId]&gt;</code>\n\
             Channel: <code>/add_dest -100123456789</code>\n\
             Topic: <code>/add_dest -100123456789/4</code>",
        )
        .await;
        return Ok(());
    };

    let mut probe = bot.send_message(ChatId(dest.chat_id), "✅ Verification successful.");
    if let Some(thread) = dest.thread_id {
        probe = probe.message_thread_id(thread);
    }
    match probe.await {
        Ok(sent) => {
            if let Err(err) = bot.delete_message(sent.chat.id, sent.id).await {
                debug!(?err, "could not delete verification message");
            }
            let text = if db::add_destination(&ctx.pool, dest).await? {
                format!("✅ Destination <code>{}</code> added.", dest)
            } else {
                format!("Destination <code>{}</code> already exists.", dest)
            };
            reply(bot, msg, text).await;
        }
        Err(err) => {
            warn!(%dest, ?err, "destination verification failed");
            let text = "❌ <b>Failed to add destination.</b>\n\n\
                        Make sure the bot is a member of the chat and may post there.";
            reply(bot, msg, text).await;
        }
    }
    Ok(())
}

async fn track(bot: &Bot, ctx: &BotContext, msg: &Message, args: &str) -> Result<()> {
    let Some((repo, dest)) = parse_track_args(args, current_destination(msg)) else {
        let usage = "Usage: <code>/track owner/repo [chatId[/threadId]]</code>";
        reply(bot, msg, usage).await;
        return Ok(());
    };
    let canonical = match ctx.github.get_repository(&repo).await {
        Ok(r) => r.full_name,
        Err(err) if err.is_not_found() => {
            let text = format!("❌ Repository <b>{}</b> not found.", escape(&repo));
            reply(bot, msg, text).await;
            return Ok(());
        }
        Err(err) => {
            let text = format!(
                "⚠️ Could not look up <b>{}</b>: {}",
                escape(&repo),
                escape(&err.to_string())
            );
            reply(bot, msg, text).await;
            return Ok(());
        }
    };
    let name = escape(&canonical);
    let text = if db::add_release_subscription(&ctx.pool, &canonical, dest).await? {
        format!("✅ Tracking releases of <b>{}</b> in <code>{}</code>.", name, dest)
    } else {
        format!("<b>{}</b> is already tracked for <code>{}</code>.", name, dest)
    };
    reply(bot, msg, text).await;
    Ok(())
}
