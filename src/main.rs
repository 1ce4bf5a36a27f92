use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::prelude::*;
use tokio_util::sync::CancellationToken;
use tracing::{error, info, warn};

use tg_starbot::config;
use tg_starbot::db;
use tg_starbot::digest::{DigestSchedule, DigestScheduler};
use tg_starbot::github::{GitHubClient, GitHubOptions, GitHubService, ResponseCache};
use tg_starbot::handlers::{self, BotContext};
use tg_starbot::model::Cadence;
use tg_starbot::monitor::{Monitor, MonitorSettings};
use tg_starbot::notifier::{Notify, TelegramNotifier};
use tg_starbot::summarizer::{GeminiSummarizer, Summarize};

#[derive(Debug, Parser)]
#[command(author, version, about)]
struct Args {
    /// YAML config; see `config::example()` for the layout
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,
}

#[tokio::main]
async fn main() -> Result<()> {
    tracing_subscriber::fmt()
        .with_env_filter(tracing_subscriber::EnvFilter::from_default_env())
        .with_target(false)
        .compact()
        .init();

    let args = Args::parse();
    let cfg = config::load(Some(&args.config))?;
    cfg.ensure_dirs()?;

    let pool = db::init_pool(&cfg.database_url()).await?;
    db::run_migrations(&pool).await?;

    let shutdown = CancellationToken::new();
    let cache = Arc::new(ResponseCache::new());
    let github = GitHubClient::new(pool.clone(), cache, GitHubOptions::from_config(&cfg.github)?)?
        .with_shutdown(shutdown.clone());
    let github_service: Arc<dyn GitHubService> = Arc::new(github.clone());

    let summarizer: Option<Arc<dyn Summarize>> = match &cfg.gemini {
        Some(g) => Some(Arc::new(GeminiSummarizer::from_config(g)?)),
        None => {
            info!("no gemini section; AI enrichment disabled");
            None
        }
    };

    let bot = Bot::new(cfg.telegram.bot_token.clone());
    let notifier: Arc<dyn Notify> = Arc::new(TelegramNotifier::new(
        bot.clone(),
        pool.clone(),
        github_service.clone(),
        summarizer,
        cfg.telegram.owner_user_id,
    ));

    let monitor = Arc::new(Monitor::new(
        pool.clone(),
        github_service.clone(),
        notifier.clone(),
        MonitorSettings::from_config(&cfg),
    ));
    let digest = Arc::new(DigestScheduler::new(
        pool.clone(),
        github_service,
        notifier,
        DigestSchedule::from_config(&cfg.digest)?,
        Duration::from_millis(cfg.app.send_delay_ms),
    ));

    let mut tasks = Vec::new();
    {
        let monitor = monitor.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move { monitor.run_stars_loop(token).await }));
    }
    {
        let monitor = monitor.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move { monitor.run_releases_loop(token).await }));
    }
    for cadence in [Cadence::Daily, Cadence::Weekly] {
        let digest = digest.clone();
        let token = shutdown.clone();
        tasks.push(tokio::spawn(async move { digest.run(cadence, token).await }));
    }

    let ctx = Arc::new(BotContext {
        pool,
        github,
        digest,
        owner_user_id: cfg.telegram.owner_user_id,
        default_interval_secs: cfg.app.monitor_interval_seconds,
        ai_configured: cfg.gemini.is_some(),
    });

    info!("starting telegram bot");
    teloxide::repl(bot, move |bot: Bot, msg: Message| {
        let ctx = ctx.clone();
        async move {
            if let Err(err) = handlers::handle_update(&bot, &ctx, &msg).await {
                error!(?err, "failed to handle update");
            }
            respond(())
        }
    })
    .await;

    info!("shutting down background tasks");
    shutdown.cancel();
    for task in tasks {
        if let Err(err) = task.await {
            warn!(?err, "background task panicked");
        }
    }
    Ok(())
}
