use anyhow::Result;
use clap::Parser;
use std::path::PathBuf;
use std::sync::Arc;
use std::time::Duration;
use teloxide::Bot;
use tracing::info;

use tg_starbot::config;
use tg_starbot::db;
use tg_starbot::digest::{DigestOutcome, DigestSchedule, DigestScheduler};
use tg_starbot::github::{GitHubClient, GitHubOptions, GitHubService, ResponseCache};
use tg_starbot::model::Cadence;
use tg_starbot::notifier::{Notify, TelegramNotifier};
use tg_starbot::summarizer::{GeminiSummarizer, Summarize};

#[derive(Debug, Parser)]
#[command(
    author,
    version,
    about = "Deliver the pending digest queue once and exit"
)]
struct Args {
    /// Path to YAML config file
    #[arg(long, default_value = "config.yaml")]
    config: PathBuf,

    /// Only deliver if the stored digest mode is this cadence (daily or weekly)
    #[arg(long)]
    cadence: Option<String>,

    /// Print the queue size and exit without delivering
    #[arg(long)]
    dry_run: bool,
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

    let queued = db::digest_queue_count(&pool).await?;
    info!(queued, mode = %db::delivery_mode(&pool).await?, "digest queue state");
    if args.dry_run || queued == 0 {
        return Ok(());
    }

    let cadence = match args.cadence.as_deref().map(str::to_ascii_lowercase).as_deref() {
        None => None,
        Some("daily") => Some(Cadence::Daily),
        Some("weekly") => Some(Cadence::Weekly),
        Some(other) => anyhow::bail!("unknown cadence '{}': expected daily or weekly", other),
    };

    let github: Arc<dyn GitHubService> = Arc::new(GitHubClient::new(
        pool.clone(),
        Arc::new(ResponseCache::new()),
        GitHubOptions::from_config(&cfg.github)?,
    )?);
    let summarizer: Option<Arc<dyn Summarize>> = match &cfg.gemini {
        Some(g) => Some(Arc::new(GeminiSummarizer::from_config(g)?)),
        None => None,
    };
    let notifier: Arc<dyn Notify> = Arc::new(TelegramNotifier::new(
        Bot::new(cfg.telegram.bot_token.clone()),
        pool.clone(),
        github.clone(),
        summarizer,
        cfg.telegram.owner_user_id,
    ));
    let scheduler = DigestScheduler::new(
        pool,
        github,
        notifier,
        DigestSchedule::from_config(&cfg.digest)?,
        Duration::from_millis(cfg.app.send_delay_ms),
    );

    let outcome = match cadence {
        Some(c) => scheduler.fire(c).await?,
        None => scheduler.flush_now().await?,
    };
    match outcome {
        DigestOutcome::Skipped { mode } => info!(%mode, "stored mode does not match; nothing sent"),
        DigestOutcome::Delivered { drained, sent, failed } => {
            info!(drained, sent, failed, "digest flushed")
        }
    }
    Ok(())
}
