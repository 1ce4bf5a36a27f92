use anyhow::{anyhow, Result};
use async_trait::async_trait;
use futures::future::join_all;
use reqwest::Url;
use std::sync::Arc;
use teloxide::prelude::*;
use teloxide::types::{
    InputFile, InputMedia, InputMediaAnimation, InputMediaPhoto, InputMediaVideo, ParseMode,
};
use teloxide::RequestError;
use tracing::{debug, info, instrument, warn};

use crate::db::{self, Pool};
use crate::format::{self, MediaKind};
use crate::github::{GitHubService, Release, Repository};
use crate::model::Destination;
use crate::summarizer::Summarize;

/// Telegram rejects captions longer than this.
const CAPTION_LIMIT: usize = 1024;

/// Outbound side of the bot: where formatted notifications go.
#[async_trait]
pub trait Notify: Send + Sync {
    /// Preview of a newly starred repository, sent to every destination.
    async fn send_repo_notification(&self, repo: &Repository) -> Result<()>;

    async fn send_release_notification(
        &self,
        release: &Release,
        repo: &Repository,
        destinations: &[Destination],
    ) -> Result<()>;

    /// Direct message to the bot owner.
    async fn alert_owner(&self, text: &str) -> Result<()>;
}

pub struct TelegramNotifier {
    bot: Bot,
    pool: Pool,
    github: Arc<dyn GitHubService>,
    summarizer: Option<Arc<dyn Summarize>>,
    owner: ChatId,
}

/// Media picked for a preview, with the kind that decides how it is sent.
#[derive(Debug, Clone)]
struct PreviewMedia {
    url: Url,
    kind: MediaKind,
}

impl TelegramNotifier {
    pub fn new(
        bot: Bot,
        pool: Pool,
        github: Arc<dyn GitHubService>,
        summarizer: Option<Arc<dyn Summarize>>,
        owner_user_id: i64,
    ) -> Self {
        Self {
            bot,
            pool,
            github,
            summarizer,
            owner: ChatId(owner_user_id),
        }
    }

    /// README summary and preview media, each only when enabled.
    async fn enrich(
        &self,
        repo: &Repository,
        readme: Option<&str>,
    ) -> (Option<String>, Vec<PreviewMedia>) {
        let (Some(summarizer), Some(readme)) = (self.summarizer.as_ref(), readme) else {
            return (None, Vec::new());
        };
        if !db::ai_features_enabled(&self.pool).await.unwrap_or(false) {
            return (None, Vec::new());
        }

        let summary = match summarizer.summarize_readme(readme).await {
            Ok(s) => s,
            Err(err) => {
                warn!(?err, repo = %repo.full_name, "README summary failed");
                None
            }
        };

        if !db::ai_media_selection_enabled(&self.pool).await.unwrap_or(false) {
            return (summary, Vec::new());
        }
        let candidates = format::extract_media_from_readme(
            readme,
            &repo.owner.login,
            &repo.name,
            &repo.default_branch,
        );
        if candidates.is_empty() {
            return (summary, Vec::new());
        }
        let selected = match summarizer.select_preview_media(readme, &candidates).await {
            Ok(urls) => urls,
            Err(err) => {
                warn!(?err, repo = %repo.full_name, "preview media selection failed");
                Vec::new()
            }
        };
        let media = selected
            .iter()
            .filter_map(|u| {
                let kind = format::media_kind(u);
                Url::parse(u).ok().map(|url| PreviewMedia { url, kind })
            })
            .collect();
        (summary, media)
    }

    async fn send_text(
        &self,
        dest: Destination,
        text: &str,
        disable_preview: bool,
    ) -> Result<(), RequestError> {
        let mut req = self
            .bot
            .send_message(ChatId(dest.chat_id), text)
            .parse_mode(ParseMode::Html)
            .disable_web_page_preview(disable_preview);
        if let Some(thread) = dest.thread_id {
            req = req.message_thread_id(thread);
        }
        req.await.map(|_| ())
    }

    /// Text send with one retry without link preview when Telegram cannot
    /// fetch the page.
    async fn send_text_with_fallback(&self, dest: Destination, text: &str) -> Result<()> {
        match self.send_text(dest, text, false).await {
            Ok(()) => Ok(()),
            Err(err) if err.to_string().contains("WEBPAGE_CURL_FAILED") => {
                warn!(%dest, "link preview failed; retrying without preview");
                self.send_text(dest, text, true).await?;
                Ok(())
            }
            Err(err) => Err(err.into()),
        }
    }

    async fn send_media(
        &self,
        dest: Destination,
        media: &[PreviewMedia],
        caption: Option<&str>,
    ) -> Result<(), RequestError> {
        let chat = ChatId(dest.chat_id);
        if let [single] = media {
            let file = InputFile::url(single.url.clone());
            macro_rules! send_single {
                ($req:expr) => {{
                    let mut req = $req;
                    if let Some(c) = caption {
                        req = req.caption(c).parse_mode(ParseMode::Html);
                    }
                    if let Some(thread) = dest.thread_id {
                        req = req.message_thread_id(thread);
                    }
                    req.await.map(|_| ())
                }};
            }
            return match single.kind {
                MediaKind::Photo => send_single!(self.bot.send_photo(chat, file)),
                MediaKind::Video => send_single!(self.bot.send_video(chat, file)),
                MediaKind::Animation => send_single!(self.bot.send_animation(chat, file)),
            };
        }

        let group: Vec<InputMedia> = media
            .iter()
            .enumerate()
            .map(|(i, m)| {
                let file = InputFile::url(m.url.clone());
                let caption = caption.filter(|_| i == 0);
                match m.kind {
                    MediaKind::Photo => {
                        let mut item = InputMediaPhoto::new(file);
                        if let Some(c) = caption {
                            item = item.caption(c).parse_mode(ParseMode::Html);
                        }
                        InputMedia::Photo(item)
                    }
                    MediaKind::Video => {
                        let mut item = InputMediaVideo::new(file);
                        if let Some(c) = caption {
                            item = item.caption(c).parse_mode(ParseMode::Html);
                        }
                        InputMedia::Video(item)
                    }
                    MediaKind::Animation => {
                        let mut item = InputMediaAnimation::new(file);
                        if let Some(c) = caption {
                            item = item.caption(c).parse_mode(ParseMode::Html);
                        }
                        InputMedia::Animation(item)
                    }
                }
            })
            .collect();
        let mut req = self.bot.send_media_group(chat, group);
        if let Some(thread) = dest.thread_id {
            req = req.message_thread_id(thread);
        }
        req.await.map(|_| ())
    }

    /// One destination: media first when there is any, text otherwise or as
    /// the fallback.
    async fn deliver(&self, dest: Destination, text: &str, media: &[PreviewMedia]) -> Result<()> {
        if media.is_empty() {
            return self.send_text_with_fallback(dest, text).await;
        }

        let fits = text.chars().count() <= CAPTION_LIMIT;
        match self.send_media(dest, media, fits.then_some(text)).await {
            Ok(()) if fits => Ok(()),
            Ok(()) => self.send_text_with_fallback(dest, text).await,
            Err(err) => {
                warn!(%dest, ?err, "media send failed; falling back to text");
                self.send_text_with_fallback(dest, text).await
            }
        }
    }

    /// Deliver to every destination concurrently. Fails only if none succeeded.
    async fn broadcast(
        &self,
        destinations: &[Destination],
        text: &str,
        media: &[PreviewMedia],
    ) -> Result<()> {
        let results = join_all(destinations.iter().map(|d| self.deliver(*d, text, media))).await;
        let mut delivered = 0usize;
        for (dest, res) in destinations.iter().zip(results) {
            match res {
                Ok(()) => delivered += 1,
                Err(err) => warn!(%dest, ?err, "failed to deliver notification"),
            }
        }
        if delivered == 0 && !destinations.is_empty() {
            return Err(anyhow!("no destination accepted the notification"));
        }
        Ok(())
    }
}

#[async_trait]
impl Notify for TelegramNotifier {
    #[instrument(skip_all, fields(repo = %repo.full_name))]
    async fn send_repo_notification(&self, repo: &Repository) -> Result<()> {
        let destinations = db::list_destinations(&self.pool).await?;
        if destinations.is_empty() {
            debug!("no destinations configured; dropping notification");
            return Ok(());
        }

        let (languages, release, readme) = tokio::join!(
            self.github.languages(&repo.full_name),
            self.github.latest_release(&repo.full_name),
            self.github.readme(&repo.full_name),
        );
        let languages = languages
            .map_err(|err| debug!(?err, "languages unavailable"))
            .ok();
        let release = release
            .map_err(|err| debug!(?err, "latest release unavailable"))
            .ok()
            .flatten();
        let readme = readme
            .map_err(|err| debug!(?err, "readme unavailable"))
            .ok()
            .flatten();

        let (summary, media) = self.enrich(repo, readme.as_deref()).await;
        let text = format::format_repository_preview(
            repo,
            languages.as_ref(),
            release.as_ref(),
            summary.as_deref(),
            chrono::Utc::now(),
        );

        self.broadcast(&destinations, &text, &media).await?;
        info!(
            destinations = destinations.len(),
            media = media.len(),
            "repository notification sent"
        );
        Ok(())
    }

    #[instrument(skip_all, fields(repo = %repo.full_name, tag = %release.tag_name))]
    async fn send_release_notification(
        &self,
        release: &Release,
        repo: &Repository,
        destinations: &[Destination],
    ) -> Result<()> {
        let text = format::format_release(release, repo);
        self.broadcast(destinations, &text, &[]).await?;
        info!(destinations = destinations.len(), "release notification sent");
        Ok(())
    }

    async fn alert_owner(&self, text: &str) -> Result<()> {
        self.bot
            .send_message(self.owner, text)
            .parse_mode(ParseMode::Html)
            .await?;
        Ok(())
    }
}
