//! Telegram HTML rendering for repositories, releases and users.

use chrono::{DateTime, Utc};
use once_cell::sync::Lazy;
use regex::Regex;
use teloxide::utils::html::escape;

use crate::github::{Languages, Release, Repository};

const RELEASE_NOTES_LIMIT: usize = 1000;
const MEDIA_EXTENSIONS: &[&str] = &[
    ".png", ".jpg", ".jpeg", ".gif", ".webp", ".mp4", ".mov", ".webm",
];

static README_MEDIA: Lazy<Regex> = Lazy::new(|| {
    Regex::new(r#"!\[[^\]]*\]\(\s*([^)\s]+)[^)]*\)|<img[^>]*?src=["']([^"']+)["']"#)
        .expect("valid media regex")
});
static REPO_URL: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"github\.com/([^/\s]+)/([^/\s?#]+)").expect("valid url regex"));
static REPO_SLUG: Lazy<Regex> =
    Lazy::new(|| Regex::new(r"^([^/\s]+)/([^/\s]+)$").expect("valid slug regex"));

/// `1234` -> `1.2K`, `3_400_000` -> `3.4M`.
pub fn format_number(n: u64) -> String {
    if n >= 1_000_000 {
        format!("{:.1}M", n as f64 / 1_000_000.0)
    } else if n >= 1_000 {
        format!("{:.1}K", n as f64 / 1_000.0)
    } else {
        n.to_string()
    }
}

/// Share of each language by bytes, largest first, at most `limit` entries.
pub fn top_languages(languages: &Languages, limit: usize) -> Vec<(String, f64)> {
    let total: u64 = languages.values().sum();
    if total == 0 {
        return Vec::new();
    }
    let mut shares: Vec<(String, f64)> = languages
        .iter()
        .map(|(lang, bytes)| (lang.clone(), *bytes as f64 * 100.0 / total as f64))
        .collect();
    shares.sort_by(|a, b| b.1.total_cmp(&a.1).then_with(|| a.0.cmp(&b.0)));
    shares.truncate(limit);
    shares
}

pub fn time_ago(ts: Option<DateTime<Utc>>, now: DateTime<Utc>) -> String {
    let Some(ts) = ts else {
        return "N/A".into();
    };
    let secs = (now - ts).num_seconds().max(0);
    let (n, unit) = match secs {
        s if s < 60 => return "just now".into(),
        s if s < 3_600 => (s / 60, "minute"),
        s if s < 86_400 => (s / 3_600, "hour"),
        s if s < 2_592_000 => (s / 86_400, "day"),
        s if s < 31_536_000 => (s / 2_592_000, "month"),
        s => (s / 31_536_000, "year"),
    };
    format!("{} {}{} ago", n, unit, if n == 1 { "" } else { "s" })
}

/// Human form of an interval, e.g. `3600 seconds (approx. 60.0 minutes)`.
pub fn format_duration(secs: u64) -> String {
    if secs < 120 {
        return format!("{} seconds", secs);
    }
    let minutes = secs as f64 / 60.0;
    if minutes < 120.0 {
        return format!("{} seconds (approx. {:.1} minutes)", secs, minutes);
    }
    let hours = minutes / 60.0;
    if hours < 48.0 {
        return format!("{} seconds (approx. {:.1} hours)", secs, hours);
    }
    format!("{} seconds (approx. {:.1} days)", secs, hours / 24.0)
}

pub fn format_repository_preview(
    repo: &Repository,
    languages: Option<&Languages>,
    latest_release: Option<&Release>,
    summary: Option<&str>,
    now: DateTime<Utc>,
) -> String {
    let description = summary
        .map(str::to_owned)
        .or_else(|| repo.description.clone())
        .filter(|d| !d.trim().is_empty())
        .unwrap_or_else(|| "No description available.".into());

    let release = match latest_release {
        Some(r) => format!("<a href='{}'>{}</a>", escape(&r.html_url), escape(&r.tag_name)),
        None => "No official releases".into(),
    };

    let langs = languages
        .map(|l| top_languages(l, 3))
        .filter(|l| !l.is_empty())
        .map(|l| {
            l.iter()
                .map(|(lang, pct)| {
                    let tag = lang.replace(['-', ' '], "_");
                    format!("#{} (<code>{:.1}%</code>)", escape(&tag), pct)
                })
                .collect::<Vec<_>>()
                .join(" ")
        })
        .unwrap_or_else(|| "Not specified".into());

    let url = escape(&repo.html_url);
    format!(
        "📦 <a href='{url}'>{name}</a>\n\n\
         📝 <b>Desc:</b>\n{desc}\n\n\
         <blockquote>⭐ Stars: <b>{stars}</b> | 🍴 Forks: <b>{forks}</b> | \
         🪲 Open Issues: <b>{issues}</b></blockquote>\n\n\
         🚀 <b>Latest Release:</b> {release}\n\
         ⏳ <b>Last updated:</b> {updated}\n\n\
         💻 <b>Lang's:</b> {langs}\n\n\
         <a href='{url}'>🔗 View on GitHub</a>",
        url = url,
        name = escape(&repo.full_name),
        desc = escape(description.trim()),
        stars = format_number(repo.stargazers_count),
        forks = format_number(repo.forks_count),
        issues = repo.open_issues_count,
        release = release,
        updated = time_ago(repo.pushed_at, now),
        langs = langs,
    )
}

pub fn format_release(release: &Release, repo: &Repository) -> String {
    let mut out = format!(
        "🚀 <b>New release</b> of <a href='{}'>{}</a>\n\n🏷 <b>{}</b>",
        escape(&repo.html_url),
        escape(&repo.full_name),
        escape(&release.tag_name),
    );
    let display_name = release
        .name
        .as_deref()
        .filter(|n| !n.is_empty() && *n != release.tag_name);
    if let Some(name) = display_name {
        out.push_str(&format!(" ({})", escape(name)));
    }
    if release.prerelease {
        out.push_str(" <i>pre-release</i>");
    }
    if let Some(body) = release.body.as_deref().map(str::trim).filter(|b| !b.is_empty()) {
        let notes = truncate_chars(body, RELEASE_NOTES_LIMIT);
        out.push_str(&format!("\n\n<blockquote>{}</blockquote>", escape(&notes)));
    }
    out.push_str(&format!(
        "\n\n<a href='{}'>🔗 View release</a>",
        escape(&release.html_url)
    ));
    out
}

fn truncate_chars(s: &str, max: usize) -> String {
    if s.chars().count() <= max {
        return s.to_string();
    }
    let mut out: String = s.chars().take(max).collect();
    out.push('…');
    out
}

/// How a media URL should be sent, judged by its file extension.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum MediaKind {
    Photo,
    Video,
    Animation,
}

pub fn media_kind(url: &str) -> MediaKind {
    let path = url_path(url).to_ascii_lowercase();
    if [".mp4", ".mov", ".webm"].iter().any(|e| path.ends_with(e)) {
        MediaKind::Video
    } else if path.ends_with(".gif") {
        MediaKind::Animation
    } else {
        MediaKind::Photo
    }
}

fn url_path(url: &str) -> &str {
    url.split(['?', '#']).next().unwrap_or(url)
}

/// Absolute URL for a README reference; relative paths point into the raw
/// content of `branch`.
pub fn resolve_media_url(url: &str, owner: &str, repo: &str, branch: &str) -> String {
    let url = url.trim();
    if url.starts_with("http://") || url.starts_with("https://") {
        return url.to_string();
    }
    let clean = url.trim_start_matches(['.', '/']);
    format!("https://raw.githubusercontent.com/{}/{}/{}/{}", owner, repo, branch, clean)
}

/// Image and video references in a README, made absolute, deduplicated, and
/// limited to file types Telegram can send.
pub fn extract_media_from_readme(
    markdown: &str,
    owner: &str,
    repo: &str,
    branch: &str,
) -> Vec<String> {
    let mut out: Vec<String> = Vec::new();
    for caps in README_MEDIA.captures_iter(markdown) {
        let Some(raw) = caps.get(1).or_else(|| caps.get(2)) else {
            continue;
        };
        let url = resolve_media_url(raw.as_str(), owner, repo, branch);
        let path = url_path(&url).to_ascii_lowercase();
        if MEDIA_EXTENSIONS.iter().any(|e| path.ends_with(e)) && !out.contains(&url) {
            out.push(url);
        }
    }
    out
}

/// Accepts `owner/repo` or any github.com repository URL.
pub fn parse_repo_input(text: &str) -> Option<(String, String)> {
    let text = text.trim();
    let caps = REPO_URL.captures(text).or_else(|| REPO_SLUG.captures(text))?;
    let owner = caps.get(1)?.as_str();
    let repo = caps.get(2)?.as_str();
    let repo = repo.strip_suffix(".git").unwrap_or(repo);
    if owner.is_empty() || repo.is_empty() {
        return None;
    }
    Some((owner.to_string(), repo.to_string()))
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::github::model::Owner;
    use chrono::{Duration, TimeZone};

    fn repo() -> Repository {
        Repository {
            full_name: "tokio-rs/tokio".into(),
            name: "tokio".into(),
            owner: Owner {
                login: "tokio-rs".into(),
                avatar_url: None,
            },
            html_url: "https://github.com/tokio-rs/tokio".into(),
            description: Some("A runtime for <async> Rust".into()),
            stargazers_count: 25_400,
            forks_count: 2_300,
            open_issues_count: 312,
            pushed_at: None,
            default_branch: "master".into(),
        }
    }

    #[test]
    fn numbers_get_suffixes() {
        assert_eq!(format_number(999), "999");
        assert_eq!(format_number(1_250), "1.2K");
        assert_eq!(format_number(3_400_000), "3.4M");
    }

    #[test]
    fn time_ago_buckets() {
        let now = Utc.with_ymd_and_hms(2024, 6, 1, 12, 0, 0).unwrap();
        assert_eq!(time_ago(None, now), "N/A");
        assert_eq!(time_ago(Some(now - Duration::seconds(10)), now), "just now");
        assert_eq!(time_ago(Some(now - Duration::minutes(1)), now), "1 minute ago");
        assert_eq!(time_ago(Some(now - Duration::hours(5)), now), "5 hours ago");
        assert_eq!(time_ago(Some(now - Duration::days(3)), now), "3 days ago");
        assert_eq!(time_ago(Some(now - Duration::days(800)), now), "2 years ago");
    }

    #[test]
    fn languages_ranked_by_share() {
        let langs: Languages = [("Rust", 750), ("C", 200), ("Shell", 40), ("Nix", 10)]
            .into_iter()
            .map(|(name, bytes)| (name.to_string(), bytes))
            .collect();
        let top = top_languages(&langs, 3);
        assert_eq!(top.len(), 3);
        assert_eq!(top[0].0, "Rust");
        assert!((top[0].1 - 75.0).abs() < 1e-9);
        assert_eq!(top[2].0, "Shell");
        assert!(top_languages(&Languages::new(), 3).is_empty());
    }

    #[test]
    fn preview_escapes_and_prefers_summary() {
        let now = Utc::now();
        let text = format_repository_preview(&repo(), None, None, None, now);
        assert!(text.contains("A runtime for &lt;async&gt; Rust"));
        assert!(text.contains("Stars: <b>25.4K</b>"));
        assert!(text.contains("No official releases"));
        assert!(text.contains("Not specified"));

        let text = format_repository_preview(&repo(), None, None, Some("Summarised."), now);
        assert!(text.contains("Summarised."));
        assert!(!text.contains("runtime for"));
    }

    #[test]
    fn release_message_truncates_notes() {
        let release = Release {
            tag_name: "v1.0.0".into(),
            name: Some("First".into()),
            html_url: "https://github.com/tokio-rs/tokio/releases/tag/v1.0.0".into(),
            body: Some("x".repeat(RELEASE_NOTES_LIMIT + 50)),
            published_at: None,
            prerelease: false,
        };
        let text = format_release(&release, &repo());
        assert!(text.contains("<b>v1.0.0</b> (First)"));
        assert!(text.contains('…'));
        assert!(!text.contains(&"x".repeat(RELEASE_NOTES_LIMIT + 1)));
    }

    #[test]
    fn readme_media_is_resolved_and_filtered() {
        let md = r#"
![logo](./assets/logo.png)
![badge](https://img.shields.io/badge/ci-passing-green)
<img width="400" src="https://example.com/demo.gif">
![again](assets/logo.png)
![clip](/docs/demo.mp4 "demo")
"#;
        let media = extract_media_from_readme(md, "o", "r", "main");
        assert_eq!(
            media,
            vec![
                "https://raw.githubusercontent.com/o/r/main/assets/logo.png".to_string(),
                "https://example.com/demo.gif".to_string(),
                "https://raw.githubusercontent.com/o/r/main/docs/demo.mp4".to_string(),
            ]
        );
        assert_eq!(media_kind(&media[1]), MediaKind::Animation);
        assert_eq!(media_kind(&media[2]), MediaKind::Video);
        assert_eq!(media_kind("https://x/y.png?raw=true"), MediaKind::Photo);
    }

    #[test]
    fn repo_input_forms() {
        assert_eq!(parse_repo_input("rust-lang/rust"), Some(("rust-lang".into(), "rust".into())));
        assert_eq!(
            parse_repo_input("https://github.com/serde-rs/serde.git"),
            Some(("serde-rs".into(), "serde".into()))
        );
        assert_eq!(
            parse_repo_input(" https://github.com/a/b/tree/main "),
            Some(("a".into(), "b".into()))
        );
        assert_eq!(parse_repo_input("not a repo"), None);
    }
}
