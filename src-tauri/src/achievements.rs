use std::collections::{HashMap, HashSet};
use std::path::{Path, PathBuf};
use std::sync::{Arc, LazyLock};

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use scraper::{ElementRef, Html, Selector};
use serde::{Serialize, Serializer};

use crate::error::{Error, Result};

const ICON_CDN: &str = "https://cdn.cloudflare.steamstatic.com/steamcommunity/public/images/apps";

/// One entry of `achievements.json`.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct AchievementEntry {
    pub name: String,
    #[serde(rename = "displayName")]
    pub display_name: String,
    pub description: String,
    #[serde(serialize_with = "bool_as_int")]
    pub hidden: bool,
    pub icon: String,
    pub icongray: String,
}

fn bool_as_int<S: Serializer>(v: &bool, s: S) -> std::result::Result<S::Ok, S::Error> {
    s.serialize_u8(u8::from(*v))
}

/// A remote place achievement definitions can be scraped from.
pub trait AchievementSource: Send + Sync {
    fn label(&self) -> &'static str;
    fn fetch(&self, app_id: u32) -> BoxFuture<'_, Result<Vec<AchievementEntry>>>;
}

/// Keeps the first entry for each name, in source order.
pub fn dedup_by_name(entries: Vec<AchievementEntry>) -> Vec<AchievementEntry> {
    let mut seen = HashSet::new();
    entries
        .into_iter()
        .filter(|e| seen.insert(e.name.clone()))
        .collect()
}

static STEAMDB_ROW: LazyLock<Selector> = LazyLock::new(|| selector(r#"div[id^="achievement-"]"#));
static STEAMDB_NAME: LazyLock<Selector> = LazyLock::new(|| selector(".achievement_name"));
static STEAMDB_DESC: LazyLock<Selector> = LazyLock::new(|| selector(".achievement_desc"));
static STEAMDB_SPOILER: LazyLock<Selector> = LazyLock::new(|| selector(".achievement_spoiler"));
static COMMUNITY_ROW: LazyLock<Selector> = LazyLock::new(|| selector(".achieveRow"));
static COMMUNITY_TITLE: LazyLock<Selector> = LazyLock::new(|| selector("h3"));
static COMMUNITY_DESC: LazyLock<Selector> = LazyLock::new(|| selector("h5"));
static IMG: LazyLock<Selector> = LazyLock::new(|| selector("img"));

fn selector(css: &str) -> Selector {
    Selector::parse(css).expect("static selector")
}

/// Text content with whitespace runs collapsed. Entities are already decoded by the parser.
fn text_of(el: ElementRef<'_>) -> String {
    el.text()
        .flat_map(str::split_whitespace)
        .collect::<Vec<_>>()
        .join(" ")
}

fn first_text(row: ElementRef<'_>, sel: &Selector) -> Option<String> {
    row.select(sel).next().map(text_of)
}

fn icon_url(app_id: u32, raw: &str) -> String {
    if raw.starts_with("http://") || raw.starts_with("https://") {
        raw.to_string()
    } else {
        format!("{ICON_CDN}/{app_id}/{}", raw.trim_start_matches('/'))
    }
}

/// Parses the SteamDB `stats` page. Each achievement row has `id="achievement-<API name>"`.
pub fn parse_steamdb(html: &str, app_id: u32) -> Vec<AchievementEntry> {
    const HIDDEN_PREFIX: &str = "Hidden achievement:";

    let document = Html::parse_document(html);
    let mut out = vec![];
    for row in document.select(&STEAMDB_ROW) {
        let Some(name) = row
            .value()
            .id()
            .and_then(|id| id.strip_prefix("achievement-"))
            .map(str::trim)
            .filter(|n| !n.is_empty())
        else {
            continue;
        };

        let display_name = first_text(row, &STEAMDB_NAME)
            .filter(|n| !n.is_empty())
            .unwrap_or_else(|| name.to_string());
        let spoiler = first_text(row, &STEAMDB_SPOILER);
        let raw_desc = first_text(row, &STEAMDB_DESC).unwrap_or_default();
        let hidden = spoiler.is_some() || raw_desc.starts_with(HIDDEN_PREFIX);
        let description = match spoiler {
            Some(text) => text,
            None => raw_desc
                .strip_prefix(HIDDEN_PREFIX)
                .map(str::trim)
                .unwrap_or(&raw_desc)
                .to_string(),
        };

        let mut icons = row
            .select(&IMG)
            .filter_map(|img| {
                let v = img.value();
                v.attr("data-name").or_else(|| v.attr("src"))
            })
            .filter(|src| src.ends_with(".jpg") || src.ends_with(".png"))
            .map(|src| icon_url(app_id, src));
        let icon = icons.next().unwrap_or_default();
        let icongray = icons.next().unwrap_or_else(|| icon.clone());

        out.push(AchievementEntry {
            name: name.to_string(),
            display_name,
            description,
            hidden,
            icon,
            icongray,
        });
    }
    dedup_by_name(out)
}

/// `ACH_` style identifier for sources that only expose display names.
fn derived_api_name(display_name: &str, taken: &mut HashSet<String>) -> String {
    let mut base = String::new();
    for c in display_name.chars() {
        if c.is_ascii_alphanumeric() {
            base.push(c.to_ascii_uppercase());
        } else if !base.ends_with('_') {
            base.push('_');
        }
    }
    let base = base.trim_matches('_');
    let base = if base.is_empty() { "ACHIEVEMENT" } else { base };

    let mut candidate = base.to_string();
    let mut n = 2;
    while !taken.insert(candidate.clone()) {
        candidate = format!("{base}_{n}");
        n += 1;
    }
    candidate
}

/// Parses the Steam Community global achievements page (`.achieveRow` blocks).
pub fn parse_community(html: &str) -> Vec<AchievementEntry> {
    let document = Html::parse_document(html);
    let mut taken = HashSet::new();
    let mut out = vec![];
    for row in document.select(&COMMUNITY_ROW) {
        let Some(title) = first_text(row, &COMMUNITY_TITLE).filter(|t| !t.is_empty()) else {
            continue;
        };
        let description = first_text(row, &COMMUNITY_DESC).unwrap_or_default();
        let icon = row
            .select(&IMG)
            .next()
            .and_then(|img| img.value().attr("src"))
            .unwrap_or_default()
            .to_string();

        out.push(AchievementEntry {
            name: derived_api_name(&title, &mut taken),
            display_name: title,
            description,
            hidden: false,
            icongray: icon.clone(),
            icon,
        });
    }
    dedup_by_name(out)
}

async fn get_html(client: &reqwest::Client, url: &str) -> Result<String> {
    log::info!("GET {url}");
    Ok(client
        .get(url)
        .send()
        .await?
        .error_for_status()?
        .text()
        .await?)
}

pub struct SteamDbSource {
    client: reqwest::Client,
    base_url: String,
}

impl SteamDbSource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
        }
    }
}

impl AchievementSource for SteamDbSource {
    fn label(&self) -> &'static str {
        "SteamDB"
    }

    fn fetch(&self, app_id: u32) -> BoxFuture<'_, Result<Vec<AchievementEntry>>> {
        async move {
            let url = format!("{}/{app_id}/stats/", self.base_url.trim_end_matches('/'));
            let html = get_html(&self.client, &url).await?;
            Ok(parse_steamdb(&html, app_id))
        }
        .boxed()
    }
}

pub struct CommunitySource {
    client: reqwest::Client,
    base_url: String,
    language: String,
}

impl CommunitySource {
    pub fn new(client: reqwest::Client, base_url: impl Into<String>, language: impl Into<String>) -> Self {
        Self {
            client,
            base_url: base_url.into(),
            language: language.into(),
        }
    }
}

impl AchievementSource for CommunitySource {
    fn label(&self) -> &'static str {
        "Steam Community"
    }

    fn fetch(&self, app_id: u32) -> BoxFuture<'_, Result<Vec<AchievementEntry>>> {
        async move {
            let url = format!(
                "{}/{app_id}/achievements/?l={}",
                self.base_url.trim_end_matches('/'),
                self.language
            );
            let html = get_html(&self.client, &url).await?;
            Ok(parse_community(&html))
        }
        .boxed()
    }
}

/// Picks a source per the "use Steam" toggle. Never fails: no data means an empty list.
pub struct AchievementFetcher {
    pub steamdb: Arc<dyn AchievementSource>,
    pub community: Arc<dyn AchievementSource>,
}

impl AchievementFetcher {
    async fn try_source(source: &dyn AchievementSource, app_id: u32) -> Vec<AchievementEntry> {
        match source.fetch(app_id).await {
            Ok(entries) => {
                log::info!("{}: {} achievements for {app_id}", source.label(), entries.len());
                entries
            }
            Err(e) => {
                log::warn!("{} achievements for {app_id} failed: {e}", source.label());
                vec![]
            }
        }
    }

    /// `prefer_remote` = community page only; otherwise SteamDB with the community page as fallback.
    pub async fn fetch(&self, app_id: u32, prefer_remote: bool) -> Vec<AchievementEntry> {
        if prefer_remote {
            return Self::try_source(self.community.as_ref(), app_id).await;
        }
        let primary = Self::try_source(self.steamdb.as_ref(), app_id).await;
        if !primary.is_empty() {
            return primary;
        }
        Self::try_source(self.community.as_ref(), app_id).await
    }
}

fn icon_file_name(url: &str) -> Option<String> {
    let path = url.split(['?', '#']).next()?;
    let name = path.rsplit('/').next()?.trim();
    if name.is_empty() || name.contains("..") {
        return None;
    }
    Some(name.to_string())
}

async fn localize_icon(client: &reqwest::Client, img_dir: &Path, url: &str) -> Result<String> {
    let name = icon_file_name(url).ok_or_else(|| Error::InvalidInput(format!("bad icon url {url}")))?;
    let dest = img_dir.join(&name);
    if !tokio::fs::try_exists(&dest).await.unwrap_or(false) {
        let bytes = client.get(url).send().await?.error_for_status()?.bytes().await?;
        tokio::fs::create_dir_all(img_dir).await?;
        tokio::fs::write(&dest, &bytes).await?;
    }
    Ok(format!("img/{name}"))
}

/// Icon downloads for one `achievements.json`: each URL is tried once, and
/// after a connect or timeout failure the CDN is not asked again.
struct IconDownloads<'a> {
    client: &'a reqwest::Client,
    img_dir: PathBuf,
    seen: HashMap<String, Option<String>>,
    unreachable: bool,
}

impl<'a> IconDownloads<'a> {
    fn new(client: &'a reqwest::Client, img_dir: PathBuf) -> Self {
        Self {
            client,
            img_dir,
            seen: HashMap::new(),
            unreachable: false,
        }
    }

    /// Local `img/<file>` path, or `None` to keep the remote URL.
    async fn localize(&mut self, url: &str) -> Option<String> {
        if let Some(known) = self.seen.get(url) {
            return known.clone();
        }
        if self.unreachable {
            return None;
        }
        let local = match localize_icon(self.client, &self.img_dir, url).await {
            Ok(local) => Some(local),
            Err(e) => {
                if let Error::Http(http) = &e {
                    if http.is_connect() || http.is_timeout() {
                        log::warn!("icon host unreachable, keeping remote icon URLs");
                        self.unreachable = true;
                    }
                }
                log::warn!("icon download failed for {url}: {e}");
                None
            }
        };
        self.seen.insert(url.to_string(), local.clone());
        local
    }
}

/// Writes `achievements.json` into `settings_dir`. Returns how many entries were written.
///
/// With a client, remote icons are saved under `img/` and referenced relatively;
/// icons that fail to download keep their URL.
pub async fn write_achievements(
    settings_dir: &Path,
    entries: &[AchievementEntry],
    icon_client: Option<&reqwest::Client>,
) -> Result<usize> {
    if entries.is_empty() {
        return Ok(0);
    }

    let mut entries = entries.to_vec();
    if let Some(client) = icon_client {
        let mut icons = IconDownloads::new(client, settings_dir.join("img"));
        for entry in &mut entries {
            for field in [&mut entry.icon, &mut entry.icongray] {
                if !field.starts_with("http") {
                    continue;
                }
                if let Some(local) = icons.localize(field.as_str()).await {
                    *field = local;
                }
            }
        }
    }

    tokio::fs::create_dir_all(settings_dir).await?;
    let json = serde_json::to_string_pretty(&entries)?;
    tokio::fs::write(settings_dir.join("achievements.json"), json).await?;
    Ok(entries.len())
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::atomic::{AtomicUsize, Ordering};

    use super::*;

    /// Canned source that counts how often it was asked.
    pub struct FakeSource {
        pub label: &'static str,
        pub result: std::result::Result<Vec<AchievementEntry>, String>,
        pub calls: AtomicUsize,
    }

    impl FakeSource {
        pub fn ok(label: &'static str, entries: Vec<AchievementEntry>) -> Arc<Self> {
            Arc::new(Self {
                label,
                result: Ok(entries),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn failing(label: &'static str) -> Arc<Self> {
            Arc::new(Self {
                label,
                result: Err("503 Service Unavailable".into()),
                calls: AtomicUsize::new(0),
            })
        }

        pub fn calls(&self) -> usize {
            self.calls.load(Ordering::SeqCst)
        }
    }

    impl AchievementSource for FakeSource {
        fn label(&self) -> &'static str {
            self.label
        }

        fn fetch(&self, _app_id: u32) -> BoxFuture<'_, Result<Vec<AchievementEntry>>> {
            self.calls.fetch_add(1, Ordering::SeqCst);
            let res = self.result.clone().map_err(Error::Dispatch);
            futures_util::future::ready(res).boxed()
        }
    }

    pub fn entry(name: &str) -> AchievementEntry {
        AchievementEntry {
            name: name.to_string(),
            display_name: name.to_string(),
            description: String::new(),
            hidden: false,
            icon: String::new(),
            icongray: String::new(),
        }
    }
}
