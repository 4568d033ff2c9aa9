use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::{Deserialize, Serialize};
use tokio::sync::OnceCell;

use crate::error::{Error, Result};

/// A resolved game: both halves are known from here on.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GameIdentity {
    pub app_id: u32,
    pub name: String,
}

/// What the user typed. Exactly one key is used per lookup.
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum GameQuery {
    AppId(u32),
    Name(String),
}

impl GameQuery {
    /// AppID wins when both fields are filled in.
    pub fn from_inputs(app_id: &str, game_name: &str) -> Result<Self> {
        let app_id = app_id.trim();
        let game_name = game_name.trim();
        if !app_id.is_empty() {
            let id = app_id
                .parse::<u32>()
                .ok()
                .filter(|id| *id > 0)
                .ok_or_else(|| Error::InvalidInput(format!("'{app_id}' is not a valid AppID")))?;
            return Ok(GameQuery::AppId(id));
        }
        if !game_name.is_empty() {
            return Ok(GameQuery::Name(game_name.to_string()));
        }
        Err(Error::InvalidInput(
            "Enter GameName or AppID to continue".to_string(),
        ))
    }
}

#[derive(Debug, Clone, Deserialize)]
pub struct CatalogApp {
    pub appid: u32,
    pub name: String,
}

#[derive(Debug, Deserialize)]
struct AppListResponse {
    applist: AppList,
}

#[derive(Debug, Deserialize)]
struct AppList {
    apps: Vec<CatalogApp>,
}

fn normalize(name: &str) -> String {
    name.chars()
        .filter(|c| c.is_alphanumeric())
        .flat_map(char::to_lowercase)
        .collect()
}

/// In-memory Steam app list.
#[derive(Debug, Default)]
pub struct Catalog {
    apps: Vec<CatalogApp>,
}

impl Catalog {
    pub fn new(apps: Vec<CatalogApp>) -> Self {
        let apps = apps
            .into_iter()
            .filter(|a| !a.name.trim().is_empty())
            .collect();
        Self { apps }
    }

    pub fn parse(json: &str) -> Result<Self> {
        let resp: AppListResponse = serde_json::from_str(json)?;
        Ok(Self::new(resp.applist.apps))
    }

    pub fn len(&self) -> usize {
        self.apps.len()
    }

    pub fn is_empty(&self) -> bool {
        self.apps.is_empty()
    }

    pub fn by_id(&self, app_id: u32) -> Result<GameIdentity> {
        self.apps
            .iter()
            .find(|a| a.appid == app_id)
            .map(|a| GameIdentity {
                app_id: a.appid,
                name: a.name.clone(),
            })
            .ok_or_else(|| Error::NotFound(format!("Could not find game name for AppID '{app_id}'")))
    }

    /// Exact (case-insensitive) match first, then punctuation-insensitive,
    /// then the shortest title that starts with or contains the query.
    pub fn by_name(&self, name: &str) -> Result<GameIdentity> {
        let wanted = name.trim();
        let not_found = || Error::NotFound(format!("Could not find AppID for '{wanted}'"));
        if wanted.is_empty() {
            return Err(not_found());
        }

        let lower = wanted.to_lowercase();
        let norm = normalize(wanted);

        let hit = self
            .apps
            .iter()
            .find(|a| a.name.to_lowercase() == lower)
            .or_else(|| {
                if norm.is_empty() {
                    return None;
                }
                self.apps.iter().find(|a| normalize(&a.name) == norm)
            })
            .or_else(|| {
                if norm.is_empty() {
                    return None;
                }
                let prefixed = self
                    .apps
                    .iter()
                    .filter(|a| normalize(&a.name).starts_with(&norm))
                    .min_by_key(|a| a.name.len());
                prefixed.or_else(|| {
                    self.apps
                        .iter()
                        .filter(|a| normalize(&a.name).contains(&norm))
                        .min_by_key(|a| a.name.len())
                })
            })
            .ok_or_else(not_found)?;

        Ok(GameIdentity {
            app_id: hit.appid,
            name: hit.name.clone(),
        })
    }
}

/// Maps AppID <-> title.
pub trait AppCatalog: Send + Sync {
    fn resolve<'a>(&'a self, query: &'a GameQuery) -> BoxFuture<'a, Result<GameIdentity>>;
}

/// Fetches the Steam app list once per process and answers lookups from memory.
pub struct SteamCatalog {
    client: reqwest::Client,
    url: String,
    cache: OnceCell<Arc<Catalog>>,
}

impl SteamCatalog {
    pub fn new(client: reqwest::Client, url: impl Into<String>) -> Self {
        Self {
            client,
            url: url.into(),
            cache: OnceCell::new(),
        }
    }

    async fn load(&self) -> Result<Arc<Catalog>> {
        let catalog = self
            .cache
            .get_or_try_init(|| async {
                log::info!("Fetching Steam app list from {}", self.url);
                let text = self
                    .client
                    .get(&self.url)
                    .send()
                    .await?
                    .error_for_status()?
                    .text()
                    .await?;
                let catalog = Catalog::parse(&text)?;
                if catalog.is_empty() {
                    return Err(Error::NotFound("Steam app list came back empty".to_string()));
                }
                log::info!("Steam app list: {} entries", catalog.len());
                Ok::<_, Error>(Arc::new(catalog))
            })
            .await?;
        Ok(catalog.clone())
    }
}

impl AppCatalog for SteamCatalog {
    fn resolve<'a>(&'a self, query: &'a GameQuery) -> BoxFuture<'a, Result<GameIdentity>> {
        async move {
            let catalog = self.load().await?;
            match query {
                GameQuery::AppId(id) => catalog.by_id(*id),
                GameQuery::Name(name) => catalog.by_name(name),
            }
        }
        .boxed()
    }
}

impl AppCatalog for Catalog {
    fn resolve<'a>(&'a self, query: &'a GameQuery) -> BoxFuture<'a, Result<GameIdentity>> {
        let res = match query {
            GameQuery::AppId(id) => self.by_id(*id),
            GameQuery::Name(name) => self.by_name(name),
        };
        futures_util::future::ready(res).boxed()
    }
}
