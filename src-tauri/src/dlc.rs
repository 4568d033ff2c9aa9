use std::path::Path;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde_json::Value;

use crate::error::Result;
use crate::ini::IniFile;

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DlcEntry {
    pub id: u32,
    pub name: String,
}

pub trait DlcSource: Send + Sync {
    fn fetch(&self, app_id: u32) -> BoxFuture<'_, Result<Vec<DlcEntry>>>;
}

/// `data.dlc` of a store `appdetails` response, in response order.
pub fn parse_dlc_ids(root: &Value, app_id: u32) -> Vec<u32> {
    let Some(app) = root.get(app_id.to_string()) else {
        return vec![];
    };
    if app.get("success").and_then(Value::as_bool) != Some(true) {
        return vec![];
    }
    app.get("data")
        .and_then(|d| d.get("dlc"))
        .and_then(Value::as_array)
        .map(|arr| {
            arr.iter()
                .filter_map(Value::as_u64)
                .filter_map(|id| u32::try_from(id).ok())
                .collect()
        })
        .unwrap_or_default()
}

fn parse_app_name(root: &Value, app_id: u32) -> Option<String> {
    root.get(app_id.to_string())?
        .get("data")?
        .get("name")?
        .as_str()
        .map(|s| s.trim().to_string())
        .filter(|s| !s.is_empty())
}

fn details_url(api_url: &str, app_id: u32, filters: &str) -> String {
    format!("{api_url}?appids={app_id}&filters={filters}")
}

/// Steam store `appdetails` endpoint.
pub struct StoreDlcSource {
    client: reqwest::Client,
    api_url: String,
}

impl StoreDlcSource {
    pub fn new(client: reqwest::Client, api_url: impl Into<String>) -> Self {
        Self {
            client,
            api_url: api_url.into(),
        }
    }

    async fn app_details(&self, app_id: u32, filters: &str) -> Result<Value> {
        let url = details_url(&self.api_url, app_id, filters);
        let root = self
            .client
            .get(&url)
            .send()
            .await?
            .error_for_status()?
            .json::<Value>()
            .await?;
        Ok(root)
    }

    async fn dlc_name(&self, dlc_id: u32) -> String {
        match self.app_details(dlc_id, "basic").await {
            Ok(root) => parse_app_name(&root, dlc_id).unwrap_or_else(|| format!("DLC {dlc_id}")),
            Err(e) => {
                log::warn!("name lookup for DLC {dlc_id} failed: {e}");
                format!("DLC {dlc_id}")
            }
        }
    }
}

impl DlcSource for StoreDlcSource {
    fn fetch(&self, app_id: u32) -> BoxFuture<'_, Result<Vec<DlcEntry>>> {
        async move {
            let root = self.app_details(app_id, "basic,dlc").await?;
            let ids = parse_dlc_ids(&root, app_id);
            log::info!("{} DLC ids for {app_id}", ids.len());

            let mut out = Vec::with_capacity(ids.len());
            for id in ids {
                let name = self.dlc_name(id).await;
                out.push(DlcEntry { id, name });
            }
            Ok(out)
        }
        .boxed()
    }
}

/// Any failure is logged and treated as "no DLC".
pub async fn fetch_dlc(source: &dyn DlcSource, app_id: u32) -> Vec<DlcEntry> {
    match source.fetch(app_id).await {
        Ok(entries) => entries,
        Err(e) => {
            log::warn!("DLC fetch for {app_id} failed: {e}");
            vec![]
        }
    }
}

/// Writes `configs.app.ini` (`[app::dlcs]`) into `settings_dir`.
pub async fn write_dlc_config(settings_dir: &Path, entries: &[DlcEntry]) -> Result<()> {
    let mut ini = IniFile::new();
    let section = ini.section("app::dlcs");
    section.set("unlock_all", 0);
    for dlc in entries {
        section.set(&dlc.id.to_string(), dlc.name.replace(['\r', '\n'], " "));
    }
    tokio::fs::write(settings_dir.join("configs.app.ini"), ini.render()).await?;
    Ok(())
}

#[cfg(test)]
pub(crate) mod testing {
    use super::*;
    use crate::error::Error;

    pub struct FakeDlc(pub std::result::Result<Vec<DlcEntry>, String>);

    impl DlcSource for FakeDlc {
        fn fetch(&self, _app_id: u32) -> BoxFuture<'_, Result<Vec<DlcEntry>>> {
            futures_util::future::ready(self.0.clone().map_err(Error::Dispatch)).boxed()
        }
    }
}
