use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::{FutureExt, StreamExt};
use tokio::sync::Mutex;

use crate::archive::{self, ArchiveKind};
use crate::error::{Error, Result};
use crate::progress::OutputSink;

pub const EMU_FOLDER: &str = "goldberg_emu";
const DOWNLOADS_FOLDER: &str = "downloads";
const REPORT_EVERY_BYTES: u64 = 5 * 1024 * 1024;

/// Downloads the emulator archive to a local file.
pub trait ArchiveFetcher: Send + Sync {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        sink: &'a dyn OutputSink,
    ) -> BoxFuture<'a, Result<()>>;
}

pub struct HttpArchiveFetcher {
    client: reqwest::Client,
}

impl HttpArchiveFetcher {
    pub fn new(client: reqwest::Client) -> Self {
        Self { client }
    }
}

impl ArchiveFetcher for HttpArchiveFetcher {
    fn fetch<'a>(
        &'a self,
        url: &'a str,
        dest: &'a Path,
        sink: &'a dyn OutputSink,
    ) -> BoxFuture<'a, Result<()>> {
        async move {
            log::info!("Downloading emulator archive: {url}");
            let response = self.client.get(url).send().await?.error_for_status()?;
            let total = response.content_length();

            let mut file = std::fs::File::create(dest)?;
            let mut downloaded: u64 = 0;
            let mut next_report = REPORT_EVERY_BYTES;

            let mut stream = response.bytes_stream();
            while let Some(chunk) = stream.next().await {
                let chunk = chunk?;
                file.write_all(&chunk)?;
                downloaded = downloaded.saturating_add(chunk.len() as u64);

                if downloaded >= next_report {
                    next_report = next_report.saturating_add(REPORT_EVERY_BYTES);
                    match total {
                        Some(t) if t > 0 => sink.line(&format!(
                            "Downloading GBE... {} / {} MB",
                            downloaded / 1024 / 1024,
                            t / 1024 / 1024
                        )),
                        _ => sink.line(&format!(
                            "Downloading GBE... {} MB",
                            downloaded / 1024 / 1024
                        )),
                    }
                }
            }
            file.flush()?;
            log::info!("Downloaded {downloaded} bytes to {}", dest.to_string_lossy());
            Ok(())
        }
        .boxed()
    }
}

fn file_name_from_url(url: &str) -> String {
    url.split(['?', '#'])
        .next()
        .and_then(|u| u.rsplit('/').next())
        .filter(|s| !s.is_empty())
        .unwrap_or("emulator-archive")
        .to_string()
}

fn as_provision_error(e: Error) -> Error {
    match e {
        Error::Provision(_) => e,
        other => Error::Provision(other.to_string()),
    }
}

/// Breadth-first search for the first directory under `root` matching `pred`.
fn find_dir(root: &Path, pred: impl Fn(&Path) -> bool) -> Option<PathBuf> {
    let mut queue = std::collections::VecDeque::from([root.to_path_buf()]);
    while let Some(dir) = queue.pop_front() {
        let Ok(rd) = std::fs::read_dir(&dir) else {
            continue;
        };
        let mut children: Vec<PathBuf> = rd
            .flatten()
            .filter(|e| e.file_type().map(|t| t.is_dir()).unwrap_or(false))
            .map(|e| e.path())
            .collect();
        children.sort();
        for child in children {
            if pred(&child) {
                return Some(child);
            }
            queue.push_back(child);
        }
    }
    None
}

fn dir_name_is(path: &Path, name: &str) -> bool {
    path.file_name().and_then(|s| s.to_str()) == Some(name)
}

/// Owns `<assets>/goldberg_emu`. Existence of that folder means "provisioned".
pub struct Provisioner {
    assets_dir: PathBuf,
    archive_url: String,
    fetcher: Arc<dyn ArchiveFetcher>,
    lock: Mutex<()>,
}

impl Provisioner {
    pub fn new(
        assets_dir: impl Into<PathBuf>,
        archive_url: impl Into<String>,
        fetcher: Arc<dyn ArchiveFetcher>,
    ) -> Self {
        Self {
            assets_dir: assets_dir.into(),
            archive_url: archive_url.into(),
            fetcher,
            lock: Mutex::new(()),
        }
    }

    pub fn assets_dir(&self) -> &Path {
        &self.assets_dir
    }

    pub fn root(&self) -> PathBuf {
        self.assets_dir.join(EMU_FOLDER)
    }

    pub fn is_provisioned(&self) -> bool {
        self.root().exists()
    }

    /// Downloads and unpacks the emulator unless it is already on disk.
    /// The contents of an existing folder are not validated.
    pub async fn ensure_provisioned(&self, sink: &dyn OutputSink) -> Result<()> {
        let _guard = self.lock.lock().await;
        if self.is_provisioned() {
            return Ok(());
        }

        sink.line("Setting up GBE(Detanup01 fork)...");
        self.download_and_extract(&self.root(), sink)
            .await
            .map_err(as_provision_error)?;
        sink.line("GBE setup successfully.");
        Ok(())
    }

    async fn download_and_extract(&self, root: &Path, sink: &dyn OutputSink) -> Result<()> {
        let kind = ArchiveKind::detect(&self.archive_url).ok_or_else(|| {
            Error::Provision(format!("unsupported archive format: {}", self.archive_url))
        })?;

        let downloads = self.assets_dir.join(DOWNLOADS_FOLDER);
        std::fs::create_dir_all(&downloads)?;
        let archive_path = downloads.join(file_name_from_url(&self.archive_url));

        self.fetcher
            .fetch(&self.archive_url, &archive_path, sink)
            .await?;

        // Extract next to the final folder, then move into place.
        let extract_tmp = self.assets_dir.join(format!(".{EMU_FOLDER}.tmp"));
        if extract_tmp.exists() {
            let _ = std::fs::remove_dir_all(&extract_tmp);
        }

        sink.line("Extracting GBE...");
        let src = archive_path.clone();
        let dest = extract_tmp.clone();
        let extracted = tauri::async_runtime::spawn_blocking(move || {
            archive::extract(kind, &src, &dest, |done, total| {
                if total > 0 && (done == total || done % 200 == 0) {
                    log::debug!("extracted {done}/{total} entries");
                }
            })
        })
        .await
        .map_err(|e| Error::Dispatch(e.to_string()))?;

        if let Err(e) = extracted {
            let _ = std::fs::remove_dir_all(&extract_tmp);
            return Err(e);
        }

        std::fs::rename(&extract_tmp, root)?;
        let _ = std::fs::remove_file(&archive_path);
        log::info!("GBE provisioned at {}", root.to_string_lossy());
        Ok(())
    }

    /// Removes the provisioned tree so the next job downloads a fresh copy.
    pub async fn reset(&self) -> Result<bool> {
        let _guard = self.lock.lock().await;
        if !self.is_provisioned() {
            return Ok(false);
        }
        let root = self.root();
        tokio::fs::remove_dir_all(&root).await?;
        log::info!("Removed {}", root.to_string_lossy());
        Ok(true)
    }

    pub fn locate_experimental_dir(&self) -> Result<PathBuf> {
        find_dir(&self.root(), |p| dir_name_is(p, "experimental")).ok_or_else(|| {
            Error::Layout("could not find the 'experimental' folder in the GBE release".to_string())
        })
    }

    /// `tools/generate_interfaces`, skipping `tools` folders without it.
    pub fn locate_interface_tools_dir(&self) -> Result<PathBuf> {
        find_dir(&self.root(), |p| {
            dir_name_is(p, "tools") && p.join("generate_interfaces").is_dir()
        })
        .map(|tools| tools.join("generate_interfaces"))
        .ok_or_else(|| {
            Error::Layout("could not find 'tools/generate_interfaces' in the GBE release".to_string())
        })
    }
}


#[cfg(test)]
mod tests {
    use super::testing::FakeFetcher;
    use super::*;
    use crate::progress::testing::RecordingSink;

    const URL: &str = "https://example.invalid/releases/latest/download/emu-win-release.zip";

    fn provisioner(dir: &Path, fetcher: Arc<FakeFetcher>) -> Provisioner {
        Provisioner::new(dir, URL, fetcher)
    }

    #[tokio::test]
    async fn second_call_does_not_download_again() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::release());
        let prov = provisioner(dir.path(), fetcher.clone());
        let sink = RecordingSink::default();

        prov.ensure_provisioned(&sink).await.unwrap();
        prov.ensure_provisioned(&sink).await.unwrap();

        assert_eq!(fetcher.calls(), 1);
        assert!(prov.is_provisioned());
        // archive is removed after a successful extraction
        assert!(!dir.path().join("downloads/emu-win-release.zip").exists());
        assert!(!dir.path().join(".goldberg_emu.tmp").exists());
        assert!(sink.lines().iter().any(|l| l == "GBE setup successfully."));
    }

    #[tokio::test]
    async fn existing_folder_counts_as_provisioned() {
        let dir = tempfile::tempdir().unwrap();
        std::fs::create_dir_all(dir.path().join(EMU_FOLDER)).unwrap();
        let fetcher = Arc::new(FakeFetcher::release());
        let prov = provisioner(dir.path(), fetcher.clone());

        prov.ensure_provisioned(&RecordingSink::default()).await.unwrap();
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn failed_download_is_a_provision_error() {
        let dir = tempfile::tempdir().unwrap();
        let mut fake = FakeFetcher::release();
        fake.fail = true;
        let prov = provisioner(dir.path(), Arc::new(fake));

        let err = prov.ensure_provisioned(&RecordingSink::default()).await.unwrap_err();
        assert!(matches!(err, Error::Provision(_)));
        assert!(!prov.is_provisioned());
    }

    #[tokio::test]
    async fn corrupt_archive_leaves_no_provisioned_folder() {
        struct HtmlFetcher;
        impl ArchiveFetcher for HtmlFetcher {
            fn fetch<'a>(
                &'a self,
                _url: &'a str,
                dest: &'a Path,
                _sink: &'a dyn OutputSink,
            ) -> BoxFuture<'a, Result<()>> {
                let res = std::fs::write(dest, b"<html>404</html>").map_err(Error::from);
                futures_util::future::ready(res).boxed()
            }
        }

        let dir = tempfile::tempdir().unwrap();
        let prov = Provisioner::new(dir.path(), URL, Arc::new(HtmlFetcher));
        let err = prov.ensure_provisioned(&RecordingSink::default()).await.unwrap_err();

        assert!(matches!(err, Error::Provision(_)));
        assert!(!prov.is_provisioned());
        assert!(dir.path().join("downloads/emu-win-release.zip").exists());
    }

    #[tokio::test]
    async fn unknown_format_is_rejected() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::release());
        let prov = Provisioner::new(dir.path(), "https://example.invalid/emu.rar", fetcher.clone());
        let err = prov.ensure_provisioned(&RecordingSink::default()).await.unwrap_err();
        assert!(matches!(err, Error::Provision(_)));
        assert_eq!(fetcher.calls(), 0);
    }

    #[tokio::test]
    async fn locates_layout_directories() {
        let dir = tempfile::tempdir().unwrap();
        let prov = provisioner(dir.path(), Arc::new(FakeFetcher::release()));
        assert!(matches!(prov.locate_experimental_dir(), Err(Error::Layout(_))));

        prov.ensure_provisioned(&RecordingSink::default()).await.unwrap();
        let exp = prov.locate_experimental_dir().unwrap();
        assert!(exp.join("x64/steam_api64.dll").is_file());
        let tools = prov.locate_interface_tools_dir().unwrap();
        assert!(tools.join("generate_interfaces_x32.exe").is_file());
    }

    #[tokio::test]
    async fn tools_folder_without_generator_is_skipped() {
        let dir = tempfile::tempdir().unwrap();
        let root = dir.path().join(EMU_FOLDER);
        std::fs::create_dir_all(root.join("a/tools/lobby_connect")).unwrap();
        std::fs::create_dir_all(root.join("b/tools/generate_interfaces")).unwrap();
        let prov = provisioner(dir.path(), Arc::new(FakeFetcher::release()));

        let tools = prov.locate_interface_tools_dir().unwrap();
        assert!(tools.ends_with("b/tools/generate_interfaces"));
    }

    #[tokio::test]
    async fn reset_forces_a_new_download() {
        let dir = tempfile::tempdir().unwrap();
        let fetcher = Arc::new(FakeFetcher::release());
        let prov = provisioner(dir.path(), fetcher.clone());
        let sink = RecordingSink::default();

        prov.ensure_provisioned(&sink).await.unwrap();
        assert!(prov.reset().await.unwrap());
        assert!(!prov.reset().await.unwrap());
        prov.ensure_provisioned(&sink).await.unwrap();
        assert_eq!(fetcher.calls(), 2);
    }

    #[test]
    fn archive_name_comes_from_the_url() {
        assert_eq!(file_name_from_url(URL), "emu-win-release.zip");
        assert_eq!(file_name_from_url("https://x/y/emu.7z?raw=1"), "emu.7z");
        assert_eq!(file_name_from_url("https://x/"), "emulator-archive");
    }
}
