use std::path::{Path, PathBuf};
use std::process::Stdio;
use std::sync::Arc;
use std::time::Duration;

use futures_util::future::BoxFuture;
use serde::{Deserialize, Serialize};
use tokio::process::Command;

use crate::achievements::{self, AchievementFetcher, CommunitySource, SteamDbSource};
use crate::catalog::{AppCatalog, GameIdentity, GameQuery, SteamCatalog};
use crate::config::GeneratorConfig;
use crate::dispatcher::{Dispatcher, TaskHandle};
use crate::dlc::{self, DlcSource, StoreDlcSource};
use crate::error::{Error, Result, Stage};
use crate::ini::IniFile;
use crate::progress::OutputSink;
use crate::provision::{HttpArchiveFetcher, Provisioner};

const SETTINGS_DIR: &str = "steam_settings";
const INTERFACES_FILE: &str = "steam_interfaces.txt";
const TEMPLATE_DIR: &str = "steam_settings";
const LOCAL_SAVE_PATH: &str = "./GSE Saves";
const USER_AGENT: &str =
    "Mozilla/5.0 (Windows NT 10.0; Win64; x64) AppleWebKit/537.36 (KHTML, like Gecko) Chrome/124.0 Safari/537.36";

#[cfg(windows)]
const CREATE_NO_WINDOW: u32 = 0x0800_0000;

#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize)]
#[serde(default)]
pub struct GenerationFlags {
    /// Community page only, skipping SteamDB.
    pub use_remote_achievements: bool,
    pub use_local_save: bool,
    pub disable_lan_only: bool,
    pub achievements_only: bool,
    pub disable_overlay: bool,
}

/// What the shell hands over when Generate is pressed.
#[derive(Debug, Clone)]
pub struct GenerationRequest {
    pub query: GameQuery,
    pub account_name: String,
    pub flags: GenerationFlags,
}

/// One resolved generation run.
#[derive(Debug, Clone)]
pub struct GenerationJob {
    pub game: GameIdentity,
    pub target_dir: PathBuf,
    pub binary: Option<PathBuf>,
    pub account_name: String,
    pub flags: GenerationFlags,
}

impl GenerationJob {
    pub fn new(
        game: GameIdentity,
        output_dir: &Path,
        binary: Option<PathBuf>,
        account_name: String,
        flags: GenerationFlags,
    ) -> Self {
        let target_dir = output_dir.join(target_dir_name(&game));
        Self {
            game,
            target_dir,
            binary,
            account_name,
            flags,
        }
    }

    pub fn settings_dir(&self) -> PathBuf {
        self.target_dir.join(SETTINGS_DIR)
    }
}

#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct GenerationReport {
    pub path: PathBuf,
    pub game: GameIdentity,
    pub achievements: usize,
    pub dlcs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Outcome {
    Completed(GenerationReport),
    /// The binary picker was dismissed; nothing was written.
    Cancelled,
}

/// Asks the user for the game's original `steam_api(64).dll`.
pub trait BinaryPicker: Send + Sync {
    fn pick(&self) -> BoxFuture<'_, Option<PathBuf>>;
}

/// Everything the pipeline talks to, shared across jobs.
pub struct Services {
    pub catalog: Arc<dyn AppCatalog>,
    pub achievements: AchievementFetcher,
    pub dlc: Arc<dyn DlcSource>,
    pub provisioner: Arc<Provisioner>,
    /// Set when achievement icons should be downloaded next to the JSON.
    pub icon_client: Option<reqwest::Client>,
    pub output_dir: PathBuf,
    pub interface_tool_wrapper: Option<String>,
    pub language: String,
}

pub fn http_client() -> Result<reqwest::Client> {
    let client = reqwest::Client::builder()
        .user_agent(USER_AGENT)
        .timeout(Duration::from_secs(30))
        .build()?;
    Ok(client)
}

impl Services {
    pub fn from_config(cfg: &GeneratorConfig, assets_dir: PathBuf, output_dir: PathBuf) -> Result<Self> {
        let client = http_client()?;
        Ok(Self {
            catalog: Arc::new(SteamCatalog::new(client.clone(), cfg.app_list_url.clone())),
            achievements: AchievementFetcher {
                steamdb: Arc::new(SteamDbSource::new(client.clone(), cfg.steamdb_url.clone())),
                community: Arc::new(CommunitySource::new(
                    client.clone(),
                    cfg.community_url.clone(),
                    cfg.language.clone(),
                )),
            },
            dlc: Arc::new(StoreDlcSource::new(client.clone(), cfg.store_api_url.clone())),
            provisioner: Arc::new(Provisioner::new(
                assets_dir,
                cfg.emulator_archive_url.clone(),
                Arc::new(HttpArchiveFetcher::new(client.clone())),
            )),
            icon_client: cfg.download_icons.then_some(client),
            output_dir,
            interface_tool_wrapper: cfg.interface_tool_wrapper.clone(),
            language: cfg.language.clone(),
        })
    }

    fn template_dir(&self) -> PathBuf {
        self.provisioner.assets_dir().join(TEMPLATE_DIR)
    }
}

/// Replaces characters Windows does not allow in file names.
pub fn sanitize_dir_name(name: &str) -> String {
    name.chars()
        .map(|c| if "<>:\"/\\|?*".contains(c) { '_' } else { c })
        .collect()
}

pub fn target_dir_name(game: &GameIdentity) -> String {
    format!("{} ({})", sanitize_dir_name(&game.name), game.app_id)
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Arch {
    X64,
    X32,
}

impl Arch {
    /// `steam_api64.dll` is 64-bit; anything else is treated as 32-bit.
    pub fn from_binary(path: &Path) -> Self {
        let name = path
            .file_name()
            .map(|s| s.to_string_lossy().to_lowercase())
            .unwrap_or_default();
        if name == "steam_api64.dll" {
            Arch::X64
        } else {
            Arch::X32
        }
    }

    fn dir(self) -> &'static str {
        match self {
            Arch::X64 => "x64",
            Arch::X32 => "x32",
        }
    }

    fn generator(self) -> &'static str {
        match self {
            Arch::X64 => "generate_interfaces_x64.exe",
            Arch::X32 => "generate_interfaces_x32.exe",
        }
    }
}

fn copy_dir_all(src: &Path, dst: &Path) -> Result<()> {
    std::fs::create_dir_all(dst)?;
    for entry in std::fs::read_dir(src)? {
        let entry = entry?;
        let to = dst.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_dir_all(&entry.path(), &to)?;
        } else {
            std::fs::copy(entry.path(), to)?;
        }
    }
    Ok(())
}

fn move_file(from: &Path, to: &Path) -> Result<()> {
    if std::fs::rename(from, to).is_ok() {
        return Ok(());
    }
    // Different volume: copy then delete.
    std::fs::copy(from, to)?;
    std::fs::remove_file(from)?;
    Ok(())
}

/// Copies the emulator build for `arch`, backs up the original binary and writes `steam_appid.txt`.
fn install_emulator_files(experimental: &Path, arch: Arch, binary: &Path, job: &GenerationJob) -> Result<()> {
    let source = experimental.join(arch.dir());
    if !source.is_dir() {
        return Err(Error::Layout(format!(
            "missing {} folder in {}",
            arch.dir(),
            experimental.to_string_lossy()
        )));
    }

    for entry in std::fs::read_dir(&source)? {
        let entry = entry?;
        if entry.file_type()?.is_file() {
            std::fs::copy(entry.path(), job.target_dir.join(entry.file_name()))?;
        }
    }

    let binary_name = binary
        .file_name()
        .map(|s| s.to_string_lossy().to_lowercase())
        .ok_or_else(|| Error::InvalidInput(format!("not a file: {}", binary.to_string_lossy())))?;
    std::fs::copy(binary, job.target_dir.join(format!("{binary_name}.o")))?;

    std::fs::write(job.settings_dir().join("steam_appid.txt"), job.game.app_id.to_string())?;
    Ok(())
}

/// Runs the interface generator next to `binary` and returns the list it produced.
async fn generate_interfaces(
    tools_dir: &Path,
    arch: Arch,
    binary: &Path,
    wrapper: Option<&str>,
) -> Result<PathBuf> {
    let generator = tools_dir.join(arch.generator());
    if !generator.is_file() {
        return Err(Error::Layout(format!("missing {}", generator.to_string_lossy())));
    }
    let work_dir = binary
        .parent()
        .filter(|p| !p.as_os_str().is_empty())
        .unwrap_or_else(|| Path::new("."));

    let mut cmd = match wrapper.map(str::trim).filter(|w| !w.is_empty()) {
        Some(w) => {
            let mut cmd = Command::new(w);
            cmd.arg(&generator);
            cmd
        }
        None => Command::new(&generator),
    };
    cmd.arg(binary)
        .current_dir(work_dir)
        .stdin(Stdio::null())
        .stdout(Stdio::piped())
        .stderr(Stdio::piped())
        .kill_on_drop(true);
    #[cfg(windows)]
    cmd.creation_flags(CREATE_NO_WINDOW);

    log::info!("Running {} {}", generator.to_string_lossy(), binary.to_string_lossy());
    let output = cmd.output().await?;
    for line in String::from_utf8_lossy(&output.stdout).lines() {
        log::debug!("generate_interfaces: {line}");
    }
    if !output.status.success() {
        log::warn!(
            "interface generator exited with {}: {}",
            output.status,
            String::from_utf8_lossy(&output.stderr).trim()
        );
    }

    let produced = work_dir.join(INTERFACES_FILE);
    if !produced.is_file() {
        return Err(Error::Io(std::io::Error::new(
            std::io::ErrorKind::NotFound,
            format!("interface generator did not produce {INTERFACES_FILE}"),
        )));
    }
    Ok(produced)
}

/// Copies fonts/sounds from the asset template and writes `configs.overlay.ini`.
fn apply_template(template: &Path, settings_dir: &Path, disable_overlay: bool) -> Result<()> {
    if template.is_dir() {
        for folder in ["fonts", "sounds"] {
            let src = template.join(folder);
            if !src.is_dir() {
                continue;
            }
            let dst = settings_dir.join(folder);
            if dst.exists() {
                std::fs::remove_dir_all(&dst)?;
            }
            copy_dir_all(&src, &dst)?;
        }
    }

    let overlay_src = template.join(if disable_overlay { "disabled.ini" } else { "enabled.ini" });
    let overlay_dst = settings_dir.join("configs.overlay.ini");
    if overlay_src.is_file() {
        std::fs::copy(&overlay_src, &overlay_dst)?;
        return Ok(());
    }
    IniFile::new()
        .set(
            "overlay::general",
            "enable_experimental_overlay",
            if disable_overlay { 0 } else { 1 },
        )
        .write_to(&overlay_dst)
}

/// Emulator binaries, original-binary backup, AppID and interface list.
///
/// File work runs as blocking dispatcher jobs, the interface generator as an async one.
pub async fn copy_and_patch(
    dispatcher: &Dispatcher,
    job: Arc<GenerationJob>,
    provisioner: Arc<Provisioner>,
    template: PathBuf,
    wrapper: Option<String>,
    sink: &dyn OutputSink,
) -> Result<()> {
    let binary = job
        .binary
        .clone()
        .ok_or_else(|| Error::InvalidInput("no steam_api(64).dll selected".to_string()))?;
    sink.line("Generating GSE...");
    let arch = Arch::from_binary(&binary);

    let tools = {
        let (job, binary) = (job.clone(), binary.clone());
        dispatcher
            .run_blocking(move || {
                let experimental = provisioner.locate_experimental_dir()?;
                let tools = provisioner.locate_interface_tools_dir()?;
                install_emulator_files(&experimental, arch, &binary, &job)?;
                Ok(tools)
            })
            .outcome()
            .await?
    };

    let produced = dispatcher
        .run(async move { generate_interfaces(&tools, arch, &binary, wrapper.as_deref()).await })
        .outcome()
        .await?;

    dispatcher
        .run_blocking(move || {
            let settings_dir = job.settings_dir();
            move_file(&produced, &settings_dir.join(INTERFACES_FILE))?;
            apply_template(&template, &settings_dir, job.flags.disable_overlay)
        })
        .outcome()
        .await
}

/// Always runs; no achievements is not an error.
pub async fn fetch_achievements(
    job: &GenerationJob,
    fetcher: &AchievementFetcher,
    icon_client: Option<&reqwest::Client>,
    sink: &dyn OutputSink,
) -> Result<usize> {
    sink.line("Fetching Achievements...");
    let entries = fetcher
        .fetch(job.game.app_id, job.flags.use_remote_achievements)
        .await;
    if entries.is_empty() {
        sink.line("No achievements found.");
        return Ok(0);
    }
    let written = achievements::write_achievements(&job.settings_dir(), &entries, icon_client).await?;
    sink.line(&format!("{written} achievements written."));
    Ok(written)
}

pub async fn fetch_dlc(job: &GenerationJob, source: &dyn DlcSource, sink: &dyn OutputSink) -> Result<usize> {
    sink.line("Fetching DLCs...");
    let entries = dlc::fetch_dlc(source, job.game.app_id).await;
    dlc::write_dlc_config(&job.settings_dir(), &entries).await?;
    sink.line(&format!("{} DLCs found.", entries.len()));
    Ok(entries.len())
}

/// `configs.main.ini` / `configs.user.ini`.
///
/// The LAN file is written whenever LAN-only is disabled outside achievements-only
/// mode; the user file is skipped entirely in achievements-only mode.
pub fn create_user_config(
    settings_dir: &Path,
    account_name: &str,
    flags: &GenerationFlags,
    language: &str,
) -> Result<()> {
    if flags.disable_lan_only && !flags.achievements_only {
        IniFile::new()
            .set("main::connectivity", "disable_lan_only", 1)
            .write_to(&settings_dir.join("configs.main.ini"))?;
    }

    let account = account_name.trim();
    if account.is_empty() && !flags.use_local_save {
        return Ok(());
    }

    let mut ini = IniFile::new();
    if !account.is_empty() {
        ini.set("user::general", "account_name", account)
            .set("user::general", "language", language);
    }
    if flags.use_local_save {
        ini.set("user::saves", "local_save_path", LOCAL_SAVE_PATH);
    }
    if !ini.is_empty() && !flags.achievements_only {
        ini.write_to(&settings_dir.join("configs.user.ini"))?;
    }
    Ok(())
}

/// Waits for a dispatched stage and tags any failure with `stage`.
async fn staged<T>(stage: Stage, handle: TaskHandle<T>) -> Result<T> {
    handle.outcome().await.map_err(|e| Error::in_stage(stage, e))
}

/// Resolve, provision, ask for the binary, then generate.
///
/// Resolution and provisioning errors surface as-is; anything later is wrapped
/// with the failing stage. Partial output is left in place on failure.
pub async fn run(
    dispatcher: &Dispatcher,
    services: Arc<Services>,
    request: GenerationRequest,
    picker: &dyn BinaryPicker,
    sink: Arc<dyn OutputSink>,
) -> Result<Outcome> {
    let flags = request.flags;

    match &request.query {
        GameQuery::AppId(_) => sink.line("Parsing AppID..."),
        GameQuery::Name(_) => sink.line("Parsing game name..."),
    }
    let game = {
        let services = services.clone();
        let query = request.query.clone();
        dispatcher
            .run(async move { services.catalog.resolve(&query).await })
            .outcome()
            .await?
    };
    log::info!("Resolved {} ({})", game.name, game.app_id);
    sink.resolved(&game);

    let binary = if flags.achievements_only {
        None
    } else {
        {
            let services = services.clone();
            let sink = sink.clone();
            dispatcher
                .run(async move { services.provisioner.ensure_provisioned(sink.as_ref()).await })
                .outcome()
                .await?;
        }

        sink.line("Select steam_api(64).dll of the Game...");
        match picker.pick().await {
            Some(path) => Some(path),
            None => {
                sink.line("DLL selection cancelled");
                sink.status("No DLL selected", true);
                return Ok(Outcome::Cancelled);
            }
        }
    };

    let job = Arc::new(GenerationJob::new(
        game,
        &services.output_dir,
        binary,
        request.account_name,
        flags,
    ));

    let first_stage = if flags.achievements_only {
        Stage::Achievements
    } else {
        Stage::CopyAndPatch
    };
    {
        let settings_dir = job.settings_dir();
        staged(
            first_stage,
            dispatcher.run_blocking(move || Ok(std::fs::create_dir_all(settings_dir)?)),
        )
        .await?;
    }

    if !flags.achievements_only {
        copy_and_patch(
            dispatcher,
            job.clone(),
            services.provisioner.clone(),
            services.template_dir(),
            services.interface_tool_wrapper.clone(),
            sink.as_ref(),
        )
        .await
        .map_err(|e| Error::in_stage(Stage::CopyAndPatch, e))?;
    }

    let achievements = {
        let (services, job, sink) = (services.clone(), job.clone(), sink.clone());
        staged(
            Stage::Achievements,
            dispatcher.run(async move {
                fetch_achievements(
                    &job,
                    &services.achievements,
                    services.icon_client.as_ref(),
                    sink.as_ref(),
                )
                .await
            }),
        )
        .await?
    };

    let dlcs = if flags.achievements_only {
        0
    } else {
        let (services, job, sink) = (services.clone(), job.clone(), sink.clone());
        staged(
            Stage::Dlc,
            dispatcher.run(async move { fetch_dlc(&job, services.dlc.as_ref(), sink.as_ref()).await }),
        )
        .await?
    };

    {
        let (services, job) = (services.clone(), job.clone());
        staged(
            Stage::UserConfig,
            dispatcher.run_blocking(move || {
                create_user_config(
                    &job.settings_dir(),
                    &job.account_name,
                    &job.flags,
                    &services.language,
                )
            }),
        )
        .await?;
    }

    sink.line("Files generated successfully!");
    sink.line(&format!("Location: {}", job.target_dir.to_string_lossy()));
    sink.status("GSE generated successfully", false);

    Ok(Outcome::Completed(GenerationReport {
        path: job.target_dir.clone(),
        game: job.game.clone(),
        achievements,
        dlcs,
    }))
}
