mod achievements;
mod archive;
mod catalog;
mod config;
mod dispatcher;
mod dlc;
mod error;
mod ini;
mod logger;
mod pipeline;
mod progress;
mod provision;
#[cfg(test)]
mod test_server;

use std::path::PathBuf;
use std::sync::Arc;

use futures_util::future::BoxFuture;
use futures_util::FutureExt;
use serde::Deserialize;
use tauri::{Manager, State};

use crate::catalog::GameQuery;
use crate::config::GeneratorConfig;
use crate::dispatcher::{Dispatcher, JobSlot};
use crate::pipeline::{BinaryPicker, GenerationFlags, GenerationReport, GenerationRequest, Outcome, Services};
use crate::progress::{FinishedPayload, OutputSink};
use crate::provision::Provisioner;

struct AppState {
    config_dir: PathBuf,
    output_dir: PathBuf,
    dispatcher: Dispatcher,
    job: JobSlot,
    services: Arc<Services>,
}

fn app_data_dir(app: &tauri::AppHandle) -> Result<PathBuf, String> {
    app.path()
        .app_data_dir()
        .map_err(|e| format!("failed to resolve app data dir: {e}"))
}

/// Native file dialog for the game's original `steam_api(64).dll`.
struct DialogPicker;

impl BinaryPicker for DialogPicker {
    fn pick(&self) -> BoxFuture<'_, Option<PathBuf>> {
        async {
            rfd::AsyncFileDialog::new()
                .set_title("Select steam_api.dll or steam_api64.dll of the Game")
                .add_filter("Steam API DLL (steam_api*.dll)", &["dll"])
                .pick_file()
                .await
                .map(|file| file.path().to_path_buf())
        }
        .boxed()
    }
}

#[derive(Debug, Clone, Deserialize)]
struct GenerateArgs {
    #[serde(default)]
    account_name: String,
    #[serde(default)]
    game_name: String,
    #[serde(default)]
    app_id: String,
    #[serde(default)]
    flags: GenerationFlags,
}

#[tauri::command]
fn load_username(state: State<'_, AppState>) -> Result<String, String> {
    config::load_username(&state.config_dir).map_err(|e| e.to_string())
}

#[tauri::command]
fn save_username(state: State<'_, AppState>, username: String) -> Result<bool, String> {
    config::save_username(&state.config_dir, &username).map_err(|e| e.to_string())?;
    Ok(true)
}

/// Runs one generation job. Returns `None` when the DLL picker was dismissed.
#[tauri::command]
async fn generate(
    app: tauri::AppHandle,
    state: State<'_, AppState>,
    args: GenerateArgs,
) -> Result<Option<GenerationReport>, String> {
    let (sink, rx) = progress::queue();
    let forwarder = progress::forward_to_ui(app.clone(), rx);

    let result = async {
        let query = GameQuery::from_inputs(&args.app_id, &args.game_name)?;
        let _guard = state.job.try_acquire()?;

        sink.status("Generating GSE...", false);
        let request = GenerationRequest {
            query,
            account_name: args.account_name.clone(),
            flags: args.flags,
        };
        let shared: Arc<dyn OutputSink> = Arc::new(sink.clone());
        pipeline::run(&state.dispatcher, state.services.clone(), request, &DialogPicker, shared).await
    }
    .await;

    let report = match result {
        Ok(Outcome::Completed(report)) => {
            progress::emit_finished(
                &app,
                FinishedPayload {
                    path: report.path.to_string_lossy().to_string(),
                    achievements: report.achievements,
                    dlcs: report.dlcs,
                },
            );
            Ok(Some(report))
        }
        Ok(Outcome::Cancelled) => Ok(None),
        Err(e) => {
            let msg = e.to_string();
            sink.line(&msg);
            sink.status(&msg, true);
            Err(msg)
        }
    };

    // Flush queued output before the front end re-enables the button.
    drop(sink);
    let _ = forwarder.await;
    report
}

#[tauri::command]
fn open_output_folder(state: State<'_, AppState>, path: Option<String>) -> Result<bool, String> {
    let dir = path.map(PathBuf::from).unwrap_or_else(|| state.output_dir.clone());
    if !dir.exists() {
        return Err(format!("{} does not exist", dir.to_string_lossy()));
    }
    opener::open(&dir).map_err(|e| e.to_string())?;
    Ok(true)
}

/// Holds the job slot for the whole reset so no generation can start halfway through.
async fn reset_when_idle(job: &JobSlot, provisioner: &Provisioner) -> error::Result<bool> {
    let _guard = job.try_acquire()?;
    provisioner.reset().await
}

/// Deletes the downloaded emulator so the next job fetches the latest release.
#[tauri::command]
async fn reset_emulator(state: State<'_, AppState>) -> Result<bool, String> {
    reset_when_idle(&state.job, &state.services.provisioner)
        .await
        .map_err(|e| e.to_string())
}

fn build_state(app: &tauri::AppHandle) -> Result<AppState, String> {
    let data_dir = app_data_dir(app)?;
    let config_dir = data_dir.join("config");

    let cfg = GeneratorConfig::load(&config_dir).map_err(|e| e.to_string())?;
    if !GeneratorConfig::settings_path(&config_dir).exists() {
        // Write defaults once so they can be edited by hand.
        if let Err(e) = cfg.save(&config_dir) {
            log::warn!("could not write default settings: {e}");
        }
    }

    let output_dir = cfg.resolved_output_dir().map_err(|e| e.to_string())?;
    let assets_dir = cfg.resolved_assets_dir(&data_dir);
    log::info!("output dir: {}", output_dir.to_string_lossy());
    log::info!("assets dir: {}", assets_dir.to_string_lossy());

    let services = Services::from_config(&cfg, assets_dir, output_dir.clone()).map_err(|e| e.to_string())?;
    let dispatcher = Dispatcher::new(cfg.worker_threads);
    log::info!("dispatcher started with {} workers", dispatcher.workers());
    Ok(AppState {
        config_dir,
        output_dir,
        dispatcher,
        job: JobSlot::default(),
        services: Arc::new(services),
    })
}

#[cfg_attr(mobile, tauri::mobile_entry_point)]
pub fn run() {
    tauri::Builder::default()
        .setup(|app| {
            // File logging (AppDataDir/logs/gse-generator.log)
            let logs_dir = app_data_dir(app.handle())?.join("logs");
            logger::init(&logs_dir).map_err(|e| e.to_string())?;

            let state = build_state(app.handle())?;
            app.manage(state);
            Ok(())
        })
        .plugin(tauri_plugin_opener::init())
        .invoke_handler(tauri::generate_handler![
            load_username,
            save_username,
            generate,
            open_output_folder,
            reset_emulator
        ])
        .run(tauri::generate_context!())
        .expect("error while running tauri application");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::provision::testing::FakeFetcher;

    fn provisioner(dir: &std::path::Path) -> Provisioner {
        std::fs::create_dir_all(dir.join(provision::EMU_FOLDER)).unwrap();
        Provisioner::new(dir, "https://example.invalid/emu.zip", Arc::new(FakeFetcher::release()))
    }

    #[tokio::test]
    async fn reset_is_refused_while_a_job_runs() {
        let dir = tempfile::tempdir().unwrap();
        let prov = provisioner(dir.path());
        let slot = JobSlot::default();

        let running = slot.try_acquire().unwrap();
        assert!(matches!(reset_when_idle(&slot, &prov).await, Err(error::Error::Busy)));
        assert!(prov.is_provisioned());
        drop(running);

        assert!(reset_when_idle(&slot, &prov).await.unwrap());
        assert!(!prov.is_provisioned());
        // the slot is free again once the reset is done
        assert!(slot.try_acquire().is_ok());
    }
}
