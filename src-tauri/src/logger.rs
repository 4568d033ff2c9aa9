use std::path::{Path, PathBuf};

use log::LevelFilter;
use log4rs::{
    append::rolling_file::{
        policy::compound::{
            roll::fixed_window::FixedWindowRoller, trigger::size::SizeTrigger, CompoundPolicy,
        },
        RollingFileAppender,
    },
    config::{Appender, Config, Root},
    encode::pattern::PatternEncoder,
};

type AnyError = Box<dyn std::error::Error + Send + Sync>;

const LOG_NAME: &str = "gse-generator";
const MAX_LOG_BYTES: u64 = 10 * 1024 * 1024;
const KEEP_ROLLED: u32 = 5;
const FILE_PATTERN: &str = "{d(%Y-%m-%d %H:%M:%S%.3f)} [{l}] {t} {M} - {m}{n}";

pub fn log_file(logs_dir: &Path) -> PathBuf {
    logs_dir.join(format!("{LOG_NAME}.log"))
}

/// Rolling file appender (plus stdout in debug builds) writing into `logs_dir`.
fn build_config(logs_dir: &Path, level: LevelFilter) -> Result<Config, AnyError> {
    std::fs::create_dir_all(logs_dir)?;

    let roller = FixedWindowRoller::builder().build(
        &logs_dir
            .join(format!("{LOG_NAME}.{{}}.log"))
            .to_string_lossy(),
        KEEP_ROLLED,
    )?;
    let policy = CompoundPolicy::new(Box::new(SizeTrigger::new(MAX_LOG_BYTES)), Box::new(roller));

    let file_appender = RollingFileAppender::builder()
        .encoder(Box::new(PatternEncoder::new(FILE_PATTERN)))
        .build(log_file(logs_dir), Box::new(policy))?;

    let builder = Config::builder().appender(Appender::builder().build("file", Box::new(file_appender)));
    let root = Root::builder().appender("file");

    #[cfg(debug_assertions)]
    let (builder, root) = {
        use log4rs::append::console::ConsoleAppender;
        let stdout = ConsoleAppender::builder()
            .encoder(Box::new(PatternEncoder::new("[{l}] {m}{n}")))
            .build();
        (
            builder.appender(Appender::builder().build("stdout", Box::new(stdout))),
            root.appender("stdout"),
        )
    };

    Ok(builder.build(root.build(level))?)
}

/// Starts file logging under `<AppData>/logs`. A second call is a no-op.
pub fn init(logs_dir: &Path) -> Result<(), AnyError> {
    let cfg = build_config(logs_dir, LevelFilter::Info)?;
    if log4rs::init_config(cfg).is_err() {
        return Ok(());
    }

    std::panic::set_hook(Box::new(|info| {
        log::error!("panic: {info}");
    }));

    log::info!("logger initialized");
    log::info!("log file: {}", log_file(logs_dir).to_string_lossy());
    Ok(())
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn config_creates_the_log_directory() {
        let dir = tempfile::tempdir().unwrap();
        let logs = dir.path().join("logs");
        build_config(&logs, LevelFilter::Debug).unwrap();
        assert!(logs.is_dir());
        assert_eq!(log_file(&logs).file_name().unwrap(), "gse-generator.log");
    }
}
