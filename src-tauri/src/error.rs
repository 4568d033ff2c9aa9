use std::fmt;

use serde::Serialize;

/// Stages that run after the binary is picked; their failures are tagged.
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
pub enum Stage {
    CopyAndPatch,
    Achievements,
    Dlc,
    UserConfig,
}

impl fmt::Display for Stage {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        let name = match self {
            Stage::CopyAndPatch => "copy & patch",
            Stage::Achievements => "achievements",
            Stage::Dlc => "dlc",
            Stage::UserConfig => "user config",
        };
        f.write_str(name)
    }
}

#[derive(Debug, thiserror::Error)]
pub enum Error {
    #[error("{0}")]
    NotFound(String),

    #[error("failed to set up GBE: {0}")]
    Provision(String),

    #[error("emulator layout: {0}")]
    Layout(String),

    #[error("failed to generate files ({stage}): {message}")]
    Generation { stage: Stage, message: String },

    #[error("{0}")]
    InvalidInput(String),

    #[error("a generation job is already running")]
    Busy,

    #[error("background task failed: {0}")]
    Dispatch(String),

    #[error("archive: {0}")]
    Archive(String),

    #[error(transparent)]
    Io(#[from] std::io::Error),

    #[error(transparent)]
    Http(#[from] reqwest::Error),

    #[error(transparent)]
    Json(#[from] serde_json::Error),
}

impl Error {
    /// Wraps any error raised while a generation stage runs.
    pub fn in_stage(stage: Stage, err: impl fmt::Display) -> Self {
        Error::Generation {
            stage,
            message: err.to_string(),
        }
    }
}

pub type Result<T> = std::result::Result<T, Error>;

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn generation_error_names_the_stage() {
        let err = Error::in_stage(Stage::CopyAndPatch, "steam_interfaces.txt was not produced");
        assert_eq!(
            err.to_string(),
            "failed to generate files (copy & patch): steam_interfaces.txt was not produced"
        );
    }

    #[test]
    fn not_found_message_is_passed_through() {
        let err = Error::NotFound("Could not find AppID for 'Nope'".into());
        assert_eq!(err.to_string(), "Could not find AppID for 'Nope'");
    }
}
