use std::time::Duration;

use serde::Serialize;
use tauri::{AppHandle, Emitter};
use tokio::sync::mpsc;

use crate::catalog::GameIdentity;

/// How often queued output is flushed onto the UI.
pub const DRAIN_INTERVAL: Duration = Duration::from_millis(100);

/// Event name: `gse://status`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct StatusPayload {
    pub message: String,
    pub is_error: bool,
}

/// Event name: `gse://resolved`
#[derive(Debug, Clone, Serialize, PartialEq, Eq)]
pub struct ResolvedPayload {
    pub app_id: String,
    pub name: String,
}

/// Event name: `gse://finished`
#[derive(Debug, Clone, Serialize)]
pub struct FinishedPayload {
    pub path: String,
    pub achievements: usize,
    pub dlcs: usize,
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum OutputEvent {
    Line(String),
    Status(StatusPayload),
    Resolved(ResolvedPayload),
}

/// Where pipeline stages report what they are doing.
///
/// Passed explicitly into every stage instead of redirecting a global stream.
pub trait OutputSink: Send + Sync {
    fn line(&self, message: &str);
    fn status(&self, message: &str, is_error: bool);
    /// Called once the catalog has filled in both AppID and name.
    fn resolved(&self, _game: &GameIdentity) {}
}

/// Collapses a raw message into a single display line. Empty results are dropped.
fn clean_line(message: &str) -> Option<String> {
    let cleaned = message.replace(['\r', '\n'], "");
    let cleaned = cleaned.trim();
    if cleaned.is_empty() {
        None
    } else {
        Some(cleaned.to_string())
    }
}

/// Thread-safe sink used by workers; the UI side drains the queue on a timer.
#[derive(Clone)]
pub struct QueueSink {
    tx: mpsc::UnboundedSender<OutputEvent>,
}

pub fn queue() -> (QueueSink, mpsc::UnboundedReceiver<OutputEvent>) {
    let (tx, rx) = mpsc::unbounded_channel();
    (QueueSink { tx }, rx)
}

impl OutputSink for QueueSink {
    fn line(&self, message: &str) {
        let Some(line) = clean_line(message) else {
            return;
        };
        log::info!("{line}");
        let _ = self.tx.send(OutputEvent::Line(line));
    }

    fn status(&self, message: &str, is_error: bool) {
        if is_error {
            log::error!("status: {message}");
        } else {
            log::info!("status: {message}");
        }
        let _ = self.tx.send(OutputEvent::Status(StatusPayload {
            message: message.to_string(),
            is_error,
        }));
    }

    fn resolved(&self, game: &GameIdentity) {
        let _ = self.tx.send(OutputEvent::Resolved(ResolvedPayload {
            app_id: game.app_id.to_string(),
            name: game.name.clone(),
        }));
    }
}

/// Takes everything currently queued without waiting.
pub fn drain_pending(rx: &mut mpsc::UnboundedReceiver<OutputEvent>) -> Vec<OutputEvent> {
    let mut out = vec![];
    while let Ok(ev) = rx.try_recv() {
        out.push(ev);
    }
    out
}

pub fn emit_event(app: &AppHandle, ev: OutputEvent) {
    match ev {
        OutputEvent::Line(line) => {
            let _ = app.emit("gse://log", line);
        }
        OutputEvent::Status(payload) => {
            let _ = app.emit("gse://status", payload);
        }
        OutputEvent::Resolved(payload) => {
            let _ = app.emit("gse://resolved", payload);
        }
    }
}

pub fn emit_finished(app: &AppHandle, payload: FinishedPayload) {
    let _ = app.emit("gse://finished", payload);
}

/// Polls the output queue every [`DRAIN_INTERVAL`] and forwards it to the window.
///
/// Finishes once every sender is gone and the queue is empty.
pub fn forward_to_ui(
    app: AppHandle,
    mut rx: mpsc::UnboundedReceiver<OutputEvent>,
) -> tauri::async_runtime::JoinHandle<()> {
    tauri::async_runtime::spawn(async move {
        let mut ticker = tokio::time::interval(DRAIN_INTERVAL);
        loop {
            ticker.tick().await;
            for ev in drain_pending(&mut rx) {
                emit_event(&app, ev);
            }
            if rx.is_closed() && rx.is_empty() {
                break;
            }
        }
    })
}

#[cfg(test)]
pub(crate) mod testing {
    use std::sync::Mutex;

    use super::{clean_line, OutputSink, StatusPayload};
    use crate::catalog::GameIdentity;

    /// Collects output in memory.
    #[derive(Default)]
    pub struct RecordingSink {
        pub lines: Mutex<Vec<String>>,
        pub statuses: Mutex<Vec<StatusPayload>>,
        pub resolved: Mutex<Vec<GameIdentity>>,
    }

    impl RecordingSink {
        pub fn lines(&self) -> Vec<String> {
            self.lines.lock().unwrap().clone()
        }

        pub fn statuses(&self) -> Vec<StatusPayload> {
            self.statuses.lock().unwrap().clone()
        }
    }

    impl OutputSink for RecordingSink {
        fn line(&self, message: &str) {
            if let Some(line) = clean_line(message) {
                self.lines.lock().unwrap().push(line);
            }
        }

        fn status(&self, message: &str, is_error: bool) {
            self.statuses.lock().unwrap().push(StatusPayload {
                message: message.to_string(),
                is_error,
            });
        }

        fn resolved(&self, game: &GameIdentity) {
            self.resolved.lock().unwrap().push(game.clone());
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;

    #[test]
    fn lines_are_flattened_and_blank_lines_dropped() {
        assert_eq!(clean_line("  Fetching DLCs...\r\n"), Some("Fetching DLCs...".into()));
        assert_eq!(clean_line("\n \r"), None);
    }

    #[test]
    fn queue_preserves_order_until_drained() {
        let (sink, mut rx) = queue();
        sink.line("one");
        sink.line("");
        sink.status("Generating GSE...", false);
        sink.line("two");
        sink.resolved(&GameIdentity {
            app_id: 570,
            name: "Dota 2".into(),
        });

        let events = drain_pending(&mut rx);
        assert_eq!(
            events,
            vec![
                OutputEvent::Line("one".into()),
                OutputEvent::Status(StatusPayload {
                    message: "Generating GSE...".into(),
                    is_error: false
                }),
                OutputEvent::Line("two".into()),
                OutputEvent::Resolved(ResolvedPayload {
                    app_id: "570".into(),
                    name: "Dota 2".into()
                }),
            ]
        );
        assert!(drain_pending(&mut rx).is_empty());
    }
}
