use std::path::{Path, PathBuf};
use tokio::fs::{File, OpenOptions};
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc;
use tracing::{debug, warn};

use crate::llm::models::AuditRecord;

enum AuditCommand {
    Record(Box<AuditRecord>),
    Flush(oneshot::Sender<()>),
}

/// Append-only JSON-lines log of every model interaction.
///
/// Records go through an unbounded channel to a single writer task, so
/// callers never wait on disk and records from one caller keep their order.
/// Write failures are logged and otherwise ignored.
#[derive(Clone)]
pub struct AuditLog {
    sender: Option<mpsc::UnboundedSender<AuditCommand>>,
}

impl AuditLog {
    /// Starts the writer task. Must be called inside a Tokio runtime.
    pub fn open(path: impl Into<PathBuf>) -> Self {
        let path = path.into();
        let (sender, receiver) = mpsc::unbounded_channel();
        tokio::spawn(write_records(path, receiver));
        Self { sender: Some(sender) }
    }

    /// A log that drops every record.
    pub fn disabled() -> Self {
        Self { sender: None }
    }

    pub fn record(&self, record: AuditRecord) {
        if let Some(sender) = &self.sender {
            if sender.send(AuditCommand::Record(Box::new(record))).is_err() {
                warn!("Audit log writer has stopped, dropping record");
            }
        }
    }

    /// Waits until everything recorded so far has been written.
    pub async fn flush(&self) {
        let Some(sender) = &self.sender else {
            return;
        };
        let (ack, done) = oneshot::channel();
        if sender.send(AuditCommand::Flush(ack)).is_ok() {
            let _ = done.await;
        }
    }
}

async fn write_records(path: PathBuf, mut receiver: mpsc::UnboundedReceiver<AuditCommand>) {
    let mut file: Option<File> = None;

    while let Some(command) = receiver.recv().await {
        match command {
            AuditCommand::Record(record) => {
                let mut line = match serde_json::to_string(&record) {
                    Ok(line) => line,
                    Err(e) => {
                        warn!("Failed to serialize audit record: {}", e);
                        continue;
                    }
                };
                line.push('\n');

                if file.is_none() {
                    file = open_log(&path).await;
                }
                if let Some(handle) = file.as_mut() {
                    if let Err(e) = handle.write_all(line.as_bytes()).await {
                        warn!("Failed to write audit record to {}: {}", path.display(), e);
                        // reopen on the next record
                        file = None;
                    }
                }
            }
            AuditCommand::Flush(ack) => {
                if let Some(handle) = file.as_mut() {
                    if let Err(e) = handle.flush().await {
                        warn!("Failed to flush audit log {}: {}", path.display(), e);
                    }
                }
                let _ = ack.send(());
            }
        }
    }

    debug!("Audit log writer for {} stopped", path.display());
}

async fn open_log(path: &Path) -> Option<File> {
    if let Some(parent) = path.parent().filter(|p| !p.as_os_str().is_empty()) {
        if let Err(e) = tokio::fs::create_dir_all(parent).await {
            warn!("Failed to create audit log directory {}: {}", parent.display(), e);
            return None;
        }
    }

    match OpenOptions::new().create(true).append(true).open(path).await {
        Ok(file) => Some(file),
        Err(e) => {
            warn!("Failed to open audit log {}: {}", path.display(), e);
            None
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::llm::models::CompletionPurpose;

    fn record(prompt: &str, success: bool) -> AuditRecord {
        AuditRecord {
            timestamp: chrono::Utc::now(),
            model: "sqlcoder".to_string(),
            purpose: CompletionPurpose::SqlGeneration,
            attempt: 1,
            prompt: prompt.to_string(),
            response: success.then(|| "SELECT 1".to_string()),
            success,
            error: (!success).then(|| "timed out".to_string()),
            duration_ms: 12,
        }
    }

    #[tokio::test]
    async fn test_records_are_appended_as_json_lines() {
        let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("nested").join("audit.jsonl");

        let log = AuditLog::open(&path);
        log.record(record("first", true));
        log.record(record("second", false));
        log.flush().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        let lines: Vec<AuditRecord> = contents
            .lines()
            .map(|line| serde_json::from_str(line).unwrap())
            .collect();

        assert_eq!(lines.len(), 2);
        assert_eq!(lines[0].prompt, "first");
        assert!(lines[0].success);
        assert_eq!(lines[1].prompt, "second");
        assert_eq!(lines[1].error.as_deref(), Some("timed out"));
    }

    #[tokio::test]
    async fn test_existing_log_is_appended_to() {
        let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        let path = dir.path().join("audit.jsonl");
        std::fs::write(&path, "{\"existing\":true}\n").unwrap();

        let log = AuditLog::open(&path);
        log.record(record("new", true));
        log.flush().await;

        let contents = std::fs::read_to_string(&path).unwrap();
        assert!(contents.starts_with("{\"existing\":true}\n"));
        assert_eq!(contents.lines().count(), 2);
    }

    #[tokio::test]
    async fn test_unwritable_path_does_not_fail_callers() {
        let dir = tempfile::TempDir::new().expect("Failed to create temp dir");
        // a directory cannot be opened for appending
        let log = AuditLog::open(dir.path());
        log.record(record("lost", true));
        log.flush().await;
    }

    #[tokio::test]
    async fn test_disabled_log_ignores_records() {
        let log = AuditLog::disabled();
        log.record(record("ignored", true));
        log.flush().await;
    }
}
