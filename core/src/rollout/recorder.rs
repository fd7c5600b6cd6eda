//! Persist Codex session rollouts (.jsonl) so sessions can be replayed or inspected later.

use std::fs::File;
use std::fs::{self};
use std::io::Error as IoError;
use std::path::Path;
use std::path::PathBuf;

use codex_protocol::ConversationId;
use time::OffsetDateTime;
use time::format_description::FormatItem;
use time::macros::format_description;
use tokio::io::AsyncWriteExt;
use tokio::sync::mpsc::Sender;
use tokio::sync::mpsc::{self};
use tokio::sync::oneshot;
use tracing::info;
use tracing::warn;

use super::SESSIONS_SUBDIR;
use super::policy::is_persisted_rollout_item;
use crate::config::Config;
use crate::protocol::InitialHistory;
use crate::protocol::ResumedHistory;
use crate::protocol::RolloutItem;
use crate::protocol::RolloutLine;
use crate::protocol::SessionMeta;

/// Written into every session meta line.
pub const ORIGINATOR: &str = "codex_cli_rs";

const FILENAME_TS_FMT: &[FormatItem] =
    format_description!("[year]-[month]-[day]T[hour]-[minute]-[second]");
const RECORD_TS_FMT: &[FormatItem] =
    format_description!("[year]-[month]-[day]T[hour]:[minute]:[second].[subsecond digits:3]Z");

/// Records the persisted subset of a session's items and flushes them to
/// disk after every write.
///
/// Rollouts are recorded as JSONL and can be inspected with tools such as:
///
/// ```ignore
/// $ jq -C . ~/.codex/sessions/2025/05/07/rollout-2025-05-07T17-24-21-5973b6c0-94b8-487b-a530-2aeb6098ae0e.jsonl
/// ```
#[derive(Clone)]
pub struct RolloutRecorder {
    tx: Sender<RolloutCmd>,
    rollout_path: PathBuf,
}

#[derive(Clone)]
pub enum RolloutRecorderParams {
    Create {
        conversation_id: ConversationId,
        instructions: Option<String>,
    },
    Resume {
        path: PathBuf,
    },
}

enum RolloutCmd {
    AddItems(Vec<RolloutItem>),
    Flush { ack: oneshot::Sender<()> },
    Shutdown { ack: oneshot::Sender<()> },
}

impl RolloutRecorderParams {
    pub fn new(conversation_id: ConversationId, instructions: Option<String>) -> Self {
        Self::Create {
            conversation_id,
            instructions,
        }
    }

    pub fn resume(path: PathBuf) -> Self {
        Self::Resume { path }
    }
}

impl RolloutRecorder {
    /// Attempt to create a new [`RolloutRecorder`]. If the sessions directory
    /// cannot be created or the rollout file cannot be opened we return the
    /// error so the caller can decide whether to disable persistence.
    pub async fn new(config: &Config, params: RolloutRecorderParams) -> std::io::Result<Self> {
        let (file, rollout_path, meta) = match params {
            RolloutRecorderParams::Create {
                conversation_id,
                instructions,
            } => {
                let LogFileInfo {
                    file,
                    path,
                    timestamp,
                } = create_log_file(config, conversation_id)?;
                let timestamp = format_record_timestamp(timestamp)?;
                (
                    tokio::fs::File::from_std(file),
                    path,
                    Some(SessionMeta {
                        id: conversation_id,
                        timestamp,
                        cwd: config.cwd.clone(),
                        originator: ORIGINATOR.to_string(),
                        cli_version: env!("CARGO_PKG_VERSION").to_string(),
                        instructions,
                    }),
                )
            }
            RolloutRecorderParams::Resume { path } => (
                tokio::fs::OpenOptions::new()
                    .append(true)
                    .open(&path)
                    .await?,
                path,
                None,
            ),
        };

        // Bounded so a stalled disk pushes back on the session instead of
        // buffering without limit.
        let (tx, rx) = mpsc::channel::<RolloutCmd>(256);
        tokio::task::spawn(async move {
            if let Err(e) = rollout_writer(file, rx, meta).await {
                warn!("rollout writer stopped: {e}");
            }
        });

        Ok(Self { tx, rollout_path })
    }

    pub fn rollout_path(&self) -> &Path {
        &self.rollout_path
    }

    /// Queues the persisted subset of `items` as one batch.
    pub(crate) async fn record_items(&self, items: &[RolloutItem]) -> std::io::Result<()> {
        let filtered: Vec<RolloutItem> = items
            .iter()
            .filter(|item| is_persisted_rollout_item(item))
            .cloned()
            .collect();
        if filtered.is_empty() {
            return Ok(());
        }
        self.tx
            .send(RolloutCmd::AddItems(filtered))
            .await
            .map_err(|e| IoError::other(format!("failed to queue rollout items: {e}")))
    }

    /// Returns once every previously queued batch has been written. This is
    /// an OS-buffer flush, not an fsync.
    pub async fn flush(&self) -> std::io::Result<()> {
        let (tx_done, rx_done) = oneshot::channel();
        self.tx
            .send(RolloutCmd::Flush { ack: tx_done })
            .await
            .map_err(|e| IoError::other(format!("failed to queue rollout flush: {e}")))?;
        rx_done
            .await
            .map_err(|e| IoError::other(format!("failed waiting for rollout flush: {e}")))
    }

    /// Reads a rollout file back. Lines that do not parse are skipped with
    /// a warning; a file without a session meta line is an error.
    pub async fn get_rollout_history(path: &Path) -> std::io::Result<InitialHistory> {
        info!("Resuming rollout from {path:?}");
        let text = tokio::fs::read_to_string(path).await?;
        if text.trim().is_empty() {
            return Err(IoError::other("empty session file"));
        }

        let mut items: Vec<RolloutItem> = Vec::new();
        let mut conversation_id: Option<ConversationId> = None;
        for line in text.lines() {
            if line.trim().is_empty() {
                continue;
            }
            match serde_json::from_str::<RolloutLine>(line) {
                Ok(RolloutLine { item, .. }) => {
                    if let RolloutItem::SessionMeta(meta) = &item
                        && conversation_id.is_none()
                    {
                        conversation_id = Some(meta.id);
                    }
                    items.push(item);
                }
                Err(e) => warn!("failed to parse rollout line: {e}"),
            }
        }

        let conversation_id = conversation_id
            .ok_or_else(|| IoError::other("failed to parse conversation ID from rollout file"))?;

        info!(
            "Resumed rollout with {} items, conversation ID: {conversation_id}",
            items.len()
        );
        Ok(InitialHistory::Resumed(ResumedHistory {
            conversation_id,
            history: items,
            rollout_path: path.to_path_buf(),
        }))
    }

    pub async fn shutdown(&self) -> std::io::Result<()> {
        let (tx_done, rx_done) = oneshot::channel();
        match self.tx.send(RolloutCmd::Shutdown { ack: tx_done }).await {
            Ok(_) => rx_done
                .await
                .map_err(|e| IoError::other(format!("failed waiting for rollout shutdown: {e}"))),
            Err(e) => {
                warn!("failed to send rollout shutdown command: {e}");
                Err(IoError::other(format!(
                    "failed to send rollout shutdown command: {e}"
                )))
            }
        }
    }
}

struct LogFileInfo {
    /// Opened file handle to the rollout file.
    file: File,

    /// Full filesystem path to the rollout file.
    path: PathBuf,

    /// Timestamp for the start of the session.
    timestamp: OffsetDateTime,
}

fn create_log_file(
    config: &Config,
    conversation_id: ConversationId,
) -> std::io::Result<LogFileInfo> {
    // Resolve ~/.codex/sessions/YYYY/MM/DD and create it if missing.
    let timestamp = OffsetDateTime::now_utc();
    let mut dir = config.codex_home.clone();
    dir.push(SESSIONS_SUBDIR);
    dir.push(timestamp.year().to_string());
    dir.push(format!("{:02}", u8::from(timestamp.month())));
    dir.push(format!("{:02}", timestamp.day()));
    fs::create_dir_all(&dir)?;

    // Use `-` instead of `:` for filesystems that do not allow colons in
    // filenames.
    let date_str = timestamp
        .format(FILENAME_TS_FMT)
        .map_err(|e| IoError::other(format!("failed to format timestamp: {e}")))?;

    let path = dir.join(format!("rollout-{date_str}-{conversation_id}.jsonl"));
    let file = std::fs::OpenOptions::new()
        .append(true)
        .create(true)
        .open(&path)?;

    Ok(LogFileInfo {
        file,
        path,
        timestamp,
    })
}

fn format_record_timestamp(timestamp: OffsetDateTime) -> std::io::Result<String> {
    timestamp
        .to_offset(time::UtcOffset::UTC)
        .format(RECORD_TS_FMT)
        .map_err(|e| IoError::other(format!("failed to format timestamp: {e}")))
}

async fn rollout_writer(
    file: tokio::fs::File,
    mut rx: mpsc::Receiver<RolloutCmd>,
    meta: Option<SessionMeta>,
) -> std::io::Result<()> {
    let mut writer = JsonlWriter { file };

    // The session meta is always the first line of a new file.
    if let Some(session_meta) = meta {
        writer
            .write_item(RolloutItem::SessionMeta(session_meta))
            .await?;
    }

    while let Some(cmd) = rx.recv().await {
        match cmd {
            RolloutCmd::AddItems(items) => {
                for item in items {
                    writer.write_item(item).await?;
                }
            }
            // Sequencing barrier: by the time we handle `Flush`, all previously
            // queued writes have been applied and flushed to OS buffers.
            RolloutCmd::Flush { ack } => {
                let _ = ack.send(());
            }
            RolloutCmd::Shutdown { ack } => {
                let _ = ack.send(());
                break;
            }
        }
    }

    Ok(())
}

struct JsonlWriter {
    file: tokio::fs::File,
}

impl JsonlWriter {
    async fn write_item(&mut self, item: RolloutItem) -> std::io::Result<()> {
        let line = RolloutLine {
            timestamp: format_record_timestamp(OffsetDateTime::now_utc())?,
            item,
        };
        let mut json = serde_json::to_string(&line)?;
        json.push('\n');
        self.file.write_all(json.as_bytes()).await?;
        self.file.flush().await?;
        Ok(())
    }
}
