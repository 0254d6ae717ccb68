//! Dead letters appended to a single mbox file.
//!
//! Each record is one mbox entry. A block of `X-Dead-Letter-*` headers
//! describes the record, followed by a blank line and the stored body with
//! `From ` lines escaped in the mboxrd style. `Content-Length` holds the
//! unescaped body size so the body is recovered byte for byte.

use std::{path::PathBuf, sync::Arc, time::Duration};

use async_trait::async_trait;
use chrono::{DateTime, SecondsFormat, Utc};
use herald_common::internal;
use herald_queue::{LockFile, MessageId, QueuedMessage, Recipient};
use tokio::{fs, io::AsyncWriteExt, sync::Mutex};

use super::{DeadLetterReason, DeadLetterRecord, DeadLetterSink, path_setting, write_atomic};
use crate::{
    error::{ConfigurationError, DeadLetterError},
    settings::Settings,
};

const COMPONENT: &str = "file";
const DEFAULT_PATH: &str = "/var/spool/herald/dead-letter.mbox";
const LOCK_TIMEOUT: Duration = Duration::from_secs(10);
const STALE_LOCK: Duration = Duration::from_secs(60);
const ANSIC: &str = "%a %b %e %H:%M:%S %Y";

#[derive(Debug, Clone)]
pub struct MboxDeadLetters {
    path: PathBuf,
    local: Arc<Mutex<()>>,
}

impl MboxDeadLetters {
    /// # Errors
    /// When `path` is set to a relative path.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigurationError> {
        Ok(Self::new(path_setting(COMPONENT, settings, DEFAULT_PATH)?))
    }

    #[must_use]
    pub fn new(path: impl Into<PathBuf>) -> Self {
        Self {
            path: path.into(),
            local: Arc::default(),
        }
    }

    async fn lock(&self) -> Result<LockFile, DeadLetterError> {
        if let Some(parent) = self.path.parent() {
            fs::create_dir_all(parent).await?;
        }

        let mut lock = self.path.clone().into_os_string();
        lock.push(".lock");
        Ok(LockFile::acquire(&self.local, lock.into(), LOCK_TIMEOUT, STALE_LOCK).await?)
    }

    async fn read_all(&self) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        match fs::read_to_string(&self.path).await {
            Ok(contents) => parse(&contents).map_err(|reason| DeadLetterError::Corrupted {
                path: self.path.display().to_string(),
                reason,
            }),
            Err(e) if e.kind() == std::io::ErrorKind::NotFound => Ok(Vec::new()),
            Err(e) => Err(e.into()),
        }
    }

    async fn rewrite(&self, records: &[DeadLetterRecord]) -> Result<(), DeadLetterError> {
        let contents: String = records.iter().map(render).collect();
        write_atomic(&self.path, contents.as_bytes()).await
    }
}

fn fold(value: &str) -> String {
    value.split_whitespace().collect::<Vec<_>>().join(" ")
}

fn is_from_line(line: &str) -> bool {
    line.trim_start_matches('>').starts_with("From ")
}

/// Render one record as an mbox entry.
pub(crate) fn render(record: &DeadLetterRecord) -> String {
    let message = &record.message;
    let mut out = String::with_capacity(message.body.len() + 512);

    out.push_str(&format!("From DLQ {}\n", record.dead_lettered_at.format(ANSIC)));
    out.push_str(&format!("Date: {}\n", record.dead_lettered_at.to_rfc2822()));
    out.push_str(&format!("Message-ID: <{}@dlq.local>\n", ulid::Ulid::new()));
    out.push_str(&format!("X-Dead-Letter-Id: {}\n", message.id));
    out.push_str(&format!("X-Dead-Letter-Recipient: {}\n", fold(&message.recipient.to_string())));
    out.push_str(&format!("X-Dead-Letter-Reason: {}\n", record.reason));
    out.push_str(&format!("X-Dead-Letter-Error-Count: {}\n", message.error_count));
    out.push_str(&format!(
        "X-Dead-Letter-Created: {}\n",
        message.created_at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    ));
    out.push_str(&format!(
        "X-Dead-Letter-At: {}\n",
        record.dead_lettered_at.to_rfc3339_opts(SecondsFormat::AutoSi, true)
    ));
    out.push_str(&format!("X-Dead-Letter-Error: {}\n", fold(&record.last_error)));
    out.push_str(&format!("Content-Length: {}\n\n", message.body.len()));

    for line in message.body.split('\n') {
        if is_from_line(line) {
            out.push('>');
        }
        out.push_str(line);
        out.push('\n');
    }
    out.push('\n');
    out
}

#[derive(Default)]
struct Entry<'a> {
    lines: Vec<&'a str>,
}

impl Entry<'_> {
    fn into_record(self) -> Result<DeadLetterRecord, String> {
        let mut lines = self.lines.into_iter();
        let mut id = None;
        let mut recipient = None;
        let mut reason = None;
        let mut error_count = 0;
        let mut created_at = None;
        let mut dead_lettered_at = None;
        let mut last_error = String::new();
        let mut length = None;

        for line in lines.by_ref() {
            if line.is_empty() {
                break;
            }
            let Some((name, value)) = line.split_once(": ").or_else(|| line.split_once(':')) else {
                return Err(format!("Malformed header line '{line}'"));
            };
            let value = value.trim();
            match name {
                "X-Dead-Letter-Id" => id = Some(value.parse::<MessageId>().map_err(|e| e.to_string())?),
                "X-Dead-Letter-Recipient" => {
                    recipient = Some(value.parse::<Recipient>().map_err(|e| e.to_string())?);
                }
                "X-Dead-Letter-Reason" => reason = Some(value.parse::<DeadLetterReason>()?),
                "X-Dead-Letter-Error-Count" => error_count = value.parse::<u32>().map_err(|e| e.to_string())?,
                "X-Dead-Letter-Created" => created_at = Some(parse_time(value)?),
                "X-Dead-Letter-At" => dead_lettered_at = Some(parse_time(value)?),
                "X-Dead-Letter-Error" => last_error = value.to_string(),
                "Content-Length" => length = Some(value.parse::<usize>().map_err(|e| e.to_string())?),
                _ => {}
            }
        }

        let id = id.ok_or("Missing X-Dead-Letter-Id")?;
        let length = length.ok_or_else(|| format!("Record {id} has no Content-Length"))?;

        let mut body = lines
            .map(|line| {
                if is_from_line(line) {
                    line.strip_prefix('>').unwrap_or(line)
                } else {
                    line
                }
            })
            .collect::<Vec<_>>()
            .join("\n");
        if body.len() < length || !body.is_char_boundary(length) {
            return Err(format!("Record {id} body is shorter than its Content-Length"));
        }
        body.truncate(length);

        let mut message = QueuedMessage::new(
            id,
            recipient.ok_or_else(|| format!("Record {id} has no recipient"))?,
            body,
            created_at.ok_or_else(|| format!("Record {id} has no creation time"))?,
        );
        message.error_count = error_count;
        message.last_error = Some(last_error.clone());

        Ok(DeadLetterRecord {
            message,
            reason: reason.ok_or_else(|| format!("Record {id} has no reason"))?,
            last_error,
            dead_lettered_at: dead_lettered_at.ok_or_else(|| format!("Record {id} has no escalation time"))?,
        })
    }
}

fn parse_time(value: &str) -> Result<DateTime<Utc>, String> {
    DateTime::parse_from_rfc3339(value)
        .map(|at| at.with_timezone(&Utc))
        .map_err(|e| format!("Invalid timestamp '{value}': {e}"))
}

/// Parse every entry of an mbox file.
pub(crate) fn parse(contents: &str) -> Result<Vec<DeadLetterRecord>, String> {
    let mut entries = Vec::new();
    let mut current: Option<Entry<'_>> = None;

    for line in contents.split('\n') {
        if line.starts_with("From ") {
            if let Some(entry) = current.replace(Entry::default()) {
                entries.push(entry);
            }
        } else if let Some(entry) = current.as_mut() {
            entry.lines.push(line);
        } else if !line.is_empty() {
            return Err(String::from("Content before the first From line"));
        }
    }
    entries.extend(current);

    entries.into_iter().map(Entry::into_record).collect()
}

#[async_trait]
impl DeadLetterSink for MboxDeadLetters {
    fn name(&self) -> &str {
        COMPONENT
    }

    async fn record(&self, record: DeadLetterRecord) -> Result<(), DeadLetterError> {
        let _lock = self.lock().await?;
        let mut records = self.read_all().await?;

        if let Some(existing) = records.iter_mut().find(|existing| existing.id() == record.id()) {
            internal!(level = DEBUG, id = %record.id(), "Replacing existing dead-letter entry");
            *existing = record;
            return self.rewrite(&records).await;
        }

        let mut file = fs::OpenOptions::new()
            .create(true)
            .append(true)
            .open(&self.path)
            .await?;
        file.write_all(render(&record).as_bytes()).await?;
        file.sync_data().await?;
        Ok(())
    }

    async fn list(&self) -> Result<Vec<DeadLetterRecord>, DeadLetterError> {
        let mut records = self.read_all().await?;
        records.sort_by_key(DeadLetterRecord::id);
        Ok(records)
    }

    async fn get(&self, id: MessageId) -> Result<DeadLetterRecord, DeadLetterError> {
        self.read_all()
            .await?
            .into_iter()
            .find(|record| record.id() == id)
            .ok_or(DeadLetterError::NotFound(id))
    }

    async fn remove(&self, id: MessageId) -> Result<DeadLetterRecord, DeadLetterError> {
        let _lock = self.lock().await?;
        let mut records = self.read_all().await?;
        let index = records
            .iter()
            .position(|record| record.id() == id)
            .ok_or(DeadLetterError::NotFound(id))?;

        let removed = records.remove(index);
        self.rewrite(&records).await?;
        Ok(removed)
    }
}
