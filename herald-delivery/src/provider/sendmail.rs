use std::{path::PathBuf, process::Stdio};

use async_trait::async_trait;
use herald_common::outgoing;
use tokio::{io::AsyncWriteExt, process::Command};

use super::Provider;
use crate::{
    error::{ConfigurationError, DeliveryError, PermanentError, TemporaryError},
    settings::Settings,
};

const COMPONENT: &str = "sendmail";
const DEFAULT_PATH: &str = "/usr/sbin/sendmail";

// sysexits.h
const EX_DATAERR: i32 = 65;
const EX_NOUSER: i32 = 67;
const EX_NOHOST: i32 = 68;

/// Hands each message to a local `sendmail`-compatible binary.
#[derive(Debug, Clone)]
pub struct SendmailProvider {
    path: PathBuf,
}

impl SendmailProvider {
    /// # Errors
    /// Never fails today; the binary is only checked when a message is sent.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigurationError> {
        Ok(Self {
            path: PathBuf::from(settings.get("path").unwrap_or(DEFAULT_PATH)),
        })
    }
}

/// Map a non-zero exit status onto the delivery error taxonomy.
fn classify_exit(code: Option<i32>, stderr: &str) -> DeliveryError {
    let detail = if stderr.is_empty() {
        String::from("no diagnostic output")
    } else {
        stderr.to_string()
    };

    match code {
        Some(EX_NOUSER | EX_NOHOST) => PermanentError::InvalidRecipient(detail).into(),
        Some(EX_DATAERR) => PermanentError::MessageRejected(detail).into(),
        Some(code) => TemporaryError::ServerBusy(format!("sendmail exited with {code}: {detail}")).into(),
        None => TemporaryError::ServerBusy(format!("sendmail killed by signal: {detail}")).into(),
    }
}

#[async_trait]
impl Provider for SendmailProvider {
    fn name(&self) -> &str {
        COMPONENT
    }

    async fn send(&self, address: &str, body: &str) -> Result<(), DeliveryError> {
        // A leading dash would be read as an option.
        if address.starts_with('-') {
            return Err(PermanentError::InvalidRecipient(address.to_string()).into());
        }

        let mut child = Command::new(&self.path)
            .arg("-i")
            .arg(address)
            .stdin(Stdio::piped())
            .stdout(Stdio::null())
            .stderr(Stdio::piped())
            .kill_on_drop(true)
            .spawn()
            .map_err(|e| {
                TemporaryError::ConnectionFailed(format!("Unable to run {}: {e}", self.path.display()))
            })?;

        if let Some(mut stdin) = child.stdin.take() {
            // A child that exits early closes the pipe; its exit status decides.
            match stdin.write_all(body.as_bytes()).await {
                Ok(()) => drop(stdin.shutdown().await),
                Err(e) if e.kind() == std::io::ErrorKind::BrokenPipe => {}
                Err(e) => return Err(e.into()),
            }
        }

        let output = child.wait_with_output().await?;
        let stderr = String::from_utf8_lossy(&output.stderr).trim().to_string();
        outgoing!(status = ?output.status.code(), "sendmail finished");

        if output.status.success() {
            Ok(())
        } else {
            Err(classify_exit(output.status.code(), &stderr))
        }
    }
}
