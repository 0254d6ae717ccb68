//! Plain SMTP submission to a single relay.

use std::time::Duration;

use async_trait::async_trait;
use herald_common::outgoing;
use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::TcpStream,
};

use super::Provider;
use crate::{
    error::{ConfigurationError, DeliveryError, PermanentError, TemporaryError},
    settings::Settings,
};

const COMPONENT: &str = "smtp";
const CONNECT_TIMEOUT: Duration = Duration::from_secs(10);

/// A complete, possibly multi-line, server reply.
#[derive(Debug, Clone, PartialEq, Eq)]
pub(crate) struct Reply {
    pub code: u16,
    pub lines: Vec<String>,
}

impl Reply {
    /// Parse one reply line into `(code, is_last, text)`.
    pub(crate) fn parse_line(line: &str) -> Result<(u16, bool, &str), TemporaryError> {
        let line = line.trim_end_matches(['\r', '\n']);
        let code = line
            .get(..3)
            .and_then(|code| code.parse::<u16>().ok())
            .ok_or_else(|| TemporaryError::Protocol(format!("Malformed reply: '{line}'")))?;

        match line.as_bytes().get(3) {
            None => Ok((code, true, "")),
            Some(b' ') => Ok((code, true, &line[4..])),
            Some(b'-') => Ok((code, false, &line[4..])),
            Some(c) => Err(TemporaryError::Protocol(format!(
                "Invalid separator '{}' in reply: '{line}'",
                char::from(*c)
            ))),
        }
    }

    #[must_use]
    pub(crate) const fn is_success(&self) -> bool {
        self.code >= 200 && self.code < 400
    }

    fn message(&self) -> String {
        format!("{} {}", self.code, self.lines.join(" "))
    }

    /// Map an unexpected reply onto the delivery error taxonomy.
    fn into_error(self, stage: Stage) -> DeliveryError {
        let message = self.message();
        if !(500..600).contains(&self.code) {
            return TemporaryError::ServerBusy(message).into();
        }

        match stage {
            Stage::Recipient => PermanentError::InvalidRecipient(message).into(),
            Stage::Sender => PermanentError::NotAuthorised(message).into(),
            Stage::Greeting | Stage::Hello | Stage::Data | Stage::Content => {
                PermanentError::MessageRejected(message).into()
            }
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
enum Stage {
    Greeting,
    Hello,
    Sender,
    Recipient,
    Data,
    Content,
}

/// Convert bare `\n` line endings to CRLF and dot-stuff lines starting with
/// `.`, then append the end-of-data marker.
pub(crate) fn encode_data(body: &str) -> String {
    let mut out = String::with_capacity(body.len() + 64);
    for line in body.split('\n') {
        let line = line.strip_suffix('\r').unwrap_or(line);
        if line.starts_with('.') {
            out.push('.');
        }
        out.push_str(line);
        out.push_str("\r\n");
    }

    // `split` yields a trailing empty segment for bodies ending in a newline.
    if body.ends_with('\n') {
        out.truncate(out.len() - 2);
    }
    out.push_str(".\r\n");
    out
}

#[derive(Debug, Clone)]
pub struct SmtpProvider {
    host: String,
    port: u16,
    from: String,
    helo: String,
}

impl SmtpProvider {
    /// # Errors
    /// `host` and `from` are required; `port` must be a valid port number.
    pub fn from_settings(settings: &Settings) -> Result<Self, ConfigurationError> {
        Ok(Self {
            host: settings.require(COMPONENT, "host")?.to_string(),
            port: settings.parse_or(COMPONENT, "port", 25)?,
            from: settings.require(COMPONENT, "from")?.to_string(),
            helo: settings.get("helo").unwrap_or("localhost").to_string(),
        })
    }

    #[must_use]
    pub fn endpoint(&self) -> String {
        format!("{}:{}", self.host, self.port)
    }
}

struct Session {
    reader: BufReader<tokio::net::tcp::OwnedReadHalf>,
    writer: tokio::net::tcp::OwnedWriteHalf,
}

impl Session {
    async fn connect(endpoint: &str) -> Result<Self, DeliveryError> {
        let stream = tokio::time::timeout(CONNECT_TIMEOUT, TcpStream::connect(endpoint))
            .await
            .map_err(|_| TemporaryError::ConnectionFailed(format!("Timed out connecting to {endpoint}")))?
            .map_err(|e| TemporaryError::ConnectionFailed(format!("{endpoint}: {e}")))?;

        let (reader, writer) = stream.into_split();
        Ok(Self {
            reader: BufReader::new(reader),
            writer,
        })
    }

    async fn read_reply(&mut self) -> Result<Reply, DeliveryError> {
        let mut lines = Vec::new();
        let mut buffer = String::new();

        loop {
            buffer.clear();
            if self.reader.read_line(&mut buffer).await? == 0 {
                return Err(
                    TemporaryError::ConnectionFailed("Connection closed by server".into()).into(),
                );
            }

            let (code, is_last, text) = Reply::parse_line(&buffer)?;
            outgoing!("S: {}", buffer.trim_end());
            lines.push(text.to_string());

            if is_last {
                return Ok(Reply { code, lines });
            }
        }
    }

    async fn command(&mut self, command: &str) -> Result<Reply, DeliveryError> {
        outgoing!("C: {command}");
        self.writer.write_all(command.as_bytes()).await?;
        self.writer.write_all(b"\r\n").await?;
        self.writer.flush().await?;
        self.read_reply().await
    }

    async fn expect(&mut self, command: &str, stage: Stage) -> Result<Reply, DeliveryError> {
        let reply = self.command(command).await?;
        if reply.is_success() {
            Ok(reply)
        } else {
            Err(reply.into_error(stage))
        }
    }
}

#[async_trait]
impl Provider for SmtpProvider {
    fn name(&self) -> &str {
        COMPONENT
    }

    #[tracing::instrument(skip(self, body), fields(endpoint = %self.endpoint()))]
    async fn send(&self, address: &str, body: &str) -> Result<(), DeliveryError> {
        // Anything here would end or escape the RCPT TO command.
        if address.is_empty() || address.contains(['\r', '\n', '<', '>']) {
            return Err(PermanentError::InvalidRecipient(address.escape_debug().to_string()).into());
        }

        let mut session = Session::connect(&self.endpoint()).await?;

        let greeting = session.read_reply().await?;
        if greeting.code != 220 {
            return Err(greeting.into_error(Stage::Greeting));
        }

        let ehlo = session.command(&format!("EHLO {}", self.helo)).await?;
        if !ehlo.is_success() {
            session
                .expect(&format!("HELO {}", self.helo), Stage::Hello)
                .await?;
        }

        session
            .expect(&format!("MAIL FROM:<{}>", self.from), Stage::Sender)
            .await?;
        session
            .expect(&format!("RCPT TO:<{address}>"), Stage::Recipient)
            .await?;

        let data = session.command("DATA").await?;
        if data.code != 354 {
            return Err(data.into_error(Stage::Data));
        }

        outgoing!("C: <{} bytes of message data>", body.len());
        session.writer.write_all(encode_data(body).as_bytes()).await?;
        session.writer.flush().await?;
        let accepted = session.read_reply().await?;
        if !accepted.is_success() {
            return Err(accepted.into_error(Stage::Content));
        }

        // The message is accepted at this point, a failed QUIT changes nothing.
        if let Err(e) = session.command("QUIT").await {
            outgoing!(level = DEBUG, error = %e, "QUIT failed after accepted message");
        }

        Ok(())
    }
}

#[cfg(test)]
#[allow(clippy::expect_used)]
mod tests {
    use pretty_assertions::assert_eq;

    use super::*;

    #[test]
    fn parses_reply_lines() {
        assert_eq!(Reply::parse_line("250-mail.example.com\r\n").expect("parse"), (250, false, "mail.example.com"));
        assert_eq!(Reply::parse_line("250 OK\r\n").expect("parse"), (250, true, "OK"));
        assert_eq!(Reply::parse_line("354").expect("parse"), (354, true, ""));
        assert!(Reply::parse_line("25").is_err());
        assert!(Reply::parse_line("250*bad").is_err());
    }

    #[test]
    fn data_is_normalised_and_dot_stuffed() {
        assert_eq!(
            encode_data("Subject: hi\n\n.hidden\r\nend\n"),
            "Subject: hi\r\n\r\n..hidden\r\nend\r\n.\r\n"
        );
        assert_eq!(encode_data("no newline"), "no newline\r\n.\r\n");
    }

    #[test]
    fn reply_classification() {
        let busy = Reply { code: 451, lines: vec!["try later".into()] };
        assert!(busy.into_error(Stage::Recipient).is_temporary());

        let unknown = Reply { code: 550, lines: vec!["no such user".into()] };
        assert!(matches!(
            unknown.into_error(Stage::Recipient),
            DeliveryError::Permanent(PermanentError::InvalidRecipient(_))
        ));
    }

    #[test]
    fn settings_are_validated() {
        let settings = Settings::new().with("host", "mx.example.com").with("from", "noreply@example.com");
        let provider = SmtpProvider::from_settings(&settings).expect("valid");
        assert_eq!(provider.endpoint(), "mx.example.com:25");

        let err = SmtpProvider::from_settings(&settings.clone().with("port", "seventy")).expect_err("port");
        assert!(matches!(err, ConfigurationError::InvalidSetting { .. }));
    }
}
