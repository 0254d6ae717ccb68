//! Scriptable SMTP relay for provider tests
//!
//! Every reply can be overridden through the builder, and the server can be
//! told to drop the connection or stall after a number of commands.
#![allow(dead_code)]

use std::{
    fmt::Write,
    net::SocketAddr,
    sync::{
        Arc,
        atomic::{AtomicBool, Ordering},
    },
    time::Duration,
};

use tokio::{
    io::{AsyncBufReadExt, AsyncWriteExt, BufReader},
    net::{TcpListener, TcpStream},
    sync::RwLock,
    time::timeout,
};

#[derive(Debug, Clone, PartialEq, Eq)]
pub enum Received {
    Ehlo(String),
    Helo(String),
    MailFrom(String),
    RcptTo(String),
    Data,
    /// Raw bytes between `DATA` and the terminating dot, still dot-stuffed.
    Content(String),
    Quit,
    Other(String),
}

#[derive(Debug, Clone)]
struct Reply {
    code: u16,
    text: String,
}

impl Reply {
    fn new(code: u16, text: impl Into<String>) -> Self {
        Self {
            code,
            text: text.into(),
        }
    }

    fn render(&self) -> String {
        format!("{} {}\r\n", self.code, self.text)
    }
}

#[derive(Debug, Clone)]
struct Script {
    greeting: Reply,
    ehlo: Option<(u16, Vec<String>)>,
    helo: Reply,
    mail_from: Reply,
    rcpt_to: Reply,
    data: Reply,
    data_end: Reply,
    quit: Reply,
    drop_after: Option<usize>,
    stall_on: Option<usize>,
}

impl Default for Script {
    fn default() -> Self {
        Self {
            greeting: Reply::new(220, "mock.herald.test ready"),
            ehlo: Some((250, vec!["mock.herald.test".into(), "SIZE 10000".into()])),
            helo: Reply::new(250, "Hello"),
            mail_from: Reply::new(250, "OK"),
            rcpt_to: Reply::new(250, "OK"),
            data: Reply::new(354, "End data with <CR><LF>.<CR><LF>"),
            data_end: Reply::new(250, "OK: queued"),
            quit: Reply::new(221, "Bye"),
            drop_after: None,
            stall_on: None,
        }
    }
}

impl Script {
    fn ehlo_reply(&self) -> String {
        let Some((code, lines)) = &self.ehlo else {
            return Reply::new(502, "Command not implemented").render();
        };

        let mut out = String::new();
        for (i, line) in lines.iter().enumerate() {
            let separator = if i + 1 == lines.len() { ' ' } else { '-' };
            let _ = write!(out, "{code}{separator}{line}\r\n");
        }
        out
    }
}

pub struct MockSmtpServer {
    addr: SocketAddr,
    received: Arc<RwLock<Vec<Received>>>,
    shutdown: Arc<AtomicBool>,
}

impl MockSmtpServer {
    pub fn builder() -> MockSmtpServerBuilder {
        MockSmtpServerBuilder {
            script: Script::default(),
        }
    }

    pub const fn addr(&self) -> SocketAddr {
        self.addr
    }

    pub async fn received(&self) -> Vec<Received> {
        self.received.read().await.clone()
    }

    /// Message contents accepted so far.
    pub async fn contents(&self) -> Vec<String> {
        self.received
            .read()
            .await
            .iter()
            .filter_map(|received| match received {
                Received::Content(content) => Some(content.clone()),
                _ => None,
            })
            .collect()
    }

    pub fn shutdown(&self) {
        self.shutdown.store(true, Ordering::Relaxed);
    }

    async fn handle(
        mut stream: TcpStream,
        script: Arc<Script>,
        received: Arc<RwLock<Vec<Received>>>,
    ) -> std::io::Result<()> {
        let (reader, mut writer) = stream.split();
        let mut reader = BufReader::new(reader);
        let mut line = String::new();
        let mut commands = 0;

        writer.write_all(script.greeting.render().as_bytes()).await?;

        loop {
            if script.drop_after.is_some_and(|after| commands >= after) {
                return Ok(());
            }
            if script.stall_on == Some(commands) {
                tokio::time::sleep(Duration::from_secs(3600)).await;
                return Ok(());
            }

            line.clear();
            match timeout(Duration::from_secs(10), reader.read_line(&mut line)).await {
                Ok(Ok(0)) | Err(_) => return Ok(()),
                Ok(Ok(_)) => {}
                Ok(Err(e)) => return Err(e),
            }
            commands += 1;

            let command = line.trim_end();
            let (verb, argument) = command.split_once(' ').unwrap_or((command, ""));
            let (reply, entry) = match verb.to_ascii_uppercase().as_str() {
                "EHLO" => (script.ehlo_reply(), Received::Ehlo(argument.to_string())),
                "HELO" => (script.helo.render(), Received::Helo(argument.to_string())),
                "MAIL" => (script.mail_from.render(), Received::MailFrom(argument.to_string())),
                "RCPT" => (script.rcpt_to.render(), Received::RcptTo(argument.to_string())),
                "DATA" => (script.data.render(), Received::Data),
                "QUIT" => {
                    received.write().await.push(Received::Quit);
                    writer.write_all(script.quit.render().as_bytes()).await?;
                    return Ok(());
                }
                _ => (
                    Reply::new(500, "Unknown command").render(),
                    Received::Other(command.to_string()),
                ),
            };

            let is_data = entry == Received::Data;
            received.write().await.push(entry);
            writer.write_all(reply.as_bytes()).await?;

            if is_data && script.data.code == 354 {
                let mut content = String::new();
                loop {
                    line.clear();
                    if reader.read_line(&mut line).await? == 0 {
                        return Ok(());
                    }
                    if line == ".\r\n" {
                        break;
                    }
                    content.push_str(&line);
                }
                received.write().await.push(Received::Content(content));
                writer.write_all(script.data_end.render().as_bytes()).await?;
            }
        }
    }
}

pub struct MockSmtpServerBuilder {
    script: Script,
}

impl MockSmtpServerBuilder {
    #[must_use]
    pub fn with_greeting(mut self, code: u16, text: &str) -> Self {
        self.script.greeting = Reply::new(code, text);
        self
    }

    /// Reject `EHLO` so the client falls back to `HELO`.
    #[must_use]
    pub fn without_ehlo(mut self) -> Self {
        self.script.ehlo = None;
        self
    }

    #[must_use]
    pub fn with_mail_from(mut self, code: u16, text: &str) -> Self {
        self.script.mail_from = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_rcpt_to(mut self, code: u16, text: &str) -> Self {
        self.script.rcpt_to = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_data(mut self, code: u16, text: &str) -> Self {
        self.script.data = Reply::new(code, text);
        self
    }

    #[must_use]
    pub fn with_data_end(mut self, code: u16, text: &str) -> Self {
        self.script.data_end = Reply::new(code, text);
        self
    }

    /// Close the connection after `count` commands.
    #[must_use]
    pub const fn dropping_after(mut self, count: usize) -> Self {
        self.script.drop_after = Some(count);
        self
    }

    /// Stop answering once `count` commands have been read.
    #[must_use]
    pub const fn stalling_on(mut self, count: usize) -> Self {
        self.script.stall_on = Some(count);
        self
    }

    pub async fn build(self) -> std::io::Result<MockSmtpServer> {
        let listener = TcpListener::bind("127.0.0.1:0").await?;
        let addr = listener.local_addr()?;

        let script = Arc::new(self.script);
        let received = Arc::new(RwLock::new(Vec::new()));
        let shutdown = Arc::new(AtomicBool::new(false));

        let accept_received = Arc::clone(&received);
        let accept_shutdown = Arc::clone(&shutdown);
        tokio::spawn(async move {
            while !accept_shutdown.load(Ordering::Relaxed) {
                let Ok(Ok((stream, _))) = timeout(Duration::from_millis(100), listener.accept()).await
                else {
                    continue;
                };

                let script = Arc::clone(&script);
                let received = Arc::clone(&accept_received);
                tokio::spawn(async move {
                    if let Err(e) = MockSmtpServer::handle(stream, script, received).await {
                        tracing::debug!("Mock server client error: {e}");
                    }
                });
            }
        });

        Ok(MockSmtpServer {
            addr,
            received,
            shutdown,
        })
    }
}
