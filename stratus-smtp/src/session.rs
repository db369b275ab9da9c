use std::{net::SocketAddr, sync::Arc, time::Duration};

use stratus_common::{Reply, Signal, Status, incoming, internal, outgoing, tracing};
use tokio::{
    io::{AsyncBufReadExt, AsyncRead, AsyncReadExt, AsyncWrite, AsyncWriteExt, BufReader},
    sync::broadcast::{self, error::RecvError},
};

use crate::{
    command::{Command, HeloVariant},
    error::SessionError,
    hooks::{SmtpHooks, Transaction},
};

/// Longest line read in one go. Longer data lines are read in pieces.
const MAX_LINE_LENGTH: u64 = 64 * 1024;

#[derive(PartialEq, Eq, Debug)]
pub enum Event {
    ConnectionClose,
    ConnectionKeepAlive,
}

#[derive(Clone, Debug)]
pub struct SessionConfig {
    /// Host name announced in the greeting and `EHLO` reply.
    pub banner: String,
    /// Largest accepted message in bytes; `0` disables the limit.
    pub max_message_size: usize,
    /// How long to wait for each line from the client.
    pub command_timeout: Duration,
}

impl SessionConfig {
    pub fn default_banner() -> String {
        "localhost".to_string()
    }

    pub const fn default_max_message_size() -> usize {
        32 * 1024 * 1024
    }

    pub const fn default_command_timeout() -> Duration {
        Duration::from_secs(300)
    }
}

impl Default for SessionConfig {
    fn default() -> Self {
        Self {
            banner: Self::default_banner(),
            max_message_size: Self::default_max_message_size(),
            command_timeout: Self::default_command_timeout(),
        }
    }
}

#[derive(Debug, Default)]
enum State {
    #[default]
    Connected,
    Greeted,
    Transaction {
        mail_from: Option<String>,
        rcpt_tos: Vec<String>,
    },
}

/// One client connection, driven from greeting to `QUIT`.
pub struct Session<Stream> {
    peer: SocketAddr,
    stream: BufReader<Stream>,
    hooks: Arc<dyn SmtpHooks>,
    config: Arc<SessionConfig>,
    shutdown: broadcast::Receiver<Signal>,
    state: State,
}

impl<Stream: AsyncRead + AsyncWrite + Unpin + Send> Session<Stream> {
    pub fn new(
        stream: Stream,
        peer: SocketAddr,
        hooks: Arc<dyn SmtpHooks>,
        config: Arc<SessionConfig>,
        shutdown: broadcast::Receiver<Signal>,
    ) -> Self {
        Self {
            peer,
            stream: BufReader::new(stream),
            hooks,
            config,
            shutdown,
            state: State::default(),
        }
    }

    /// Run the dialogue until the client quits or disconnects.
    ///
    /// # Errors
    ///
    /// Fails on I/O errors, an idle client, or a shutdown signal. The client
    /// is sent a `421` first where possible.
    #[tracing::instrument(level = tracing::Level::DEBUG, skip_all, fields(peer = %self.peer), err)]
    pub async fn run(mut self) -> Result<(), SessionError> {
        let result = self.converse().await;

        let farewell = match &result {
            Err(SessionError::Timeout(_)) => "Timeout, closing connection",
            Err(SessionError::Shutdown) => "Service shutting down",
            _ => return result,
        };

        if let Err(err) = self.reply(&Reply::new(Status::Unavailable, farewell)).await {
            internal!("Unable to say goodbye to {}: {err}", self.peer);
        }

        result
    }

    async fn converse(&mut self) -> Result<(), SessionError> {
        let greeting = format!("{} ESMTP Stratus relay", self.config.banner);
        self.reply(&Reply::new(Status::ServiceReady, greeting)).await?;

        let mut line = Vec::new();
        loop {
            if self.read_line(&mut line).await? == 0 {
                internal!(level = DEBUG, "{} closed the connection", self.peer);
                return Ok(());
            }

            let command = Command::try_from(line.as_slice()).unwrap_or_else(|e| e);
            incoming!("{command}");

            if self.handle(command).await? == Event::ConnectionClose {
                return Ok(());
            }
        }
    }

    async fn handle(&mut self, command: Command) -> Result<Event, SessionError> {
        let reply = match command {
            Command::Helo(HeloVariant::Ehlo(host)) => {
                self.state = State::Greeted;
                let mut lines = vec![format!("{} Hello {host}", self.config.banner)];
                if self.config.max_message_size > 0 {
                    lines.push(format!("SIZE {}", self.config.max_message_size));
                }
                lines.push("8BITMIME".to_string());
                self.reply_lines(Status::Ok, &lines).await?;
                return Ok(Event::ConnectionKeepAlive);
            }
            Command::Helo(HeloVariant::Helo(_)) => {
                self.state = State::Greeted;
                Reply::new(Status::Ok, self.config.banner.clone())
            }
            Command::MailFrom(mail_from) => match self.state {
                State::Connected => {
                    Reply::new(Status::InvalidCommandSequence, "Error: send HELO first")
                }
                State::Transaction { .. } => {
                    Reply::new(Status::InvalidCommandSequence, "Error: nested MAIL command")
                }
                State::Greeted => {
                    self.state = State::Transaction {
                        mail_from,
                        rcpt_tos: Vec::new(),
                    };
                    Reply::ok()
                }
            },
            Command::RcptTo(address) => match &mut self.state {
                State::Transaction { rcpt_tos, .. } => {
                    let reply = self.hooks.on_rcpt(self.peer, &address).await;
                    if reply.is_positive() {
                        rcpt_tos.push(address);
                    }
                    reply
                }
                _ => Reply::new(Status::InvalidCommandSequence, "Error: need MAIL command"),
            },
            Command::Data => self.data().await?,
            Command::Rset => {
                if !matches!(self.state, State::Connected) {
                    self.state = State::Greeted;
                }
                Reply::ok()
            }
            Command::Noop => Reply::ok(),
            Command::Quit => {
                self.reply(&Reply::new(Status::GoodBye, "Bye")).await?;
                return Ok(Event::ConnectionClose);
            }
            Command::Syntax(message) => Reply::new(Status::InvalidArguments, message),
            Command::Invalid(_) => {
                Reply::new(Status::Unprocessable, "Error: command not recognized")
            }
        };

        self.reply(&reply).await?;
        Ok(Event::ConnectionKeepAlive)
    }

    async fn data(&mut self) -> Result<Reply, SessionError> {
        match &self.state {
            State::Transaction { rcpt_tos, .. } if !rcpt_tos.is_empty() => {}
            State::Transaction { .. } => {
                return Ok(Reply::new(
                    Status::InvalidCommandSequence,
                    "Error: need RCPT command",
                ));
            }
            _ => {
                return Ok(Reply::new(
                    Status::InvalidCommandSequence,
                    "Error: need MAIL command",
                ));
            }
        }

        self.reply(&Reply::new(
            Status::StartMailInput,
            "End data with <CR><LF>.<CR><LF>",
        ))
        .await?;

        let content = self.receive_data().await?;

        let State::Transaction {
            mail_from,
            rcpt_tos,
        } = std::mem::replace(&mut self.state, State::Greeted)
        else {
            return Ok(Reply::new(
                Status::InvalidCommandSequence,
                "Error: need MAIL command",
            ));
        };

        let Some(content) = content else {
            return Ok(Reply::new(
                Status::ExceededStorage,
                "Error: Too much mail data",
            ));
        };

        let transaction = Transaction {
            peer: self.peer,
            mail_from,
            rcpt_tos,
            content,
        };

        Ok(self.hooks.on_data(&transaction).await)
    }

    /// Read message content up to the lone `.` line.
    ///
    /// Returns `None` if the message exceeded the configured size; the
    /// content is still read to the end so the dialogue stays in sync.
    async fn receive_data(&mut self) -> Result<Option<Vec<u8>>, SessionError> {
        let limit = self.config.max_message_size;
        let mut content = Vec::new();
        let mut oversized = false;
        let mut at_line_start = true;
        let mut line = Vec::new();

        loop {
            if self.read_line(&mut line).await? == 0 {
                return Err(SessionError::Connection(
                    std::io::ErrorKind::UnexpectedEof.into(),
                ));
            }

            if at_line_start && matches!(line.as_slice(), b".\r\n" | b".\n") {
                break;
            }

            let chunk = match line.as_slice() {
                [b'.', rest @ ..] if at_line_start => rest,
                chunk => chunk,
            };
            at_line_start = line.ends_with(b"\n");

            if oversized {
                continue;
            }

            if limit > 0 && content.len() + chunk.len() > limit {
                internal!(
                    level = WARN,
                    "Message from {} exceeds {limit} bytes, discarding",
                    self.peer
                );
                oversized = true;
                content = Vec::new();
            } else {
                content.extend_from_slice(chunk);
            }
        }

        Ok((!oversized).then_some(content))
    }

    async fn read_line(&mut self, buffer: &mut Vec<u8>) -> Result<usize, SessionError> {
        buffer.clear();
        let timeout = self.config.command_timeout;

        loop {
            let mut limited = (&mut self.stream).take(MAX_LINE_LENGTH);

            tokio::select! {
                read = tokio::time::timeout(timeout, limited.read_until(b'\n', buffer)) => {
                    return match read {
                        Ok(read) => Ok(read?),
                        Err(_) => Err(SessionError::Timeout(timeout.as_secs())),
                    };
                }
                signal = self.shutdown.recv() => {
                    if matches!(signal, Ok(Signal::Shutdown) | Err(RecvError::Closed)) {
                        return Err(SessionError::Shutdown);
                    }
                }
            }
        }
    }

    async fn reply(&mut self, reply: &Reply) -> Result<(), SessionError> {
        outgoing!("{reply}");
        self.stream
            .write_all(format!("{reply}\r\n").as_bytes())
            .await?;
        self.stream.flush().await?;
        Ok(())
    }

    async fn reply_lines(&mut self, status: Status, lines: &[String]) -> Result<(), SessionError> {
        let response: String = lines
            .iter()
            .enumerate()
            .map(|(i, line)| {
                let separator = if i + 1 == lines.len() { ' ' } else { '-' };
                format!("{status}{separator}{line}\r\n")
            })
            .collect();

        outgoing!("{}", response.trim_end());
        self.stream.write_all(response.as_bytes()).await?;
        self.stream.flush().await?;
        Ok(())
    }
}
