use std::{io::{self, Read, Write}, net::{Shutdown, SocketAddr, TcpStream}, string::FromUtf8Error};

use log::debug;
use thiserror::Error;

/// One SMTP connection seen from the server side.
#[derive(Debug)]
pub struct Session {
    source: TcpStream,
    peer: SocketAddr,
    domain: String
}

impl Session {
    /// Greets the client right away.
    pub fn new(mut source: TcpStream, domain: String) -> Result<Self, io::Error> {
        let peer = source.peer_addr()?;
        source.write_all(&ServerCommand::OpeningMessage(domain.clone()).into_bytes())?;

        Ok(Self { source, peer, domain })
    }

    pub fn peer(&self) -> SocketAddr {
        self.peer
    }

    fn recv_commands(&self) -> Result<CommandIter<TcpStream>, io::Error> {
        Ok(CommandIter::new(self.source.try_clone()?))
    }

    fn send_command(&mut self, command: ServerCommand) -> Result<(), io::Error> {
        self.source.write_all(&command.into_bytes())
    }

    pub fn shutdown(&mut self) -> Result<(), io::Error> {
        self.source.shutdown(Shutdown::Both)
    }

    pub fn into_mail_iter(self) -> Result<MailReceiver, io::Error> {
        MailReceiver::new(self)
    }
}

impl Drop for Session {
    fn drop(&mut self) {
        if let Err(e) = self.shutdown() {
            // Usually the peer already hung up
            debug!("Session shutdown with {} : {e}", self.peer)
        }
    }
}

/// Splits the client byte stream into commands, or into a single
/// [`ClientCommand::MailInput`] once [`CommandIter::expect_mail_input`] was called.
pub struct CommandIter<R> {
    source: R,
    data: bool,
    buffer: Vec<u8>,
    /// Bytes of `buffer` already known to hold no CRLF
    scanned: usize
}

impl<R: Read> CommandIter<R> {
    pub fn new(source: R) -> Self {
        Self { source, data: false, buffer: Vec::new(), scanned: 0 }
    }

    /// Lines up to the lone `.` line are mail content, dot-unstuffed.
    pub fn expect_mail_input(&mut self) {
        self.data = true;
    }

    /// Next CRLF terminated line, terminator included.
    /// Only bytes received since the last call are scanned, the CR of a
    /// CRLF split across reads included.
    fn buffered_line(&mut self) -> Option<Vec<u8>> {
        let start = self.scanned.saturating_sub(1);

        match self.buffer[start..].windows(2).position(|it| it == b"\r\n") {
            Some(position) => {
                self.scanned = 0;
                Some(self.buffer.drain(0..start + position + 2).collect())
            },
            None => {
                self.scanned = self.buffer.len();
                None
            }
        }
    }
}

impl<R: Read> Iterator for CommandIter<R> {
    type Item = Result<ClientCommand, SmtpError>;

    fn next(&mut self) -> Option<Self::Item> {
        let mut read_buffer = [0_u8; 2048];
        let mut buffered_data: Vec<u8> = Vec::new();

        loop {
            if let Some(mut line) = self.buffered_line() {

                if !self.data {
                    return Some(ClientCommand::from_bytes(&line).map_err(SmtpError::Command));
                }

                if line == b".\r\n" {
                    self.data = false;
                    return Some(Ok(ClientCommand::MailInput(buffered_data)));
                }

                if line.starts_with(b".") {
                    line.remove(0);
                }
                buffered_data.append(&mut line);

            } else {
                match self.source.read(&mut read_buffer) {
                    // Connection closed, a half received message is dropped
                    Ok(0) => return None,
                    Ok(byte_read) => self.buffer.extend_from_slice(&read_buffer[0..byte_read]),
                    Err(e) if e.kind() == io::ErrorKind::Interrupted => continue,
                    Err(e) => return Some(Err(SmtpError::Io(e)))
                }
            }
        }
    }
}

#[derive(Debug, Error)]
pub enum SmtpError {
    #[error("IO error : {0}")]
    Io(#[from] io::Error),
    #[error("Command parsing error : {0}")]
    Command(#[from] ClientCommandParseError),
}

#[derive(Debug, PartialEq, Eq)]
pub enum ClientCommand {
    Hello(String),
    Mail(String),
    Recipient(String),
    Data,
    MailInput(Vec<u8>),
    Quit,
    Reset,
    Verify(String),
    Expand(String),
    Help(Option<String>),
    Noop(Option<String>),
}

impl ClientCommand {
    pub fn from_bytes(bytes: &[u8]) -> Result<Self, ClientCommandParseError> {

        let Some(line) = bytes.strip_suffix(b"\r\n") else {
            return Err(ClientCommandParseError::BadEol)
        };

        let mut options = line.splitn(2, |it| *it == b' ');

        let command_bytes = match options.next() {
            Some(it) if !it.is_empty() => it,
            _ => return Err(ClientCommandParseError::MissingCommand)
        };

        if !command_bytes.is_ascii() {
            return Err(ClientCommandParseError::InvalidCommandCharacter)
        }

        let command_str = String::from_utf8_lossy(command_bytes).to_ascii_uppercase();
        let argument = options.next()
            .map(|it| it.trim_ascii())
            .filter(|it| !it.is_empty());

        match command_str.as_str() {

            "HELO" | "EHLO" => {
                let Some(domain) = argument else {
                    return Err(ClientCommandParseError::MissingDomain);
                };

                Ok(ClientCommand::Hello(utf8(domain)?))
            }

            "MAIL" => {
                let Some(params) = argument else {
                    return Err(ClientCommandParseError::MissingParameter);
                };

                Ok(ClientCommand::Mail(parse_path(params, b"FROM:", true)?))
            }

            "RCPT" => {
                let Some(params) = argument else {
                    return Err(ClientCommandParseError::MissingParameter);
                };

                Ok(ClientCommand::Recipient(parse_path(params, b"TO:", false)?))
            }

            "DATA" => Ok(Self::Data),

            "QUIT" => Ok(Self::Quit),

            "RSET" => Ok(Self::Reset),

            "VRFY" => {
                let Some(str) = argument else {
                    return Err(ClientCommandParseError::MissingParameter);
                };

                Ok(ClientCommand::Verify(utf8(str)?))
            }

            "EXPN" => {
                let Some(str) = argument else {
                    return Err(ClientCommandParseError::MissingParameter);
                };

                Ok(ClientCommand::Expand(utf8(str)?))
            }

            "HELP" => Ok(ClientCommand::Help(argument.map(utf8).transpose()?)),

            "NOOP" => Ok(ClientCommand::Noop(argument.map(utf8).transpose()?)),

            _ => Err(ClientCommandParseError::InvalidCommand(command_str))

        }
    }
}

fn utf8(bytes: &[u8]) -> Result<String, ClientCommandParseError> {
    String::from_utf8(bytes.to_vec()).map_err(ClientCommandParseError::InvalidCharacter)
}

/// Address of a `FROM:<path>` / `TO:<path>` argument, brackets and ESMTP
/// parameters stripped. `<>` is only accepted where `allow_null` is set.
fn parse_path(params: &[u8], keyword: &[u8], allow_null: bool) -> Result<String, ClientCommandParseError> {
    if params.len() < keyword.len() || !params[..keyword.len()].eq_ignore_ascii_case(keyword) {
        return Err(ClientCommandParseError::SyntaxInvalid);
    }

    let path = utf8(params[keyword.len()..].trim_ascii_start())?;

    let address = match path.strip_prefix('<') {
        Some(bracketed) => {
            let Some((address, _esmtp_params)) = bracketed.split_once('>') else {
                return Err(ClientCommandParseError::SyntaxInvalid);
            };
            address
        },
        None => path.split(' ').next().unwrap_or_default()
    };

    if address.contains(' ') || (address.is_empty() && !(allow_null && path.starts_with('<'))) {
        return Err(ClientCommandParseError::SyntaxInvalid);
    }

    Ok(address.to_owned())
}

#[derive(Debug, Error)]
pub enum ClientCommandParseError {
    #[error("Command do not end with CRLF line end")]
    BadEol,
    #[error("Missing command")]
    MissingCommand,
    #[error("Missing domain parameter in HELO command")]
    MissingDomain,
    #[error("Syntax invalid")]
    SyntaxInvalid,
    #[error("Invalid ASCII character in command")]
    InvalidCommandCharacter,
    #[error("Invalid character {0}")]
    InvalidCharacter(FromUtf8Error),
    #[error("Invalid command {0}")]
    InvalidCommand(String),
    #[error("Required parameter is missing")]
    MissingParameter
}

#[derive(Debug)]
pub enum ServerCommand {
    OpeningMessage(String),
    HelloOk {
        domain: String,
        greet: Option<String>
    },
    SenderOk,
    RecipientOk,
    NoopOk,
    ResetOk,
    StartMailInput,
    MailOk,
    ClosingConnection,
    SyntaxError,
    CommandUnrecognized,
    CommandNotImplemented,
    BadSequenceOfCommand(String)
}

impl ServerCommand {
    pub fn into_bytes(self) -> Vec<u8> {
        match self {

            ServerCommand::OpeningMessage(domain) =>
                format!("220 {domain} Service ready\r\n").into_bytes(),

            ServerCommand::HelloOk { domain, greet } => match greet {
                Some(greet) => format!("250 {domain} {greet}\r\n").into_bytes(),
                None => format!("250 {domain}\r\n").into_bytes()
            },

            ServerCommand::SenderOk =>
                b"250 Sender Ok\r\n".to_vec(),

            ServerCommand::RecipientOk =>
                b"250 Recipient Ok\r\n".to_vec(),

            ServerCommand::StartMailInput =>
                b"354 Start mail input; end with <CRLF>.<CRLF>\r\n".to_vec(),

            ServerCommand::MailOk =>
                b"250 Mail Ok\r\n".to_vec(),

            ServerCommand::ClosingConnection =>
                b"221 Closing connection\r\n".to_vec(),

            ServerCommand::SyntaxError =>
                b"501 Syntax error\r\n".to_vec(),

            ServerCommand::CommandNotImplemented =>
                b"502 Not implemented\r\n".to_vec(),

            ServerCommand::CommandUnrecognized =>
                b"500 Command unrecognized\r\n".to_vec(),

            ServerCommand::BadSequenceOfCommand(text) =>
                format!("503 Bad sequence of command. {text}\r\n").into_bytes(),

            ServerCommand::NoopOk | ServerCommand::ResetOk =>
                b"250 OK\r\n".to_vec(),
        }
    }
}

/// Drives the SMTP dialogue of a [`Session`] and yields every completed
/// [`Envelope`], after the client got its final `250` for the DATA.
pub struct MailReceiver {
    session: Session,
    commands: CommandIter<TcpStream>,
    closed: bool
}

impl MailReceiver {
    pub fn new(smtp_session: Session) -> Result<Self, io::Error> {
        let commands = smtp_session.recv_commands()?;
        Ok(Self { session: smtp_session, commands, closed: false })
    }

    pub fn peer(&self) -> SocketAddr {
        self.session.peer
    }

    fn reply(&mut self, command: ServerCommand) -> Result<(), SmtpError> {
        Ok(self.session.send_command(command)?)
    }

    fn next_envelope(&mut self) -> Result<Option<Envelope>, SmtpError> {
        // None: awaiting MAIL, empty recipients: awaiting RCPT
        let mut current_mail: Option<Envelope> = None;

        while let Some(command) = self.commands.next() {
            let command = match command {
                Ok(command) => command,
                Err(SmtpError::Command(e)) => {
                    debug!("Invalid command from {} : {e}", self.session.peer);
                    self.reply(parse_error_reply(&e))?;
                    continue;
                },
                Err(e) => return Err(e)
            };

            if !matches!(command, ClientCommand::MailInput(_)) {
                debug!("New command {:?}", command);
            }

            match command {

                ClientCommand::Hello(client_domain) => self.reply(ServerCommand::HelloOk {
                    domain: self.session.domain.clone(),
                    greet: Some(format!("greets {client_domain}"))
                })?,

                ClientCommand::Mail(from_address) => match current_mail {
                    Some(_) => self.reply(ServerCommand::BadSequenceOfCommand("Mail sequence already started".to_owned()))?,
                    None => {
                        current_mail = Some(Envelope::new(self.session.peer, from_address));
                        self.reply(ServerCommand::SenderOk)?;
                    }
                },

                ClientCommand::Recipient(recipient_address) => match &mut current_mail {
                    Some(m) => {
                        m.recipients.push(recipient_address);
                        self.reply(ServerCommand::RecipientOk)?;
                    },
                    None => self.reply(ServerCommand::BadSequenceOfCommand("No mail sequence. Begin with a MAIL command".to_owned()))?
                },

                ClientCommand::Data => match &current_mail {
                    Some(m) if !m.recipients.is_empty() => {
                        self.reply(ServerCommand::StartMailInput)?;
                        self.commands.expect_mail_input();
                    },
                    Some(_) => self.reply(ServerCommand::BadSequenceOfCommand("No recipient. Send a RCPT command first".to_owned()))?,
                    None => self.reply(ServerCommand::BadSequenceOfCommand("No mail sequence. Begin with a MAIL command".to_owned()))?
                },

                ClientCommand::MailInput(content) => match current_mail.take() {
                    Some(mut m) => {
                        m.body = content;
                        self.reply(ServerCommand::MailOk)?;
                        return Ok(Some(m));
                    },
                    None => self.reply(ServerCommand::BadSequenceOfCommand("No mail sequence. Begin with a MAIL command".to_owned()))?
                },

                ClientCommand::Quit => {
                    self.reply(ServerCommand::ClosingConnection)?;
                    return Ok(None);
                },

                ClientCommand::Reset => {
                    current_mail = None;
                    self.reply(ServerCommand::ResetOk)?;
                },

                ClientCommand::Noop(_) => self.reply(ServerCommand::NoopOk)?,

                ClientCommand::Verify(_) |
                ClientCommand::Expand(_) |
                ClientCommand::Help(_) => self.reply(ServerCommand::CommandNotImplemented)?,
            }
        }

        Ok(None)
    }
}

fn parse_error_reply(error: &ClientCommandParseError) -> ServerCommand {
    match error {
        ClientCommandParseError::BadEol |
        ClientCommandParseError::InvalidCharacter(_) |
        ClientCommandParseError::InvalidCommandCharacter |
        ClientCommandParseError::SyntaxInvalid |
        ClientCommandParseError::MissingDomain |
        ClientCommandParseError::MissingParameter => ServerCommand::SyntaxError,
        ClientCommandParseError::MissingCommand |
        ClientCommandParseError::InvalidCommand(_) => ServerCommand::CommandUnrecognized
    }
}

impl Iterator for MailReceiver {
    type Item = Result<Envelope, SmtpError>;

    fn next(&mut self) -> Option<Self::Item> {
        if self.closed {
            return None;
        }

        let next = self.next_envelope();
        if !matches!(next, Ok(Some(_))) {
            self.closed = true;
        }

        next.transpose()
    }
}

/// A message as accepted from the client.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Envelope {
    pub peer: SocketAddr,
    pub sender: String,
    pub recipients: Vec<String>,
    /// CRLF terminated lines, dot-unstuffed
    pub body: Vec<u8>
}

impl Envelope {
    pub fn new(peer: SocketAddr, sender: String) -> Self {
        Self { peer, sender, recipients: Vec::new(), body: Vec::new() }
    }
}
