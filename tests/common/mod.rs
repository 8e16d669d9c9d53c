#![allow(dead_code)]

use std::{
    io::{BufRead, BufReader, Read, Write},
    net::{SocketAddr, TcpStream},
    sync::{mpsc, Arc, Mutex},
    thread,
    time::Duration
};

use mailhook::{
    hooks::{Hook, HookError},
    mail_sender::Relay,
    smtp::Envelope,
    smtp_server::{MailHandler, SmtpConfig, SmtpServer}
};

pub const WAIT: Duration = Duration::from_secs(5);

/// Sends every message it sees to a channel.
pub struct Recorder {
    sender: Mutex<mpsc::Sender<Envelope>>
}

impl Recorder {
    pub fn new() -> (Arc<Self>, mpsc::Receiver<Envelope>) {
        let (sender, receiver) = mpsc::channel();
        (Arc::new(Self { sender: Mutex::new(sender) }), receiver)
    }
}

impl Hook for Recorder {
    fn name(&self) -> &str {
        "recorder"
    }

    fn process(&self, peer: SocketAddr, sender: &str, recipients: &[String], body: &[u8]) -> Result<(), HookError> {
        let mut envelope = Envelope::new(peer, sender.to_owned());
        envelope.recipients = recipients.to_vec();
        envelope.body = body.to_vec();

        self.sender.lock().unwrap().send(envelope)
            .map_err(|e| HookError::Failed(e.to_string()))
    }
}

pub struct Failing;

impl Hook for Failing {
    fn name(&self) -> &str {
        "failing"
    }

    fn process(&self, _: SocketAddr, _: &str, _: &[String], _: &[u8]) -> Result<(), HookError> {
        Err(HookError::Failed("always fails".to_owned()))
    }
}

/// Serves on an ephemeral loopback port in a background thread.
pub fn start_server(hooks: Vec<Arc<dyn Hook>>, relay: Option<Relay>) -> SocketAddr {
    let server = SmtpServer::bind(
        &SmtpConfig { bind: vec!["127.0.0.1:0".parse().unwrap()], domain: "test.local".to_owned() },
        MailHandler::new(hooks, relay)
    ).unwrap();
    let addr = server.local_addrs().unwrap()[0];

    thread::spawn(move || server.run());

    addr
}

pub struct Client {
    reader: BufReader<TcpStream>,
    writer: TcpStream
}

impl Client {
    pub fn connect(addr: SocketAddr) -> Self {
        let writer = TcpStream::connect(addr).unwrap();
        writer.set_read_timeout(Some(WAIT)).unwrap();
        let mut client = Self { reader: BufReader::new(writer.try_clone().unwrap()), writer };

        let greeting = client.reply();
        assert!(greeting.starts_with("220"), "unexpected greeting {greeting}");
        client
    }

    pub fn reply(&mut self) -> String {
        let mut line = String::new();
        self.reader.read_line(&mut line).unwrap();
        line.trim_end().to_owned()
    }

    pub fn command(&mut self, command: &str) -> String {
        self.send(&format!("{command}\r\n"));
        self.reply()
    }

    pub fn send(&mut self, raw: &str) {
        self.writer.write_all(raw.as_bytes()).unwrap();
        self.writer.flush().unwrap();
    }

    /// Full transaction, returns the reply to the final dot.
    pub fn deliver(&mut self, from: &str, to: &[&str], body: &str) -> String {
        assert!(self.command(&format!("MAIL FROM:<{from}>")).starts_with("250"));
        for recipient in to {
            assert!(self.command(&format!("RCPT TO:<{recipient}>")).starts_with("250"));
        }
        assert!(self.command("DATA").starts_with("354"));
        self.send(body);
        self.command(".")
    }

    pub fn is_closed(&mut self) -> bool {
        let mut buffer = [0_u8; 16];
        matches!(self.reader.read(&mut buffer), Ok(0))
    }
}
