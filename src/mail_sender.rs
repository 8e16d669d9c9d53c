use std::{fmt, io, str::FromStr};

use log::debug;
use mail_send::{smtp::message::Message, SmtpClientBuilder};
use thiserror::Error;

/// Downstream SMTP server messages get forwarded to.
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct RelayTarget {
    pub host: String,
    pub port: u16
}

impl FromStr for RelayTarget {
    type Err = RelayError;

    /// `host:port`
    fn from_str(s: &str) -> Result<Self, Self::Err> {
        let Some((host, port)) = s.rsplit_once(':') else {
            return Err(RelayError::InvalidTarget(s.to_owned()));
        };

        let host = host.trim_start_matches('[').trim_end_matches(']');
        match port.parse::<u16>() {
            Ok(port) if !host.is_empty() => Ok(Self { host: host.to_owned(), port }),
            _ => Err(RelayError::InvalidTarget(s.to_owned()))
        }
    }
}

impl fmt::Display for RelayTarget {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        write!(f, "{}:{}", self.host, self.port)
    }
}

/// Forwards messages over a fresh plain SMTP connection each time.
#[derive(Debug, Clone)]
pub struct Relay {
    target: RelayTarget
}

impl Relay {
    pub fn new(target: RelayTarget) -> Self {
        Self { target }
    }

    pub fn target(&self) -> &RelayTarget {
        &self.target
    }

    /// Blocking; must not be called from within an async runtime.
    pub fn forward(&self, sender: &str, recipients: &[String], body: &[u8]) -> Result<(), RelayError> {
        tokio::runtime::Builder::new_current_thread()
            .enable_all()
            .build()
            .map_err(RelayError::Runtime)?
            .block_on(self.send(sender, recipients, body))
    }

    async fn send(&self, sender: &str, recipients: &[String], body: &[u8]) -> Result<(), RelayError> {
        debug!("Connecting to relay {}", self.target);

        // Dropping the client on any error closes the connection
        let mut client = SmtpClientBuilder::new(self.target.host.clone(), self.target.port)
            .connect_plain()
            .await?;

        let mut message = Message::empty()
            .from(sender.to_owned())
            .body(body);

        for recipient in recipients {
            message = message.to(recipient.clone());
        }

        client.send(message).await?;
        client.quit().await?;

        debug!("Message from {sender} transmitted to {}", self.target);
        Ok(())
    }
}

#[derive(Debug, Error)]
pub enum RelayError {
    #[error("Invalid relay address {0}, expected host:port")]
    InvalidTarget(String),
    #[error("Failed to start relay runtime : {0}")]
    Runtime(#[source] io::Error),
    #[error("SMTP relay error : {0}")]
    Smtp(#[from] mail_send::Error),
}
