use std::{io, net::{SocketAddr, TcpListener, TcpStream}, sync::Arc, thread};

use log::{debug, error, info};

use crate::{hooks::{dispatch, Hook}, mail_sender::Relay, smtp::{Envelope, Session}};

pub struct SmtpConfig {
    pub bind: Vec<SocketAddr>,
    /// Announced in the greeting and HELO replies
    pub domain: String
}

/// What happens to every accepted message: hooks first, then the relay.
#[derive(Debug)]
pub struct MailHandler {
    hooks: Vec<Arc<dyn Hook>>,
    relay: Option<Relay>
}

impl MailHandler {
    pub fn new(hooks: Vec<Arc<dyn Hook>>, relay: Option<Relay>) -> Self {
        Self { hooks, relay }
    }

    /// Never fails, hook and relay errors are logged.
    pub fn deliver(&self, envelope: &Envelope) {
        info!(
            "Mail from {} to {:?} received from {} ({} bytes)",
            envelope.sender, envelope.recipients, envelope.peer, envelope.body.len()
        );

        dispatch(envelope, &self.hooks);

        if let Some(relay) = &self.relay {
            match relay.forward(&envelope.sender, &envelope.recipients, &envelope.body) {
                Ok(()) => info!("Mail from {} relayed to {}", envelope.sender, relay.target()),
                Err(e) => error!("Failed to relay mail to {} : {e}", relay.target())
            }
        }
    }
}

pub struct SmtpServer {
    listeners: Vec<TcpListener>,
    domain: String,
    handler: Arc<MailHandler>
}

impl SmtpServer {
    /// Binds every configured address, failing on the first one that cannot be bound.
    pub fn bind(config: &SmtpConfig, handler: MailHandler) -> Result<Self, io::Error> {
        let listeners = config.bind.iter()
            .map(|addr| TcpListener::bind(addr)
                .map_err(|e| io::Error::new(e.kind(), format!("Could not listen on {addr} : {e}"))))
            .collect::<Result<Vec<_>, _>>()?;

        Ok(Self { listeners, domain: config.domain.clone(), handler: Arc::new(handler) })
    }

    pub fn local_addrs(&self) -> Result<Vec<SocketAddr>, io::Error> {
        self.listeners.iter().map(TcpListener::local_addr).collect()
    }

    /// Accepts connections on every listener until the process ends.
    pub fn run(self) -> Result<(), io::Error> {
        debug!("Starting SMTP server task");

        let domain = &self.domain;
        let handler = &self.handler;

        thread::scope(|s| -> Result<(), io::Error> {
            for listener in &self.listeners {
                info!("SMTP listening on {}", listener.local_addr()?);

                thread::Builder::new()
                    .name("smtp-accept".to_owned())
                    .spawn_scoped(s, move || accept_loop(listener, domain, handler))?;
            }

            Ok(())
        })
    }
}

fn accept_loop(listener: &TcpListener, domain: &str, handler: &Arc<MailHandler>) {
    for incoming in listener.incoming()
        .filter_map(|r| r.inspect_err(|e| error!("Failed to accept SMTP connection : {e}")).ok()) {

        let domain = domain.to_owned();
        let handler = handler.clone();

        let spawned = thread::Builder::new()
            .name("smtp-session".to_owned())
            .spawn(move || handle_connection(incoming, domain, &handler));

        if let Err(e) = spawned {
            error!("Failed to spawn SMTP session : {e}");
        }
    }
}

fn handle_connection(stream: TcpStream, domain: String, handler: &MailHandler) {
    let receiver = match Session::new(stream, domain).and_then(Session::into_mail_iter) {
        Ok(it) => it,
        Err(e) => {
            debug!("Failed to open SMTP session : {e}");
            return;
        }
    };

    let peer = receiver.peer();
    debug!("Connection received from {peer}");

    for mail in receiver {
        match mail {
            Ok(envelope) => handler.deliver(&envelope),
            Err(e) => debug!("Session with {peer} aborted : {e}")
        }
    }

    debug!("Connection with {peer} ended")
}
