use std::{io, process::ExitCode, sync::Arc};

use clap::Parser;
use log::info;
use mailhook::{
    config::{local_hostname, Action, Cli, ConfigError, Settings},
    daemon::{Daemon, DaemonConfig, DaemonError},
    hooks::{Hook, HookRegistry, UnknownHooks},
    mail_sender::Relay,
    smtp_server::{MailHandler, SmtpConfig, SmtpServer}
};
use simple_logger::SimpleLogger;
use thiserror::Error;

#[derive(Debug, Error)]
enum AppError {
    #[error(transparent)]
    Config(#[from] ConfigError),
    #[error(transparent)]
    Hooks(#[from] UnknownHooks),
    #[error(transparent)]
    Daemon(#[from] DaemonError),
    #[error(transparent)]
    Io(#[from] io::Error),
}

fn main() -> ExitCode {
    match run(Cli::parse()) {
        Ok(()) => ExitCode::SUCCESS,
        Err(e) => {
            eprintln!("{e}");
            ExitCode::FAILURE
        }
    }
}

fn run(cli: Cli) -> Result<(), AppError> {
    let settings = Settings::from_cli(cli)?;

    SimpleLogger::new()
        .with_level(settings.log_level)
        .init()
        .expect("Failed to start log system");

    let registry = HookRegistry::builtin();
    let hooks = registry.build(&settings.hooks)?;

    match settings.action {
        Action::Hooks => {
            for name in registry.names() {
                println!("{name}");
            }
        },
        Action::Run => create_server(&settings, hooks)?.run()?,
        Action::Start => daemon(&settings)?.start(|| create_server(&settings, hooks), SmtpServer::run)?,
        Action::Stop => daemon(&settings)?.stop()?,
        Action::Restart => daemon(&settings)?.restart(|| create_server(&settings, hooks), SmtpServer::run)?,
        Action::Status => println!("{}", daemon(&settings)?.status()),
    }

    Ok(())
}

fn create_server(settings: &Settings, hooks: Vec<Arc<dyn Hook>>) -> Result<SmtpServer, io::Error> {
    info!("Starting SMTP server at {}", settings.bind_addr());

    let relay = settings.relay.clone().map(Relay::new);
    if let Some(relay) = &relay {
        info!("Relaying messages to {}", relay.target());
    }

    SmtpServer::bind(
        &SmtpConfig { bind: vec![settings.bind_addr()], domain: local_hostname() },
        MailHandler::new(hooks, relay)
    )
}

fn daemon(settings: &Settings) -> Result<Daemon, DaemonError> {
    let config = DaemonConfig::for_name(&settings.daemon_name())?
        .stdout(&settings.stdout)
        .stderr(&settings.stderr);

    Ok(Daemon::new(config))
}
