use std::{
    env,
    fs,
    io,
    net::{IpAddr, Ipv4Addr, SocketAddr, ToSocketAddrs},
    path::{Path, PathBuf}
};

use clap::{Parser, ValueEnum};
use log::LevelFilter;
use serde::Deserialize;
use thiserror::Error;

use crate::{hooks::Printer, mail_sender::{RelayError, RelayTarget}};

pub const DEFAULT_PORT: u16 = 25;
const DEFAULT_STDOUT: &str = "output.log";
const DEFAULT_STDERR: &str = "error.log";

#[derive(Debug, Clone, Copy, PartialEq, Eq, ValueEnum)]
pub enum Action {
    /// Serve in the foreground
    Run,
    Start,
    Stop,
    Restart,
    Status,
    /// List the available hooks
    Hooks
}

#[derive(Debug, Parser)]
#[command(name = "mailhook", version, about = "SMTP server running hooks on every message it receives")]
pub struct Cli {
    #[arg(value_enum)]
    pub action: Action,

    /// Server public ip (default: resolved from the hostname)
    #[arg(long)]
    pub ip: Option<IpAddr>,

    /// Server port (default: 25)
    #[arg(long)]
    pub port: Option<u16>,

    /// Redirect standard output of the daemon to a file
    #[arg(long)]
    pub stdout: Option<PathBuf>,

    /// Redirect standard error of the daemon to a file
    #[arg(long)]
    pub stderr: Option<PathBuf>,

    /// Load configuration from a JSON file, command line values win
    #[arg(long)]
    pub config: Option<PathBuf>,

    /// Relay messages to another SMTP server
    #[arg(long, value_name = "HOST:PORT")]
    pub proxy: Option<String>,

    /// Attach a hook by name, can be repeated. The printer hook is always attached
    #[arg(long = "hook", value_name = "NAME")]
    pub hooks: Vec<String>,

    #[arg(long, conflicts_with = "silent")]
    pub verbose: bool,

    #[arg(long)]
    pub silent: bool,
}

/// Same keys as the command line options.
#[derive(Debug, Default, PartialEq, Eq, Deserialize)]
#[serde(default)]
pub struct FileConfig {
    pub ip: Option<IpAddr>,
    pub port: Option<u16>,
    pub stdout: Option<PathBuf>,
    pub stderr: Option<PathBuf>,
    pub proxy: Option<String>,
    pub hooks: Option<Vec<String>>,
    pub verbose: Option<bool>,
    pub silent: Option<bool>
}

impl FileConfig {
    pub fn load(path: &Path) -> Result<Self, ConfigError> {
        let content = fs::read_to_string(path)
            .map_err(|e| ConfigError::Read(path.to_owned(), e))?;

        serde_json::from_str(&content)
            .map_err(|e| ConfigError::Parse(path.to_owned(), e))
    }
}

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct Settings {
    pub action: Action,
    pub ip: IpAddr,
    pub port: u16,
    pub stdout: PathBuf,
    pub stderr: PathBuf,
    pub relay: Option<RelayTarget>,
    /// Printer first, no duplicates
    pub hooks: Vec<String>,
    pub log_level: LevelFilter
}

impl Settings {
    pub fn from_cli(cli: Cli) -> Result<Self, ConfigError> {
        let file = match &cli.config {
            Some(path) => FileConfig::load(path)?,
            None => FileConfig::default()
        };

        let working_dir = env::current_dir().map_err(ConfigError::WorkingDir)?;
        Self::merge(cli, file, &working_dir)
    }

    pub fn merge(cli: Cli, file: FileConfig, working_dir: &Path) -> Result<Self, ConfigError> {
        let relay = cli.proxy.or(file.proxy)
            .map(|proxy| proxy.parse::<RelayTarget>())
            .transpose()?;

        let requested_hooks = if cli.hooks.is_empty() {
            file.hooks.unwrap_or_default()
        } else {
            cli.hooks
        };

        let mut hooks = vec![Printer::NAME.to_owned()];
        for hook in requested_hooks {
            if !hooks.contains(&hook) {
                hooks.push(hook);
            }
        }

        let verbose = cli.verbose || file.verbose.unwrap_or(false);
        let silent = cli.silent || file.silent.unwrap_or(false);
        let log_level = match (verbose, silent) {
            (_, true) => LevelFilter::Warn,
            (true, false) => LevelFilter::Debug,
            (false, false) => LevelFilter::Info
        };

        Ok(Self {
            action: cli.action,
            ip: cli.ip.or(file.ip).unwrap_or_else(public_ip),
            port: cli.port.or(file.port).unwrap_or(DEFAULT_PORT),
            stdout: working_dir.join(cli.stdout.or(file.stdout).unwrap_or_else(|| DEFAULT_STDOUT.into())),
            stderr: working_dir.join(cli.stderr.or(file.stderr).unwrap_or_else(|| DEFAULT_STDERR.into())),
            relay,
            hooks,
            log_level
        })
    }

    pub fn bind_addr(&self) -> SocketAddr {
        SocketAddr::new(self.ip, self.port)
    }

    /// One daemon, and so one pid file, per port.
    pub fn daemon_name(&self) -> String {
        format!("mailhook-{}", self.port)
    }
}

pub fn local_hostname() -> String {
    gethostname::gethostname().to_string_lossy().into_owned()
}

/// First IPv4 address the hostname resolves to, loopback otherwise.
pub fn public_ip() -> IpAddr {
    (local_hostname().as_str(), 0).to_socket_addrs()
        .ok()
        .and_then(|mut addrs| addrs.find(SocketAddr::is_ipv4))
        .map(|addr| addr.ip())
        .unwrap_or(IpAddr::V4(Ipv4Addr::LOCALHOST))
}

#[derive(Debug, Error)]
pub enum ConfigError {
    #[error("Failed to read config file {0} : {1}")]
    Read(PathBuf, #[source] io::Error),
    #[error("Invalid config file {0} : {1}")]
    Parse(PathBuf, #[source] serde_json::Error),
    #[error("Failed to get working directory : {0}")]
    WorkingDir(#[source] io::Error),
    #[error(transparent)]
    Relay(#[from] RelayError),
}

#[cfg(test)]
mod tests {
    use super::*;

    fn cli(args: &[&str]) -> Cli {
        Cli::try_parse_from(std::iter::once("mailhook").chain(args.iter().copied())).unwrap()
    }

    fn merge(cli: Cli, file: FileConfig) -> Settings {
        Settings::merge(cli, file, Path::new("/srv/mailhook")).unwrap()
    }

    #[test]
    fn defaults() {
        let settings = merge(cli(&["run", "--ip", "127.0.0.1"]), FileConfig::default());

        assert_eq!(settings.action, Action::Run);
        assert_eq!(settings.bind_addr(), "127.0.0.1:25".parse().unwrap());
        assert_eq!(settings.stdout, PathBuf::from("/srv/mailhook/output.log"));
        assert_eq!(settings.stderr, PathBuf::from("/srv/mailhook/error.log"));
        assert_eq!(settings.relay, None);
        assert_eq!(settings.hooks, vec!["printer".to_owned()]);
        assert_eq!(settings.log_level, LevelFilter::Info);
        assert_eq!(settings.daemon_name(), "mailhook-25");
    }

    #[test]
    fn command_line_wins_over_file() {
        let file: FileConfig = serde_json::from_str(r#"{
            "ip": "10.0.0.1",
            "port": 2525,
            "stdout": "/var/log/mailhook.out",
            "proxy": "mx.example.com:25",
            "hooks": ["printer"],
            "verbose": true
        }"#).unwrap();

        let settings = merge(cli(&["start", "--port", "2626", "--proxy", "relay.example.com:587"]), file);

        assert_eq!(settings.bind_addr(), "10.0.0.1:2626".parse().unwrap());
        assert_eq!(settings.stdout, PathBuf::from("/var/log/mailhook.out"));
        assert_eq!(settings.relay, Some(RelayTarget { host: "relay.example.com".to_owned(), port: 587 }));
        assert_eq!(settings.log_level, LevelFilter::Debug);
    }

    #[test]
    fn printer_hook_is_always_first() {
        let settings = merge(
            cli(&["run", "--ip", "127.0.0.1", "--hook", "audit", "--hook", "printer", "--hook", "audit"]),
            FileConfig::default()
        );

        assert_eq!(settings.hooks, vec!["printer".to_owned(), "audit".to_owned()]);
    }

    #[test]
    fn silent_lowers_verbosity() {
        let settings = merge(cli(&["status", "--ip", "127.0.0.1", "--silent"]), FileConfig::default());
        assert_eq!(settings.log_level, LevelFilter::Warn);
    }

    #[test]
    fn verbose_and_silent_conflict() {
        assert!(Cli::try_parse_from(["mailhook", "run", "--verbose", "--silent"]).is_err());
    }

    #[test]
    fn rejects_bad_proxy() {
        let result = Settings::merge(
            cli(&["run", "--ip", "127.0.0.1", "--proxy", "nowhere"]),
            FileConfig::default(),
            Path::new("/")
        );

        assert!(matches!(result, Err(ConfigError::Relay(RelayError::InvalidTarget(_)))));
    }

    #[test]
    fn loads_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailhook.json");
        fs::write(&path, r#"{"port": 2525, "silent": true}"#).unwrap();

        let file = FileConfig::load(&path).unwrap();

        assert_eq!(file, FileConfig { port: Some(2525), silent: Some(true), ..FileConfig::default() });
    }

    #[test]
    fn reports_invalid_json_file() {
        let dir = tempfile::tempdir().unwrap();
        let path = dir.path().join("mailhook.json");
        fs::write(&path, "{ port").unwrap();

        assert!(matches!(FileConfig::load(&path), Err(ConfigError::Parse(_, _))));
        assert!(matches!(FileConfig::load(&dir.path().join("missing.json")), Err(ConfigError::Read(_, _))));
    }
}
