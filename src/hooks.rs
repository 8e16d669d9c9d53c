use std::{any::Any, fmt, net::SocketAddr, panic::{self, AssertUnwindSafe}, sync::Arc};

use log::{error, info};
use thiserror::Error;

use crate::smtp::Envelope;

/// Processing step run against every accepted message.
pub trait Hook: Send + Sync {
    fn name(&self) -> &str;

    fn process(&self, peer: SocketAddr, sender: &str, recipients: &[String], body: &[u8]) -> Result<(), HookError>;
}

#[derive(Debug, Error)]
pub enum HookError {
    #[error("{0}")]
    Failed(String),
    #[error("Hook panicked : {0}")]
    Panicked(String),
    #[error(transparent)]
    Io(#[from] std::io::Error),
}

#[derive(Debug)]
pub struct HookFailure {
    pub hook: String,
    pub error: HookError
}

/// Runs every hook in order. A failing or panicking hook is logged and
/// skipped; the failures are handed back for inspection.
pub fn dispatch(envelope: &Envelope, hooks: &[Arc<dyn Hook>]) -> Vec<HookFailure> {
    let mut failures = Vec::new();

    for hook in hooks {
        info!("Running hook {}", hook.name());

        let result = panic::catch_unwind(AssertUnwindSafe(|| hook.process(
            envelope.peer,
            &envelope.sender,
            &envelope.recipients,
            &envelope.body
        ))).unwrap_or_else(|payload| Err(HookError::Panicked(panic_message(payload))));

        if let Err(e) = result {
            error!("Hook {} failed : {e}", hook.name());
            failures.push(HookFailure { hook: hook.name().to_owned(), error: e });
        }
    }

    failures
}

fn panic_message(payload: Box<dyn Any + Send>) -> String {
    if let Some(message) = payload.downcast_ref::<&str>() {
        message.to_string()
    } else if let Some(message) = payload.downcast_ref::<String>() {
        message.clone()
    } else {
        "unknown panic".to_owned()
    }
}

type HookConstructor = fn() -> Arc<dyn Hook>;

/// Hooks known by name.
pub struct HookRegistry {
    entries: Vec<(&'static str, HookConstructor)>
}

impl HookRegistry {
    pub fn builtin() -> Self {
        Self { entries: vec![(Printer::NAME, printer as HookConstructor)] }
    }

    pub fn names(&self) -> impl Iterator<Item = &'static str> + '_ {
        self.entries.iter().map(|(name, _)| *name)
    }

    pub fn contains(&self, name: &str) -> bool {
        self.names().any(|it| it == name)
    }

    /// Instantiates the named hooks in the order given.
    pub fn build(&self, names: &[String]) -> Result<Vec<Arc<dyn Hook>>, UnknownHooks> {
        let unknown = names.iter()
            .filter(|name| !self.contains(name))
            .cloned()
            .collect::<Vec<_>>();

        if !unknown.is_empty() {
            return Err(UnknownHooks { unknown, known: self.names().map(str::to_owned).collect() });
        }

        Ok(names.iter()
            .filter_map(|name| self.entries.iter().find(|(it, _)| *it == name.as_str()))
            .map(|(_, constructor)| constructor())
            .collect())
    }
}

#[derive(Debug, Error)]
#[error("Unknown hook names: {}. Should be one of: {}", unknown.join(", "), known.join(", "))]
pub struct UnknownHooks {
    pub unknown: Vec<String>,
    pub known: Vec<String>
}

fn printer() -> Arc<dyn Hook> {
    Arc::new(Printer)
}

/// Logs every message at info level.
#[derive(Debug, Default)]
pub struct Printer;

impl Printer {
    pub const NAME: &'static str = "printer";

    pub fn render(peer: SocketAddr, sender: &str, recipients: &[String], body: &[u8]) -> String {
        format!(
            "FROM: {sender}\nTO: {recipients:?}\nIP: {peer}\nMESSAGE:\n    {}",
            String::from_utf8_lossy(body)
        )
    }
}

impl Hook for Printer {
    fn name(&self) -> &str {
        Self::NAME
    }

    fn process(&self, peer: SocketAddr, sender: &str, recipients: &[String], body: &[u8]) -> Result<(), HookError> {
        info!("{}", Self::render(peer, sender, recipients, body));
        Ok(())
    }
}

impl fmt::Debug for dyn Hook {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        f.debug_tuple("Hook").field(&self.name()).finish()
    }
}
