//! Background process lifecycle.
//!
//! A [`Daemon`] detaches the current process from its terminal (double fork,
//! new session, standard streams redirected), records its pid in a
//! [`PidFile`] and runs a payload. The pid file is the only state shared
//! between the `start`, `stop` and `status` invocations: a present pid means
//! running, whether or not that process is still alive.

use std::{
    fmt,
    fs::{File, OpenOptions},
    io::{self, Write},
    os::fd::AsRawFd,
    path::{Path, PathBuf},
    process,
    thread,
    time::Duration
};

use log::{debug, error, info, warn};
use nix::{
    errno::Errno,
    sys::{signal::{kill, Signal}, stat::{umask, Mode}},
    unistd::{access, chdir, dup2, fork, getpid, setsid, AccessFlags, ForkResult, Pid}
};
use thiserror::Error;

use crate::pidfile::{PidFile, PidFileError};

/// Pid file locations, most preferred first.
pub const PIDFILE_DIRECTORIES: [&str; 2] = ["/var/run", "/tmp"];

const DEV_NULL: &str = "/dev/null";
const TERMINATE_RETRY_DELAY: Duration = Duration::from_millis(100);

#[derive(Debug, Clone, PartialEq, Eq)]
pub struct DaemonConfig {
    pub pidfile: PathBuf,
    pub stdin: PathBuf,
    pub stdout: PathBuf,
    pub stderr: PathBuf
}

impl DaemonConfig {
    /// Standard streams default to `/dev/null`.
    pub fn new(pidfile: impl Into<PathBuf>) -> Self {
        Self {
            pidfile: pidfile.into(),
            stdin: PathBuf::from(DEV_NULL),
            stdout: PathBuf::from(DEV_NULL),
            stderr: PathBuf::from(DEV_NULL)
        }
    }

    /// Place `<name>.pid` in the first writable directory of [`PIDFILE_DIRECTORIES`].
    pub fn for_name(name: &str) -> Result<Self, DaemonError> {
        let directories = PIDFILE_DIRECTORIES.iter().map(|dir| Path::new(*dir)).collect::<Vec<_>>();
        Ok(Self::new(pidfile_path(name, &directories)?))
    }

    pub fn stdin(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdin = path.into();
        self
    }

    pub fn stdout(mut self, path: impl Into<PathBuf>) -> Self {
        self.stdout = path.into();
        self
    }

    pub fn stderr(mut self, path: impl Into<PathBuf>) -> Self {
        self.stderr = path.into();
        self
    }
}

pub fn pidfile_path(name: &str, directories: &[&Path]) -> Result<PathBuf, DaemonError> {
    directories.iter()
        .find(|dir| access(**dir, AccessFlags::W_OK).is_ok())
        .map(|dir| dir.join(format!("{name}.pid")))
        .ok_or(DaemonError::NoPidDirectory)
}

/// Delivers the termination request to a running daemon.
pub trait Terminate {
    fn terminate(&self, pid: i32) -> Result<(), Errno>;
}

#[derive(Debug, Default, Clone, Copy)]
pub struct SigTerm;

impl Terminate for SigTerm {
    fn terminate(&self, pid: i32) -> Result<(), Errno> {
        kill(Pid::from_raw(pid), Signal::SIGTERM)
    }
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum DaemonStatus {
    Stopped,
    Running(i32)
}

impl fmt::Display for DaemonStatus {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            DaemonStatus::Stopped => write!(f, "stopped"),
            DaemonStatus::Running(pid) => write!(f, "running, pid={pid}"),
        }
    }
}

#[derive(Debug)]
pub struct Daemon<T: Terminate = SigTerm> {
    config: DaemonConfig,
    pidfile: PidFile,
    terminator: T
}

impl Daemon<SigTerm> {
    pub fn new(config: DaemonConfig) -> Self {
        Self::with_terminator(config, SigTerm)
    }
}

impl<T: Terminate> Daemon<T> {
    pub fn with_terminator(config: DaemonConfig, terminator: T) -> Self {
        let pidfile = PidFile::new(config.pidfile.clone());
        Self { config, pidfile, terminator }
    }

    pub fn config(&self) -> &DaemonConfig {
        &self.config
    }

    pub fn status(&self) -> DaemonStatus {
        match self.pidfile.read() {
            Some(pid) => DaemonStatus::Running(pid),
            None => DaemonStatus::Stopped
        }
    }

    /// Detach and run `run` with whatever `prepare` produced.
    ///
    /// `prepare` runs in the foreground, after the already-running check and
    /// before detaching, so its failure still reaches the caller. Only the
    /// detached process returns from this function; the intermediate
    /// processes exit with status 0. A failing payload is logged, not
    /// returned.
    pub fn start<S, E, P, R>(&self, prepare: P, run: R) -> Result<(), DaemonError>
    where
        P: FnOnce() -> io::Result<S>,
        R: FnOnce(S) -> Result<(), E>,
        E: fmt::Display
    {
        if let Some(pid) = self.pidfile.read() {
            return Err(DaemonError::AlreadyRunning { pidfile: self.config.pidfile.clone(), pid });
        }

        debug!("Starting daemon");
        let payload = prepare().map_err(DaemonError::Prepare)?;

        self.daemonize()?;

        let _pid_guard = PidGuard::write(&self.pidfile)?;
        info!("Daemon running with pid {}", getpid());

        if let Err(e) = run(payload) {
            error!("Daemon payload failed : {e}");
        }

        Ok(())
    }

    /// Stopping a daemon that has no pid file is not an error.
    pub fn stop(&self) -> Result<(), DaemonError> {
        let Some(pid) = self.pidfile.read() else {
            warn!("pidfile {} does not exist. Daemon not running?", self.config.pidfile.display());
            return Ok(());
        };

        debug!("Stopping daemon {pid}");

        loop {
            match self.terminator.terminate(pid) {
                Ok(()) => thread::sleep(TERMINATE_RETRY_DELAY),
                Err(Errno::ESRCH) => break,
                Err(source) => return Err(DaemonError::Signal { pid, source })
            }
        }

        self.pidfile.remove()?;
        info!("Daemon {pid} stopped");
        Ok(())
    }

    pub fn restart<S, E, P, R>(&self, prepare: P, run: R) -> Result<(), DaemonError>
    where
        P: FnOnce() -> io::Result<S>,
        R: FnOnce(S) -> Result<(), E>,
        E: fmt::Display
    {
        self.stop()?;
        self.start(prepare, run)
    }

    fn daemonize(&self) -> Result<(), DaemonError> {
        fork_and_exit_parent()?;

        chdir("/").map_err(DaemonError::Detach)?;
        setsid().map_err(DaemonError::Detach)?;
        umask(Mode::empty());

        fork_and_exit_parent()?;

        self.redirect_standard_streams()
    }

    fn redirect_standard_streams(&self) -> Result<(), DaemonError> {
        io::stdout().flush().ok();
        io::stderr().flush().ok();

        let stdin = File::open(&self.config.stdin)
            .map_err(|e| DaemonError::Redirect(self.config.stdin.clone(), e))?;
        let stdout = open_append(&self.config.stdout)?;
        let stderr = open_append(&self.config.stderr)?;

        for (file, target, path) in [
            (&stdin, io::stdin().as_raw_fd(), &self.config.stdin),
            (&stdout, io::stdout().as_raw_fd(), &self.config.stdout),
            (&stderr, io::stderr().as_raw_fd(), &self.config.stderr),
        ] {
            dup2(file.as_raw_fd(), target)
                .map_err(|e| DaemonError::Redirect(path.clone(), e.into()))?;
        }

        Ok(())
    }
}

fn open_append(path: &Path) -> Result<File, DaemonError> {
    OpenOptions::new()
        .create(true)
        .append(true)
        .open(path)
        .map_err(|e| DaemonError::Redirect(path.to_owned(), e))
}

fn fork_and_exit_parent() -> Result<(), DaemonError> {
    io::stdout().flush().ok();
    io::stderr().flush().ok();

    // SAFETY: called before any thread is spawned, the child only continues
    // the single threaded detach sequence.
    match unsafe { fork() } {
        Ok(ForkResult::Parent { child }) => {
            debug!("Forked daemon child {child}");
            process::exit(0)
        },
        Ok(ForkResult::Child) => Ok(()),
        Err(e) => Err(DaemonError::Detach(e))
    }
}

/// Removes the pid file when the detached process returns normally.
struct PidGuard<'a> {
    pidfile: &'a PidFile
}

impl<'a> PidGuard<'a> {
    fn write(pidfile: &'a PidFile) -> Result<Self, PidFileError> {
        pidfile.write(getpid().as_raw())?;
        Ok(Self { pidfile })
    }
}

impl Drop for PidGuard<'_> {
    fn drop(&mut self) {
        if let Err(e) = self.pidfile.remove() {
            error!("{e}")
        }
    }
}

#[derive(Debug, Error)]
pub enum DaemonError {
    #[error("pidfile {} already exist (pid {pid}). Daemon already running?", pidfile.display())]
    AlreadyRunning { pidfile: PathBuf, pid: i32 },
    #[error("No writable pid file directory among {:?}", PIDFILE_DIRECTORIES)]
    NoPidDirectory,
    #[error("{0}")]
    Prepare(#[source] io::Error),
    #[error("Failed to detach process : {0}")]
    Detach(#[source] Errno),
    #[error("Failed to redirect standard stream to {0} : {1}")]
    Redirect(PathBuf, #[source] io::Error),
    #[error("Failed to signal process {pid} : {source}")]
    Signal { pid: i32, source: Errno },
    #[error(transparent)]
    PidFile(#[from] PidFileError),
}
