mod common;

use std::{
    fs,
    net::TcpListener,
    path::PathBuf,
    process::{Child, Command, Stdio},
    thread,
    time::{Duration, Instant}
};

use common::{Client, WAIT};
use mailhook::{daemon::DaemonConfig, pidfile::PidFile};

const POLL: Duration = Duration::from_millis(50);

/// Runs the `mailhook` binary against one port, stopping a leftover daemon on drop.
struct Mailhook {
    port: u16,
    output: tempfile::TempDir,
    pidfile: PidFile
}

impl Mailhook {
    fn on_free_port() -> Self {
        Self::on_port(TcpListener::bind("127.0.0.1:0").unwrap().local_addr().unwrap().port())
    }

    fn on_port(port: u16) -> Self {
        let pidfile = DaemonConfig::for_name(&format!("mailhook-{port}")).unwrap().pidfile;

        Self { port, output: tempfile::tempdir().unwrap(), pidfile: PidFile::new(pidfile) }
    }

    fn command(&self, action: &str) -> Command {
        let mut command = Command::new(env!("CARGO_BIN_EXE_mailhook"));
        command
            .arg(action)
            .args(["--ip", "127.0.0.1", "--port", &self.port.to_string()])
            .arg("--stdout").arg(self.stdout())
            .arg("--stderr").arg(self.stderr())
            .stdin(Stdio::null());
        command
    }

    fn spawn(&self, action: &str) -> Child {
        self.command(action).stdout(Stdio::null()).stderr(Stdio::null()).spawn().unwrap()
    }

    fn status(&self) -> String {
        let output = self.command("status").output().unwrap();
        assert!(output.status.success());
        String::from_utf8_lossy(&output.stdout).trim_end().to_owned()
    }

    fn stdout(&self) -> PathBuf {
        self.output.path().join("output.log")
    }

    fn stderr(&self) -> PathBuf {
        self.output.path().join("error.log")
    }

    fn daemon_output(&self) -> String {
        [self.stdout(), self.stderr()].iter()
            .filter_map(|path| fs::read_to_string(path).ok())
            .collect()
    }
}

impl Drop for Mailhook {
    fn drop(&mut self) {
        if self.pidfile.read().is_some() {
            let _ = self.spawn("stop").wait();
        }
    }
}

fn wait_until(what: &str, mut condition: impl FnMut() -> bool) {
    let deadline = Instant::now() + WAIT;
    while !condition() {
        assert!(Instant::now() < deadline, "timed out waiting for {what}");
        thread::sleep(POLL);
    }
}

fn wait_for_exit(mut child: Child) -> bool {
    let deadline = Instant::now() + WAIT;
    loop {
        if let Some(status) = child.try_wait().unwrap() {
            return status.success();
        }
        if Instant::now() >= deadline {
            let _ = child.kill();
            panic!("mailhook did not exit");
        }
        thread::sleep(POLL);
    }
}

#[test]
fn start_status_deliver_stop() {
    let mailhook = Mailhook::on_free_port();
    assert_eq!(mailhook.status(), "stopped");

    assert!(wait_for_exit(mailhook.spawn("start")));
    wait_until("the pid file", || mailhook.pidfile.read().is_some());

    let pid = mailhook.pidfile.read().unwrap();
    assert_eq!(fs::read_to_string(mailhook.pidfile.path()).unwrap(), format!("{pid}\n"));
    assert_eq!(mailhook.status(), format!("running, pid={pid}"));

    assert!(!wait_for_exit(mailhook.spawn("start")), "a second start must be refused");
    assert_eq!(mailhook.pidfile.read(), Some(pid));

    let mut client = Client::connect(format!("127.0.0.1:{}", mailhook.port).parse().unwrap());
    assert!(client.command("HELO client.test").starts_with("250"));
    let reply = client.deliver("alice@example.com", &["bob@example.com"], "Subject: hi\r\n\r\n..dot\r\n");
    assert!(reply.starts_with("250"), "unexpected reply {reply}");
    assert!(client.command("QUIT").starts_with("221"));

    wait_until("the printer output", || {
        let output = mailhook.daemon_output();
        output.contains("FROM: alice@example.com") && output.contains("\n.dot")
    });
    assert!(!mailhook.daemon_output().contains("..dot"));

    assert!(wait_for_exit(mailhook.spawn("stop")));

    assert_eq!(mailhook.status(), "stopped");
    assert!(!mailhook.pidfile.path().exists());

    assert!(wait_for_exit(mailhook.spawn("stop")), "stopping a stopped daemon is not an error");
}

#[test]
fn start_on_busy_port_leaves_no_pid_file() {
    let busy = TcpListener::bind("127.0.0.1:0").unwrap();
    let mailhook = Mailhook::on_port(busy.local_addr().unwrap().port());

    let output = mailhook.command("start").output().unwrap();

    assert!(!output.status.success());
    assert!(String::from_utf8_lossy(&output.stderr).contains(&format!("Could not listen on 127.0.0.1:{}", mailhook.port)));
    assert!(!mailhook.pidfile.path().exists());
    assert_eq!(mailhook.status(), "stopped");
}
