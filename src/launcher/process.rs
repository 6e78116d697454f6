//! Worker process supervision
//!
//! A supervisor task owns each spawned process. Handles talk to it over
//! channels, so any number of callers can wait for the exit or request a
//! kill, and a kill request always resolves even when the process is gone.

use async_trait::async_trait;
#[cfg(unix)]
use nix::sys::signal::{kill, Signal};
#[cfg(unix)]
use nix::unistd::Pid;
use std::fmt;
use std::process::Stdio;
use std::time::Duration;
use tokio::process::{Child, Command};
use tokio::sync::{mpsc, oneshot, watch};
use tokio::time::timeout;
use tracing::{debug, warn};

use crate::models::WorkerId;
use crate::transport::StdioTransport;

use super::LaunchError;

/// How a worker process ended
#[derive(Clone, Copy, Debug, PartialEq, Eq)]
pub enum ProcessExit {
    Success,
    Failure(Option<i32>),
    /// Terminated on request
    Killed,
}

impl ProcessExit {
    pub fn is_abnormal(&self) -> bool {
        matches!(self, ProcessExit::Failure(_))
    }
}

impl fmt::Display for ProcessExit {
    fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
        match self {
            ProcessExit::Success => write!(f, "exited normally"),
            ProcessExit::Failure(Some(code)) => write!(f, "exit code {code}"),
            ProcessExit::Failure(None) => write!(f, "terminated by signal"),
            ProcessExit::Killed => write!(f, "killed"),
        }
    }
}

/// A running worker process
#[async_trait]
pub trait WorkerProcess: Send {
    /// Resolve when the process exits. Must be cancel-safe.
    async fn wait(&mut self) -> ProcessExit;

    /// Ask the process to shut down
    async fn terminate(&mut self);

    /// Stop the process immediately
    async fn kill(&mut self);
}

/// Spawns processes for one launcher type
pub trait WorkerFactory: Send + Sync {
    fn display_name(&self) -> &str;

    fn spawn(&self, id: &WorkerId, url: &str) -> Result<Box<dyn WorkerProcess>, LaunchError>;
}

/// Handle to a supervised process. Cheap to clone.
#[derive(Clone, Debug)]
pub struct ProcessHandle {
    kill_tx: mpsc::Sender<oneshot::Sender<()>>,
    exit_rx: watch::Receiver<Option<ProcessExit>>,
}

impl ProcessHandle {
    /// Hand `process` to a new supervisor task
    pub fn supervise(
        process: Box<dyn WorkerProcess>,
        kill_timeout: Duration,
        label: impl Into<String>,
    ) -> Self {
        let (kill_tx, kill_rx) = mpsc::channel(8);
        let (exit_tx, exit_rx) = watch::channel(None);

        tokio::spawn(supervise(
            process,
            kill_rx,
            exit_tx,
            kill_timeout,
            label.into(),
        ));

        Self { kill_tx, exit_rx }
    }

    /// Wait for the process to exit
    pub async fn exited(&mut self) -> ProcessExit {
        let observed = match self.exit_rx.wait_for(Option::is_some).await {
            Ok(exit) => *exit,
            Err(_) => None,
        };
        observed
            .or_else(|| *self.exit_rx.borrow())
            .unwrap_or(ProcessExit::Killed)
    }

    pub fn exit_status(&self) -> Option<ProcessExit> {
        *self.exit_rx.borrow()
    }

    /// Request termination, escalating to a hard kill after the supervisor's
    /// kill timeout. Resolves immediately when the process already exited.
    pub async fn force_kill(&self) {
        let (ack_tx, ack_rx) = oneshot::channel();
        if self.kill_tx.send(ack_tx).await.is_err() {
            return;
        }
        let _ = ack_rx.await;
    }
}

async fn supervise(
    mut process: Box<dyn WorkerProcess>,
    mut kill_rx: mpsc::Receiver<oneshot::Sender<()>>,
    exit_tx: watch::Sender<Option<ProcessExit>>,
    kill_timeout: Duration,
    label: String,
) {
    let exit = tokio::select! {
        exit = process.wait() => {
            debug!("{} process {}", label, exit);
            exit
        }
        request = kill_rx.recv() => {
            shutdown(process.as_mut(), kill_timeout, &label).await;
            if let Some(ack) = request {
                let _ = ack.send(());
            }
            ProcessExit::Killed
        }
    };

    let _ = exit_tx.send(Some(exit));

    // Acknowledge kill requests that raced with the exit
    kill_rx.close();
    while let Ok(ack) = kill_rx.try_recv() {
        let _ = ack.send(());
    }
}

async fn shutdown(process: &mut dyn WorkerProcess, kill_timeout: Duration, label: &str) {
    process.terminate().await;

    if timeout(kill_timeout, process.wait()).await.is_err() {
        warn!(
            "{} was not killed in {} ms, sending SIGKILL.",
            label,
            kill_timeout.as_millis()
        );
        process.kill().await;
    }
}

/// A worker running as a child process
pub struct CommandProcess {
    child: Child,
}

impl CommandProcess {
    pub fn new(child: Child) -> Self {
        Self { child }
    }
}

#[async_trait]
impl WorkerProcess for CommandProcess {
    async fn wait(&mut self) -> ProcessExit {
        match self.child.wait().await {
            Ok(status) if status.success() => ProcessExit::Success,
            Ok(status) => ProcessExit::Failure(status.code()),
            Err(e) => {
                warn!("Failed to wait for worker process: {}", e);
                ProcessExit::Failure(None)
            }
        }
    }

    #[cfg(unix)]
    async fn terminate(&mut self) {
        if let Some(pid) = self.child.id() {
            if let Err(e) = kill(Pid::from_raw(pid as i32), Signal::SIGTERM) {
                debug!("Could not signal process {}: {}", pid, e);
            }
        }
    }

    #[cfg(not(unix))]
    async fn terminate(&mut self) {
        self.kill().await;
    }

    async fn kill(&mut self) {
        if let Err(e) = self.child.kill().await {
            debug!("Kill failed, process probably already gone: {}", e);
        }
    }
}

/// Launches a program, passing it the target address
#[derive(Clone)]
pub struct CommandFactory {
    display_name: String,
    program: String,
    args: Vec<String>,
    stdio: Option<StdioTransport>,
}

impl CommandFactory {
    pub fn new(display_name: impl Into<String>, program: impl Into<String>) -> Self {
        Self {
            display_name: display_name.into(),
            program: program.into(),
            args: Vec::new(),
            stdio: None,
        }
    }

    pub fn args(mut self, args: Vec<String>) -> Self {
        self.args = args;
        self
    }

    /// Connect the process's stdin/stdout to the transport
    pub fn with_transport(mut self, transport: StdioTransport) -> Self {
        self.stdio = Some(transport);
        self
    }

    /// Arguments with `{url}` substituted; the address is appended when no
    /// argument mentions it
    pub fn build_args(&self, url: &str) -> Vec<String> {
        let mut args: Vec<String> = self
            .args
            .iter()
            .map(|arg| arg.replace("{url}", url))
            .collect();
        if !self.args.iter().any(|arg| arg.contains("{url}")) {
            args.push(url.to_string());
        }
        args
    }
}

impl WorkerFactory for CommandFactory {
    fn display_name(&self) -> &str {
        &self.display_name
    }

    fn spawn(&self, id: &WorkerId, url: &str) -> Result<Box<dyn WorkerProcess>, LaunchError> {
        let mut command = Command::new(&self.program);
        command
            .args(self.build_args(url))
            .env("TESTFLEET_URL", url)
            .env("TESTFLEET_WORKER_ID", id.as_str())
            .kill_on_drop(true);

        if self.stdio.is_some() {
            command.stdin(Stdio::piped()).stdout(Stdio::piped());
        } else {
            command.stdin(Stdio::null()).stdout(Stdio::null());
        }

        let mut child = command.spawn().map_err(|e| LaunchError::Spawn {
            name: self.display_name.clone(),
            reason: format!("{}: {e}", self.program),
        })?;

        if let Some(transport) = &self.stdio {
            if let (Some(stdin), Some(stdout)) = (child.stdin.take(), child.stdout.take()) {
                transport.attach(id.clone(), self.display_name.clone(), stdin, stdout);
            }
        }

        Ok(Box::new(CommandProcess::new(child)))
    }
}

#[cfg(test)]
pub(crate) mod fakes {
    //! Scripted processes and factories for lifecycle tests

    use super::*;
    use std::sync::atomic::{AtomicUsize, Ordering};
    use std::sync::{Arc, Mutex};

    /// What a fake process does once spawned
    #[derive(Clone, Copy, Debug)]
    pub enum Behavior {
        /// Exit with the given code after a delay
        ExitAfter(Duration, i32),
        /// Run until killed
        RunForever,
        /// Ignore termination requests, only die on a hard kill
        IgnoreTerminate,
    }

    pub struct FakeProcess {
        behavior: Behavior,
        terminated: bool,
        killed: bool,
        kills: Arc<AtomicUsize>,
    }

    #[async_trait]
    impl WorkerProcess for FakeProcess {
        async fn wait(&mut self) -> ProcessExit {
            if self.killed || self.terminated {
                return ProcessExit::Failure(None);
            }
            match self.behavior {
                Behavior::ExitAfter(delay, 0) => {
                    tokio::time::sleep(delay).await;
                    ProcessExit::Success
                }
                Behavior::ExitAfter(delay, code) => {
                    tokio::time::sleep(delay).await;
                    ProcessExit::Failure(Some(code))
                }
                Behavior::RunForever | Behavior::IgnoreTerminate => {
                    std::future::pending().await
                }
            }
        }

        async fn terminate(&mut self) {
            if !matches!(self.behavior, Behavior::IgnoreTerminate) {
                self.terminated = true;
            }
        }

        async fn kill(&mut self) {
            self.killed = true;
            self.kills.fetch_add(1, Ordering::SeqCst);
        }
    }

    /// Factory handing out processes with a scripted behavior per spawn
    pub struct FakeFactory {
        name: String,
        script: Mutex<Vec<Behavior>>,
        fallback: Behavior,
        pub spawns: Arc<AtomicUsize>,
        pub hard_kills: Arc<AtomicUsize>,
        pub urls: Mutex<Vec<String>>,
    }

    impl FakeFactory {
        pub fn new(name: &str, fallback: Behavior) -> Self {
            Self {
                name: name.to_string(),
                script: Mutex::new(Vec::new()),
                fallback,
                spawns: Arc::new(AtomicUsize::new(0)),
                hard_kills: Arc::new(AtomicUsize::new(0)),
                urls: Mutex::new(Vec::new()),
            }
        }

        /// Behaviors for the first spawns, in order
        pub fn scripted(name: &str, script: Vec<Behavior>, fallback: Behavior) -> Self {
            let factory = Self::new(name, fallback);
            *factory.script.lock().unwrap() = script.into_iter().rev().collect();
            factory
        }

        pub fn spawn_count(&self) -> usize {
            self.spawns.load(Ordering::SeqCst)
        }
    }

    impl WorkerFactory for FakeFactory {
        fn display_name(&self) -> &str {
            &self.name
        }

        fn spawn(&self, _id: &WorkerId, url: &str) -> Result<Box<dyn WorkerProcess>, LaunchError> {
            self.spawns.fetch_add(1, Ordering::SeqCst);
            self.urls.lock().unwrap().push(url.to_string());
            let behavior = self.script.lock().unwrap().pop().unwrap_or(self.fallback);
            Ok(Box::new(FakeProcess {
                behavior,
                terminated: false,
                killed: false,
                kills: self.hard_kills.clone(),
            }))
        }
    }
}

#[cfg(test)]
mod tests {
    use super::fakes::*;
    use super::*;
    use std::sync::atomic::Ordering;
    use std::sync::Arc;

    fn spawn_fake(behavior: Behavior) -> (ProcessHandle, Arc<FakeFactory>) {
        let factory = Arc::new(FakeFactory::new("Fake", behavior));
        let process = factory.spawn(&WorkerId::new("1"), "http://localhost:9876/").unwrap();
        (
            ProcessHandle::supervise(process, Duration::from_millis(2000), "Fake"),
            factory,
        )
    }

    #[tokio::test(start_paused = true)]
    async fn test_exit_is_observed() {
        let (mut handle, _) = spawn_fake(Behavior::ExitAfter(Duration::from_millis(50), 3));
        assert_eq!(handle.exited().await, ProcessExit::Failure(Some(3)));
        assert!(handle.exit_status().unwrap().is_abnormal());
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_kill_graceful() {
        let (mut handle, factory) = spawn_fake(Behavior::RunForever);
        handle.force_kill().await;
        assert_eq!(handle.exited().await, ProcessExit::Killed);
        assert_eq!(factory.hard_kills.load(Ordering::SeqCst), 0);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_kill_escalates_after_timeout() {
        let (handle, factory) = spawn_fake(Behavior::IgnoreTerminate);
        handle.force_kill().await;
        assert_eq!(factory.hard_kills.load(Ordering::SeqCst), 1);
    }

    #[tokio::test(start_paused = true)]
    async fn test_force_kill_after_exit_resolves() {
        let (mut handle, _) = spawn_fake(Behavior::ExitAfter(Duration::from_millis(1), 0));
        assert_eq!(handle.exited().await, ProcessExit::Success);
        handle.force_kill().await;
        handle.force_kill().await;
    }

    #[test]
    fn test_build_args_appends_url() {
        let factory = CommandFactory::new("Headless", "chromium")
            .args(vec!["--headless".to_string()]);
        assert_eq!(
            factory.build_args("http://localhost:9876/?id=1"),
            vec!["--headless", "http://localhost:9876/?id=1"]
        );
    }

    #[test]
    fn test_build_args_substitutes_placeholder() {
        let factory = CommandFactory::new("Node", "node")
            .args(vec!["runner.js".to_string(), "--url={url}".to_string()]);
        assert_eq!(
            factory.build_args("http://h:1/"),
            vec!["runner.js", "--url=http://h:1/"]
        );
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_process_reports_exit_code() {
        let factory = CommandFactory::new("Shell", "sh")
            .args(vec!["-c".to_string(), "exit 3".to_string(), "{url}".to_string()]);
        let process = factory.spawn(&WorkerId::new("1"), "http://h:1/").unwrap();
        let mut handle = ProcessHandle::supervise(process, Duration::from_millis(500), "Shell");
        assert_eq!(handle.exited().await, ProcessExit::Failure(Some(3)));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_command_process_stops_on_sigterm() {
        let factory = CommandFactory::new("Sleeper", "sh")
            .args(vec!["-c".to_string(), "exec sleep 30".to_string(), "{url}".to_string()]);
        let process = factory.spawn(&WorkerId::new("1"), "http://h:1/").unwrap();
        let kill_timeout = Duration::from_secs(5);
        let mut handle = ProcessHandle::supervise(process, kill_timeout, "Sleeper");

        let started = std::time::Instant::now();
        handle.force_kill().await;
        assert!(started.elapsed() < kill_timeout);
        assert_eq!(handle.exited().await, ProcessExit::Killed);
    }

    #[tokio::test]
    async fn test_spawn_missing_program_fails() {
        let factory = CommandFactory::new("Missing", "/nonexistent/testfleet-worker");
        let err = factory.spawn(&WorkerId::new("1"), "http://h:1/").err().unwrap();
        assert!(matches!(err, LaunchError::Spawn { .. }));
    }
}
