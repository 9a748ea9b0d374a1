// SPDX-License-Identifier: GPL-3.0-or-later

//! Portable child-process primitive.
//!
//! Every child is owned by a background task that waits for it. The task also
//! listens on the signal multiplexer: when the CLI itself is interrupted
//! before the child finishes, the child is terminated and reaped before the
//! task completes, so no process outlives the command that spawned it.
//!
//! On Windows children are started in a new process group, which lets us post
//! CTRL-BREAK to the child without interrupting ourselves.

use std::collections::HashMap;
use std::ffi::OsStr;
use std::path::PathBuf;
use std::process::{ExitStatus, Stdio};
use std::sync::Arc;
use std::sync::atomic::{AtomicUsize, Ordering};

use tokio::io::AsyncReadExt;
use tokio::process::{ChildStderr, ChildStdout, Command};
use tokio::sync::{Notify, watch};
use tracing::debug;

use crate::error::Result;
use crate::signals;

#[cfg(windows)]
const CREATE_NEW_PROCESS_GROUP: u32 = 0x0000_0200;

static LIVE_CHILDREN: AtomicUsize = AtomicUsize::new(0);

/// How one standard stream of the child is wired.
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub enum StdioMode {
    #[default]
    Inherit,
    Null,
    Piped,
}

impl StdioMode {
    fn to_stdio(self) -> Stdio {
        match self {
            StdioMode::Inherit => Stdio::inherit(),
            StdioMode::Null => Stdio::null(),
            StdioMode::Piped => Stdio::piped(),
        }
    }
}

/// Options shared by every spawn. Cloneable so a reloader can reuse them.
#[derive(Debug, Clone, Default)]
pub struct SpawnOptions {
    pub cwd: Option<PathBuf>,
    /// Extra variables layered over the inherited environment.
    pub env: Option<HashMap<String, String>>,
    pub stdin: StdioMode,
    pub stdout: StdioMode,
    pub stderr: StdioMode,
}

impl SpawnOptions {
    pub fn in_dir(cwd: impl Into<PathBuf>) -> Self {
        Self {
            cwd: Some(cwd.into()),
            ..Self::default()
        }
    }
}

/// Signals that can be delivered to a child.
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ProcessSignal {
    Interrupt,
    Terminate,
}

/// Handle to a spawned child.
pub struct ChildProcess {
    pid: Option<u32>,
    program: String,
    status: watch::Receiver<Option<i32>>,
    stdout: Option<ChildStdout>,
    stderr: Option<ChildStderr>,
}

/// Spawn `argv[0]` with the remaining arguments.
pub fn spawn<S: AsRef<OsStr>>(argv: &[S], options: &SpawnOptions) -> Result<ChildProcess> {
    let Some((program, args)) = argv.split_first() else {
        let err = std::io::Error::new(std::io::ErrorKind::InvalidInput, "empty command line");
        return Err(err.into());
    };

    let mut command = Command::new(program);
    command
        .args(args)
        .stdin(options.stdin.to_stdio())
        .stdout(options.stdout.to_stdio())
        .stderr(options.stderr.to_stdio())
        .kill_on_drop(true);
    if let Some(cwd) = &options.cwd {
        command.current_dir(cwd);
    }
    if let Some(env) = &options.env {
        command.envs(env);
    }
    #[cfg(windows)]
    command.creation_flags(CREATE_NEW_PROCESS_GROUP);

    let program = program.as_ref().to_string_lossy().into_owned();
    let mut child = command.spawn()?;
    let pid = child.id();
    let stdout = child.stdout.take();
    let stderr = child.stderr.take();
    debug!(%program, ?pid, "spawned child process");

    let should_exit = Arc::new(Notify::new());
    let handler = {
        let should_exit = should_exit.clone();
        signals::register(move |_| should_exit.notify_one())
    };

    LIVE_CHILDREN.fetch_add(1, Ordering::SeqCst);
    let (tx, status) = watch::channel(None);
    let task_program = program.clone();
    tokio::spawn(async move {
        let code = tokio::select! {
            status = child.wait() => status.map(exit_code).unwrap_or(-1),
            _ = should_exit.notified() => {
                debug!(program = %task_program, ?pid, "terminating child after host signal");
                if let Some(pid) = pid {
                    send_signal(pid, ProcessSignal::Terminate);
                }
                child.wait().await.map(exit_code).unwrap_or(-1)
            }
        };
        signals::remove(handler);
        LIVE_CHILDREN.fetch_sub(1, Ordering::SeqCst);
        debug!(program = %task_program, ?pid, code, "child process exited");
        let _ = tx.send(Some(code));
    });

    Ok(ChildProcess {
        pid,
        program,
        status,
        stdout,
        stderr,
    })
}

/// Spawn and wait, returning the exit code.
pub async fn run<S: AsRef<OsStr>>(argv: &[S], options: &SpawnOptions) -> Result<i32> {
    let mut child = spawn(argv, options)?;
    Ok(child.wait().await)
}

/// Spawn with stdout captured, returning the exit code and the decoded output.
pub async fn output<S: AsRef<OsStr>>(
    argv: &[S],
    options: &SpawnOptions,
) -> Result<(i32, String)> {
    let options = SpawnOptions {
        stdout: StdioMode::Piped,
        ..options.clone()
    };
    let mut child = spawn(argv, &options)?;
    let mut text = String::new();
    if let Some(mut stdout) = child.take_stdout() {
        stdout.read_to_string(&mut text).await?;
    }
    Ok((child.wait().await, text))
}

/// Number of children spawned through this module that have not been reaped.
pub fn live_children() -> usize {
    LIVE_CHILDREN.load(Ordering::SeqCst)
}

impl ChildProcess {
    pub fn pid(&self) -> Option<u32> {
        self.pid
    }

    pub fn program(&self) -> &str {
        &self.program
    }

    pub fn take_stdout(&mut self) -> Option<ChildStdout> {
        self.stdout.take()
    }

    pub fn take_stderr(&mut self) -> Option<ChildStderr> {
        self.stderr.take()
    }

    /// Exit code if the child has already been reaped.
    pub fn exit_code(&self) -> Option<i32> {
        *self.status.borrow()
    }

    /// Wait for the child to exit. Returns -1 if the exit code is unknown.
    pub async fn wait(&mut self) -> i32 {
        let waited = match self.status.wait_for(Option::is_some).await {
            Ok(code) => *code,
            Err(_) => None,
        };
        waited.or_else(|| self.exit_code()).unwrap_or(-1)
    }

    /// Deliver `signal` to the child. No-op once it has exited.
    pub fn signal(&self, signal: ProcessSignal) {
        if self.exit_code().is_some() {
            return;
        }
        if let Some(pid) = self.pid {
            send_signal(pid, signal);
        }
    }

    /// Ask the child to stop and wait for it. Idempotent.
    pub async fn terminate(&mut self) -> i32 {
        if let Some(code) = self.exit_code() {
            return code;
        }
        self.signal(ProcessSignal::Terminate);
        self.wait().await
    }
}

fn exit_code(status: ExitStatus) -> i32 {
    if let Some(code) = status.code() {
        return code;
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return 128 + signal;
        }
    }
    -1
}

#[cfg(unix)]
fn send_signal(pid: u32, signal: ProcessSignal) {
    let signum = match signal {
        ProcessSignal::Interrupt => libc::SIGINT,
        ProcessSignal::Terminate => libc::SIGTERM,
    };
    // SAFETY: kill(2) has no memory-safety preconditions.
    unsafe {
        libc::kill(pid as libc::pid_t, signum);
    }
}

// Both signals map to CTRL-BREAK: CTRL-C cannot be targeted at a single
// process group. The shield keeps the console event from re-entering our own
// dispatcher while the child is being stopped.
#[cfg(windows)]
fn send_signal(pid: u32, _signal: ProcessSignal) {
    use windows_sys::Win32::System::Console::{CTRL_BREAK_EVENT, GenerateConsoleCtrlEvent};

    let _shield = signals::shield();
    // SAFETY: plain FFI call with integer arguments.
    unsafe {
        GenerateConsoleCtrlEvent(CTRL_BREAK_EVENT, pid);
    }
}

#[cfg(all(test, unix))]
mod tests {
    use super::*;
    use std::time::Duration;

    #[tokio::test]
    async fn run_returns_exit_code() {
        let _serial = crate::signals::tests_support::serial();
        let code = run(&["sh", "-c", "exit 7"], &SpawnOptions::default())
            .await
            .unwrap();
        assert_eq!(code, 7);
    }

    #[tokio::test]
    async fn output_captures_stdout() {
        let _serial = crate::signals::tests_support::serial();
        let (code, text) = output(&["sh", "-c", "printf hello"], &SpawnOptions::default())
            .await
            .unwrap();
        assert_eq!(code, 0);
        assert_eq!(text, "hello");
    }

    #[tokio::test]
    async fn spawn_honours_cwd_and_env() {
        let _serial = crate::signals::tests_support::serial();
        let dir = tempfile::tempdir().unwrap();
        let mut env = HashMap::new();
        env.insert("NB_TEST_VALUE".to_string(), "42".to_string());
        let options = SpawnOptions {
            cwd: Some(dir.path().to_path_buf()),
            env: Some(env),
            ..SpawnOptions::default()
        };
        let (_, text) = output(&["sh", "-c", "printf \"$NB_TEST_VALUE:$(pwd)\""], &options)
            .await
            .unwrap();
        let (value, cwd) = text.split_once(':').unwrap();
        assert_eq!(value, "42");
        assert_eq!(
            std::fs::canonicalize(cwd).unwrap(),
            std::fs::canonicalize(dir.path()).unwrap()
        );
    }

    #[tokio::test]
    async fn terminate_is_idempotent() {
        let _serial = crate::signals::tests_support::serial();
        let mut child = spawn(&["sleep", "30"], &SpawnOptions::default()).unwrap();
        let first = child.terminate().await;
        assert_eq!(first, 128 + libc::SIGTERM);
        assert_eq!(child.terminate().await, first);
        assert_eq!(child.exit_code(), Some(first));
    }

    #[tokio::test]
    async fn interrupt_signal_reaches_child() {
        let _serial = crate::signals::tests_support::serial();
        let mut child = spawn(&["sleep", "30"], &SpawnOptions::default()).unwrap();
        child.signal(ProcessSignal::Interrupt);
        assert_eq!(child.wait().await, 128 + libc::SIGINT);
    }

    #[tokio::test]
    async fn host_signal_reaps_child() {
        let _serial = crate::signals::tests_support::serial();
        let mut child = spawn(&["sleep", "30"], &SpawnOptions::default()).unwrap();
        // Give the supervising task a chance to start waiting.
        tokio::time::sleep(Duration::from_millis(50)).await;

        signals::dispatch(signals::Signal::Interrupt);

        let code = tokio::time::timeout(Duration::from_secs(5), child.wait())
            .await
            .expect("child was not reaped");
        assert_eq!(code, 128 + libc::SIGTERM);
    }

    #[tokio::test]
    async fn empty_argv_is_rejected() {
        let argv: [&str; 0] = [];
        assert!(spawn(&argv, &SpawnOptions::default()).is_err());
    }
}
