// SPDX-License-Identifier: GPL-3.0-or-later

//! Bot supervision with restart-on-change.
//!
//! The [`Reloader`] owns the bot child process. It starts it through a
//! [`BotLauncher`], then waits on a [`ChangeSource`]: every batch that still
//! has a path after the [`FileFilter`] stops the child, waits for the reload
//! delay and starts a fresh one. A host interrupt, the child exiting on its
//! own, or the change source closing ends the loop, and the child is always
//! stopped before [`Reloader::run`] returns.

use std::io::Write;
use std::path::{Path, PathBuf};
use std::sync::Arc;
use std::sync::atomic::{AtomicBool, Ordering};
use std::time::Duration;

use async_trait::async_trait;
use tokio::sync::Notify;
use tracing::debug;

use crate::error::Result;
use crate::process::ChildProcess;
use crate::signals::{self, HandlerId, Signal};
use crate::watcher::{ChangeSource, FileFilter};

/// Starts and stops the supervised bot.
#[async_trait]
pub trait BotLauncher: Send {
    async fn startup(&mut self) -> Result<ChildProcess>;

    async fn shutdown(&mut self, child: &mut ChildProcess) -> Result<()>;
}

#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum ReloadState {
    Starting,
    Running,
    Restarting,
    Stopping,
    Stopped,
}

pub struct Reloader<L, W> {
    launcher: L,
    watcher: W,
    filter: FileFilter,
    delay: Duration,
    root: PathBuf,
    out: Box<dyn Write + Send>,
    state: ReloadState,
    child: Option<ChildProcess>,
    restarts: usize,
    should_exit: Arc<AtomicBool>,
    exit_notify: Arc<Notify>,
    restarting: Arc<AtomicBool>,
}

impl<L: BotLauncher, W: ChangeSource> Reloader<L, W> {
    pub fn new(launcher: L, watcher: W, filter: FileFilter, root: impl Into<PathBuf>) -> Self {
        Self {
            launcher,
            watcher,
            filter,
            delay: Duration::from_millis(500),
            root: root.into(),
            out: Box::new(std::io::stderr()),
            state: ReloadState::Stopped,
            child: None,
            restarts: 0,
            should_exit: Arc::new(AtomicBool::new(false)),
            exit_notify: Arc::new(Notify::new()),
            restarting: Arc::new(AtomicBool::new(false)),
        }
    }

    pub fn with_delay(mut self, delay: Duration) -> Self {
        self.delay = delay;
        self
    }

    /// Where progress messages go (stderr by default).
    pub fn with_output(mut self, out: Box<dyn Write + Send>) -> Self {
        self.out = out;
        self
    }

    pub fn state(&self) -> ReloadState {
        self.state
    }

    pub fn restarts(&self) -> usize {
        self.restarts
    }

    /// Supervise until interrupted or the bot exits. Returns the exit code of
    /// the last child.
    pub async fn run(&mut self) -> Result<i32> {
        let handler = self.register_exit_handler();
        let result = self.supervise().await;
        let code = self.shutdown().await;
        signals::remove(handler);
        self.state = ReloadState::Stopped;
        self.say("Stopped reloader.");
        result?;
        code
    }

    async fn supervise(&mut self) -> Result<()> {
        self.state = ReloadState::Starting;
        let child = self.launcher.startup().await?;
        self.say(&format!("Started reloader with process [{}].", pid_label(&child)));
        self.child = Some(child);
        self.state = ReloadState::Running;

        loop {
            let Some(child) = self.child.as_mut() else {
                break;
            };
            let batch = tokio::select! {
                _ = self.exit_notify.notified() => None,
                code = child.wait() => {
                    debug!(code, "bot exited on its own");
                    None
                }
                batch = self.watcher.next_batch() => batch,
            };
            if self.should_exit.load(Ordering::SeqCst) {
                break;
            }
            let Some(batch) = batch else {
                break;
            };
            if self.child.as_ref().is_some_and(|c| c.exit_code().is_some()) {
                break;
            }
            let changed = self.filter.filter_batch(&batch);
            if changed.is_empty() {
                continue;
            }
            let paths: Vec<String> = changed.iter().map(|p| self.display_path(p)).collect();
            self.say(&format!(
                "Watchfiles detected changes in {}. Reloading...",
                paths.join(", ")
            ));
            self.restart().await?;
        }
        Ok(())
    }

    async fn restart(&mut self) -> Result<()> {
        self.state = ReloadState::Restarting;
        self.restarting.store(true, Ordering::SeqCst);
        let result = self.restart_child().await;
        self.restarting.store(false, Ordering::SeqCst);
        self.state = ReloadState::Running;
        result
    }

    async fn restart_child(&mut self) -> Result<()> {
        if let Some(mut child) = self.child.take() {
            if child.exit_code().is_none() {
                self.launcher.shutdown(&mut child).await?;
            }
            let code = child.wait().await;
            debug!(code, "previous bot process reaped");
        }

        tokio::time::sleep(self.delay).await;
        self.watcher.drain();
        if self.should_exit.load(Ordering::SeqCst) {
            return Ok(());
        }

        let child = self.launcher.startup().await?;
        self.say(&format!("Restarted process [{}].", pid_label(&child)));
        self.child = Some(child);
        self.restarts += 1;
        Ok(())
    }

    async fn shutdown(&mut self) -> Result<i32> {
        self.state = ReloadState::Stopping;
        let Some(mut child) = self.child.take() else {
            return Ok(0);
        };
        if child.exit_code().is_none() {
            self.say(&format!("Shutting down process [{}]...", pid_label(&child)));
            self.launcher.shutdown(&mut child).await?;
        }
        Ok(child.wait().await)
    }

    fn register_exit_handler(&self) -> HandlerId {
        let should_exit = self.should_exit.clone();
        let notify = self.exit_notify.clone();
        let restarting = self.restarting.clone();
        signals::register(move |signal| {
            // On Windows the restart's own CTRL-BREAK to the child's group is
            // echoed back to us.
            if cfg!(windows) && signal != Signal::Terminate && restarting.load(Ordering::SeqCst)
            {
                return;
            }
            should_exit.store(true, Ordering::SeqCst);
            notify.notify_one();
        })
    }

    fn display_path(&self, path: &Path) -> String {
        match path.strip_prefix(&self.root) {
            Ok(relative) => format!("\"{}\"", relative.display()),
            Err(_) => format!("\"{}\"", path.display()),
        }
    }

    fn say(&mut self, message: &str) {
        debug!("{message}");
        let _ = writeln!(self.out, "{message}");
    }
}

fn pid_label(child: &ChildProcess) -> String {
    child
        .pid()
        .map(|pid| pid.to_string())
        .unwrap_or_else(|| "?".to_string())
}

#[cfg(all(test, unix))]
mod tests {
    use std::sync::Mutex;
    use std::time::Instant;

    use super::*;
    use crate::process::{self, SpawnOptions};
    use crate::signals::tests_support::serial;
    use crate::watcher::{Change, ChangeKind, FsWatcher};
    use tokio::sync::mpsc;

    /// Starts `sleep 30` (or a short-lived shell when `exit_immediately`)
    /// and records every start/stop.
    struct SleepLauncher {
        log: Arc<Mutex<Vec<String>>>,
        exit_immediately: bool,
    }

    #[async_trait]
    impl BotLauncher for SleepLauncher {
        async fn startup(&mut self) -> Result<ChildProcess> {
            self.log.lock().unwrap().push("start".to_string());
            let argv: &[&str] = if self.exit_immediately {
                &["sh", "-c", "exit 4"]
            } else {
                &["sleep", "30"]
            };
            process::spawn(argv, &SpawnOptions::default())
        }

        async fn shutdown(&mut self, child: &mut ChildProcess) -> Result<()> {
            let code = child.terminate().await;
            self.log.lock().unwrap().push(format!("stop {code}"));
            Ok(())
        }
    }

    struct ChannelSource(mpsc::UnboundedReceiver<Vec<Change>>);

    #[async_trait]
    impl ChangeSource for ChannelSource {
        async fn next_batch(&mut self) -> Option<Vec<Change>> {
            self.0.recv().await
        }

        fn drain(&mut self) {
            while self.0.try_recv().is_ok() {}
        }
    }

    #[derive(Clone, Default)]
    struct SharedOut(Arc<Mutex<Vec<u8>>>);

    impl Write for SharedOut {
        fn write(&mut self, buf: &[u8]) -> std::io::Result<usize> {
            self.0.lock().unwrap().extend_from_slice(buf);
            Ok(buf.len())
        }

        fn flush(&mut self) -> std::io::Result<()> {
            Ok(())
        }
    }

    impl SharedOut {
        fn text(&self) -> String {
            String::from_utf8_lossy(&self.0.lock().unwrap()).into_owned()
        }
    }

    fn modified(path: &str) -> Vec<Change> {
        vec![(ChangeKind::Modified, PathBuf::from(path))]
    }

    fn reloader(
        exit_immediately: bool,
    ) -> (
        Reloader<SleepLauncher, ChannelSource>,
        mpsc::UnboundedSender<Vec<Change>>,
        Arc<Mutex<Vec<String>>>,
        SharedOut,
    ) {
        let log = Arc::new(Mutex::new(Vec::new()));
        let (tx, rx) = mpsc::unbounded_channel();
        let out = SharedOut::default();
        let launcher = SleepLauncher {
            log: log.clone(),
            exit_immediately,
        };
        let reloader = Reloader::new(launcher, ChannelSource(rx), FileFilter::default(), "/bot")
            .with_delay(Duration::from_millis(20))
            .with_output(Box::new(out.clone()));
        (reloader, tx, log, out)
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn relevant_change_restarts_once() {
        let _guard = serial();
        let (mut reloader, tx, log, out) = reloader(false);

        tx.send(modified("/bot/src/.hidden.py")).unwrap();
        tx.send(modified("/bot/src/app.pyc")).unwrap();
        tx.send(modified("/bot/src/app.py")).unwrap();
        drop(tx);

        reloader.run().await.unwrap();

        assert_eq!(reloader.restarts(), 1);
        assert_eq!(reloader.state(), ReloadState::Stopped);
        let log = log.lock().unwrap().clone();
        assert_eq!(log.len(), 4);
        assert_eq!(log[0], "start");
        assert!(log[1].starts_with("stop"));
        assert_eq!(log[2], "start");
        assert!(log[3].starts_with("stop"));

        let text = out.text();
        assert!(text.contains("Watchfiles detected changes in \"src/app.py\". Reloading..."));
        assert!(text.contains("Restarted process ["));
        assert!(text.trim_end().ends_with("Stopped reloader."));
        assert_eq!(process::live_children(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn interrupt_stops_the_loop() {
        let _guard = serial();
        let (mut reloader, tx, log, _out) = reloader(false);

        let interrupter = tokio::spawn(async move {
            tokio::time::sleep(Duration::from_millis(200)).await;
            signals::dispatch(Signal::Interrupt);
            drop(tx);
        });
        reloader.run().await.unwrap();
        interrupter.await.unwrap();

        assert_eq!(reloader.restarts(), 0);
        assert_eq!(log.lock().unwrap()[0], "start");
        assert_eq!(signals::handler_count(), 0);
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn bot_exit_ends_supervision_with_its_code() {
        let _guard = serial();
        let (mut reloader, _tx, log, _out) = reloader(true);

        let code = reloader.run().await.unwrap();

        assert_eq!(code, 4);
        assert_eq!(*log.lock().unwrap(), ["start"]);
    }

    /// Runs `sleep 30` and timestamps every start and stop.
    struct TimedLauncher(Arc<Mutex<Vec<(&'static str, Instant)>>>);

    #[async_trait]
    impl BotLauncher for TimedLauncher {
        async fn startup(&mut self) -> Result<ChildProcess> {
            self.0.lock().unwrap().push(("start", Instant::now()));
            process::spawn(&["sleep", "30"], &SpawnOptions::default())
        }

        async fn shutdown(&mut self, child: &mut ChildProcess) -> Result<()> {
            child.terminate().await;
            self.0.lock().unwrap().push(("stop", Instant::now()));
            Ok(())
        }
    }

    #[tokio::test(flavor = "multi_thread")]
    async fn filesystem_changes_restart_after_delay() {
        let _guard = serial();
        let tmp = tempfile::tempdir().unwrap();
        let root = tmp.path().canonicalize().unwrap();
        let events = Arc::new(Mutex::new(Vec::new()));
        let out = SharedOut::default();

        let watcher = FsWatcher::new(vec![root.clone()]).unwrap();
        let mut reloader = Reloader::new(
            TimedLauncher(events.clone()),
            watcher,
            FileFilter::default(),
            root.clone(),
        )
        .with_output(Box::new(out.clone()));

        let writer = {
            let events = events.clone();
            let root = root.clone();
            tokio::spawn(async move {
                tokio::time::sleep(Duration::from_millis(200)).await;
                std::fs::write(root.join(".hidden.py"), "x = 1\n").unwrap();
                std::fs::write(root.join("x.pyc"), b"\0").unwrap();
                tokio::time::sleep(Duration::from_millis(400)).await;
                let starts_before = events.lock().unwrap().len();

                std::fs::write(root.join("a.py"), "print('hi')\n").unwrap();
                let deadline = Instant::now() + Duration::from_secs(10);
                while events.lock().unwrap().iter().filter(|(e, _)| *e == "start").count() < 2
                    && Instant::now() < deadline
                {
                    tokio::time::sleep(Duration::from_millis(20)).await;
                }
                signals::dispatch(Signal::Interrupt);
                starts_before
            })
        };

        tokio::time::timeout(Duration::from_secs(20), reloader.run())
            .await
            .unwrap()
            .unwrap();
        let starts_before = writer.await.unwrap();

        assert_eq!(starts_before, 1);
        assert_eq!(reloader.restarts(), 1);
        let events = events.lock().unwrap().clone();
        let stopped = events.iter().find(|(e, _)| *e == "stop").unwrap().1;
        let restarted = events.iter().filter(|(e, _)| *e == "start").nth(1).unwrap().1;
        assert!(restarted.duration_since(stopped) >= Duration::from_millis(500));

        let text = out.text();
        assert!(text.contains("\"a.py\""));
        assert!(!text.contains(".hidden.py"));
        assert!(!text.contains("x.pyc"));
        assert_eq!(process::live_children(), 0);
    }
}
