//! Stage execution
//!
//! [`StageRunner`] is the seam between the pipeline's ordering rules and the
//! side effects of running a stage. [`ProcessRunner`] is the real
//! implementation: it spawns child processes, streams their output into the
//! log, and enforces the optional stage timeout and signal-driven abort.

use crate::config::HandoffMode;
use crate::error::StageError;
use crate::stage::{CommandSpec, Stage, StageAction};
use crate::supervisor;
use std::process::{ExitStatus, Stdio};
use std::time::Duration;
use tokio::io::{AsyncBufReadExt, AsyncRead, BufReader};
use tokio::process::{Child, Command};
use tokio::sync::watch;
use tokio::task::JoinHandle;
use tracing::{debug, info, warn};

/// Receives the number of the last termination signal delivered to the
/// orchestrator, `None` until one arrives
pub type ShutdownSignal = watch::Receiver<Option<i32>>;

/// How long to wait for output forwarding to drain after a child exits
const OUTPUT_DRAIN_TIMEOUT: Duration = Duration::from_secs(2);

/// Executes one stage to completion
#[allow(async_fn_in_trait)]
pub trait StageRunner {
    async fn run(&mut self, stage: &Stage) -> Result<(), StageError>;
}

/// Wait for a signal this receiver has not seen yet. Never resolves once the
/// sender is gone.
pub async fn next_signal(shutdown: &mut ShutdownSignal) -> i32 {
    loop {
        if shutdown.changed().await.is_err() {
            std::future::pending::<()>().await;
        }
        if let Some(signal) = *shutdown.borrow_and_update() {
            return signal;
        }
    }
}

/// A signal delivered since this receiver last looked, without waiting
pub fn pending_signal(shutdown: &mut ShutdownSignal) -> Option<i32> {
    if shutdown.has_changed().unwrap_or(false) {
        *shutdown.borrow_and_update()
    } else {
        None
    }
}

/// Map a child's exit status to a stage result
pub fn status_to_result(status: ExitStatus) -> Result<(), StageError> {
    if status.success() {
        return Ok(());
    }
    if let Some(code) = status.code() {
        return Err(StageError::Exited { code });
    }
    #[cfg(unix)]
    {
        use std::os::unix::process::ExitStatusExt;
        if let Some(signal) = status.signal() {
            return Err(StageError::Signaled { signal });
        }
    }
    Err(StageError::Exited {
        code: crate::error::EXIT_FAILURE,
    })
}

/// Install SIGINT/SIGTERM handlers and publish received signals on a watch
/// channel
pub fn spawn_signal_listener() -> std::io::Result<ShutdownSignal> {
    let (tx, rx) = watch::channel(None);

    #[cfg(unix)]
    {
        use tokio::signal::unix::{signal, SignalKind};
        let mut sigterm = signal(SignalKind::terminate())?;
        let mut sigint = signal(SignalKind::interrupt())?;
        tokio::spawn(async move {
            loop {
                let received = tokio::select! {
                    _ = sigterm.recv() => libc::SIGTERM,
                    _ = sigint.recv() => libc::SIGINT,
                };
                info!(signal = received, "Received termination signal");
                if tx.send(Some(received)).is_err() {
                    break;
                }
            }
        });
    }

    #[cfg(not(unix))]
    {
        tokio::spawn(async move {
            while tokio::signal::ctrl_c().await.is_ok() {
                info!("Received Ctrl+C");
                if tx.send(Some(2)).is_err() {
                    break;
                }
            }
        });
    }

    Ok(rx)
}

/// Runs stages as real child processes
pub struct ProcessRunner {
    stage_timeout: Option<Duration>,
    grace_period: Duration,
    handoff: HandoffMode,
    shutdown: ShutdownSignal,
}

impl ProcessRunner {
    pub fn new(shutdown: ShutdownSignal) -> Self {
        Self {
            stage_timeout: None,
            grace_period: Duration::from_secs(10),
            handoff: HandoffMode::default(),
            shutdown,
        }
    }

    pub fn with_stage_timeout(mut self, timeout: Option<Duration>) -> Self {
        self.stage_timeout = timeout;
        self
    }

    pub fn with_grace_period(mut self, grace_period: Duration) -> Self {
        self.grace_period = grace_period;
        self
    }

    pub fn with_handoff(mut self, handoff: HandoffMode) -> Self {
        self.handoff = handoff;
        self
    }

    async fn run_command(&mut self, stage: &Stage, spec: &CommandSpec) -> Result<(), StageError> {
        let mut cmd = Command::new(&spec.program);
        cmd.args(&spec.args)
            .envs(&spec.env)
            .current_dir(&stage.working_dir)
            .stdin(Stdio::null())
            .stdout(Stdio::piped())
            .stderr(Stdio::piped())
            .kill_on_drop(true);

        // Own process group, so terminating the stage reaches its whole tree
        #[cfg(unix)]
        cmd.process_group(0);

        debug!(
            stage = %stage.name,
            command = %spec.display(),
            dir = %stage.working_dir.display(),
            "Spawning"
        );

        let mut child = cmd.spawn().map_err(|source| StageError::Spawn {
            program: spec.program.clone(),
            source,
        })?;

        let mut forwarders: Vec<JoinHandle<()>> = Vec::new();
        if let Some(stdout) = child.stdout.take() {
            forwarders.push(tokio::spawn(forward_lines(stdout, stage.name.clone(), "stdout")));
        }
        if let Some(stderr) = child.stderr.take() {
            forwarders.push(tokio::spawn(forward_lines(stderr, stage.name.clone(), "stderr")));
        }

        let result = self.wait_child(stage, &mut child).await;

        let drain = async {
            for handle in forwarders {
                let _ = handle.await;
            }
        };
        if tokio::time::timeout(OUTPUT_DRAIN_TIMEOUT, drain).await.is_err() {
            debug!(stage = %stage.name, "Output still open after exit, detaching");
        }

        result
    }

    async fn wait_child(&mut self, stage: &Stage, child: &mut Child) -> Result<(), StageError> {
        enum Event {
            Exited(std::io::Result<ExitStatus>),
            TimedOut(Duration),
            Signal(i32),
        }

        let stage_timeout = self.stage_timeout;
        let deadline = async move {
            match stage_timeout {
                Some(limit) => {
                    tokio::time::sleep(limit).await;
                    limit
                }
                None => std::future::pending().await,
            }
        };

        let event = tokio::select! {
            status = child.wait() => Event::Exited(status),
            limit = deadline => Event::TimedOut(limit),
            signal = next_signal(&mut self.shutdown) => Event::Signal(signal),
        };

        match event {
            Event::Exited(status) => status_to_result(status.map_err(StageError::Wait)?),
            Event::TimedOut(limit) => {
                warn!(
                    stage = %stage.name,
                    timeout_secs = limit.as_secs(),
                    "Stage timed out, terminating"
                );
                terminate(&stage.name, child, self.grace_period).await;
                Err(StageError::TimedOut {
                    secs: limit.as_secs(),
                })
            }
            Event::Signal(signal) => {
                warn!(stage = %stage.name, signal, "Aborting stage on signal");
                terminate(&stage.name, child, self.grace_period).await;
                Err(StageError::Interrupted { signal })
            }
        }
    }
}

impl StageRunner for ProcessRunner {
    async fn run(&mut self, stage: &Stage) -> Result<(), StageError> {
        // Covers signals that arrived between stages or during a built-in action
        if let Some(signal) = pending_signal(&mut self.shutdown) {
            warn!(stage = %stage.name, signal, "Signal received, not starting stage");
            return Err(StageError::Interrupted { signal });
        }

        match &stage.action {
            StageAction::Command(spec) => self.run_command(stage, spec).await,
            StageAction::Clean(spec) => {
                let report = spec
                    .apply()
                    .map_err(|e| StageError::Action(format!("cleanup failed: {}", e)))?;
                info!(
                    stage = %stage.name,
                    paths_removed = report.paths_removed,
                    bytecode_removed = report.bytecode_removed,
                    "Cleanup finished"
                );
                Ok(())
            }
            StageAction::Publish(spec) => spec.apply().map(|_| ()),
            StageAction::Launch(spec) => {
                supervisor::handoff(spec, self.handoff, self.shutdown.clone()).await
            }
        }
    }
}

/// Re-emit each line a child writes as a log event
async fn forward_lines<R>(reader: R, stage: String, stream: &'static str)
where
    R: AsyncRead + Unpin,
{
    let mut lines = BufReader::new(reader).lines();
    loop {
        match lines.next_line().await {
            Ok(Some(line)) => info!(target: "stage", stage = %stage, stream, "{}", line),
            Ok(None) => break,
            Err(e) => {
                warn!(stage = %stage, stream, error = %e, "Error reading child output");
                break;
            }
        }
    }
}

/// SIGTERM the child's process group, then SIGKILL after the grace period
async fn terminate(stage: &str, child: &mut Child, grace_period: Duration) {
    if let Some(pid) = child.id() {
        info!(stage, pid, "Sending SIGTERM to stage process group");

        // SAFETY: kill(2) has no memory-safety preconditions
        #[cfg(unix)]
        unsafe {
            libc::kill(-(pid as i32), libc::SIGTERM);
        }

        #[cfg(not(unix))]
        {
            let _ = child.start_kill();
        }
    }

    match tokio::time::timeout(grace_period, child.wait()).await {
        Ok(Ok(status)) => {
            info!(stage, ?status, "Stage process exited after SIGTERM");
        }
        Ok(Err(e)) => {
            warn!(stage, error = %e, "Error waiting for stage process to exit");
        }
        Err(_) => {
            warn!(
                stage,
                grace_period_secs = grace_period.as_secs(),
                "Grace period exceeded, sending SIGKILL"
            );
            #[cfg(unix)]
            {
                if let Some(pid) = child.id() {
                    // SAFETY: kill(2) has no memory-safety preconditions
                    unsafe {
                        libc::kill(-(pid as i32), libc::SIGKILL);
                    }
                }
            }
            let _ = child.kill().await;
        }
    }
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::stage::StageKind;
    use std::time::Instant;

    fn shell_stage(name: &str, script: &str) -> Stage {
        Stage::command(
            name,
            StageKind::Build,
            ".",
            CommandSpec::new("sh").args(["-c", script]),
        )
    }

    fn runner() -> (watch::Sender<Option<i32>>, ProcessRunner) {
        let (tx, rx) = watch::channel(None);
        (tx, ProcessRunner::new(rx).with_grace_period(Duration::from_secs(1)))
    }

    #[tokio::test]
    async fn test_successful_command() {
        let (_tx, mut runner) = runner();
        assert!(runner.run(&shell_stage("ok", "echo hello; echo oops >&2")).await.is_ok());
    }

    #[tokio::test]
    async fn test_exit_code_is_reported() {
        let (_tx, mut runner) = runner();
        let err = runner.run(&shell_stage("fail", "exit 3")).await.unwrap_err();
        assert!(matches!(err, StageError::Exited { code: 3 }));
    }

    #[tokio::test]
    async fn test_missing_program() {
        let (_tx, mut runner) = runner();
        let stage = Stage::command(
            "missing",
            StageKind::Install,
            ".",
            CommandSpec::new("/no/such/tool"),
        );
        let err = runner.run(&stage).await.unwrap_err();
        assert_eq!(err.exit_code(), crate::error::EXIT_NOT_FOUND);
    }

    #[tokio::test]
    async fn test_working_dir_and_env() {
        let dir = tempfile::tempdir().unwrap();
        let (_tx, mut runner) = runner();
        let stage = Stage::command(
            "env",
            StageKind::Build,
            dir.path(),
            CommandSpec::new("sh")
                .args(["-c", "echo \"$GREETING\" > out.txt"])
                .env("GREETING", "hi"),
        );
        runner.run(&stage).await.unwrap();
        let out = std::fs::read_to_string(dir.path().join("out.txt")).unwrap();
        assert_eq!(out.trim(), "hi");
    }

    #[tokio::test]
    async fn test_stage_timeout() {
        let (_tx, runner) = runner();
        let mut runner = runner.with_stage_timeout(Some(Duration::from_millis(200)));

        let start = Instant::now();
        let err = runner.run(&shell_stage("hang", "sleep 30")).await.unwrap_err();
        assert!(matches!(err, StageError::TimedOut { .. }));
        assert_eq!(err.exit_code(), crate::error::EXIT_TIMEOUT);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_aborts_running_stage() {
        let (tx, mut runner) = runner();
        let stage = shell_stage("long", "sleep 30");

        let start = Instant::now();
        let deliver = async {
            tokio::time::sleep(Duration::from_millis(200)).await;
            tx.send(Some(libc::SIGTERM)).unwrap();
        };
        let (result, ()) = tokio::join!(runner.run(&stage), deliver);

        let err = result.unwrap_err();
        assert!(matches!(err, StageError::Interrupted { signal } if signal == libc::SIGTERM));
        assert_eq!(err.exit_code(), 128 + libc::SIGTERM);
        assert!(start.elapsed() < Duration::from_secs(10));
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_signal_before_stage_prevents_start() {
        let dir = tempfile::tempdir().unwrap();
        let (tx, mut runner) = runner();
        tx.send(Some(libc::SIGINT)).unwrap();

        let stage = Stage::command(
            "never",
            StageKind::Install,
            dir.path(),
            CommandSpec::new("sh").args(["-c", "touch ran.txt"]),
        );
        let err = runner.run(&stage).await.unwrap_err();
        assert!(matches!(err, StageError::Interrupted { signal } if signal == libc::SIGINT));
        assert!(!dir.path().join("ran.txt").exists());

        // Consumed: the next stage is not interrupted by the same signal
        assert!(runner.run(&shell_stage("after", "true")).await.is_ok());
    }

    #[test]
    fn test_pending_signal() {
        let (tx, mut rx) = watch::channel(None);
        assert_eq!(pending_signal(&mut rx), None);
        tx.send(Some(15)).unwrap();
        assert_eq!(pending_signal(&mut rx), Some(15));
        assert_eq!(pending_signal(&mut rx), None);
        drop(tx);
        assert_eq!(pending_signal(&mut rx), None);
    }

    #[tokio::test]
    async fn test_next_signal_pends_after_sender_dropped() {
        let (tx, mut rx) = watch::channel(None);
        drop(tx);
        let result = tokio::time::timeout(Duration::from_millis(100), next_signal(&mut rx)).await;
        assert!(result.is_err());
    }
}
