//! Backend launch and handoff
//!
//! The last stage turns the orchestrator into the backend server. On Unix
//! this is a real `exec`, so the process manager keeps observing a single PID
//! and its signals land on the server directly. Where `exec` is unavailable,
//! or when forwarding is requested, the orchestrator stays as a thin parent:
//! it relays termination signals and exits with the child's status.

use crate::config::{BackendConfig, HandoffMode, RuntimeConfig};
use crate::error::{ConfigError, StageError};
use crate::runner::{next_signal, pending_signal, status_to_result, ShutdownSignal};
use crate::stage::CommandSpec;
use serde::Serialize;
use std::path::{Path, PathBuf};
use std::process::Stdio;
use tokio::process::Command;
use tracing::{debug, info, warn};

/// Server execution strategy, picked from the worker count and recycling cap
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "snake_case", tag = "kind")]
pub enum ServerStrategy {
    /// One asynchronous server process, no worker multiplexing
    SingleProcess,
    /// A master process with `workers` request-handling workers
    MultiWorker { workers: u32 },
}

impl ServerStrategy {
    /// A recycling cap needs a master to replace the retired worker, so a
    /// capped single worker still runs under the multi-worker server.
    pub fn select(workers: u32, max_requests: Option<u32>) -> Self {
        if workers <= 1 && max_requests.is_none() {
            ServerStrategy::SingleProcess
        } else {
            ServerStrategy::MultiWorker {
                workers: workers.max(1),
            }
        }
    }

    pub fn workers(&self) -> u32 {
        match self {
            ServerStrategy::SingleProcess => 1,
            ServerStrategy::MultiWorker { workers } => *workers,
        }
    }
}

/// Everything needed to start the backend server
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct LaunchSpec {
    pub strategy: ServerStrategy,
    /// `module:attribute` of the ASGI application
    pub entry_point: String,
    pub host: String,
    pub port: u16,
    pub bind_addr: String,
    pub timeout_secs: u64,
    /// Worker recycling cap. Trades a little latency for bounded memory.
    pub max_requests: Option<u32>,
    /// Server program and its leading arguments, for the selected strategy
    pub server: CommandSpec,
    pub worker_class: String,
    pub working_dir: PathBuf,
}

impl LaunchSpec {
    /// The server program strings come from the project file and may carry
    /// leading arguments of their own (`python -m uvicorn`).
    pub fn new(
        config: &RuntimeConfig,
        backend: &BackendConfig,
        working_dir: &Path,
    ) -> Result<Self, ConfigError> {
        let strategy = ServerStrategy::select(config.worker_count, config.max_requests_per_worker);
        let server = match strategy {
            ServerStrategy::SingleProcess => {
                CommandSpec::parse("backend.single_server", &backend.single_server)?
            }
            ServerStrategy::MultiWorker { .. } => {
                CommandSpec::parse("backend.multi_server", &backend.multi_server)?
            }
        };

        Ok(Self {
            strategy,
            entry_point: backend.entry_point.clone(),
            host: config.host.clone(),
            port: config.port,
            bind_addr: config.bind_addr(),
            timeout_secs: config.request_timeout_secs,
            max_requests: config.max_requests_per_worker,
            server,
            worker_class: backend.worker_class.clone(),
            working_dir: working_dir.to_path_buf(),
        })
    }

    /// Command line for the selected strategy.
    ///
    /// The single-process server has no per-request timeout, so the request
    /// timeout bounds idle keep-alive connections there. It never gets a
    /// recycling cap: nothing would restart it after the cap is reached.
    pub fn command(&self) -> CommandSpec {
        let base = self.server.clone().arg(&self.entry_point);

        let spec = match self.strategy {
            ServerStrategy::SingleProcess => base
                .args(["--host", self.host.as_str()])
                .args(["--port".to_string(), self.port.to_string()])
                .args(["--timeout-keep-alive".to_string(), self.timeout_secs.to_string()]),
            ServerStrategy::MultiWorker { workers } => {
                let spec = base
                    .args(["--workers".to_string(), workers.to_string()])
                    .args(["--worker-class", self.worker_class.as_str()])
                    .args(["--bind", self.bind_addr.as_str()])
                    .args(["--timeout".to_string(), self.timeout_secs.to_string()]);
                match self.max_requests {
                    Some(n) => spec.args(["--max-requests".to_string(), n.to_string()]),
                    None => spec,
                }
            }
        };

        spec.env("HOST", &self.host)
            .env("PORT", self.port.to_string())
            .env("WORKERS", self.strategy.workers().to_string())
            .env("TIMEOUT", self.timeout_secs.to_string())
    }

    /// Warn early when the application module cannot be found. The server
    /// itself still runs, so its own exit status is what gets reported.
    pub fn preflight(&self) {
        let module = self.entry_point.split(':').next().unwrap_or_default();
        let relative = module.replace('.', "/");
        let as_file = self.working_dir.join(format!("{}.py", relative));
        let as_package = self.working_dir.join(&relative).join("__init__.py");
        if !as_file.exists() && !as_package.exists() {
            warn!(
                entry_point = %self.entry_point,
                working_dir = %self.working_dir.display(),
                "Backend entry point module not found, the server will likely fail to start"
            );
        }
    }
}

/// Start the backend and give it control.
///
/// With [`HandoffMode::Exec`] on Unix this only returns if `exec` fails.
/// Otherwise it returns once the backend exits, mapping its status. A
/// termination signal that is already pending stops the launch.
pub async fn handoff(
    spec: &LaunchSpec,
    mode: HandoffMode,
    mut shutdown: ShutdownSignal,
) -> Result<(), StageError> {
    if let Some(signal) = pending_signal(&mut shutdown) {
        warn!(signal, "Signal received, not launching backend");
        return Err(StageError::Interrupted { signal });
    }

    spec.preflight();
    let command = spec.command();

    info!(
        strategy = ?spec.strategy,
        workers = spec.strategy.workers(),
        bind = %spec.bind_addr,
        timeout_secs = spec.timeout_secs,
        max_requests = ?spec.max_requests,
        command = %command.display(),
        mode = ?mode,
        "Handing off to backend server"
    );

    match mode {
        #[cfg(unix)]
        HandoffMode::Exec => Err(exec_replace(&command, &spec.working_dir)),
        #[cfg(not(unix))]
        HandoffMode::Exec => {
            warn!("exec handoff is not available on this platform, forwarding instead");
            spawn_and_forward(&command, &spec.working_dir, shutdown).await
        }
        HandoffMode::Forward => spawn_and_forward(&command, &spec.working_dir, shutdown).await,
    }
}

/// Replace the current process image. Only returns on failure.
#[cfg(unix)]
fn exec_replace(command: &CommandSpec, working_dir: &Path) -> StageError {
    use std::os::unix::process::CommandExt;

    let source = std::process::Command::new(&command.program)
        .args(&command.args)
        .envs(&command.env)
        .current_dir(working_dir)
        .exec();

    StageError::Spawn {
        program: command.program.clone(),
        source,
    }
}

async fn spawn_and_forward(
    command: &CommandSpec,
    working_dir: &Path,
    mut shutdown: ShutdownSignal,
) -> Result<(), StageError> {
    let mut child = Command::new(&command.program)
        .args(&command.args)
        .envs(&command.env)
        .current_dir(working_dir)
        .stdin(Stdio::inherit())
        .stdout(Stdio::inherit())
        .stderr(Stdio::inherit())
        .spawn()
        .map_err(|source| StageError::Spawn {
            program: command.program.clone(),
            source,
        })?;

    let pid = child.id();
    info!(pid, "Backend process started, forwarding signals");

    loop {
        tokio::select! {
            status = child.wait() => {
                let status = status.map_err(StageError::Wait)?;
                info!(?status, "Backend process exited");
                return status_to_result(status);
            }
            signal = next_signal(&mut shutdown) => {
                debug!(signal, pid, "Forwarding signal to backend");
                forward_signal(pid, signal);
            }
        }
    }
}

#[cfg(unix)]
fn forward_signal(pid: Option<u32>, signal: i32) {
    if let Some(pid) = pid {
        // SAFETY: kill(2) has no memory-safety preconditions
        unsafe {
            libc::kill(pid as i32, signal);
        }
    }
}

#[cfg(not(unix))]
fn forward_signal(_pid: Option<u32>, signal: i32) {
    warn!(signal, "Signal forwarding is not supported on this platform");
}

#[cfg(test)]
mod tests {
    use super::*;
    use crate::config::{EnvMap, Hosting};

    fn spec_for(pairs: &[(&str, &str)], hosting: Hosting) -> LaunchSpec {
        let env: EnvMap = pairs
            .iter()
            .map(|(k, v)| (k.to_string(), v.to_string()))
            .collect();
        let config = RuntimeConfig::from_env(&env, hosting).unwrap();
        LaunchSpec::new(&config, &BackendConfig::default(), Path::new("/srv/app")).unwrap()
    }

    #[test]
    fn test_strategy_selection() {
        assert_eq!(ServerStrategy::select(1, None), ServerStrategy::SingleProcess);
        assert_eq!(
            ServerStrategy::select(4, None),
            ServerStrategy::MultiWorker { workers: 4 }
        );
        assert_eq!(
            ServerStrategy::select(1, Some(1)),
            ServerStrategy::MultiWorker { workers: 1 }
        );
        assert_eq!(ServerStrategy::select(4, Some(1)).workers(), 4);
        assert_eq!(ServerStrategy::SingleProcess.workers(), 1);
    }

    #[test]
    fn test_capped_single_worker_runs_under_master() {
        let spec = spec_for(&[], Hosting::Constrained);
        assert_eq!(spec.strategy, ServerStrategy::MultiWorker { workers: 1 });

        let cmd = spec.command();
        assert_eq!(cmd.program, "gunicorn");
        assert_eq!(
            cmd.args,
            vec![
                "main:app",
                "--workers",
                "1",
                "--worker-class",
                "uvicorn.workers.UvicornWorker",
                "--bind",
                "0.0.0.0:8000",
                "--timeout",
                "120",
                "--max-requests",
                "1",
            ]
        );
        assert_eq!(cmd.env.get("WORKERS").map(String::as_str), Some("1"));
    }

    #[test]
    fn test_uncapped_single_worker_command() {
        let config = RuntimeConfig {
            max_requests_per_worker: None,
            ..RuntimeConfig::defaults(Hosting::Constrained)
        };
        let spec =
            LaunchSpec::new(&config, &BackendConfig::default(), Path::new("/srv/app")).unwrap();
        assert_eq!(spec.strategy, ServerStrategy::SingleProcess);

        let cmd = spec.command();
        assert_eq!(cmd.program, "uvicorn");
        assert_eq!(
            cmd.args,
            vec![
                "main:app",
                "--host",
                "0.0.0.0",
                "--port",
                "8000",
                "--timeout-keep-alive",
                "120",
            ]
        );
        assert_eq!(cmd.env.get("PORT").map(String::as_str), Some("8000"));
    }

    #[test]
    fn test_multi_worker_command() {
        let spec = spec_for(&[("WORKERS", "4"), ("PORT", "9000")], Hosting::Constrained);
        assert_eq!(spec.strategy, ServerStrategy::MultiWorker { workers: 4 });

        let cmd = spec.command();
        assert_eq!(cmd.program, "gunicorn");
        assert_eq!(
            cmd.args,
            vec![
                "main:app",
                "--workers",
                "4",
                "--worker-class",
                "uvicorn.workers.UvicornWorker",
                "--bind",
                "0.0.0.0:9000",
                "--timeout",
                "120",
                "--max-requests",
                "1",
            ]
        );
        assert_eq!(cmd.env.get("WORKERS").map(String::as_str), Some("4"));
    }

    #[test]
    fn test_container_hosting_has_no_request_cap() {
        let cmd = spec_for(&[], Hosting::Container).command();
        assert_eq!(cmd.program, "gunicorn");
        assert!(!cmd.args.iter().any(|a| a == "--max-requests"));
    }

    #[test]
    fn test_server_program_with_leading_args() {
        let config = RuntimeConfig::defaults(Hosting::Container);
        let backend = BackendConfig {
            single_server: "python -m uvicorn".to_string(),
            ..BackendConfig::default()
        };
        let config = RuntimeConfig {
            worker_count: 1,
            ..config
        };
        let spec = LaunchSpec::new(&config, &backend, Path::new(".")).unwrap();
        assert_eq!(spec.strategy, ServerStrategy::SingleProcess);

        let cmd = spec.command();
        assert_eq!(cmd.program, "python");
        assert_eq!(&cmd.args[..3], ["-m", "uvicorn", "main:app"]);
    }

    #[test]
    fn test_unparsable_server_command_is_config_error() {
        let backend = BackendConfig {
            multi_server: "gunicorn 'unterminated".to_string(),
            ..BackendConfig::default()
        };
        let config = RuntimeConfig::defaults(Hosting::Container);
        let err = LaunchSpec::new(&config, &backend, Path::new(".")).unwrap_err();
        match err {
            ConfigError::InvalidCommand { field, .. } => assert_eq!(field, "backend.multi_server"),
            other => panic!("expected an invalid command, got {other:?}"),
        }
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_pending_signal_stops_exec_handoff() {
        let (tx, rx) = tokio::sync::watch::channel(None);
        let backend = BackendConfig {
            multi_server: "/definitely/not/a/server".to_string(),
            ..BackendConfig::default()
        };
        let config = RuntimeConfig::defaults(Hosting::Container);
        let spec = LaunchSpec::new(&config, &backend, Path::new(".")).unwrap();
        tx.send(Some(libc::SIGTERM)).unwrap();

        let err = handoff(&spec, HandoffMode::Exec, rx).await.unwrap_err();
        assert!(matches!(err, StageError::Interrupted { signal } if signal == libc::SIGTERM));
        assert_eq!(err.exit_code(), 128 + libc::SIGTERM);
    }

    #[tokio::test]
    async fn test_forward_mode_reports_exit_code() {
        let (_tx, rx) = tokio::sync::watch::channel(None);
        let command = CommandSpec::new("sh").args(["-c", "exit 7"]);
        let err = spawn_and_forward(&command, Path::new("."), rx).await.unwrap_err();
        assert_eq!(err.exit_code(), 7);
    }

    #[tokio::test]
    async fn test_forward_mode_success() {
        let (_tx, rx) = tokio::sync::watch::channel(None);
        let command = CommandSpec::new("sh").args(["-c", "exit 0"]);
        assert!(spawn_and_forward(&command, Path::new("."), rx).await.is_ok());
    }

    #[tokio::test]
    async fn test_forward_mode_missing_program() {
        let (_tx, rx) = tokio::sync::watch::channel(None);
        let command = CommandSpec::new("/definitely/not/a/server");
        let err = spawn_and_forward(&command, Path::new("."), rx).await.unwrap_err();
        assert!(err.is_launch_failure());
        assert_eq!(err.exit_code(), crate::error::EXIT_NOT_FOUND);
    }

    #[cfg(unix)]
    #[tokio::test]
    async fn test_forward_mode_relays_signals() {
        let (tx, rx) = tokio::sync::watch::channel(None);
        let script = "trap 'exit 42' TERM; while true; do sleep 0.05; done";
        let command = CommandSpec::new("sh").args(["-c", script]);

        let task =
            tokio::spawn(async move { spawn_and_forward(&command, Path::new("."), rx).await });
        tokio::time::sleep(std::time::Duration::from_millis(300)).await;
        tx.send(Some(libc::SIGTERM)).unwrap();

        let err = task.await.unwrap().unwrap_err();
        assert_eq!(err.exit_code(), 42);
    }
}
