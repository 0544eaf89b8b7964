use crate::error::ConfigError;
use serde::{Deserialize, Serialize};
use std::collections::HashMap;
use std::path::{Path, PathBuf};
use std::str::FromStr;
use std::time::Duration;

/// Snapshot of the process environment, taken once at startup
pub type EnvMap = HashMap<String, String>;

/// Name of the project file looked up in the project root
pub const PROJECT_FILE: &str = "stagehand.toml";

/// Hosting class, which decides the concurrency defaults
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum Hosting {
    /// Single core, little memory: one worker, recycled after every request
    #[default]
    Constrained,
    /// Dedicated container: four workers, no request cap
    Container,
}

impl Hosting {
    pub fn default_workers(&self) -> u32 {
        match self {
            Hosting::Constrained => 1,
            Hosting::Container => 4,
        }
    }

    pub fn default_max_requests(&self) -> Option<u32> {
        match self {
            Hosting::Constrained => Some(1),
            Hosting::Container => None,
        }
    }

    pub fn as_str(&self) -> &'static str {
        match self {
            Hosting::Constrained => "constrained",
            Hosting::Container => "container",
        }
    }
}

/// How the launch stage hands control to the backend
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, Deserialize, clap::ValueEnum)]
#[serde(rename_all = "lowercase")]
pub enum HandoffMode {
    /// Replace the orchestrator process with the backend (Unix only)
    #[default]
    Exec,
    /// Keep a parent that forwards signals and exits with the child's status
    Forward,
}

/// Runtime settings resolved from the environment.
///
/// Built once by the driver and passed by reference; nothing mutates it
/// afterwards.
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct RuntimeConfig {
    /// Bind address (`HOST`)
    pub host: String,
    /// Bind port (`PORT`)
    pub port: u16,
    /// Number of server workers (`WORKERS`), always at least 1
    pub worker_count: u32,
    /// Per-request timeout in seconds (`TIMEOUT`), always positive
    pub request_timeout_secs: u64,
    /// Requests a worker serves before it is recycled (`MAX_REQUESTS`)
    pub max_requests_per_worker: Option<u32>,
}

impl RuntimeConfig {
    /// Defaults for a hosting class with an empty environment
    pub fn defaults(hosting: Hosting) -> Self {
        Self {
            host: default_host(),
            port: default_port(),
            worker_count: hosting.default_workers(),
            request_timeout_secs: default_request_timeout(),
            max_requests_per_worker: hosting.default_max_requests(),
        }
    }

    /// Resolve from an environment snapshot.
    ///
    /// Absent or blank variables fall back to the hosting defaults. A variable
    /// that is set but unusable is an error, never silently replaced.
    pub fn from_env(env: &EnvMap, hosting: Hosting) -> Result<Self, ConfigError> {
        let mut config = Self::defaults(hosting);

        if let Some(host) = lookup(env, "HOST") {
            if host.chars().any(char::is_whitespace) {
                return Err(ConfigError::InvalidValue {
                    var: "HOST",
                    value: host.to_string(),
                    reason: "bind address must not contain whitespace".to_string(),
                });
            }
            config.host = host.to_string();
        }
        if let Some(raw) = lookup(env, "PORT") {
            config.port = parse_positive("PORT", raw)?;
        }
        if let Some(raw) = lookup(env, "WORKERS") {
            config.worker_count = parse_positive("WORKERS", raw)?;
        }
        if let Some(raw) = lookup(env, "TIMEOUT") {
            config.request_timeout_secs = parse_positive("TIMEOUT", raw)?;
        }
        if let Some(raw) = lookup(env, "MAX_REQUESTS") {
            config.max_requests_per_worker = Some(parse_positive("MAX_REQUESTS", raw)?);
        }

        Ok(config)
    }

    /// `host:port`, bracketing IPv6 literals
    pub fn bind_addr(&self) -> String {
        if self.host.contains(':') && !self.host.starts_with('[') {
            format!("[{}]:{}", self.host, self.port)
        } else {
            format!("{}:{}", self.host, self.port)
        }
    }

    pub fn request_timeout(&self) -> Duration {
        Duration::from_secs(self.request_timeout_secs)
    }
}

/// Returns the trimmed value when the variable is present and non-blank
fn lookup<'a>(env: &'a EnvMap, var: &str) -> Option<&'a str> {
    env.get(var).map(|v| v.trim()).filter(|v| !v.is_empty())
}

fn parse_positive<T>(var: &'static str, raw: &str) -> Result<T, ConfigError>
where
    T: FromStr + PartialEq + From<u8>,
{
    let invalid = |reason: &str| ConfigError::InvalidValue {
        var,
        value: raw.to_string(),
        reason: reason.to_string(),
    };

    let value: T = raw
        .parse()
        .map_err(|_| invalid("expected a positive integer in range"))?;
    if value == T::from(0) {
        return Err(invalid("must be greater than 0"));
    }
    Ok(value)
}

/// Project file (`stagehand.toml`). Every field has a default, so the file
/// itself is optional.
#[derive(Debug, Deserialize, Clone, Default)]
pub struct ProjectConfig {
    #[serde(default)]
    pub layout: LayoutConfig,

    #[serde(default)]
    pub backend: BackendConfig,

    #[serde(default)]
    pub frontend: FrontendConfig,

    #[serde(default)]
    pub cleanup: CleanupConfig,

    #[serde(default)]
    pub pipeline: PipelineConfig,
}

#[derive(Debug, Deserialize, Clone)]
pub struct LayoutConfig {
    /// Candidate backend directories, relative to the project root. The first
    /// one that exists wins; the root itself is the fallback.
    #[serde(default = "default_backend_dirs")]
    pub backend_dirs: Vec<String>,

    /// Frontend source directory, relative to the project root
    #[serde(default = "default_client_dir")]
    pub client_dir: String,

    /// Build output directory, relative to the client directory
    #[serde(default = "default_frontend_output")]
    pub frontend_output: String,

    /// Where the router reads static assets from, relative to the project
    /// root. When unset the build output is served in place.
    pub publish_dir: Option<String>,
}

impl Default for LayoutConfig {
    fn default() -> Self {
        Self {
            backend_dirs: default_backend_dirs(),
            client_dir: default_client_dir(),
            frontend_output: default_frontend_output(),
            publish_dir: None,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct BackendConfig {
    /// ASGI application, `module:attribute`
    #[serde(default = "default_entry_point")]
    pub entry_point: String,

    /// Dependency install command, run in the backend directory
    #[serde(default = "default_backend_install")]
    pub install: String,

    /// Server used when a single worker is configured
    #[serde(default = "default_single_server")]
    pub single_server: String,

    /// Server used when more than one worker is configured
    #[serde(default = "default_multi_server")]
    pub multi_server: String,

    /// Worker class handed to the multi-worker server
    #[serde(default = "default_worker_class")]
    pub worker_class: String,

    #[serde(default)]
    pub handoff: HandoffMode,
}

impl Default for BackendConfig {
    fn default() -> Self {
        Self {
            entry_point: default_entry_point(),
            install: default_backend_install(),
            single_server: default_single_server(),
            multi_server: default_multi_server(),
            worker_class: default_worker_class(),
            handoff: HandoffMode::default(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct FrontendConfig {
    #[serde(default = "default_frontend_install")]
    pub install: String,

    #[serde(default = "default_frontend_build")]
    pub build: String,
}

impl Default for FrontendConfig {
    fn default() -> Self {
        Self {
            install: default_frontend_install(),
            build: default_frontend_build(),
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct CleanupConfig {
    /// Run the cleanup stage without `--clean`
    #[serde(default)]
    pub enabled: bool,

    /// Paths removed outright, relative to the project root
    #[serde(default = "default_cleanup_paths")]
    pub paths: Vec<String>,

    /// Also delete `__pycache__` directories and compiled bytecode under the
    /// backend directory
    #[serde(default = "default_true")]
    pub bytecode: bool,
}

impl Default for CleanupConfig {
    fn default() -> Self {
        Self {
            enabled: false,
            paths: default_cleanup_paths(),
            bytecode: true,
        }
    }
}

#[derive(Debug, Deserialize, Clone)]
pub struct PipelineConfig {
    /// Upper bound for any single install or build stage. Unset means stages
    /// may run for as long as they need.
    pub stage_timeout_secs: Option<u64>,

    /// Time a stage child gets between SIGTERM and SIGKILL
    #[serde(default = "default_shutdown_grace_period")]
    pub shutdown_grace_period_secs: u64,
}

impl Default for PipelineConfig {
    fn default() -> Self {
        Self {
            stage_timeout_secs: None,
            shutdown_grace_period_secs: default_shutdown_grace_period(),
        }
    }
}

impl PipelineConfig {
    pub fn stage_timeout(&self) -> Option<Duration> {
        self.stage_timeout_secs.map(Duration::from_secs)
    }

    pub fn shutdown_grace_period(&self) -> Duration {
        Duration::from_secs(self.shutdown_grace_period_secs)
    }
}

// Default value functions
fn default_host() -> String {
    "0.0.0.0".to_string()
}

fn default_port() -> u16 {
    8000
}

fn default_request_timeout() -> u64 {
    120
}

fn default_backend_dirs() -> Vec<String> {
    vec!["server/fastapi".to_string()]
}

fn default_client_dir() -> String {
    "client".to_string()
}

fn default_frontend_output() -> String {
    "dist".to_string()
}

fn default_entry_point() -> String {
    "main:app".to_string()
}

fn default_backend_install() -> String {
    "pip install --no-cache-dir -r requirements.txt".to_string()
}

fn default_single_server() -> String {
    "uvicorn".to_string()
}

fn default_multi_server() -> String {
    "gunicorn".to_string()
}

fn default_worker_class() -> String {
    "uvicorn.workers.UvicornWorker".to_string()
}

fn default_frontend_install() -> String {
    "npm install".to_string()
}

fn default_frontend_build() -> String {
    "npm run build".to_string()
}

fn default_cleanup_paths() -> Vec<String> {
    vec![
        "client/node_modules/.cache".to_string(),
        "client/node_modules/.vite".to_string(),
        ".venv".to_string(),
    ]
}

fn default_true() -> bool {
    true
}

fn default_shutdown_grace_period() -> u64 {
    10 // seconds between SIGTERM and SIGKILL
}

impl ProjectConfig {
    pub fn load<P: AsRef<Path>>(path: P) -> Result<Self, ConfigError> {
        let path = path.as_ref();
        let content = std::fs::read_to_string(path).map_err(|e| ConfigError::ReadFile {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        let config: ProjectConfig = toml::from_str(&content).map_err(|e| ConfigError::Parse {
            path: path.display().to_string(),
            reason: e.to_string(),
        })?;
        config.validate()?;
        Ok(config)
    }

    /// Load an explicit file, or `stagehand.toml` from the root if present,
    /// or fall back to defaults.
    pub fn discover(
        explicit: Option<&Path>,
        root: &Path,
    ) -> Result<(Self, Option<PathBuf>), ConfigError> {
        if let Some(path) = explicit {
            return Ok((Self::load(path)?, Some(path.to_path_buf())));
        }
        let candidate = root.join(PROJECT_FILE);
        if candidate.is_file() {
            return Ok((Self::load(&candidate)?, Some(candidate)));
        }
        Ok((Self::default(), None))
    }

    /// Check that every command line splits into a program and arguments
    pub fn validate(&self) -> Result<(), ConfigError> {
        let commands = [
            ("backend.install", &self.backend.install),
            ("backend.single_server", &self.backend.single_server),
            ("backend.multi_server", &self.backend.multi_server),
            ("frontend.install", &self.frontend.install),
            ("frontend.build", &self.frontend.build),
        ];
        for (field, line) in commands {
            let words = shell_words::split(line).map_err(|e| ConfigError::InvalidCommand {
                field: field.to_string(),
                reason: e.to_string(),
            })?;
            if words.is_empty() {
                return Err(ConfigError::InvalidCommand {
                    field: field.to_string(),
                    reason: "command is empty".to_string(),
                });
            }
        }

        if !self.backend.entry_point.contains(':') {
            return Err(ConfigError::InvalidCommand {
                field: "backend.entry_point".to_string(),
                reason: format!("expected 'module:attribute', got '{}'", self.backend.entry_point),
            });
        }

        if self.pipeline.stage_timeout_secs == Some(0) {
            return Err(ConfigError::InvalidCommand {
                field: "pipeline.stage_timeout_secs".to_string(),
                reason: "must be greater than 0 when set".to_string(),
            });
        }

        Ok(())
    }
}
