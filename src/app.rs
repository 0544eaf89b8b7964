//! Deployment context: everything resolved once, up front, before any stage
//! runs

use crate::config::{EnvMap, HandoffMode, Hosting, ProjectConfig, RuntimeConfig};
use crate::error::ConfigError;
use crate::health::HealthCheckSpec;
use crate::layout::{resolve_root, ProjectLayout};
use crate::manifest::ServiceDefinition;
use crate::pipeline::{Pipeline, Profile};
use crate::router::RouteTable;
use crate::runner::{ProcessRunner, ShutdownSignal};
use std::path::{Path, PathBuf};
use tracing::info;

/// Choices made on the command line
#[derive(Debug, Clone, Default)]
pub struct DeployOptions {
    pub profile: Profile,
    pub hosting: Hosting,
    pub root: Option<PathBuf>,
    pub config: Option<PathBuf>,
    pub clean: bool,
    /// Overrides `backend.handoff` from the project file
    pub handoff: Option<HandoffMode>,
    /// Directory holding the orchestrator binary, tried as the root when
    /// neither `root` nor `config` is given
    pub install_dir: Option<PathBuf>,
}

#[derive(Debug, Clone)]
pub struct Deployment {
    pub profile: Profile,
    pub hosting: Hosting,
    pub clean: bool,
    pub handoff: HandoffMode,
    pub project: ProjectConfig,
    /// The project file that was loaded, if any
    pub project_file: Option<PathBuf>,
    pub runtime: RuntimeConfig,
    pub layout: ProjectLayout,
}

impl Deployment {
    /// Resolve root, project file, environment and layout. Any problem here
    /// is a configuration error and no stage has run yet.
    pub fn resolve(opts: &DeployOptions, env: &EnvMap, cwd: &Path) -> Result<Self, ConfigError> {
        let config_file = opts.config.as_ref().map(|p| {
            if p.is_absolute() {
                p.clone()
            } else {
                cwd.join(p)
            }
        });
        let root = resolve_root(
            opts.root.as_deref(),
            config_file.as_deref(),
            opts.install_dir.as_deref(),
            cwd,
        );
        if !root.is_dir() {
            return Err(ConfigError::MissingDirectory(root.display().to_string()));
        }

        let (project, project_file) = ProjectConfig::discover(config_file.as_deref(), &root)?;
        let runtime = RuntimeConfig::from_env(env, opts.hosting)?;
        let layout = ProjectLayout::discover(&root, &project);
        let handoff = opts.handoff.unwrap_or(project.backend.handoff);

        info!(
            root = %root.display(),
            project_file = ?project_file,
            profile = opts.profile.as_str(),
            hosting = opts.hosting.as_str(),
            host = %runtime.host,
            port = runtime.port,
            workers = runtime.worker_count,
            timeout_secs = runtime.request_timeout_secs,
            max_requests = ?runtime.max_requests_per_worker,
            "Deployment configuration resolved"
        );

        Ok(Self {
            profile: opts.profile,
            hosting: opts.hosting,
            clean: opts.clean,
            handoff,
            project,
            project_file,
            runtime,
            layout,
        })
    }

    pub fn pipeline(&self) -> Result<Pipeline, ConfigError> {
        Pipeline::for_profile(
            self.profile,
            &self.runtime,
            &self.project,
            &self.layout,
            self.clean,
        )
    }

    /// A runner configured from the project's pipeline settings
    pub fn runner(&self, shutdown: ShutdownSignal) -> ProcessRunner {
        ProcessRunner::new(shutdown)
            .with_stage_timeout(self.project.pipeline.stage_timeout())
            .with_grace_period(self.project.pipeline.shutdown_grace_period())
            .with_handoff(self.handoff)
    }

    pub fn route_table(&self) -> RouteTable {
        RouteTable::new(self.layout.static_dir(), &self.runtime)
    }

    pub fn service_definition<'a>(
        &'a self,
        name: &'a str,
        health: &'a HealthCheckSpec,
    ) -> ServiceDefinition<'a> {
        ServiceDefinition {
            name,
            profile: self.profile,
            hosting: self.hosting,
            runtime: &self.runtime,
            health,
        }
    }
}
