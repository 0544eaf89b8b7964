//! The stage pipeline: profile composition, ordering rules and fail-fast
//! execution

use crate::config::{ProjectConfig, RuntimeConfig};
use crate::error::{ConfigError, StageError};
use crate::layout::ProjectLayout;
use crate::runner::StageRunner;
use crate::stage::{CleanSpec, CommandSpec, PublishSpec, Stage, StageKind};
use crate::supervisor::LaunchSpec;
use serde::Serialize;
use std::collections::HashSet;
use std::time::Instant;
use tracing::{error, info, info_span, warn, Instrument};
use uuid::Uuid;

/// Which collaborators a deployment installs and starts
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq, Serialize, clap::ValueEnum)]
#[serde(rename_all = "kebab-case")]
pub enum Profile {
    /// Python dependencies, then the backend
    #[default]
    BackendOnly,
    /// Python dependencies, frontend dependencies and build, then the backend
    FullStack,
}

impl Profile {
    pub fn as_str(&self) -> &'static str {
        match self {
            Profile::BackendOnly => "backend-only",
            Profile::FullStack => "full-stack",
        }
    }
}

/// Outcome of a pipeline run
#[derive(Debug, Clone, PartialEq, Eq)]
pub enum PipelineResult {
    /// Every stage completed and the backend was handed control
    Success,
    /// A stage failed; nothing after it ran
    Failure { stage: String, exit_code: i32 },
}

impl PipelineResult {
    /// The exit code the orchestrator process should terminate with
    pub fn exit_code(&self) -> i32 {
        match self {
            PipelineResult::Success => 0,
            PipelineResult::Failure { exit_code, .. } => *exit_code,
        }
    }

    pub fn is_success(&self) -> bool {
        matches!(self, PipelineResult::Success)
    }
}

/// An ordered, validated list of stages
#[derive(Debug, Clone)]
pub struct Pipeline {
    stages: Vec<Stage>,
}

impl Pipeline {
    /// Validate and wrap a stage list.
    ///
    /// Rules: names are unique, cleanup stages only appear before any other
    /// stage, and a launch stage can only be the last one.
    pub fn new(stages: Vec<Stage>) -> Result<Self, ConfigError> {
        if stages.is_empty() {
            return Err(ConfigError::InvalidPipeline("no stages".to_string()));
        }

        let mut names = HashSet::new();
        let mut seen_work = false;
        for (index, stage) in stages.iter().enumerate() {
            if !names.insert(stage.name.as_str()) {
                return Err(ConfigError::InvalidPipeline(format!(
                    "duplicate stage name '{}'",
                    stage.name
                )));
            }
            match stage.kind {
                StageKind::Cleanup if seen_work => {
                    return Err(ConfigError::InvalidPipeline(format!(
                        "cleanup stage '{}' must run before dependency installation",
                        stage.name
                    )));
                }
                StageKind::Cleanup => {}
                StageKind::Launch if index + 1 != stages.len() => {
                    return Err(ConfigError::InvalidPipeline(format!(
                        "launch stage '{}' must be the last stage",
                        stage.name
                    )));
                }
                _ => seen_work = true,
            }
        }

        Ok(Self { stages })
    }

    /// Compose the stage list for a profile
    pub fn for_profile(
        profile: Profile,
        runtime: &RuntimeConfig,
        project: &ProjectConfig,
        layout: &ProjectLayout,
        clean: bool,
    ) -> Result<Self, ConfigError> {
        let mut stages = Vec::new();

        if clean || project.cleanup.enabled {
            let bytecode_roots = if project.cleanup.bytecode {
                vec![layout.backend_dir.clone()]
            } else {
                Vec::new()
            };
            stages.push(Stage::clean(
                "cleanup",
                &layout.root,
                CleanSpec {
                    paths: project
                        .cleanup
                        .paths
                        .iter()
                        .map(|p| layout.root.join(p))
                        .collect(),
                    bytecode_roots,
                },
            ));
        }

        stages.push(Stage::command(
            "install-backend",
            StageKind::Install,
            &layout.backend_dir,
            CommandSpec::parse("backend.install", &project.backend.install)?,
        ));

        if profile == Profile::FullStack {
            let client_dir = layout.client_dir.as_ref().ok_or_else(|| {
                ConfigError::MissingDirectory(
                    layout.root.join(&project.layout.client_dir).display().to_string(),
                )
            })?;
            let output = layout
                .frontend_output
                .clone()
                .unwrap_or_else(|| client_dir.join(&project.layout.frontend_output));

            stages.push(Stage::command(
                "install-frontend",
                StageKind::Install,
                client_dir,
                CommandSpec::parse("frontend.install", &project.frontend.install)?,
            ));
            stages.push(Stage::command(
                "build-frontend",
                StageKind::Build,
                client_dir,
                CommandSpec::parse("frontend.build", &project.frontend.build)?,
            ));
            stages.push(Stage::publish(
                "publish-static",
                &layout.root,
                PublishSpec {
                    source: output,
                    target: layout.publish_dir.clone(),
                },
            ));
        }

        stages.push(Stage::launch(
            "launch-backend",
            LaunchSpec::new(runtime, &project.backend, &layout.backend_dir)?,
        ));

        Self::new(stages)
    }

    pub fn stages(&self) -> &[Stage] {
        &self.stages
    }

    /// Run every stage in order, stopping at the first fatal failure
    pub async fn run<R: StageRunner>(&self, runner: &mut R) -> PipelineResult {
        let run_id = Uuid::new_v4();
        self.run_stages(runner)
            .instrument(info_span!("pipeline", %run_id))
            .await
    }

    async fn run_stages<R: StageRunner>(&self, runner: &mut R) -> PipelineResult {
        let total = self.stages.len();
        let started = Instant::now();

        for (index, stage) in self.stages.iter().enumerate() {
            info!(
                stage = %stage.name,
                step = index + 1,
                total,
                kind = ?stage.kind,
                dir = %stage.working_dir.display(),
                action = %stage.describe(),
                "==> Starting stage"
            );
            let stage_started = Instant::now();

            match runner.run(stage).await {
                Ok(()) => {
                    info!(
                        stage = %stage.name,
                        elapsed_ms = stage_started.elapsed().as_millis() as u64,
                        "Stage completed"
                    );
                }
                Err(e) if !stage.fatal => {
                    warn!(stage = %stage.name, error = %e, "Non-fatal stage failed, continuing");
                }
                Err(e) => return self.fail(stage, e),
            }
        }

        info!(
            stages = total,
            elapsed_ms = started.elapsed().as_millis() as u64,
            "Pipeline finished"
        );
        PipelineResult::Success
    }

    fn fail(&self, stage: &Stage, e: StageError) -> PipelineResult {
        let exit_code = e.exit_code();
        if e.is_launch_failure() {
            error!(stage = %stage.name, exit_code, error = %e, "Launch failed, aborting pipeline");
        } else {
            error!(stage = %stage.name, exit_code, error = %e, "Stage failed, aborting pipeline");
        }
        PipelineResult::Failure {
            stage: stage.name.clone(),
            exit_code,
        }
    }
}
