//! Stage definitions and the built-in filesystem actions
//!
//! A stage is either an external command (install, build), a built-in action
//! (cleanup, publish) or the final backend launch. Every stage is fatal: the
//! pipeline stops at the first one that fails.

use crate::error::{ConfigError, StageError};
use crate::layout::dir_has_entries;
use crate::supervisor::LaunchSpec;
use serde::Serialize;
use std::collections::BTreeMap;
use std::ffi::OsStr;
use std::fs;
use std::io;
use std::path::{Path, PathBuf};
use tracing::{debug, info};

/// Directory names never descended into while purging bytecode
const SKIPPED_DIRS: &[&str] = &["node_modules", ".git"];

/// What a stage does, used for ordering rules and log output
#[derive(Debug, Clone, Copy, PartialEq, Eq, Serialize)]
#[serde(rename_all = "lowercase")]
pub enum StageKind {
    Cleanup,
    Install,
    Build,
    Publish,
    Launch,
}

/// An external program with arguments and extra environment
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CommandSpec {
    pub program: String,
    pub args: Vec<String>,
    /// Added on top of the inherited environment
    pub env: BTreeMap<String, String>,
}

impl CommandSpec {
    pub fn new(program: impl Into<String>) -> Self {
        Self {
            program: program.into(),
            args: Vec::new(),
            env: BTreeMap::new(),
        }
    }

    /// Split a shell-style command line (quotes respected, no expansion)
    pub fn parse(field: &str, line: &str) -> Result<Self, ConfigError> {
        let mut words = shell_words::split(line)
            .map_err(|e| ConfigError::InvalidCommand {
                field: field.to_string(),
                reason: e.to_string(),
            })?
            .into_iter();
        let program = words.next().ok_or_else(|| ConfigError::InvalidCommand {
            field: field.to_string(),
            reason: "command is empty".to_string(),
        })?;
        Ok(Self::new(program).args(words))
    }

    pub fn arg(mut self, arg: impl Into<String>) -> Self {
        self.args.push(arg.into());
        self
    }

    pub fn args<I, S>(mut self, args: I) -> Self
    where
        I: IntoIterator<Item = S>,
        S: Into<String>,
    {
        self.args.extend(args.into_iter().map(Into::into));
        self
    }

    pub fn env(mut self, key: impl Into<String>, value: impl Into<String>) -> Self {
        self.env.insert(key.into(), value.into());
        self
    }

    /// Quoted command line, for logs and plan output
    pub fn display(&self) -> String {
        shell_words::join(std::iter::once(&self.program).chain(&self.args))
    }
}

/// Files removed by a cleanup stage
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct CleanSpec {
    /// Removed outright (files or whole directory trees)
    pub paths: Vec<PathBuf>,
    /// Trees searched for `__pycache__` directories and `.pyc`/`.pyo` files
    pub bytecode_roots: Vec<PathBuf>,
}

/// What a cleanup run actually removed
#[derive(Debug, Clone, Copy, Default, PartialEq, Eq)]
pub struct CleanReport {
    pub paths_removed: usize,
    pub bytecode_removed: usize,
}

impl CleanSpec {
    /// Remove every listed path and bytecode file. Missing paths are not an
    /// error, so running this twice leaves the same tree as running it once.
    pub fn apply(&self) -> io::Result<CleanReport> {
        let mut report = CleanReport::default();

        for path in &self.paths {
            if remove_path(path)? {
                debug!(path = %path.display(), "Removed");
                report.paths_removed += 1;
            }
        }

        for root in &self.bytecode_roots {
            report.bytecode_removed += purge_bytecode(root)?;
        }

        Ok(report)
    }
}

/// Remove a file or directory tree. Returns whether anything was there.
fn remove_path(path: &Path) -> io::Result<bool> {
    let metadata = match fs::symlink_metadata(path) {
        Ok(m) => m,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(false),
        Err(e) => return Err(e),
    };

    let result = if metadata.is_dir() {
        fs::remove_dir_all(path)
    } else {
        fs::remove_file(path)
    };

    match result {
        Ok(()) => Ok(true),
        Err(e) if e.kind() == io::ErrorKind::NotFound => Ok(false),
        Err(e) => Err(e),
    }
}

fn purge_bytecode(dir: &Path) -> io::Result<usize> {
    let entries = match fs::read_dir(dir) {
        Ok(entries) => entries,
        Err(e) if e.kind() == io::ErrorKind::NotFound => return Ok(0),
        Err(e) => return Err(e),
    };

    let mut removed = 0;
    for entry in entries {
        let entry = entry?;
        let path = entry.path();
        let file_type = entry.file_type()?;
        let name = entry.file_name();

        if file_type.is_dir() {
            if name == "__pycache__" {
                if remove_path(&path)? {
                    removed += 1;
                }
            } else if !SKIPPED_DIRS.iter().any(|skip| name == *skip) {
                removed += purge_bytecode(&path)?;
            }
        } else if file_type.is_file() && is_bytecode(&path) && remove_path(&path)? {
            removed += 1;
        }
    }
    Ok(removed)
}

fn is_bytecode(path: &Path) -> bool {
    matches!(
        path.extension().and_then(OsStr::to_str),
        Some("pyc") | Some("pyo")
    )
}

/// Verifies the frontend build output and optionally swaps it into the
/// directory the router serves
#[derive(Debug, Clone, PartialEq, Eq, Serialize)]
pub struct PublishSpec {
    /// Build tool output
    pub source: PathBuf,
    /// Served directory; `None` serves `source` in place
    pub target: Option<PathBuf>,
}

impl PublishSpec {
    /// Returns the directory the router should serve.
    ///
    /// The new tree is copied next to the target first and then renamed into
    /// place, so the target is never observed half-written.
    pub fn apply(&self) -> Result<PathBuf, StageError> {
        if !dir_has_entries(&self.source) {
            return Err(StageError::Action(format!(
                "build output {} is missing or empty",
                self.source.display()
            )));
        }

        let target = match &self.target {
            Some(target) if target != &self.source => target,
            _ => return Ok(self.source.clone()),
        };

        self.swap_into(target).map_err(|e| {
            StageError::Action(format!(
                "failed to publish {} to {}: {}",
                self.source.display(),
                target.display(),
                e
            ))
        })?;

        info!(
            source = %self.source.display(),
            target = %target.display(),
            "Static assets published"
        );
        Ok(target.clone())
    }

    fn swap_into(&self, target: &Path) -> io::Result<()> {
        let incoming = sibling(target, "incoming");
        let previous = sibling(target, "previous");

        if let Some(parent) = target.parent() {
            fs::create_dir_all(parent)?;
        }
        remove_path(&incoming)?;
        remove_path(&previous)?;

        copy_tree(&self.source, &incoming)?;
        if fs::symlink_metadata(target).is_ok() {
            fs::rename(target, &previous)?;
        }
        fs::rename(&incoming, target)?;
        remove_path(&previous)?;
        Ok(())
    }
}

fn sibling(path: &Path, suffix: &str) -> PathBuf {
    let name = path
        .file_name()
        .map(|n| n.to_string_lossy().into_owned())
        .unwrap_or_default();
    path.with_file_name(format!(".{}.{}", name, suffix))
}

fn copy_tree(from: &Path, to: &Path) -> io::Result<()> {
    fs::create_dir_all(to)?;
    for entry in fs::read_dir(from)? {
        let entry = entry?;
        let dest = to.join(entry.file_name());
        if entry.file_type()?.is_dir() {
            copy_tree(&entry.path(), &dest)?;
        } else {
            fs::copy(entry.path(), &dest)?;
        }
    }
    Ok(())
}

#[derive(Debug, Clone)]
pub enum StageAction {
    Command(CommandSpec),
    Clean(CleanSpec),
    Publish(PublishSpec),
    Launch(LaunchSpec),
}

/// A named, ordered unit of orchestration work
#[derive(Debug, Clone)]
pub struct Stage {
    pub name: String,
    pub kind: StageKind,
    pub working_dir: PathBuf,
    pub action: StageAction,
    /// A failing fatal stage aborts the pipeline. Every stage built by this
    /// crate is fatal.
    pub fatal: bool,
}

/// Serializable summary of a stage, for `plan` output
#[derive(Debug, Clone, Serialize)]
pub struct StagePlan {
    pub name: String,
    pub kind: StageKind,
    pub working_dir: PathBuf,
    pub action: String,
}

impl Stage {
    fn new(
        name: impl Into<String>,
        kind: StageKind,
        working_dir: PathBuf,
        action: StageAction,
    ) -> Self {
        Self {
            name: name.into(),
            kind,
            working_dir,
            action,
            fatal: true,
        }
    }

    pub fn command(
        name: impl Into<String>,
        kind: StageKind,
        working_dir: impl Into<PathBuf>,
        spec: CommandSpec,
    ) -> Self {
        Self::new(name, kind, working_dir.into(), StageAction::Command(spec))
    }

    pub fn clean(
        name: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        spec: CleanSpec,
    ) -> Self {
        Self::new(name, StageKind::Cleanup, working_dir.into(), StageAction::Clean(spec))
    }

    pub fn publish(
        name: impl Into<String>,
        working_dir: impl Into<PathBuf>,
        spec: PublishSpec,
    ) -> Self {
        Self::new(name, StageKind::Publish, working_dir.into(), StageAction::Publish(spec))
    }

    pub fn launch(name: impl Into<String>, spec: LaunchSpec) -> Self {
        let working_dir = spec.working_dir.clone();
        Self::new(name, StageKind::Launch, working_dir, StageAction::Launch(spec))
    }

    /// One-line description of what the stage will do
    pub fn describe(&self) -> String {
        match &self.action {
            StageAction::Command(spec) => spec.display(),
            StageAction::Clean(spec) => {
                let mut text = format!("remove {} path(s)", spec.paths.len());
                if !spec.bytecode_roots.is_empty() {
                    text.push_str(", purge Python bytecode");
                }
                text
            }
            StageAction::Publish(spec) => match &spec.target {
                Some(target) => format!(
                    "verify {} and publish to {}",
                    spec.source.display(),
                    target.display()
                ),
                None => format!("verify {}", spec.source.display()),
            },
            StageAction::Launch(spec) => spec.command().display(),
        }
    }

    pub fn plan(&self) -> StagePlan {
        StagePlan {
            name: self.name.clone(),
            kind: self.kind,
            working_dir: self.working_dir.clone(),
            action: self.describe(),
        }
    }
}
