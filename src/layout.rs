//! Project directory resolution
//!
//! The orchestrator may be started from anywhere. Every directory a stage
//! runs in is resolved against the project root, with explicit fallbacks
//! instead of ad-hoc existence checks scattered through the stages.

use crate::config::ProjectConfig;
use std::path::{Path, PathBuf};
use tracing::debug;

/// Entries that mark a directory as a project checkout
const ROOT_MARKERS: [&str; 3] = ["server", "client", "stagehand.toml"];

fn first_existing<P: AsRef<Path>>(candidates: &[P]) -> Option<&Path> {
    candidates
        .iter()
        .map(|p| p.as_ref())
        .find(|p: &&Path| p.exists())
}

/// Return the first candidate that exists, or `default` if none does
pub fn resolve_path<P: AsRef<Path>>(candidates: &[P], default: &Path) -> PathBuf {
    first_existing(candidates)
        .map(Path::to_path_buf)
        .unwrap_or_else(|| default.to_path_buf())
}

/// Whether `path` is a directory with at least one entry
pub fn dir_has_entries(path: &Path) -> bool {
    std::fs::read_dir(path)
        .map(|mut entries| entries.next().is_some())
        .unwrap_or(false)
}

fn looks_like_checkout(dir: &Path) -> bool {
    let markers: Vec<PathBuf> = ROOT_MARKERS.iter().map(|m| dir.join(m)).collect();
    first_existing(&markers).is_some()
}

/// Pick the project root.
///
/// An explicit `--root` wins, then the directory holding an explicit project
/// file. Otherwise the directory the orchestrator is installed in is used
/// when it holds a checkout, so it can be started from anywhere. The current
/// directory is the fallback.
pub fn resolve_root(
    explicit: Option<&Path>,
    config_file: Option<&Path>,
    install_dir: Option<&Path>,
    cwd: &Path,
) -> PathBuf {
    let absolutize = |p: &Path| {
        if p.is_absolute() {
            p.to_path_buf()
        } else {
            cwd.join(p)
        }
    };

    if let Some(root) = explicit {
        return absolutize(root);
    }
    if let Some(parent) = config_file
        .map(absolutize)
        .and_then(|file| file.parent().map(Path::to_path_buf))
    {
        return parent;
    }
    if let Some(dir) = install_dir.filter(|dir| looks_like_checkout(dir)) {
        debug!(root = %dir.display(), "Using the orchestrator's own directory as root");
        return dir.to_path_buf();
    }
    debug!(root = %cwd.display(), "No checkout next to the orchestrator, using current directory");
    cwd.to_path_buf()
}

/// Resolved directories for one run
#[derive(Debug, Clone, PartialEq, Eq)]
pub struct ProjectLayout {
    pub root: PathBuf,
    /// Where the backend's dependency manifest and entry point live
    pub backend_dir: PathBuf,
    /// Frontend sources, if the checkout has them
    pub client_dir: Option<PathBuf>,
    /// Where the frontend build tool writes its output
    pub frontend_output: Option<PathBuf>,
    /// Where the router serves static assets from, when different from the
    /// build output
    pub publish_dir: Option<PathBuf>,
}

impl ProjectLayout {
    pub fn discover(root: &Path, project: &ProjectConfig) -> Self {
        let candidates: Vec<PathBuf> = project
            .layout
            .backend_dirs
            .iter()
            .map(|dir| root.join(dir))
            .collect();
        let backend_dir = resolve_path(&candidates, root);

        let client = root.join(&project.layout.client_dir);
        let client_dir = client.is_dir().then_some(client);
        let frontend_output = client_dir
            .as_ref()
            .map(|dir| dir.join(&project.layout.frontend_output));
        let publish_dir = project.layout.publish_dir.as_ref().map(|dir| root.join(dir));

        debug!(
            root = %root.display(),
            backend_dir = %backend_dir.display(),
            client_dir = ?client_dir,
            "Project layout resolved"
        );

        Self {
            root: root.to_path_buf(),
            backend_dir,
            client_dir,
            frontend_output,
            publish_dir,
        }
    }

    /// Directory the reverse proxy serves, once the frontend has been built
    pub fn static_dir(&self) -> Option<&Path> {
        self.publish_dir
            .as_deref()
            .or(self.frontend_output.as_deref())
    }
}
