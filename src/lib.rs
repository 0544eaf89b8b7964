//! Stagehand - a fail-fast startup orchestrator for a two-tier web app
//!
//! This library provides the pieces a container entrypoint needs to:
//! - Resolve the runtime contract (`PORT`, `HOST`, `WORKERS`, `TIMEOUT`,
//!   `MAX_REQUESTS`) from the environment with per-hosting defaults
//! - Run install, build and publish stages in order, aborting on the first
//!   failure with that stage's exit code
//! - Hand control to the backend server, either by replacing the process or
//!   by supervising it and relaying termination signals
//! - Describe the health gate and reverse proxy routes the platform applies
//!   afterwards, and render matching service definitions

pub mod app;
pub mod config;
pub mod error;
pub mod health;
pub mod layout;
pub mod manifest;
pub mod pipeline;
pub mod router;
pub mod runner;
pub mod stage;
pub mod supervisor;

/// Package name for logging
pub const PKG_NAME: &str = env!("CARGO_PKG_NAME");

/// Package version
pub const VERSION: &str = env!("CARGO_PKG_VERSION");
