use anyhow::Context;
use clap::{Args, Parser, Subcommand};
use stagehand::app::{DeployOptions, Deployment};
use stagehand::config::{EnvMap, HandoffMode, Hosting};
use stagehand::error::{ConfigError, EXIT_FAILURE};
use stagehand::health::{HealthCheckSpec, HealthProbe};
use stagehand::manifest::ManifestFormat;
use stagehand::pipeline::Profile;
use stagehand::runner::spawn_signal_listener;
use stagehand::{PKG_NAME, VERSION};
use std::path::{Path, PathBuf};
use std::process::ExitCode;
use std::time::Duration;
use tracing::{error, info};

/// Stagehand - install, build and hand off to a web backend, failing fast.
#[derive(Parser, Debug)]
#[command(name = "stagehand")]
#[command(version, about, long_about = None)]
struct Cli {
    #[command(flatten)]
    deploy: DeployArgs,

    /// Defaults to `run`
    #[command(subcommand)]
    command: Option<Commands>,
}

#[derive(Subcommand, Debug)]
enum Commands {
    /// Run every stage, then hand off to the backend server
    Run,

    /// Print the stages that would run, without running them
    Plan {
        /// Emit JSON instead of text
        #[arg(long)]
        json: bool,
    },

    /// Check the backend's health endpoint
    Probe {
        /// Poll until healthy or the start period runs out
        #[arg(long)]
        wait: bool,
    },

    /// Print a service definition derived from the current configuration
    Manifest {
        #[arg(value_enum)]
        format: ManifestFormat,

        /// Service name
        #[arg(long, default_value = "web")]
        name: String,

        /// Port the nginx server block listens on
        #[arg(long, default_value_t = 80)]
        listen: u16,
    },
}

/// Options shared by every subcommand
#[derive(Args, Debug)]
struct DeployArgs {
    /// Which stages to run
    #[arg(long, value_enum, default_value_t = Profile::BackendOnly, global = true)]
    profile: Profile,

    /// Hosting environment, selects worker and recycling defaults
    #[arg(long, value_enum, default_value_t = Hosting::Constrained, global = true)]
    hosting: Hosting,

    /// Project root (defaults to the project file's directory, then the
    /// binary's own directory if it holds a checkout, then the current
    /// directory)
    #[arg(long, global = true)]
    root: Option<PathBuf>,

    /// Path to the project file (defaults to `<root>/stagehand.toml`)
    #[arg(long, global = true)]
    config: Option<PathBuf>,

    /// Remove caches and build leftovers before installing
    #[arg(long, global = true)]
    clean: bool,

    /// How control passes to the backend
    #[arg(long, value_enum, global = true)]
    handoff: Option<HandoffMode>,

    /// Debug logging
    #[arg(short, long, global = true)]
    verbose: bool,
}

impl DeployArgs {
    fn options(&self) -> DeployOptions {
        DeployOptions {
            profile: self.profile,
            hosting: self.hosting,
            root: self.root.clone(),
            config: self.config.clone(),
            clean: self.clean,
            handoff: self.handoff,
            install_dir: std::env::current_exe()
                .ok()
                .and_then(|exe| exe.parent().map(Path::to_path_buf)),
        }
    }
}

#[tokio::main]
async fn main() -> ExitCode {
    let cli = Cli::parse();

    // Logs go to stderr so `plan` and `manifest` output stays machine-readable
    let directive = if cli.deploy.verbose {
        "stagehand=debug"
    } else {
        "stagehand=info"
    };
    tracing_subscriber::fmt()
        .with_writer(std::io::stderr)
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(directive.parse().expect("valid log directive")),
        )
        .init();

    let code = match execute(cli).await {
        Ok(code) => code,
        Err(e) => {
            let code = e
                .downcast_ref::<ConfigError>()
                .map(ConfigError::exit_code)
                .unwrap_or(EXIT_FAILURE);
            error!(error = %format!("{:#}", e), exit_code = code, "Aborting");
            code
        }
    };

    ExitCode::from(u8::try_from(code).unwrap_or(EXIT_FAILURE as u8))
}

async fn execute(cli: Cli) -> anyhow::Result<i32> {
    // The environment is read exactly once; everything downstream gets this map
    let env: EnvMap = std::env::vars().collect();
    let cwd = std::env::current_dir().context("failed to read the current directory")?;
    let deployment = Deployment::resolve(&cli.deploy.options(), &env, &cwd)?;

    match cli.command.unwrap_or(Commands::Run) {
        Commands::Run => run(&deployment).await,
        Commands::Plan { json } => plan(&deployment, json),
        Commands::Probe { wait } => probe(&deployment, wait).await,
        Commands::Manifest {
            format,
            name,
            listen,
        } => manifest(&deployment, format, &name, listen),
    }
}

async fn run(deployment: &Deployment) -> anyhow::Result<i32> {
    let pipeline = deployment.pipeline()?;
    info!(
        name = PKG_NAME,
        version = VERSION,
        stages = pipeline.stages().len(),
        handoff = ?deployment.handoff,
        "Starting deployment"
    );

    let shutdown = spawn_signal_listener().context("failed to install signal handlers")?;
    let mut runner = deployment.runner(shutdown);
    Ok(pipeline.run(&mut runner).await.exit_code())
}

fn plan(deployment: &Deployment, json: bool) -> anyhow::Result<i32> {
    let pipeline = deployment.pipeline()?;
    let stages: Vec<_> = pipeline.stages().iter().map(|s| s.plan()).collect();

    if json {
        let doc = serde_json::json!({
            "profile": deployment.profile,
            "hosting": deployment.hosting,
            "runtime": deployment.runtime,
            "stages": stages,
        });
        println!("{}", serde_json::to_string_pretty(&doc)?);
        return Ok(0);
    }

    let runtime = &deployment.runtime;
    println!(
        "profile {} / hosting {} / bind {} / workers {} / timeout {}s / max requests {}",
        deployment.profile.as_str(),
        deployment.hosting.as_str(),
        runtime.bind_addr(),
        runtime.worker_count,
        runtime.request_timeout_secs,
        runtime
            .max_requests_per_worker
            .map(|n| n.to_string())
            .unwrap_or_else(|| "unlimited".to_string()),
    );
    for (index, stage) in stages.iter().enumerate() {
        println!(
            "{:>2}. {} ({:?}) in {}",
            index + 1,
            stage.name,
            stage.kind,
            stage.working_dir.display()
        );
        println!("      {}", stage.action);
    }
    Ok(0)
}

async fn probe(deployment: &Deployment, wait: bool) -> anyhow::Result<i32> {
    let probe = HealthProbe::new(HealthCheckSpec::default());
    let host = &deployment.runtime.host;
    let port = deployment.runtime.port;

    let result = if wait {
        probe.await_ready(host, port, Duration::from_secs(1)).await
    } else {
        probe.check(host, port).await
    };

    match result {
        Ok(status) => {
            info!(port, status, path = %probe.spec().path, "Backend healthy");
            Ok(0)
        }
        Err(e) => {
            error!(port, error = %e, path = %probe.spec().path, "Backend unhealthy");
            Ok(EXIT_FAILURE)
        }
    }
}

fn manifest(
    deployment: &Deployment,
    format: ManifestFormat,
    name: &str,
    listen: u16,
) -> anyhow::Result<i32> {
    let health = HealthCheckSpec::default();
    let definition = deployment.service_definition(name, &health);

    let output = match format {
        ManifestFormat::Compose => serde_json::to_string_pretty(&definition.compose())?,
        ManifestFormat::Render => serde_json::to_string_pretty(&definition.render())?,
        ManifestFormat::Nginx => deployment.route_table().render_nginx(listen),
    };
    println!("{}", output.trim_end());
    Ok(0)
}
