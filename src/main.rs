//! Agent Sandbox CLI
//!
//! Provisions, drives and stops sandbox containers for coding agents.

use std::sync::Arc;

use clap::{Parser, Subcommand};
use tokio_util::sync::CancellationToken;

use agent_sandbox::config::agent_spec;
use agent_sandbox::{
    CliRuntime, ContainerProvider, CreationWorkflow, Error, ProvisionOutcome, ProvisionRequest,
    RunCommandRequest, SandboxRegistry, Secret, Settings, TracingTaskLogger,
};

#[derive(Parser)]
#[command(name = "agent-sandbox", about = "Container sandboxes for coding agents", version)]
struct Cli {
    #[command(subcommand)]
    command: Commands,
}

#[derive(Subcommand)]
enum Commands {
    /// Create a sandbox for a task and print the outcome as JSON
    Provision {
        /// Repository to clone
        repo_url: String,

        /// Task identifier
        #[arg(long, default_value = "cli")]
        task_id: String,

        /// Coding agent whose API key is injected
        #[arg(long, default_value = "claude")]
        agent: String,

        /// Working branch to check out or create
        #[arg(long)]
        branch: Option<String>,

        /// Container ports to expose
        #[arg(long = "port")]
        ports: Vec<u16>,

        /// Sandbox lifetime in minutes
        #[arg(long)]
        max_duration: Option<String>,

        #[arg(long)]
        vcpus: Option<u32>,

        /// Skip dependency installation and the dev server
        #[arg(long)]
        skip_install: bool,

        /// Leave the sandbox running after a failed or cancelled run
        #[arg(long)]
        keep_alive: bool,
    },

    /// Run a command in an existing sandbox
    Exec {
        sandbox_id: String,

        /// Working directory inside the container
        #[arg(long)]
        cwd: Option<String>,

        #[arg(last = true, required = true)]
        command: Vec<String>,
    },

    /// Stop a sandbox and remove its volumes
    Stop { sandbox_id: String },
}

#[tokio::main]
async fn main() {
    tracing_subscriber::fmt()
        .with_env_filter(
            tracing_subscriber::EnvFilter::from_default_env()
                .add_directive(tracing::Level::INFO.into()),
        )
        .with_writer(std::io::stderr)
        .init();

    let cli = Cli::parse();

    let settings = match Settings::load() {
        Ok(settings) => Arc::new(settings),
        Err(e) => {
            eprintln!("{}", e);
            std::process::exit(2);
        }
    };

    let runtime = Arc::new(CliRuntime::new(settings.runtime.clone()));
    let provider = ContainerProvider::new(runtime, &settings);

    let code = match cli.command {
        Commands::Provision {
            repo_url,
            task_id,
            agent,
            branch,
            ports,
            max_duration,
            vcpus,
            skip_install,
            keep_alive,
        } => {
            let mut request = ProvisionRequest::new(task_id, repo_url, agent)
                .with_install_dependencies(!skip_install)
                .with_ports(ports)
                .with_keep_alive(keep_alive);
            if let Some(branch) = branch {
                request = request.with_branch_name(branch);
            }
            if let Some(duration) = max_duration {
                request = request.with_max_duration(duration);
            }
            if let Some(vcpus) = vcpus {
                request = request.with_vcpus(vcpus);
            }
            provision(provider, settings, with_env_credentials(request)).await
        }
        Commands::Exec {
            sandbox_id,
            cwd,
            command,
        } => exec(provider, &sandbox_id, cwd, command).await,
        Commands::Stop { sandbox_id } => stop(provider, &sandbox_id).await,
    };

    std::process::exit(code);
}

/// Fills the GitHub token and the agent's API keys from the environment.
fn with_env_credentials(mut request: ProvisionRequest) -> ProvisionRequest {
    let from_env = |name: &str| std::env::var(name).ok().filter(|v| !v.is_empty());

    if let Some(token) = from_env("GITHUB_TOKEN") {
        request = request.with_github_token(Secret::new(token));
    }
    if let Some(spec) = agent_spec(&request.agent) {
        for name in spec.credentials.iter().copied() {
            if let Some(value) = from_env(name) {
                request = request.with_api_key(name, Secret::new(value));
            }
        }
    }
    request
}

async fn provision(
    provider: ContainerProvider,
    settings: Arc<Settings>,
    request: ProvisionRequest,
) -> i32 {
    let registry = Arc::new(SandboxRegistry::new(provider));
    let logger = Arc::new(TracingTaskLogger::new(request.task_id.clone()));
    let cancel = CancellationToken::new();

    let ctrl_c = cancel.clone();
    tokio::spawn(async move {
        if tokio::signal::ctrl_c().await.is_ok() {
            tracing::info!("interrupt received, cancelling at next checkpoint");
            ctrl_c.cancel();
        }
    });

    let task_id = request.task_id.clone();
    let keep_alive = request.keep_alive;
    let workflow = CreationWorkflow::new(registry.clone(), settings, logger)
        .with_cancellation(cancel)
        .with_progress(Arc::new(|percent: u8, message: &str| {
            tracing::info!(percent, "{}", message);
        }));

    let outcome = workflow.run(request).await;

    if !outcome.is_ready() && !keep_alive {
        if let Err(e) = registry.stop(&task_id).await {
            tracing::warn!(task_id = %task_id, error = %e, "failed to clean up sandbox");
        }
    }

    match serde_json::to_string_pretty(&outcome.report()) {
        Ok(json) => println!("{}", json),
        Err(e) => eprintln!("cannot serialize outcome: {}", e),
    }

    match outcome {
        ProvisionOutcome::Ready { .. } => 0,
        ProvisionOutcome::Cancelled => 130,
        ProvisionOutcome::Failed { .. } => 1,
    }
}

async fn exec(
    provider: ContainerProvider,
    sandbox_id: &str,
    cwd: Option<String>,
    command: Vec<String>,
) -> i32 {
    let sandbox = match provider.get(sandbox_id).await {
        Ok(sandbox) => sandbox,
        Err(e) => {
            eprintln!("{}", e);
            return 1;
        }
    };

    let Some((program, args)) = command.split_first() else {
        eprintln!("no command given");
        return 2;
    };
    let mut request = RunCommandRequest::new(program.as_str()).args(args.iter().cloned());
    if let Some(cwd) = cwd {
        request = request.cwd(cwd);
    }

    match sandbox.run_command(request).await {
        Ok(output) => {
            print!("{}", output.stdout());
            eprint!("{}", output.stderr());
            output.exit_code()
        }
        Err(e) => {
            eprintln!("{}", e);
            1
        }
    }
}

async fn stop(provider: ContainerProvider, sandbox_id: &str) -> i32 {
    match provider.get(sandbox_id).await {
        Ok(sandbox) => match sandbox.stop().await {
            Ok(()) => {
                println!("stopped {}", sandbox_id);
                0
            }
            Err(e) => {
                eprintln!("{}", e);
                1
            }
        },
        Err(Error::NotFound(_)) => {
            eprintln!("sandbox {} not found (already expired?)", sandbox_id);
            1
        }
        Err(e) => {
            eprintln!("{}", e);
            1
        }
    }
}
