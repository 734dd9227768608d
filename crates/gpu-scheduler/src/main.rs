use anyhow::Result;
use clap::Parser;
use gpu_scheduler::app;
use gpu_scheduler::config::AgentArgs;
use gpu_scheduler::config::Cli;
use gpu_scheduler::config::Commands;
use gpu_scheduler::config::ServerArgs;
use gpu_scheduler::k8s::crd_manifests;
use utils::logging;
use utils::version;

/// Sets up global panic hooks.
fn setup_global_hooks() {
    let default_hook = std::panic::take_hook();
    std::panic::set_hook(Box::new(move |panic_info| {
        default_hook(panic_info);
        tracing::error!("Thread panicked: {}", panic_info);
    }));
}

#[tokio::main]
async fn main() -> Result<()> {
    setup_global_hooks();

    let cli = Cli::parse();

    match cli.command {
        Commands::Agent(agent_args) => run_agent(*agent_args).await,
        Commands::Server(server_args) => run_server(*server_args).await,
        Commands::Crd => {
            print!("{}", crd_manifests()?);
            Ok(())
        }
    }
}

async fn run_agent(agent_args: AgentArgs) -> Result<()> {
    logging::init();
    tracing::info!("Starting gpu-scheduler agent {}", &**version::VERSION);

    app::agent::run(agent_args).await
}

async fn run_server(server_args: ServerArgs) -> Result<()> {
    let _guard = match &server_args.decision_log_file {
        Some(path) => Some(logging::init_with_side_log(path)?),
        None => {
            logging::init();
            None
        }
    };
    tracing::info!("Starting gpu-scheduler server {}", &**version::VERSION);

    app::server::run(server_args).await
}
