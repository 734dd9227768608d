use clap::Parser;
use clap::Subcommand;
use utils::version;

use crate::config::agent::AgentArgs;
use crate::config::server::ServerArgs;

#[derive(Parser)]
#[command(about, long_about, version = &**version::VERSION)]
pub struct Cli {
    #[command(subcommand)]
    pub command: Commands,
}

#[derive(Subcommand)]
pub enum Commands {
    /// Run the node agent reporting devices, allocations and liveness
    Agent(Box<AgentArgs>),
    /// Run the central scheduler extender
    Server(Box<ServerArgs>),
    /// Print the custom resource definitions as YAML
    Crd,
}
