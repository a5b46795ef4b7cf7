use anyhow::Context;
use clap::{ArgAction, Parser};
use log::*;
use std::path::PathBuf;
use std::sync::Arc;

use simnet_core::{Network, NetworkSummary, ShellExecutor, SimnetConfig, TopologyDriver};
use simnet_util::{env_var, observability, APP_NAME};

#[derive(Parser, Debug)]
#[clap(author, version, about, long_about = None)]
struct Cli {
    #[clap(
        short = 'f',
        long,
        help = "config file (TOML), defaults to $SIMNET_CONFIG",
        value_parser
    )]
    config: Option<PathBuf>,

    #[clap(short, long, action = ArgAction::Count, help = "more logging, repeat for more")]
    verbose: u8,

    #[clap(long, help = "also write simnet.log to this directory", value_parser)]
    log_dir: Option<PathBuf>,

    #[clap(long, help = "chain network", value_parser = parse_network)]
    network: Option<Network>,

    #[clap(long, help = "where to write the credential document", value_parser)]
    credentials: Option<PathBuf>,

    #[clap(long, help = "start a gatekeeper in front of each node")]
    gatekeepers: bool,

    #[clap(long, help = "start a monitoring stack for each node")]
    monitors: bool,
}

fn parse_network(s: &str) -> Result<Network, String> {
    s.parse().map_err(|e: simnet_core::Error| e.to_string())
}

impl Cli {
    fn load_config(&self) -> anyhow::Result<SimnetConfig> {
        let path = self.config.clone().or_else(env_var::config_path);
        let mut config = match &path {
            Some(path) => SimnetConfig::load(path)
                .with_context(|| format!("loading config {}", path.display()))?,
            None => SimnetConfig::default(),
        };
        if let Some(program) = env_var::compose_program() {
            config.exec.compose_program = program;
        }
        if let Some(network) = self.network {
            config.network = network;
        }
        if let Some(credentials) = &self.credentials {
            config.credentials.output = credentials.clone();
        }
        config.sidecars.gatekeepers |= self.gatekeepers;
        config.sidecars.monitors |= self.monitors;
        config.validate()?;
        config.exec.resolve_passthrough();
        Ok(config)
    }
}

async fn run(config: SimnetConfig) -> simnet_core::Result<NetworkSummary> {
    let driver = TopologyDriver::new(config, Arc::new(ShellExecutor))?;
    driver.bootstrap().await
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
    let cli = Cli::parse();
    let _guard =
        observability::init_tracing_subscriber(cli.log_dir.as_ref(), APP_NAME, cli.verbose)
            .map_err(|e| anyhow::anyhow!("logging: {}", e))?;

    let config = cli.load_config()?;
    match run(config).await {
        Ok(summary) => {
            println!("{}", serde_json::to_string_pretty(&summary)?);
            Ok(())
        }
        Err(e) => {
            error!("bootstrap failed: {}", e);
            eprintln!("{}", e.diagnostic());
            std::process::exit(1);
        }
    }
}
