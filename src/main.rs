use std::path::PathBuf;

use anyhow::Context;
use clap::{Parser, Subcommand};
use vanopticon_bifrost::{config, observability, run};

#[derive(Parser)]
#[command(name = "bifrost", about = "Bifrost - host-authoritative object replication")]
struct Cli {
	/// Extra JSON config file layered over the system and user files
	#[arg(long, global = true, env = "BFR_CONFIG")]
	config: Option<PathBuf>,
	#[command(subcommand)]
	command: Option<Commands>,
}

#[derive(Subcommand)]
enum Commands {
	/// Run a host and simulated peers in-process and check convergence (default)
	Simulate {
		/// Number of simulated peers
		#[arg(long)]
		peers: Option<usize>,
		/// Chat messages each peer sends
		#[arg(long)]
		messages: Option<usize>,
		/// Probability that a host-to-peer frame is lost
		#[arg(long)]
		drop_rate: Option<f64>,
		/// Seed for frame loss
		#[arg(long)]
		seed: Option<u64>,
		/// Print the Prometheus metrics of host and clients afterwards
		#[arg(long)]
		metrics: bool,
	},
	/// Print the effective configuration as JSON
	Config,
}

#[tokio::main]
async fn main() -> anyhow::Result<()> {
	let cli = Cli::parse();

	let mut settings = config::load_from(cli.config.as_deref()).context("failed to load config")?;

	match cli.command.unwrap_or(Commands::Simulate {
		peers: None,
		messages: None,
		drop_rate: None,
		seed: None,
		metrics: false,
	}) {
		Commands::Simulate {
			peers,
			messages,
			drop_rate,
			seed,
			metrics,
		} => {
			observability::init_logging(settings.log_level)?;
			if let Some(peers) = peers {
				settings.sim.peers = peers;
			}
			if let Some(messages) = messages {
				settings.sim.messages = messages;
			}
			if let Some(rate) = drop_rate {
				settings.sim.drop_rate = rate;
			}
			if let Some(seed) = seed {
				settings.sim.seed = seed;
			}

			let report = run(&settings).await?;
			println!("{}", serde_json::to_string_pretty(&report)?);
			if metrics {
				println!("{}", report.host_metrics);
				println!("{}", report.client_metrics);
			}
			if !report.converged {
				anyhow::bail!("peers diverged from the host: {}", report.diverged.join(", "));
			}
		}
		Commands::Config => {
			println!("{}", serde_json::to_string_pretty(&settings)?);
		}
	}
	Ok(())
}
