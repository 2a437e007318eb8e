use std::path::PathBuf;

use anyhow::Context;
use clap::Parser;
use superx::{Gateway, RawConfig};
use tracing::info;

#[derive(Parser)]
#[command(name = "superx", version, about = "Agentic gateway for A2A and MCP agents")]
struct Args {
	/// Path to a YAML config file.
	#[arg(short, long)]
	config: Option<PathBuf>,
	/// Listen address, overriding the config file.
	#[arg(long)]
	bind: Option<String>,
}

fn main() -> anyhow::Result<()> {
	let args = Args::parse();
	let raw = match &args.config {
		Some(path) => {
			let contents = fs_err::read_to_string(path)
				.with_context(|| format!("reading config {}", path.display()))?;
			RawConfig::from_yaml(&contents).context("parsing config")?
		},
		None => RawConfig::default(),
	};
	let mut config = raw.build().context("building config")?;
	if let Some(bind) = args.bind {
		config.bind = bind.parse().context("parsing --bind")?;
	}
	superx::telemetry::setup(&config.logging);

	tokio::runtime::Builder::new_multi_thread()
		.enable_all()
		.build()?
		.block_on(run(config))
}

async fn run(config: superx::Config) -> anyhow::Result<()> {
	let bind = config.bind;
	let gateway = Gateway::new(config)?;
	let listener = tokio::net::TcpListener::bind(bind)
		.await
		.with_context(|| format!("binding {bind}"))?;
	info!("superx listening on {bind}");
	axum::serve(listener, gateway.router())
		.with_graceful_shutdown(shutdown_signal())
		.await?;
	Ok(())
}

async fn shutdown_signal() {
	let _ = tokio::signal::ctrl_c().await;
	info!("shutting down");
}
