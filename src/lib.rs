pub mod config;
pub mod error;
pub mod net;
pub mod observability;
pub mod patch;
pub mod registry;
pub mod session;
pub mod sim;
pub mod sync;

/// Run the in-process simulation with `settings` and return its report.
pub async fn run(settings: &config::Settings) -> anyhow::Result<sim::SimReport> {
	sim::run(settings).await
}
