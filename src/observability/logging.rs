use fern::colors::{Color, ColoredLevelConfig};
use log::Level;

/// Initialize human-readable logging to stderr at the given level.
///
/// Every line carries a millisecond timestamp, the level and the emitting
/// module so replication traces from host and clients interleave legibly.
/// Calling this more than once is an error from `log`, which callers in tests
/// are free to ignore.
pub fn init_logging(level: Level) -> anyhow::Result<()> {
	let colors = ColoredLevelConfig::new()
		.error(Color::Red)
		.warn(Color::Yellow)
		.info(Color::Green)
		.debug(Color::Cyan)
		.trace(Color::BrightBlack);

	fern::Dispatch::new()
		.format(move |out, message, record| {
			out.finish(format_args!(
				"{} {:5} [{}] {}",
				chrono::Local::now().format("%Y-%m-%dT%H:%M:%S%.3f"),
				colors.color(record.level()),
				record.target(),
				message
			))
		})
		.level(level.to_level_filter())
		.chain(std::io::stderr())
		.apply()
		.map_err(|e| anyhow::anyhow!("Failed to initialize logging: {}", e))?;

	Ok(())
}
