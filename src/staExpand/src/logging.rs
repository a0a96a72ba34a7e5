
use std::fs::{self, OpenOptions};
use std::ops::Deref;
use std::path::Path;
use std::sync::Mutex;

use anyhow::{Context, Result};
use display_error_chain::ErrorChainExt;
use time::format_description::FormatItem;
use time::macros::format_description;
use time::UtcOffset;
use tracing::{error, warn, Subscriber};
use tracing::dispatcher::DefaultGuard;
use tracing_subscriber::{EnvFilter, FmtSubscriber};
use tracing_subscriber::fmt::format::{Format, Full};
use tracing_subscriber::fmt::time::OffsetTime;
use tracing_subscriber::fmt::writer::MakeWriterExt;


type EventFormat = Format<Full,OffsetTime<&'static [FormatItem<'static>]>>;


/// Logs to stderr only
pub fn init(filter: impl AsRef<str>) -> Result<()> {
	let subscriber = FmtSubscriber::builder()
		.with_env_filter(parse_filter(filter)?)
		.event_format(event_format())
		.finish();
	install(subscriber)
}


/// Logs to stderr and appends every event to the job log too.
/// All the worker processes of a batch share one job log.
pub fn init_job(filter: impl AsRef<str>, log_file: impl AsRef<Path>) -> Result<()> {

	let log_file = log_file.as_ref();
	if let Some(dir) = log_file.parent().filter(|dir| !dir.as_os_str().is_empty()) {
		fs::create_dir_all(dir)
			.context(format!("Failed to create job log folder: {}", dir.to_string_lossy()))?;
	}
	let file = OpenOptions::new()
		.create(true)
		.append(true)
		.open(log_file)
		.context(format!("Failed to open job log: {}", log_file.to_string_lossy()))?;

	// no color codes, they'd end up in the file
	let subscriber = FmtSubscriber::builder()
		.with_env_filter(parse_filter(filter)?)
		.event_format(event_format().with_ansi(false))
		.with_writer(std::io::stderr.and(Mutex::new(file)))
		.finish();
	install(subscriber)
}


pub fn init_test() -> DefaultGuard {

	let subscriber = FmtSubscriber::builder()
		.with_env_filter(EnvFilter::new("trace"))
		.event_format(event_format())
		.with_test_writer()
		.finish();

	tracing::subscriber::set_default(subscriber)
}


fn install(subscriber: impl Subscriber + Send + Sync + 'static) -> Result<()> {
	tracing::subscriber::set_global_default(subscriber)
		.context("Failed to set logging subscriber")
}


fn parse_filter(filter: impl AsRef<str>) -> Result<EnvFilter> {
	let filter = filter.as_ref();
	EnvFilter::builder()
		.parse(filter)
		.context(format!("Failed to parse log filter: {}", filter))
}


fn event_format() -> EventFormat {

	let timestamp = format_description!(
		version = 2,
		"[year]-[month]-[day] [hour]:[minute]:[second].[subsecond digits:3] [offset_hour sign:mandatory]:[offset_minute]"
	);

	// the local offset can't always be found once threads exist
	let offset = UtcOffset::current_local_offset()
		.unwrap_or(UtcOffset::UTC);

	Format::default()
		.with_timer(OffsetTime::new(offset, timestamp))
		.with_target(false)
}


/// Logs the whole error chain and drops the error
pub trait ResultExt<T> {
	fn log_err(self) -> Result<T,()>;
	fn warn_err(self) -> Result<T,()>;
}

impl<T> ResultExt<T> for Result<T,anyhow::Error> {

	fn log_err(self) -> Result<T,()> {
		self.map_err(|e| error!("{}", e.deref().chain()))
	}

	fn warn_err(self) -> Result<T,()> {
		self.map_err(|e| warn!("{}", e.deref().chain()))
	}
}
