
use std::env;

use anyhow::{bail, Context, Result};
use gumdrop::Options;

use crate::batch::run_batch;
use crate::config::Config;


#[derive(Options)]
pub struct Args {

	/// Path to the job's config file
	#[options(free, required)]
	pub config: String
}


pub fn run(log: &str, args: Args) -> Result<()> {

	// workers may run somewhere else, give them a path that works anywhere
	let config_path = std::path::absolute(&args.config)
		.context(format!("Failed to find config file: {}", args.config))?;
	let config = Config::read(&config_path)?;

	// catch config problems here, rather than once per worker
	let job = config.job()?;
	config.search()?;
	config.expand()?;

	let names = job.tomogram_names()?;
	if names.is_empty() {
		bail!("No tomograms to expand in {}", job.params_dir.to_string_lossy());
	}

	let exe = env::current_exe()
		.context("Failed to find the current executable")?;
	run_batch(&exe, log, &config_path, job, &names)?;

	Ok(())
}
