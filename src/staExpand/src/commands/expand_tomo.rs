
use anyhow::Result;
use gumdrop::Options;
use tracing::info;

use crate::aligner::ProcessRunner;
use crate::config::Config;
use crate::job::{run_tomogram, CountOrStop, Sentinel};


#[derive(Options)]
pub struct Args {

	/// Leave the stop file in place for the batch to remove
	pub shared_stop: bool,

	/// Path to the job's config file
	#[options(free, required)]
	pub config: String,

	/// Name of the tomogram to expand
	#[options(free, required)]
	pub tomo: String
}


pub fn run(args: Args) -> Result<()> {

	let config = Config::read(&args.config)?;
	let job = config.job()?;
	let sentinel =
		if args.shared_stop {
			Sentinel::shared(&job.stop_file)
		} else {
			Sentinel::new(&job.stop_file)
		};

	let report = run_tomogram(&args.tomo, &config, &sentinel, &ProcessRunner)?;
	match report.count_or_stop {
		CountOrStop::Count(count) => info!("Tomogram {} has {} particles after round {}", report.tomogram, count, report.last_round),
		CountOrStop::Stopped => info!("Tomogram {} stopped expanding at round {}", report.tomogram, report.last_round)
	}

	Ok(())
}
