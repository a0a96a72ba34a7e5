
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use serde_json::{json, Value};
use tracing::{info, warn};

use crate::aligner::{prm_file_name, Runner, Tools};
use crate::config::Config;
use crate::expand::{ExpansionRound, RoundOutcome};
use crate::params::{self, AlignmentInputs, SearchParams, SearchSchedule};
use crate::tomogram::{CacheLayout, RoundState, TomogramRecord};


/// A marker file whose presence asks running jobs to stop between steps.
/// A lone job deletes it once seen. Workers of a batch leave it for the batch to delete,
/// so every one of them gets to see it.
#[derive(Debug, Clone)]
pub struct Sentinel {
	path: PathBuf,
	consume: bool
}

impl Sentinel {

	pub fn new(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			consume: true
		}
	}

	pub fn shared(path: impl Into<PathBuf>) -> Self {
		Self {
			path: path.into(),
			consume: false
		}
	}

	pub fn path(&self) -> &Path {
		&self.path
	}

	/// true if a stop was requested
	pub fn requested(&self) -> Result<bool> {

		if !self.consume {
			return Ok(self.path.exists());
		}

		match fs::remove_file(&self.path) {
			Ok(()) => {
				info!("Stop requested by {}", self.path.to_string_lossy());
				Ok(true)
			}
			Err(e) if e.kind() == ErrorKind::NotFound => Ok(false),
			Err(e) => Err(e)
				.context(format!("Failed to remove stop file: {}", self.path.to_string_lossy()))
		}
	}
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum CountOrStop {
	/// particles in the latest expanded round
	Count(usize),
	/// too few particles qualified in the last round
	Stopped
}

impl CountOrStop {

	fn to_json(&self) -> Value {
		match self {
			Self::Count(count) => json!(count),
			Self::Stopped => json!(true)
		}
	}

	fn from_json(value: &Value) -> Option<Self> {
		match value {
			Value::Bool(true) => Some(Self::Stopped),
			value => value.as_u64().map(|count| Self::Count(count as usize))
		}
	}
}


/// What a finished job hands back, saved next to its rounds
#[derive(Debug, Clone, PartialEq)]
pub struct JobReport {
	pub tomogram: String,
	pub search: SearchParams,
	/// where the next round would go
	pub next_cache_folder: PathBuf,
	/// -1 if no round ran
	pub last_round: i32,
	pub count_or_stop: CountOrStop,
	pub cancelled: bool
}

impl JobReport {

	pub fn to_json(&self) -> Value {
		let search = &self.search;
		json!({
			"tomogram": self.tomogram,
			"search": {
				"reference": search.reference.to_string_lossy(),
				"mask": search.mask.to_string_lossy(),
				"box_size": search.box_size,
				"rotation_range": search.rotation_range,
				"rotation_step": search.rotation_step,
				"translation_radius": search.translation_radius,
				"low_cutoff": search.low_cutoff,
				"high_cutoff": search.high_cutoff,
				"ref_threshold": search.ref_threshold,
				"tilt_range": search.tilt_range
			},
			"next_cache_folder": self.next_cache_folder.to_string_lossy(),
			"last_round": self.last_round,
			"count_or_stop": self.count_or_stop.to_json(),
			"cancelled": self.cancelled
		})
	}

	pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {
		let path = path.as_ref();
		let json = serde_json::to_string_pretty(&self.to_json())
			.context("Failed to serialize job report")?;
		fs::write(path, json)
			.context(format!("Failed to write job report: {}", path.to_string_lossy()))
	}
}


/// The parts of a saved report the batch cares about
#[derive(Debug, Clone, PartialEq)]
pub struct ReportSummary {
	pub tomogram: String,
	pub last_round: i32,
	pub count_or_stop: CountOrStop,
	pub cancelled: bool
}

impl ReportSummary {

	pub fn read(path: impl AsRef<Path>) -> Result<Self> {

		let path = path.as_ref();
		let json = fs::read_to_string(path)
			.context(format!("Failed to read job report: {}", path.to_string_lossy()))?;
		let json = serde_json::from_str::<Value>(&json)
			.context(format!("Failed to parse job report: {}", path.to_string_lossy()))?;

		let tomogram = json["tomogram"].as_str()
			.context("Job report has no tomogram")?
			.to_string();
		let last_round = json["last_round"].as_i64()
			.context("Job report has no last round")?;
		let count_or_stop = CountOrStop::from_json(&json["count_or_stop"])
			.context("Job report has no count or stop flag")?;
		let cancelled = json["cancelled"].as_bool()
			.unwrap_or(false);

		Ok(Self {
			tomogram,
			last_round: last_round as i32,
			count_or_stop,
			cancelled
		})
	}
}


/// Expands one tomogram from wherever its cache left off.
/// Ends when a round stops, after `max_rounds` rounds, or when the stop file appears.
#[tracing::instrument(skip_all, level = 5, name = "Tomogram", fields(tomo = %name))]
pub fn run_tomogram(name: &str, config: &Config, sentinel: &Sentinel, runner: &dyn Runner) -> Result<JobReport> {

	let job = config.job()?;
	let expand = config.expand()?;
	let tools = &config.tools;

	// the aligner runs inside the round folders, so it needs absolute paths
	let mut search = config.search()?.clone();
	search.reference = absolute(&search.reference)?;
	search.mask = absolute(&search.mask)?;

	let layout = CacheLayout::new(&job.cache_dir, name);
	let state = RoundState::discover(&layout)?;
	if state.latest >= 0 && !state.completed {
		info!("Round {} didn't finish, resuming it", state.latest);
	}

	let mut tomogram = TomogramRecord::resolve(
		&layout,
		&job.params_dir,
		state.current_round(),
		expand.max_particles,
		expand.pixel_size,
		tools,
		runner
	)?;

	let schedule = SearchSchedule::build(&search);

	let mut last_round = state.current_round();
	let mut count_or_stop = CountOrStop::Count(tomogram.num_particles);
	let mut cancelled = false;
	let mut rounds = 0usize;

	for round in state.next_round() .. {

		if let Some(max_rounds) = job.max_rounds {
			if rounds >= max_rounds {
				info!("Finished {} rounds, the most allowed", rounds);
				break;
			}
		}

		if sentinel.requested()? {
			cancelled = true;
			break;
		}

		align(round, &layout, &tomogram, &search, &schedule, job.cpus, tools, runner)?;

		// the aligner can take a long time, check again
		if sentinel.requested()? {
			cancelled = true;
			break;
		}

		let mut expansion = ExpansionRound::new(round, &layout, &tomogram, schedule.iterations());
		expansion.prepare(tools, runner)?;
		let outcome = expansion.expand(&expand.params, tools, runner)?;
		let files = expansion.output_files();

		last_round = round;
		rounds += 1;

		match outcome {
			RoundOutcome::Expanded(count) => {
				tomogram.redirect(round, files, count);
				count_or_stop = CountOrStop::Count(count);
			}
			RoundOutcome::Stopped(count) => {
				info!("Expansion stopped at round {} with {} new particles", round, count);
				count_or_stop = CountOrStop::Stopped;
				break;
			}
		}
	}

	if cancelled {
		warn!("Cancelled after round {}", last_round);
	}

	let report = JobReport {
		tomogram: name.to_string(),
		search,
		next_cache_folder: layout.round_dir(last_round + 1),
		last_round,
		count_or_stop,
		cancelled
	};
	fs::create_dir_all(&layout.dir)
		.context(format!("Failed to create cache folder: {}", layout.dir.to_string_lossy()))?;
	report.write(layout.report())?;

	Ok(report)
}


/// Writes the round's parameter file and runs the aligner, unless it already finished
fn align(
	round: i32,
	layout: &CacheLayout,
	tomogram: &TomogramRecord,
	search: &SearchParams,
	schedule: &SearchSchedule,
	cpus: usize,
	tools: &Tools,
	runner: &dyn Runner
) -> Result<()> {

	let name = layout.name.as_str();
	let dir = layout.round_dir(round);
	fs::create_dir_all(&dir)
		.context(format!("Failed to create round folder: {}", dir.to_string_lossy()))?;

	let chunks = tools.processchunks(&dir, name, cpus, schedule.iterations());
	if chunks.is_done() {
		info!("Round {}: alignment already finished", round);
		return Ok(());
	}

	let volume = absolute(&tomogram.files.volume)?;
	let model = absolute(&tomogram.files.model)?;
	let motl = absolute(&tomogram.files.motl)?;
	let inputs = AlignmentInputs {
		name,
		volume: &volume,
		model: &model,
		motl: &motl
	};
	params::emit(dir.join(prm_file_name(name)), &inputs, search, schedule)?;

	runner.run(&tools.prm_parser(&dir, name))
		.context(format!("Failed to parse the parameter file for round {}", round))?;

	info!("Round {}: aligning {} particles over {} iterations", round, tomogram.num_particles, schedule.iterations());
	runner.run(&chunks)
		.context(format!("Alignment failed for round {}", round))?;

	Ok(())
}


fn absolute(path: &Path) -> Result<PathBuf> {
	if path.as_os_str().is_empty() {
		bail!("Empty path");
	}
	std::path::absolute(path)
		.context(format!("Failed to make path absolute: {}", path.to_string_lossy()))
}
