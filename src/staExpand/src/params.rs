
use std::fmt::Write as _;
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{Context, Result};
use tracing::info;


#[derive(Debug, Clone, PartialEq)]
pub struct SearchParams {
	pub reference: PathBuf,
	pub mask: PathBuf,
	pub box_size: [u32; 3],
	/// half-ranges for phi, theta, psi, in degrees
	pub rotation_range: [u32; 3],
	pub rotation_step: u32,
	/// in voxels
	pub translation_radius: [f64; 3],
	pub low_cutoff: [f64; 2],
	pub high_cutoff: [f64; 2],
	pub ref_threshold: u32,
	pub tilt_range: [f64; 2]
}


/// One axis' (range, step) per iteration, coarse to fine
#[derive(Debug, Clone, PartialEq)]
pub struct RotationSchedule {
	pub ranges: Vec<u32>,
	pub steps: Vec<u32>
}

impl RotationSchedule {

	pub fn len(&self) -> usize {
		self.steps.len()
	}

	/// repeats the coarsest entry at the front until there are `len` entries
	fn pad_to(&mut self, len: usize) {
		while self.steps.len() < len {
			self.ranges.insert(0, self.ranges[0]);
			self.steps.insert(0, self.steps[0]);
		}
	}
}


/// Doubles the step from `step` (capping 16..30 down to 15, stopping past 32) while the
/// range still holds three steps, then reverses so the search narrows every iteration.
/// A range too small for even the first step searches nothing.
pub fn build_rotation_schedule(range: u32, step: u32) -> RotationSchedule {

	let mut entries = Vec::<(u32, u32)>::new();
	let mut step = step.max(1);
	loop {
		if (16 .. 30).contains(&step) {
			step = 15;
		}
		if step > 32 || range < 3*step {
			break;
		}
		entries.push((3*step, step));
		step *= 2;
	}

	let Some(&(last_range, last_step)) = entries.last()
		else {
			return RotationSchedule {
				ranges: vec![0],
				steps: vec![1]
			};
		};

	// the coarsest iteration still has to cover the whole range, in whole steps
	if range > last_range {
		entries.push((range.div_ceil(last_step)*last_step, last_step));
	}

	entries.reverse();
	RotationSchedule {
		ranges: entries.iter().map(|(r, _)| *r).collect(),
		steps: entries.iter().map(|(_, s)| *s).collect()
	}
}


/// Shrinks each axis' radius linearly over the iterations, never below 1 voxel.
/// Halves round to even.
pub fn build_translation_schedule(max_iter: usize, radius: [f64; 3]) -> Vec<[u32; 3]> {
	(0 .. max_iter)
		.map(|k| {
			radius.map(|r| {
				let r = (r - k as f64*r/max_iter as f64).round_ties_even();
				r.max(1.0) as u32
			})
		})
		.collect()
}


#[derive(Debug, Clone, PartialEq)]
pub struct SearchSchedule {
	pub phi: RotationSchedule,
	pub theta: RotationSchedule,
	pub psi: RotationSchedule,
	pub translation: Vec<[u32; 3]>
}

impl SearchSchedule {

	pub fn build(params: &SearchParams) -> Self {

		let mut phi = build_rotation_schedule(params.rotation_range[0], params.rotation_step);
		let mut theta = build_rotation_schedule(params.rotation_range[1], params.rotation_step);
		let mut psi = build_rotation_schedule(params.rotation_range[2], params.rotation_step);

		let iterations = phi.len()
			.max(theta.len())
			.max(psi.len());
		phi.pad_to(iterations);
		theta.pad_to(iterations);
		psi.pad_to(iterations);

		Self {
			phi,
			theta,
			psi,
			translation: build_translation_schedule(iterations, params.translation_radius)
		}
	}

	pub fn iterations(&self) -> usize {
		self.translation.len()
	}
}


/// The files one alignment round starts from
#[derive(Debug, Clone, PartialEq)]
pub struct AlignmentInputs<'a> {
	pub name: &'a str,
	pub volume: &'a Path,
	pub model: &'a Path,
	pub motl: &'a Path
}


fn braced(items: impl IntoIterator<Item=String>) -> String {
	format!("{{{}}}", items.into_iter().collect::<Vec<_>>().join(", "))
}

fn bracketed(items: impl IntoIterator<Item=String>) -> String {
	format!("[{}]", items.into_iter().collect::<Vec<_>>().join(", "))
}

fn quoted(path: &Path) -> String {
	format!("'{}'", path.to_string_lossy())
}

fn angle_searches(schedule: &RotationSchedule) -> String {
	braced(schedule.ranges.iter()
		.zip(&schedule.steps)
		.map(|(range, step)| format!("-{}:{}:{}", range, step, range)))
}


pub fn render(inputs: &AlignmentInputs, params: &SearchParams, schedule: &SearchSchedule) -> Result<String> {

	let n = schedule.iterations();
	let per_iteration = |value: String| braced((0 .. n).map(|_| value.clone()));

	let entries = [
		("fnVolume", braced([quoted(inputs.volume)])),
		("fnModParticle", braced([quoted(inputs.model)])),
		("initMOTL", braced([quoted(inputs.motl)])),
		("tiltRange", braced([bracketed(params.tilt_range.map(|t| t.to_string()))])),
		("dPhi", angle_searches(&schedule.phi)),
		("dTheta", angle_searches(&schedule.theta)),
		("dPsi", angle_searches(&schedule.psi)),
		("searchRadius", braced(schedule.translation.iter()
			.map(|r| bracketed(r.map(|v| v.to_string()))))),
		("lowCutoff", per_iteration(bracketed(params.low_cutoff.map(|v| v.to_string())))),
		("hiCutoff", per_iteration(bracketed(params.high_cutoff.map(|v| v.to_string())))),
		("refThreshold", per_iteration(params.ref_threshold.to_string())),
		("duplicateShiftTolerance", per_iteration("NaN".to_string())),
		("duplicateAngularTolerance", per_iteration("NaN".to_string())),
		("reference", quoted(&params.reference)),
		("fnOutput", format!("'{}'", inputs.name)),
		("szVol", bracketed(params.box_size.map(|v| v.to_string()))),
		("maskType", quoted(&params.mask)),
		("alignedBaseName", "''".to_string()),
		("debugLevel", "3".to_string()),
		("lstThresholds", bracketed([params.ref_threshold.to_string()])),
		("refFlagAllTom", "1".to_string()),
		("lstFlagAllTom", "1".to_string()),
		("particlePerCPU", "20".to_string()),
		("yaxisType", "0".to_string()),
		("flgWedgeWeight", "1".to_string()),
		("sampleSphere", "'none'".to_string()),
		("sampleInterval", "NaN".to_string()),
		("insideMaskRadius", "0".to_string()),
		("outsideMaskRadius", "NaN".to_string()),
		("nWeightGroup", "8".to_string()),
		("flgRemoveDuplicates", "0".to_string()),
		("flgStrictSearchLimits", "1".to_string()),
		("flgAbsValue", "1".to_string())
	];

	let mut out = String::new();
	for (key, value) in entries {
		writeln!(out, "{} = {}\n", key, value)?;
	}
	Ok(out)
}


/// Writes a fresh parameter file, moving any old one aside to `<path>~`
pub fn emit(path: impl AsRef<Path>, inputs: &AlignmentInputs, params: &SearchParams, schedule: &SearchSchedule) -> Result<()> {

	let path = path.as_ref();

	if path.exists() {
		let mut backup = path.as_os_str().to_owned();
		backup.push("~");
		fs::rename(path, &backup)
			.context(format!("Failed to back up parameter file: {}", path.to_string_lossy()))?;
	}

	fs::write(path, render(inputs, params, schedule)?)
		.context(format!("Failed to write parameter file: {}", path.to_string_lossy()))?;
	info!("Wrote parameter file: {} ({} iterations)", path.to_string_lossy(), schedule.iterations());

	Ok(())
}
