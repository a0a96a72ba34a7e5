
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::aligner::{self, Runner, Tools};
use crate::geometry::{in_boundary, rotated_y_axis, PlacedIndex, Point};
use crate::motl::{read_points, write_points, write_provenance, write_rot_axes, MotionList, Provenance};
use crate::tomogram::{CacheLayout, TomogramFiles, TomogramRecord};


pub const DEFAULT_MIN_COUNT: usize = 5;


#[derive(Debug, Clone, PartialEq)]
pub struct ExpandParams {
	/// minimum distance between particles, in Å
	pub distance_threshold: f64,
	/// expansion stops unless more than this many particles are added
	pub min_count: usize,
	/// neighbor positions in the particle's frame, in voxels
	pub offsets: Vec<Point>
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundStatus {
	AwaitingAlignment,
	ReadyToExpand,
	Expanded,
	Stopped
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum RoundOutcome {
	/// this many new particles were written for the next round
	Expanded(usize),
	/// only this many qualified, nothing was written
	Stopped(usize)
}


/// The aligner's results for a round
#[derive(Debug, Clone, PartialEq)]
pub struct AlignedRound {
	pub volume: PathBuf,
	pub model: PathBuf,
	pub motl: PathBuf,
	pub points: PathBuf
}


/// A proposed particle that passed both checks
#[derive(Debug, Clone, PartialEq)]
pub struct Candidate {
	pub position: Point,
	/// index of the particle it was proposed by
	pub parent: usize
}


/// One round of template-driven expansion, after the aligner has refined the round's particles
pub struct ExpansionRound<'a> {
	round: i32,
	layout: &'a CacheLayout,
	tomogram: &'a TomogramRecord,
	iterations: usize,
	status: RoundStatus,
	aligned: Option<AlignedRound>
}

impl<'a> ExpansionRound<'a> {

	pub fn new(round: i32, layout: &'a CacheLayout, tomogram: &'a TomogramRecord, iterations: usize) -> Self {
		Self {
			round,
			layout,
			tomogram,
			iterations,
			status: RoundStatus::AwaitingAlignment,
			aligned: None
		}
	}

	pub fn status(&self) -> RoundStatus {
		self.status
	}

	pub fn aligned(&self) -> Option<&AlignedRound> {
		self.aligned.as_ref()
	}

	pub fn output_files(&self) -> TomogramFiles {
		self.layout.exp_files(self.round)
	}

	/// Materializes the aligned model of the finished alignment as a point list.
	/// Steps whose outputs already exist are skipped.
	pub fn prepare(&mut self, tools: &Tools, runner: &dyn Runner) -> Result<()> {

		let name = self.layout.name.as_str();
		let dir = self.layout.round_dir(self.round);

		let motl = dir.join(aligner::final_motl_name(name, self.iterations));
		if !motl.exists() {
			bail!("Alignment of round {} has no final motion list: {}", self.round, motl.to_string_lossy());
		}

		let aligned_model = tools.create_aligned_model(&dir, name, self.iterations);
		aligner::run_once(runner, &aligned_model)
			.context(format!("Failed to create the aligned model for round {}", self.round))?;
		let model = dir.join(aligner::aligned_model_name(name, self.iterations));

		let points = self.layout.aligned_points(self.round);
		aligner::run_once(runner, &tools.model2point(&dir, &model, &points))
			.context(format!("Failed to convert the aligned model for round {}", self.round))?;

		self.aligned = Some(AlignedRound {
			volume: self.tomogram.files.volume.clone(),
			model,
			motl,
			points
		});
		self.status = RoundStatus::ReadyToExpand;

		Ok(())
	}

	/// Proposes, filters and writes the next round's particles.
	/// A round whose outputs are already all there is reported as-is without writing anything.
	pub fn expand(&mut self, params: &ExpandParams, tools: &Tools, runner: &dyn Runner) -> Result<RoundOutcome> {

		let Some(aligned) = &self.aligned
			else { bail!("Round {} was not prepared", self.round); };

		let outputs = self.output_files();
		if outputs.is_complete() && self.layout.exp_points(self.round).exists() {
			let count = MotionList::read(&outputs.motl)?.len();
			info!("Round {} already expanded to {} particles", self.round, count);
			self.status = RoundStatus::Expanded;
			return Ok(RoundOutcome::Expanded(count));
		}

		let points = read_points(&aligned.points)?;
		let motl = MotionList::read(&aligned.motl)?;
		if points.len() != motl.len() {
			bail!("Round {}: the aligned model has {} particles but the motion list has {}",
				self.round, points.len(), motl.len());
		}

		let mut placed = self.placed_so_far()?;
		let threshold = params.distance_threshold/self.tomogram.pixel_size;
		let candidates = propose(&points, &motl, &params.offsets, self.tomogram.boundary, threshold, &mut placed);
		info!("Round {}: {} particles proposed {} new particles", self.round, points.len(), candidates.len());

		if candidates.len() <= params.min_count {
			warn!("Round {}: only {} new particles (need more than {}), stopping",
				self.round, candidates.len(), params.min_count);
			self.status = RoundStatus::Stopped;
			return Ok(RoundOutcome::Stopped(candidates.len()));
		}

		self.write(&candidates, &motl, &aligned.volume, tools, runner)?;
		self.status = RoundStatus::Expanded;

		Ok(RoundOutcome::Expanded(candidates.len()))
	}

	/// aligned particles of every round up to this one
	fn placed_so_far(&self) -> Result<PlacedIndex> {
		let mut placed = PlacedIndex::new();
		for round in 0 ..= self.round {
			let path = self.layout.aligned_points(round);
			if !path.exists() {
				warn!("No aligned particles for round {}, not checking distances against them", round);
				continue;
			}
			placed.extend(read_points(&path)?);
		}
		debug!("{} particles placed before round {}", placed.len(), self.round);
		Ok(placed)
	}

	fn write(
		&self,
		candidates: &[Candidate],
		motl: &MotionList,
		volume: &Path,
		tools: &Tools,
		runner: &dyn Runner
	) -> Result<()> {

		let dir = self.layout.exp_dir(self.round);
		fs::create_dir_all(&dir)
			.context(format!("Failed to create folder: {}", dir.to_string_lossy()))?;
		let outputs = self.output_files();

		let points_path = self.layout.exp_points(self.round);
		let positions = candidates.iter()
			.map(|c| c.position)
			.collect::<Vec<_>>();
		write_points(&points_path, &positions)?;

		let axes = candidates.iter()
			.map(|c| rotated_y_axis(&motl.rows[c.parent].angles.matrix()))
			.collect::<Vec<_>>();
		write_rot_axes(&outputs.rot_axes, &axes)?;

		// the model is regenerated from the points
		if outputs.model.exists() {
			fs::remove_file(&outputs.model)
				.context(format!("Failed to remove stale model: {}", outputs.model.to_string_lossy()))?;
		}
		runner.run(&tools.point2model(&dir, &points_path, &outputs.model))?;

		link_volume(volume, &outputs.volume)?;

		let provenance = candidates.iter()
			.map(|c| Provenance::expanded(self.round, c.parent))
			.collect::<Vec<_>>();
		write_provenance(self.layout.exp_provenance(self.round), &provenance)?;

		// the motion list goes last, it marks the round as done
		let mut next = MotionList::new(motl.header.clone());
		for c in candidates {
			let mut row = motl.rows[c.parent].clone();
			// the new position already includes the parent's refinement
			row.offset = Point::zeros();
			next.rows.push(row);
		}
		next.write(&outputs.motl)?;

		info!("Round {}: wrote {} particles to {}", self.round, candidates.len(), dir.to_string_lossy());

		Ok(())
	}
}


/// Greedily accepts `particle + R·offset` for every particle and offset, in that order.
/// Accepted positions join `placed` right away.
pub fn propose(
	points: &[Point],
	motl: &MotionList,
	offsets: &[Point],
	boundary: Point,
	threshold: f64,
	placed: &mut PlacedIndex
) -> Vec<Candidate> {

	let margin = 2.0*threshold;
	let mut candidates = Vec::new();

	for (parent, (point, row)) in points.iter().zip(&motl.rows).enumerate() {
		let rotation = row.angles.matrix();
		for offset in offsets {
			let position = point + rotation*offset;
			if !in_boundary(&position, &boundary, margin) {
				continue;
			}
			if placed.closest_distance(&position) < threshold {
				continue;
			}
			placed.push(position);
			candidates.push(Candidate {
				position,
				parent
			});
		}
	}

	candidates
}


fn link_volume(volume: &Path, link: &Path) -> Result<()> {

	let target = fs::canonicalize(volume)
		.context(format!("Failed to find volume: {}", volume.to_string_lossy()))?;

	match fs::remove_file(link) {
		Ok(()) => (),
		Err(e) if e.kind() == ErrorKind::NotFound => (),
		Err(e) => return Err(e)
			.context(format!("Failed to remove old volume link: {}", link.to_string_lossy()))
	}

	std::os::unix::fs::symlink(&target, link)
		.context(format!("Failed to link volume {} to {}", target.to_string_lossy(), link.to_string_lossy()))
}
