
use std::fs;
use std::io::ErrorKind;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use tracing::{info, warn};

use crate::aligner::{self, Runner, Tools};
use crate::cluster::{cluster_by_count, representatives};
use crate::geometry::Point;
use crate::motl::{read_points, read_provenance, read_rot_axes, write_points, write_rot_axes, MotionList, Provenance};
use crate::mrc::MrcHeader;


/// The four files that describe a tomogram's particles at some point in the expansion
#[derive(Debug, Clone, PartialEq)]
pub struct TomogramFiles {
	pub volume: PathBuf,
	pub model: PathBuf,
	pub motl: PathBuf,
	pub rot_axes: PathBuf
}

impl TomogramFiles {

	pub fn all(&self) -> [&Path; 4] {
		[self.volume.as_path(), self.model.as_path(), self.motl.as_path(), self.rot_axes.as_path()]
	}

	pub fn is_complete(&self) -> bool {
		self.all().iter().all(|path| path.exists())
	}

	pub fn check(&self) -> Result<()> {
		for path in self.all() {
			if !path.exists() {
				bail!("Missing file: {}", path.to_string_lossy());
			}
		}
		Ok(())
	}
}


/// Where a tomogram's rounds live:
/// `<cache>/<name>_cache/round_<N>/` with the expanded particles under `exp/`
#[derive(Debug, Clone, PartialEq)]
pub struct CacheLayout {
	pub name: String,
	pub dir: PathBuf
}

impl CacheLayout {

	pub fn new(cache_root: impl AsRef<Path>, name: impl Into<String>) -> Self {
		let name = name.into();
		Self {
			dir: cache_root.as_ref().join(format!("{}_cache", name)),
			name
		}
	}

	pub fn round_dir(&self, round: i32) -> PathBuf {
		self.dir.join(format!("round_{}", round))
	}

	pub fn exp_dir(&self, round: i32) -> PathBuf {
		self.round_dir(round).join("exp")
	}

	pub fn exp_files(&self, round: i32) -> TomogramFiles {
		let dir = self.exp_dir(round);
		TomogramFiles {
			volume: dir.join(format!("{}_exp.mrc", self.name)),
			model: dir.join(format!("{}_exp.mod", self.name)),
			motl: dir.join(format!("{}_exp_MOTL.csv", self.name)),
			rot_axes: dir.join(format!("{}_exp_RotAxes.csv", self.name))
		}
	}

	pub fn exp_points(&self, round: i32) -> PathBuf {
		self.exp_dir(round).join(format!("{}_exp.pts", self.name))
	}

	/// where each expanded particle came from, one row per motion-list row
	pub fn exp_provenance(&self, round: i32) -> PathBuf {
		self.exp_dir(round).join(format!("{}_exp_provenance.csv", self.name))
	}

	/// the round's particles after alignment, as a point list
	pub fn aligned_points(&self, round: i32) -> PathBuf {
		self.round_dir(round).join(aligner::aligned_points_name(&self.name))
	}

	pub fn less_dir(&self) -> PathBuf {
		self.dir.join("less")
	}

	pub fn report(&self) -> PathBuf {
		self.dir.join("report.json")
	}
}


/// Highest numbered `round_<N>` folder, or -1 when there are none
pub fn discover_latest_round(cache_dir: impl AsRef<Path>) -> Result<i32> {

	let cache_dir = cache_dir.as_ref();
	let entries = match fs::read_dir(cache_dir) {
		Ok(entries) => entries,
		Err(e) if e.kind() == ErrorKind::NotFound => return Ok(-1),
		Err(e) => return Err(e)
			.context(format!("Failed to read cache folder: {}", cache_dir.to_string_lossy()))
	};

	let mut latest = -1;
	for entry in entries {
		let entry = entry
			.context(format!("Failed to read cache folder: {}", cache_dir.to_string_lossy()))?;
		if !entry.path().is_dir() {
			continue;
		}
		let file_name = entry.file_name();
		let Some(round) = file_name.to_str()
			.and_then(|name| name.strip_prefix("round_"))
			.and_then(|n| n.parse::<i32>().ok())
			else { continue; };
		latest = latest.max(round);
	}

	Ok(latest)
}


/// Which round a tomogram's job resumes from, found once per job
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct RoundState {
	/// highest round folder, -1 if none
	pub latest: i32,
	/// whether that round's expanded particles were fully written
	pub completed: bool
}

impl RoundState {

	pub fn discover(layout: &CacheLayout) -> Result<Self> {
		let latest = discover_latest_round(&layout.dir)?;
		let completed = latest >= 0 && layout.exp_files(latest).is_complete();
		Ok(Self {
			latest,
			completed
		})
	}

	/// the round whose outputs hold the current particles, -1 for the initial picks
	pub fn current_round(&self) -> i32 {
		if self.completed {
			self.latest
		} else {
			self.latest.max(0) - 1
		}
	}

	pub fn next_round(&self) -> i32 {
		self.current_round() + 1
	}
}


#[derive(Debug, Clone, PartialEq)]
pub struct TomogramRecord {
	pub name: String,
	/// whose outputs `files` points at, -1 for the initial picks
	pub round: i32,
	pub files: TomogramFiles,
	/// in voxels
	pub boundary: Point,
	/// Å per voxel
	pub pixel_size: f64,
	pub num_particles: usize
}

impl TomogramRecord {

	/// Adopts the particles of `round`, or the initial picks when `round < 0`.
	/// Initial picks above `max_particles` are thinned out first.
	#[tracing::instrument(skip_all, level = 5, name = "Resolve", fields(tomo = %layout.name, round = round))]
	pub fn resolve(
		layout: &CacheLayout,
		params_dir: &Path,
		round: i32,
		max_particles: Option<usize>,
		pixel_size: Option<f64>,
		tools: &Tools,
		runner: &dyn Runner
	) -> Result<Self> {

		let name = layout.name.as_str();
		let mut files =
			if round < 0 {
				find_initial_files(params_dir, name)?
			} else {
				let files = layout.exp_files(round);
				files.check()
					.context(format!("Incomplete round {} for tomogram {}", round, name))?;
				files
			};

		let header = MrcHeader::read(&files.volume)?;
		let pixel_size = pixel_size.unwrap_or_else(|| header.pixel_size());

		let mut num_particles = MotionList::read(&files.motl)?.len();
		info!("Round {}: {} particles from {}", round, num_particles, files.motl.to_string_lossy());

		if round < 0 {
			if let Some(max_particles) = max_particles {
				if num_particles > max_particles {
					files = less_particles(layout, &files, max_particles, tools, runner)?;
					num_particles = MotionList::read(&files.motl)?.len();
				}
			}
		}

		Ok(Self {
			name: name.to_string(),
			round,
			files,
			boundary: header.boundary(),
			pixel_size,
			num_particles
		})
	}

	/// points the record at a newly expanded round
	pub fn redirect(&mut self, round: i32, files: TomogramFiles, num_particles: usize) {
		self.round = round;
		self.files = files;
		self.num_particles = num_particles;
	}

	/// where each current particle came from
	pub fn provenance(&self, layout: &CacheLayout) -> Result<Vec<Provenance>> {

		if self.round < 0 {
			return Ok(vec![Provenance::MANUAL; self.num_particles]);
		}

		let provenance = read_provenance(layout.exp_provenance(self.round))?;
		if provenance.len() != self.num_particles {
			bail!("Round {} of tomogram {} has {} particles but {} provenance rows",
				self.round, self.name, self.num_particles, provenance.len());
		}
		Ok(provenance)
	}
}


fn find_initial_files(params_dir: &Path, name: &str) -> Result<TomogramFiles> {

	let model = params_dir.join(format!("{}.mod", name));
	if !model.exists() {
		bail!("Missing model file for tomogram {}: {}", name, model.to_string_lossy());
	}

	let mut candidates = fs::read_dir(params_dir)
		.context(format!("Failed to read params folder: {}", params_dir.to_string_lossy()))?
		.filter_map(|entry| entry.ok())
		.filter_map(|entry| entry.file_name().to_str().map(str::to_string))
		.filter(|file_name| belongs_to(file_name, name))
		.collect::<Vec<_>>();
	candidates.sort();

	let motl = find_file(&candidates, params_dir, name, "motion list", "MOTL.csv")?;
	let rot_axes = find_file(&candidates, params_dir, name, "rotation axes", "RotAxes.csv")?;

	// prefer the exact name, other tomograms may share the prefix
	let volume = [format!("{}.mrc", name), format!("{}.rec", name)].into_iter()
		.map(|file_name| params_dir.join(file_name))
		.find(|path| path.exists());
	let volume = match volume {
		Some(volume) => volume,
		None => find_file(&candidates, params_dir, name, "volume", ".mrc")
			.or_else(|_| find_file(&candidates, params_dir, name, "volume", ".rec"))?
	};

	Ok(TomogramFiles {
		volume,
		model,
		motl,
		rot_axes
	})
}


/// true if the file is named for the tomogram: `TS_1_MOTL.csv` is for `TS_1`, `TS_10_MOTL.csv` isn't
fn belongs_to(file_name: &str, name: &str) -> bool {
	match file_name.strip_prefix(name) {
		Some(rest) => rest.chars().next().is_some_and(|c| !c.is_ascii_alphanumeric()),
		None => false
	}
}


/// Prefers `{name}_{suffix}` or `{name}{suffix}`, then any other file of the tomogram ending in `suffix`
fn find_file(
	candidates: &[String],
	params_dir: &Path,
	name: &str,
	what: &str,
	suffix: &str
) -> Result<PathBuf> {
	let exact = [format!("{}_{}", name, suffix), format!("{}{}", name, suffix)];
	candidates.iter()
		.find(|file_name| exact.contains(file_name))
		.or_else(|| candidates.iter().find(|file_name| file_name.ends_with(suffix)))
		.map(|file_name| params_dir.join(file_name))
		.context(format!("Missing {} file for tomogram {} in {}", what, name, params_dir.to_string_lossy()))
}


/// Thins the initial picks down to `max_particles`, one particle per cluster.
/// Points, motion-list rows and rotation axes are selected with the same indices.
fn less_particles(
	layout: &CacheLayout,
	files: &TomogramFiles,
	max_particles: usize,
	tools: &Tools,
	runner: &dyn Runner
) -> Result<TomogramFiles> {

	let name = layout.name.as_str();
	let dir = layout.less_dir();
	let less = TomogramFiles {
		volume: files.volume.clone(),
		model: dir.join(format!("{}_less.mod", name)),
		motl: dir.join(format!("{}_less_MOTL.csv", name)),
		rot_axes: dir.join(format!("{}_less_RotAxes.csv", name))
	};
	if less.is_complete() {
		info!("Using previously reduced particles: {}", dir.to_string_lossy());
		return Ok(less);
	}

	fs::create_dir_all(&dir)
		.context(format!("Failed to create folder: {}", dir.to_string_lossy()))?;

	let all_points = dir.join(format!("{}_initial.pts", name));
	aligner::run_once(runner, &tools.model2point(&dir, &files.model, &all_points))?;

	let points = read_points(&all_points)?;
	let motl = MotionList::read(&files.motl)?;
	let axes = read_rot_axes(&files.rot_axes)?;
	if points.len() != motl.len() || points.len() != axes.len() {
		bail!("Particle files disagree for tomogram {}: {} points, {} motion list rows, {} rotation axes",
			name, points.len(), motl.len(), axes.len());
	}

	let keep = representatives(&cluster_by_count(&points, max_particles));
	warn!("Reducing tomogram {} from {} to {} particles", name, points.len(), keep.len());

	let less_points = dir.join(format!("{}_less.pts", name));
	write_points(&less_points, &keep.iter().map(|&i| points[i]).collect::<Vec<_>>())?;
	write_rot_axes(&less.rot_axes, &keep.iter().map(|&i| axes[i]).collect::<Vec<_>>())?;
	aligner::run_once(runner, &tools.point2model(&dir, &less_points, &less.model))?;

	// the motion list goes last, it marks the reduction as done
	motl.select(&keep).write(&less.motl)?;

	Ok(less)
}
