
use std::path::{Path, PathBuf};

use anyhow::Result;
use gumdrop::Options;
use tracing::info;

use crate::config::Config;
use crate::detect::{build_training_set, save_training_set};
use crate::extract::sample_seeds;
use crate::motl::read_points;
use crate::mrc::Volume;


#[derive(Options)]
pub struct Args {

	/// Path to the config file with a [seeds] section
	#[options(free, required)]
	pub config: String,

	/// The tomogram to crop
	#[options(required)]
	pub volume: String,

	/// Known particles (point file, voxels): seeds are drawn from these, and labeled
	pub points: Option<String>,

	/// Only sample where this volume is positive
	pub mask: Option<String>,

	/// Folder for the cubes
	#[options(required)]
	pub out: String,

	/// Prefix for the cube files, defaults to the volume's file name
	pub name: Option<String>
}


pub fn run(args: Args) -> Result<()> {

	let config = Config::read(&args.config)?;
	let seeds = config.seeds()?;

	let volume = Volume::read(&args.volume)?;
	let points = match &args.points {
		Some(path) => read_points(path)?,
		None => Vec::new()
	};
	let mask = match &args.mask {
		Some(path) => Some(Volume::read(path)?),
		None => None
	};

	let mut rng = match seeds.rng_seed {
		Some(seed) => fastrand::Rng::with_seed(seed),
		None => fastrand::Rng::new()
	};

	let sample = sample_seeds(
		volume.shape(),
		seeds.target_count,
		seeds.cube_size,
		&points,
		mask.as_ref(),
		seeds.resample,
		&mut rng
	)?;
	info!("{} seeds from {} available ({} requested)", sample.coords.len(), sample.available, sample.requested);

	let cubes = build_training_set(&volume, &sample.coords, seeds.cube_size, &points, seeds.label_radius)?;

	let name = match &args.name {
		Some(name) => name.clone(),
		None => Path::new(&args.volume)
			.file_stem()
			.map(|stem| stem.to_string_lossy().to_string())
			.unwrap_or_else(|| "cube".to_string())
	};
	save_training_set(&PathBuf::from(&args.out), &name, &cubes)?;

	Ok(())
}
