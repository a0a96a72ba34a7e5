
#![allow(dead_code)]

use std::cell::RefCell;
use std::fs::{self, OpenOptions};
use std::io::{Seek, SeekFrom};
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use byteorder::{WriteBytesExt, LE};
use indoc::formatdoc;

use sta_expand::aligner::{self, Invocation, RunOutput, Runner};
use sta_expand::config::Config;
use sta_expand::geometry::{rotated_y_axis, Angles, Point};
use sta_expand::motl::{write_points, write_rot_axes, MotionList, MotlRow};
use sta_expand::mrc::Volume;


pub fn bin_path() -> &'static Path {
	let bin_path = Path::new(env!("CARGO_BIN_EXE_sta-expand"));
	if !bin_path.exists() {
		panic!("Target binary not found at: {:?}", bin_path);
	}
	bin_path
}


/// Stands in for the aligner suite. Model files are point lists here,
/// and alignment leaves every particle where it was.
#[derive(Default)]
pub struct FakeAligner {
	pub calls: RefCell<Vec<Invocation>>
}

impl FakeAligner {

	pub fn programs(&self) -> Vec<String> {
		self.calls.borrow()
			.iter()
			.map(|inv| inv.program.clone())
			.collect()
	}
}

impl Runner for FakeAligner {

	fn run(&self, inv: &Invocation) -> Result<RunOutput> {

		self.calls.borrow_mut().push(inv.clone());
		let arg = |i: usize| inv.cwd.join(&inv.args[i]);

		match inv.program.as_str() {
			"prmParser" => (),
			"processchunks" => {
				let prm = inv.cwd.join(aligner::prm_file_name(&inv.args[2]));
				fs::copy(prm_value(&prm, "initMOTL")?, &inv.outputs[0])?;
			}
			"createAlignedModel" => {
				fs::copy(prm_value(&arg(0), "fnModParticle")?, &inv.outputs[0])?;
			}
			"model2point" => {
				fs::copy(arg(2), arg(4))?;
			}
			"point2model" => {
				fs::copy(arg(4), arg(6))?;
			}
			program => bail!("Unexpected program: {}", program)
		}

		let out = RunOutput::default();
		aligner::check_outputs(inv, &out)?;
		Ok(out)
	}
}


/// reads a path out of a `key = {'path'}` line
pub fn prm_value(prm: &Path, key: &str) -> Result<PathBuf> {
	let content = fs::read_to_string(prm)
		.context(format!("Failed to read {}", prm.to_string_lossy()))?;
	let prefix = format!("{} = {{'", key);
	content.lines()
		.find_map(|line| line.strip_prefix(&prefix))
		.and_then(|rest| rest.strip_suffix("'}"))
		.map(PathBuf::from)
		.context(format!("No {} in {}", key, prm.to_string_lossy()))
}


/// An MRC file that's all header: the real voxels would only slow the tests down
pub fn fake_volume(path: &Path, shape: [usize; 3], pixel_size: f64) {
	Volume::new(1, 1, 1, pixel_size)
		.save(path)
		.expect("Failed to save volume");
	let mut file = OpenOptions::new()
		.write(true)
		.open(path)
		.expect("Failed to open volume");
	file.seek(SeekFrom::Start(0)).unwrap();
	for n in shape {
		file.write_i32::<LE>(n as i32).unwrap();
	}
	// keep the pixel size: sampling and cell both scale
	file.seek(SeekFrom::Start(4*7)).unwrap();
	for n in shape {
		file.write_i32::<LE>(n as i32).unwrap();
	}
	for n in shape {
		file.write_f32::<LE>((n as f64*pixel_size) as f32).unwrap();
	}
}


/// Writes the initial picks for a tomogram into the params folder
pub fn write_tomogram(params_dir: &Path, name: &str, shape: [usize; 3], pixel_size: f64, points: &[Point], angles: &[Angles]) {

	fs::create_dir_all(params_dir).unwrap();
	fake_volume(&params_dir.join(format!("{}.mrc", name)), shape, pixel_size);
	write_points(params_dir.join(format!("{}.mod", name)), points).unwrap();

	let mut motl = MotionList::with_default_header();
	for (i, a) in angles.iter().enumerate() {
		motl.rows.push(MotlRow::new(i as u32 + 1, *a));
	}
	motl.write(params_dir.join(format!("{}_MOTL.csv", name))).unwrap();

	let axes = angles.iter()
		.map(|a| rotated_y_axis(&a.matrix()))
		.collect::<Vec<_>>();
	write_rot_axes(params_dir.join(format!("{}_RotAxes.csv", name)), &axes).unwrap();
}


pub struct JobSettings {
	pub max_rounds: usize,
	pub distance_threshold: f64,
	pub min_count: usize,
	pub max_particles: usize,
	pub offsets: Vec<[f64; 3]>,
	/// extra TOML appended as-is
	pub extra: String
}

impl Default for JobSettings {
	fn default() -> Self {
		Self {
			max_rounds: 1,
			distance_threshold: 15.0,
			min_count: 5,
			max_particles: 1000,
			offsets: vec![[20.0, 0.0, 0.0]],
			extra: String::new()
		}
	}
}

impl JobSettings {

	pub fn toml(&self) -> String {
		let offsets = self.offsets.iter()
			.map(|o| format!("[{:?}, {:?}, {:?}]", o[0], o[1], o[2]))
			.collect::<Vec<_>>()
			.join(", ");
		formatdoc! {r#"
			[job]
			params_dir = "params"
			cache_dir = "cache"
			max_rounds = {max_rounds}

			[search]
			reference = "ref.mrc"
			mask = "mask.mrc"
			box_size = [32, 32, 32]
			rotation_range = [9, 9, 9]
			rotation_step = 3
			translation_radius = [4, 4, 4]
			ref_threshold = 100

			[expand]
			distance_threshold = {threshold:?}
			min_count = {min_count}
			max_particles = {max_particles}
			offsets = [{offsets}]

			{extra}
		"#,
			max_rounds = self.max_rounds,
			threshold = self.distance_threshold,
			min_count = self.min_count,
			max_particles = self.max_particles,
			offsets = offsets,
			extra = self.extra
		}
	}

	/// writes the config file into `root` and reads it back
	pub fn write(&self, root: &Path) -> Config {
		let path = root.join("config.toml");
		fs::write(&path, self.toml()).unwrap();
		Config::read(&path).expect("Failed to read config")
	}
}


/// every pair at least `threshold` apart
pub fn min_pair_distance(points: &[Point]) -> f64 {
	let mut min = f64::INFINITY;
	for i in 0 .. points.len() {
		for j in i + 1 .. points.len() {
			min = min.min((points[i] - points[j]).norm());
		}
	}
	min
}
