
use std::fs;
use std::path::{Path, PathBuf};

use anyhow::{bail, Context, Result};
use toml::{Table, Value};

use crate::aligner::Tools;
use crate::expand::{ExpandParams, DEFAULT_MIN_COUNT};
use crate::extract::DeclusterParams;
use crate::geometry::Point;
use crate::params::SearchParams;


/// Config is the contents of the job's TOML file.
/// Each command only needs some of the sections, so they're checked on use.
#[derive(Debug, Clone, PartialEq)]
pub struct Config {
	job: Option<JobConfig>,
	search: Option<SearchParams>,
	expand: Option<ExpandConfig>,
	pub tools: Tools,
	seeds: Option<SeedsConfig>,
	decluster: Option<DeclusterConfig>
}

#[derive(Debug, Clone, PartialEq)]
pub struct JobConfig {
	pub params_dir: PathBuf,
	pub cache_dir: PathBuf,
	pub log_file: PathBuf,
	pub stop_file: PathBuf,
	/// tomograms processed at once
	pub workers: usize,
	/// handed to the aligner, per tomogram
	pub cpus: usize,
	pub max_rounds: Option<usize>,
	pub tomograms: Option<Vec<String>>
}

#[derive(Debug, Clone, PartialEq)]
pub struct ExpandConfig {
	pub params: ExpandParams,
	pub max_particles: Option<usize>,
	/// overrides the volume header's pixel size
	pub pixel_size: Option<f64>
}

#[derive(Debug, Clone, PartialEq)]
pub struct SeedsConfig {
	pub target_count: usize,
	pub cube_size: usize,
	pub resample: bool,
	pub rng_seed: Option<u64>,
	/// in voxels
	pub label_radius: f64
}

#[derive(Debug, Clone, PartialEq)]
pub struct DeclusterConfig {
	pub probability_threshold: f32,
	pub label_radius: f64,
	pub repeat_unit: f64,
	pub min_patch_size: usize
}

impl DeclusterConfig {

	pub fn params(&self) -> DeclusterParams {
		DeclusterParams {
			probability_threshold: self.probability_threshold,
			.. DeclusterParams::from_unit(self.label_radius, self.repeat_unit, self.min_patch_size)
		}
	}
}


impl Config {

	pub fn read(path: impl AsRef<Path>) -> Result<Self> {

		let path = path.as_ref();
		let toml = fs::read_to_string(path)
			.with_context(|| format!("Failed to read config file at: {}", path.to_string_lossy()))?;

		// relative paths are relative to the config file
		let base = path.parent()
			.unwrap_or(Path::new("."));

		Self::parse(&toml, base)
			.with_context(|| format!("Failed to parse config file at: {}", path.to_string_lossy()))
	}

	pub fn parse(toml: &str, base: &Path) -> Result<Self> {

		let toml = toml.parse::<Table>()?;
		let fields = Fields { base };

		// read the job section
		let job = match fields.section(&toml, "job")? {
			None => None,
			Some(t) => {
				let cache_dir = fields.path(t, "job", "cache_dir")?;
				Some(JobConfig {
					params_dir: fields.path(t, "job", "params_dir")?,
					log_file: fields.path_or(t, "job", "log_file", cache_dir.join("expand.log"))?,
					stop_file: fields.path_or(t, "job", "stop_file", cache_dir.join("STOP"))?,
					workers: fields.usize_or(t, "job", "workers", 1)?.max(1),
					cpus: fields.usize_or(t, "job", "cpus", 1)?.max(1),
					max_rounds: fields.opt_usize(t, "job", "max_rounds")?,
					tomograms: fields.opt_strings(t, "job", "tomograms")?,
					cache_dir
				})
			}
		};

		// read the search section
		let search = match fields.section(&toml, "search")? {
			None => None,
			Some(t) => Some(SearchParams {
				reference: fields.path(t, "search", "reference")?,
				mask: fields.path(t, "search", "mask")?,
				box_size: fields.u32s(t, "search", "box_size")?,
				rotation_range: fields.u32s(t, "search", "rotation_range")?,
				rotation_step: fields.u32(t, "search", "rotation_step")?,
				translation_radius: fields.f64s(t, "search", "translation_radius")?,
				low_cutoff: fields.f64s_or(t, "search", "low_cutoff", [0.0, 0.05])?,
				high_cutoff: fields.f64s_or(t, "search", "high_cutoff", [0.1, 0.05])?,
				ref_threshold: fields.u32(t, "search", "ref_threshold")?,
				tilt_range: fields.f64s_or(t, "search", "tilt_range", [-60.0, 60.0])?
			})
		};

		// read the expand section
		let expand = match fields.section(&toml, "expand")? {
			None => None,
			Some(t) => {
				let offsets = t.get("offsets")
					.context("Missing expand.offsets")?
					.as_array()
					.context("expand.offsets was not an array")?
					.iter()
					.enumerate()
					.map(|(i, offset)| {
						let v = numbers::<3>(offset)
							.with_context(|| format!("expand.offsets[{}] was not an [x, y, z] array", i))?;
						Ok(Point::new(v[0], v[1], v[2]))
					})
					.collect::<Result<Vec<_>>>()?;
				Some(ExpandConfig {
					params: ExpandParams {
						distance_threshold: fields.f64(t, "expand", "distance_threshold")?,
						min_count: fields.usize_or(t, "expand", "min_count", DEFAULT_MIN_COUNT)?,
						offsets
					},
					max_particles: fields.opt_usize(t, "expand", "max_particles")?,
					pixel_size: fields.opt_f64(t, "expand", "pixel_size")?
				})
			}
		};

		// read the tools section
		let tools = {
			let defaults = Tools::default();
			match fields.section(&toml, "tools")? {
				None => defaults,
				Some(t) => Tools {
					prm_parser: fields.string_or(t, "tools", "prm_parser", defaults.prm_parser)?,
					processchunks: fields.string_or(t, "tools", "processchunks", defaults.processchunks)?,
					create_aligned_model: fields.string_or(t, "tools", "create_aligned_model", defaults.create_aligned_model)?,
					model2point: fields.string_or(t, "tools", "model2point", defaults.model2point)?,
					point2model: fields.string_or(t, "tools", "point2model", defaults.point2model)?
				}
			}
		};

		// read the seeds section
		let seeds = match fields.section(&toml, "seeds")? {
			None => None,
			Some(t) => Some(SeedsConfig {
				target_count: fields.usize(t, "seeds", "target_count")?,
				cube_size: fields.positive_usize(t, "seeds", "cube_size")?,
				resample: fields.bool_or(t, "seeds", "resample", false)?,
				rng_seed: fields.opt_usize(t, "seeds", "rng_seed")?
					.map(|seed| seed as u64),
				label_radius: fields.positive_f64(t, "seeds", "label_radius")?
			})
		};

		// read the decluster section
		let decluster = match fields.section(&toml, "decluster")? {
			None => None,
			Some(t) => Some(DeclusterConfig {
				probability_threshold: fields.opt_f64(t, "decluster", "probability_threshold")?
					.map(|p| p as f32)
					.unwrap_or(DeclusterParams::DEFAULT_THRESHOLD),
				label_radius: fields.f64(t, "decluster", "label_radius")?,
				repeat_unit: fields.f64(t, "decluster", "repeat_unit")?,
				min_patch_size: fields.usize_or(t, "decluster", "min_patch_size", 1)?
			})
		};

		Ok(Config {
			job,
			search,
			expand,
			tools,
			seeds,
			decluster
		})
	}

	pub fn job(&self) -> Result<&JobConfig> {
		self.job.as_ref()
			.context("Missing [job] section from config file")
	}

	pub fn search(&self) -> Result<&SearchParams> {
		self.search.as_ref()
			.context("Missing [search] section from config file")
	}

	pub fn expand(&self) -> Result<&ExpandConfig> {
		self.expand.as_ref()
			.context("Missing [expand] section from config file")
	}

	pub fn seeds(&self) -> Result<&SeedsConfig> {
		self.seeds.as_ref()
			.context("Missing [seeds] section from config file")
	}

	pub fn decluster(&self) -> Result<&DeclusterConfig> {
		self.decluster.as_ref()
			.context("Missing [decluster] section from config file")
	}
}


impl JobConfig {

	/// The configured tomograms, or else every `{name}.mod` in the params folder
	pub fn tomogram_names(&self) -> Result<Vec<String>> {

		if let Some(names) = &self.tomograms {
			return Ok(names.clone());
		}

		let mut names = fs::read_dir(&self.params_dir)
			.context(format!("Failed to read params folder: {}", self.params_dir.to_string_lossy()))?
			.filter_map(|entry| entry.ok())
			.filter_map(|entry| {
				entry.file_name()
					.to_str()
					.and_then(|file_name| file_name.strip_suffix(".mod"))
					.map(str::to_string)
			})
			.collect::<Vec<_>>();
		names.sort();

		Ok(names)
	}
}


/// Reads typed values out of a section, naming `section.key` in every error
struct Fields<'a> {
	base: &'a Path
}

impl<'a> Fields<'a> {

	fn section<'t>(&self, toml: &'t Table, name: &str) -> Result<Option<&'t Table>> {
		match toml.get(name) {
			None => Ok(None),
			Some(value) => value.as_table()
				.map(Some)
				.with_context(|| format!("{} key is not a table", name))
		}
	}

	fn value<'t>(&self, t: &'t Table, section: &str, key: &str) -> Result<&'t Value> {
		t.get(key)
			.with_context(|| format!("Missing {}.{}", section, key))
	}

	fn string(&self, t: &Table, section: &str, key: &str) -> Result<String> {
		self.value(t, section, key)?
			.as_str()
			.map(str::to_string)
			.with_context(|| format!("{}.{} was not a string", section, key))
	}

	fn string_or(&self, t: &Table, section: &str, key: &str, default: String) -> Result<String> {
		match t.get(key) {
			None => Ok(default),
			Some(_) => self.string(t, section, key)
		}
	}

	fn opt_strings(&self, t: &Table, section: &str, key: &str) -> Result<Option<Vec<String>>> {
		let Some(value) = t.get(key)
			else { return Ok(None); };
		value.as_array()
			.with_context(|| format!("{}.{} was not an array", section, key))?
			.iter()
			.map(|item| {
				item.as_str()
					.map(str::to_string)
					.with_context(|| format!("{}.{} has a non-string item", section, key))
			})
			.collect::<Result<Vec<_>>>()
			.map(Some)
	}

	fn path(&self, t: &Table, section: &str, key: &str) -> Result<PathBuf> {
		Ok(self.base.join(self.string(t, section, key)?))
	}

	fn path_or(&self, t: &Table, section: &str, key: &str, default: PathBuf) -> Result<PathBuf> {
		match t.get(key) {
			None => Ok(default),
			Some(_) => self.path(t, section, key)
		}
	}

	fn opt_usize(&self, t: &Table, section: &str, key: &str) -> Result<Option<usize>> {
		let Some(value) = t.get(key)
			else { return Ok(None); };
		let i = value.as_integer()
			.with_context(|| format!("{}.{} was not an integer", section, key))?;
		if i < 0 {
			bail!("{}.{} can't be negative: {}", section, key, i);
		}
		Ok(Some(i as usize))
	}

	fn usize(&self, t: &Table, section: &str, key: &str) -> Result<usize> {
		self.opt_usize(t, section, key)?
			.with_context(|| format!("Missing {}.{}", section, key))
	}

	fn usize_or(&self, t: &Table, section: &str, key: &str, default: usize) -> Result<usize> {
		Ok(self.opt_usize(t, section, key)?
			.unwrap_or(default))
	}

	fn positive_usize(&self, t: &Table, section: &str, key: &str) -> Result<usize> {
		let i = self.usize(t, section, key)?;
		if i == 0 {
			bail!("{}.{} must be positive", section, key);
		}
		Ok(i)
	}

	fn u32(&self, t: &Table, section: &str, key: &str) -> Result<u32> {
		let i = self.usize(t, section, key)?;
		u32::try_from(i)
			.with_context(|| format!("{}.{} is too large: {}", section, key, i))
	}

	fn opt_f64(&self, t: &Table, section: &str, key: &str) -> Result<Option<f64>> {
		let Some(value) = t.get(key)
			else { return Ok(None); };
		number(value)
			.map(Some)
			.with_context(|| format!("{}.{} was not a number", section, key))
	}

	fn f64(&self, t: &Table, section: &str, key: &str) -> Result<f64> {
		self.opt_f64(t, section, key)?
			.with_context(|| format!("Missing {}.{}", section, key))
	}

	fn positive_f64(&self, t: &Table, section: &str, key: &str) -> Result<f64> {
		let v = self.f64(t, section, key)?;
		if v.is_nan() || v <= 0.0 {
			bail!("{}.{} must be positive: {}", section, key, v);
		}
		Ok(v)
	}

	fn bool_or(&self, t: &Table, section: &str, key: &str, default: bool) -> Result<bool> {
		match t.get(key) {
			None => Ok(default),
			Some(value) => value.as_bool()
				.with_context(|| format!("{}.{} was not a boolean", section, key))
		}
	}

	fn f64s<const N: usize>(&self, t: &Table, section: &str, key: &str) -> Result<[f64; N]> {
		numbers::<N>(self.value(t, section, key)?)
			.with_context(|| format!("{}.{} was not an array of {} numbers", section, key, N))
	}

	fn f64s_or<const N: usize>(&self, t: &Table, section: &str, key: &str, default: [f64; N]) -> Result<[f64; N]> {
		match t.get(key) {
			None => Ok(default),
			Some(_) => self.f64s(t, section, key)
		}
	}

	fn u32s<const N: usize>(&self, t: &Table, section: &str, key: &str) -> Result<[u32; N]> {
		let values = self.f64s::<N>(t, section, key)?;
		let mut out = [0u32; N];
		for (o, v) in out.iter_mut().zip(values) {
			if v < 0.0 || v.fract() != 0.0 {
				bail!("{}.{} should only have non-negative integers, got {}", section, key, v);
			}
			*o = v as u32;
		}
		Ok(out)
	}
}


/// integers are fine wherever a float is expected
fn number(value: &Value) -> Option<f64> {
	match value {
		Value::Float(f) => Some(*f),
		Value::Integer(i) => Some(*i as f64),
		_ => None
	}
}

fn numbers<const N: usize>(value: &Value) -> Option<[f64; N]> {
	let array = value.as_array()?;
	if array.len() != N {
		return None;
	}
	let mut out = [0.0; N];
	for (o, v) in out.iter_mut().zip(array) {
		*o = number(v)?;
	}
	Some(out)
}


#[cfg(test)]
mod test {

	use galvanic_assert::{assert_that, matchers::*};
	use indoc::indoc;

	use super::*;


	const FULL: &str = indoc! {r#"
		[job]
		params_dir = "params"
		cache_dir = "/scratch/cache"
		workers = 4
		cpus = 8
		max_rounds = 3
		tomograms = ["tilt1", "tilt2"]

		[search]
		reference = "ref.mrc"
		mask = "mask.mrc"
		box_size = [64, 64, 64]
		rotation_range = [180, 30, 180]
		rotation_step = 2
		translation_radius = [10, 10, 10.5]
		ref_threshold = 500

		[expand]
		distance_threshold = 105.0
		max_particles = 200
		offsets = [[0, 0, 10], [0, 0, -10]]

		[tools]
		processchunks = "/opt/peet/bin/processchunks"

		[seeds]
		target_count = 50
		cube_size = 64
		label_radius = 3
		rng_seed = 12

		[decluster]
		label_radius = 2.0
		repeat_unit = 10
		min_patch_size = 3
	"#};

	#[test]
	fn full() {

		let config = Config::parse(FULL, Path::new("/jobs/j1"))
			.expect("Failed to parse config");

		let job = config.job().unwrap();
		assert_that!(&job.params_dir, eq(PathBuf::from("/jobs/j1/params")));
		assert_that!(&job.cache_dir, eq(PathBuf::from("/scratch/cache")));
		assert_that!(&job.stop_file, eq(PathBuf::from("/scratch/cache/STOP")));
		assert_that!(&job.log_file, eq(PathBuf::from("/scratch/cache/expand.log")));
		assert_that!(&job.workers, eq(4));
		assert_that!(&job.max_rounds, eq(Some(3)));
		assert_that!(&job.tomogram_names().unwrap(), eq(vec!["tilt1".to_string(), "tilt2".to_string()]));

		let search = config.search().unwrap();
		assert_that!(&search.rotation_range, eq([180, 30, 180]));
		assert_that!(&search.translation_radius, eq([10.0, 10.0, 10.5]));
		assert_that!(&search.tilt_range, eq([-60.0, 60.0]));

		let expand = config.expand().unwrap();
		assert_that!(&expand.params.min_count, eq(DEFAULT_MIN_COUNT));
		assert_that!(&expand.params.offsets, eq(vec![Point::new(0.0, 0.0, 10.0), Point::new(0.0, 0.0, -10.0)]));
		assert_that!(&expand.pixel_size, eq(None));

		assert_that!(&config.tools.processchunks.as_str(), eq("/opt/peet/bin/processchunks"));
		assert_that!(&config.tools.model2point.as_str(), eq("model2point"));

		let seeds = config.seeds().unwrap();
		assert_that!(&seeds.rng_seed, eq(Some(12)));
		assert_that!(&seeds.resample, eq(false));

		let params = config.decluster().unwrap().params();
		assert_that!(&params.probability_threshold, eq(0.1));
		assert_that!(&params.dedup_distance, eq(7.5));
		assert_that!(&params.patch_distance, eq(12.5));
		assert_that!(&params.min_patch_size, eq(3));
	}

	#[test]
	fn sections_checked_on_use() {
		let config = Config::parse("", Path::new("."))
			.expect("Failed to parse config");
		assert_that!(&config.job().is_err(), eq(true));
		assert_that!(&config.tools, eq(Tools::default()));
	}

	#[test]
	fn bad_values() {

		let missing = indoc! {r#"
			[expand]
			offsets = [[0, 0, 10]]
		"#};
		let err = Config::parse(missing, Path::new(".")).unwrap_err();
		assert_that!(&err.to_string(), eq("Missing expand.distance_threshold".to_string()));

		let short = indoc! {r#"
			[expand]
			distance_threshold = 10
			offsets = [[0, 10]]
		"#};
		assert_that!(&Config::parse(short, Path::new(".")).is_err(), eq(true));

		let negative = indoc! {r#"
			[job]
			params_dir = "p"
			cache_dir = "c"
			workers = -2
		"#};
		assert_that!(&Config::parse(negative, Path::new(".")).is_err(), eq(true));

		let empty_cubes = indoc! {r#"
			[seeds]
			target_count = 10
			cube_size = 0
			label_radius = 3
		"#};
		let err = Config::parse(empty_cubes, Path::new(".")).unwrap_err();
		assert_that!(&err.to_string(), eq("seeds.cube_size must be positive".to_string()));

		let flat_labels = indoc! {r#"
			[seeds]
			target_count = 10
			cube_size = 32
			label_radius = 0
		"#};
		assert_that!(&Config::parse(flat_labels, Path::new(".")).is_err(), eq(true));
	}

	#[test]
	fn tomograms_from_models() {

		let dir = assert_fs::TempDir::new()
			.expect("Failed to create temp dir");
		for file in ["b.mod", "a.mod", "a.mrc", "a_MOTL.csv"] {
			fs::write(dir.path().join(file), "").unwrap();
		}
		let toml = indoc! {r#"
			[job]
			params_dir = "."
			cache_dir = "cache"
		"#};
		let config = Config::parse(toml, dir.path())
			.expect("Failed to parse config");
		assert_that!(&config.job().unwrap().tomogram_names().unwrap(), eq(vec!["a".to_string(), "b".to_string()]));
	}
}
