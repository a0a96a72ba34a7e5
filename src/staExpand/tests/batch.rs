
mod util;


use std::ffi::OsStr;
use std::fs;
use std::os::unix::fs::PermissionsExt;
use std::path::Path;
use std::process::{Command, ExitStatus};

use assert_fs::TempDir;
use galvanic_assert::{assert_that, matchers::*};
use indoc::{formatdoc, indoc};

use sta_expand::geometry::{Angles, Point};
use sta_expand::job::{CountOrStop, ReportSummary};
use sta_expand::logging;
use sta_expand::params::SearchSchedule;
use sta_expand::tomogram::CacheLayout;

use util::{write_tomogram, JobSettings};


/// Shell stand-ins for the aligner suite, model files are point lists here too
fn write_tools(dir: &Path, iterations: usize) -> String {

	let scripts = [
		("prmParser", "exit 0\n".to_string()),
		("processchunks", formatdoc! {r#"
			motl=$(sed -n "s/^initMOTL = {{'\(.*\)'}}$/\1/p" "$3.prm")
			cp "$motl" "$3_MOTL_Tom1_Iter{}.csv"
		"#, iterations + 1}),
		("createAlignedModel", indoc! {r#"
			model=$(sed -n "s/^fnModParticle = {'\(.*\)'}$/\1/p" "$1")
			cp "$model" "$(basename "$1" .prm)_Tom1_Iter$2.mod"
		"#}.to_string()),
		("model2point", "cp \"$3\" \"$5\"\n".to_string()),
		("point2model", "cp \"$5\" \"$7\"\n".to_string())
	];

	let mut toml = String::from("[tools]\n");
	for (name, body) in scripts {
		let path = dir.join(name);
		fs::write(&path, format!("#!/bin/sh\nset -e\n{}", body)).unwrap();
		fs::set_permissions(&path, fs::Permissions::from_mode(0o755)).unwrap();
		let key = match name {
			"prmParser" => "prm_parser",
			"createAlignedModel" => "create_aligned_model",
			other => other
		};
		toml.push_str(&format!("{} = \"{}\"\n", key, path.to_string_lossy()));
	}
	toml
}


fn run(args: impl IntoIterator<Item = impl AsRef<OsStr>>) -> ExitStatus {
	Command::new(util::bin_path())
		.args(args)
		.spawn()
		.expect("Failed to spawn process")
		.wait()
		.expect("Failed to wait for process")
}


#[test]
fn help() {
	let _logging = logging::init_test();
	let exit = run(["--help"]);
	assert_that!(&exit.success(), eq(true));
}


#[test]
fn batch_survives_a_bad_tomogram() {
	let _logging = logging::init_test();

	let dir = TempDir::new().unwrap();
	let tools_dir = dir.path().join("tools");
	fs::create_dir_all(&tools_dir).unwrap();

	let points = (0 .. 8)
		.map(|i| Point::new(40.0 + 25.0*i as f64, 100.0, 100.0))
		.collect::<Vec<_>>();
	write_tomogram(&dir.path().join("params"), "good", [250, 200, 200], 2.0, &points, &[Angles::ZERO; 8]);

	// listed, but its model file is missing
	write_tomogram(&dir.path().join("params"), "bad", [250, 200, 200], 2.0, &points, &[Angles::ZERO; 8]);
	fs::remove_file(dir.path().join("params/bad.mod")).unwrap();

	let mut settings = JobSettings {
		// 20 Å is 10 voxels here
		distance_threshold: 20.0,
		offsets: vec![[0.0, 0.0, 20.0]],
		.. JobSettings::default()
	};
	let config = settings.write(dir.path());
	let iterations = SearchSchedule::build(config.search().unwrap()).iterations();
	settings.extra = format!("{}\n", write_tools(&tools_dir, iterations));
	let toml = settings.toml()
		.replace("max_rounds = 1", "max_rounds = 1\nworkers = 2\ntomograms = [\"bad\", \"good\"]");
	let config_path = dir.path().join("config.toml");
	fs::write(&config_path, toml).unwrap();

	let exit = run([OsStr::new("expand"), config_path.as_os_str()]);
	assert_that!(&exit.success(), eq(true));

	let cache = dir.path().join("cache");
	let report = ReportSummary::read(CacheLayout::new(&cache, "good").report())
		.expect("Failed to read report");
	assert_that!(&report.tomogram.as_str(), eq("good"));
	assert_that!(&report.last_round, eq(0));
	assert_that!(&report.count_or_stop, eq(CountOrStop::Count(8)));
	assert_that!(&CacheLayout::new(&cache, "good").exp_files(0).is_complete(), eq(true));

	assert_that!(&CacheLayout::new(&cache, "bad").report().exists(), eq(false));

	// both workers logged to the job log
	let log = fs::read_to_string(cache.join("expand.log"))
		.expect("Failed to read job log");
	assert_that!(&log.contains("bad"), eq(true));
	assert_that!(&log.contains("good"), eq(true));
}


#[test]
fn stopped_batch_starts_nothing() {
	let _logging = logging::init_test();

	let dir = TempDir::new().unwrap();
	let points = vec![Point::new(100.0, 100.0, 100.0)];
	write_tomogram(&dir.path().join("params"), "t1", [200, 200, 200], 1.0, &points, &[Angles::ZERO]);
	JobSettings::default().write(dir.path());

	let stop_file = dir.path().join("cache/STOP");
	fs::create_dir_all(stop_file.parent().unwrap()).unwrap();
	fs::write(&stop_file, "").unwrap();

	let exit = run([OsStr::new("expand"), dir.path().join("config.toml").as_os_str()]);
	assert_that!(&exit.success(), eq(true));
	assert_that!(&stop_file.exists(), eq(false));
	assert_that!(&CacheLayout::new(dir.path().join("cache"), "t1").report().exists(), eq(false));
}
