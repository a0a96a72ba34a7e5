
use std::collections::VecDeque;
use std::path::Path;
use std::process::{Child, Command};
use std::thread;
use std::time::Duration;

use anyhow::{Context, Result};
use tracing::{error, info, warn};

use crate::config::JobConfig;
use crate::job::{CountOrStop, ReportSummary, Sentinel};
use crate::logging::ResultExt;
use crate::tomogram::CacheLayout;


const POLL_INTERVAL: Duration = Duration::from_millis(500);


#[derive(Debug, Clone, Default, PartialEq)]
pub struct BatchSummary {
	pub finished: Vec<ReportSummary>,
	pub failed: Vec<String>,
	/// never started because of a stop request
	pub skipped: Vec<String>
}


struct Worker {
	name: String,
	child: Child
}


/// Launches `exe --log <log> expand-tomo <config> <name> --shared-stop` per tomogram,
/// at most `job.workers` at once. A failed tomogram is logged and the others carry on.
pub fn run_batch(exe: &Path, log: &str, config_path: &Path, job: &JobConfig, names: &[String]) -> Result<BatchSummary> {

	info!("Expanding {} tomograms, {} at a time", names.len(), job.workers);

	let mut pending = names.iter().collect::<VecDeque<_>>();
	let mut running = Vec::<Worker>::new();
	let mut summary = BatchSummary::default();
	let mut stopping = false;

	loop {

		// workers see the stop file themselves, just don't start any more
		if !stopping && job.stop_file.exists() {
			warn!("Stop requested, not starting the {} remaining tomograms", pending.len());
			stopping = true;
			summary.skipped.extend(pending.drain(..).cloned());
		}

		while running.len() < job.workers {
			let Some(name) = pending.pop_front()
				else { break; };
			info!("Starting worker for tomogram {}", name);
			let spawned = Command::new(exe)
				.arg("--log")
				.arg(log)
				.arg("expand-tomo")
				.arg("--shared-stop")
				.arg(config_path)
				.arg(name)
				.spawn()
				.context(format!("Failed to start worker: {}", exe.to_string_lossy()));
			let child = match spawned {
				Ok(child) => child,
				Err(e) => {
					stop_workers(&mut running);
					return Err(e);
				}
			};
			running.push(Worker {
				name: name.clone(),
				child
			});
		}

		if running.is_empty() {
			break;
		}

		// collect any finished workers
		let mut i = 0;
		while i < running.len() {
			let exit = running[i].child.try_wait()
				.context(format!("Failed to check worker for tomogram {}", running[i].name))?;
			let Some(exit) = exit
				else {
					i += 1;
					continue;
				};
			let worker = running.swap_remove(i);
			if exit.success() {
				finish(&worker.name, job, &mut summary);
			} else {
				match exit.code() {
					Some(code) => error!("Tomogram {} failed with exit code {}", worker.name, code),
					None => error!("Tomogram {} worker was killed", worker.name)
				}
				summary.failed.push(worker.name);
			}
		}

		thread::sleep(POLL_INTERVAL);
	}

	// every worker has seen it by now
	if stopping {
		Sentinel::new(&job.stop_file).requested()?;
	}

	info!("Batch done: {} finished, {} failed, {} skipped",
		summary.finished.len(), summary.failed.len(), summary.skipped.len());

	Ok(summary)
}


fn finish(name: &str, job: &JobConfig, summary: &mut BatchSummary) {

	let path = CacheLayout::new(&job.cache_dir, name).report();
	let Ok(report) = ReportSummary::read(&path)
		.context(format!("Tomogram {} finished without a readable report", name))
		.warn_err()
		else {
			summary.failed.push(name.to_string());
			return;
		};

	match report.count_or_stop {
		CountOrStop::Count(count) => info!("Tomogram {}: {} particles after round {}{}",
			name, count, report.last_round, if report.cancelled { " (cancelled)" } else { "" }),
		CountOrStop::Stopped => info!("Tomogram {}: stopped expanding at round {}", name, report.last_round)
	}
	summary.finished.push(report);
}


/// Kills and reaps every running worker, so none outlive a failed batch
fn stop_workers(running: &mut Vec<Worker>) {

	for mut worker in running.drain(..) {
		warn!("Stopping worker for tomogram {}", worker.name);
		let _ = worker.child.kill()
			.context(format!("Failed to kill worker for tomogram {}", worker.name))
			.warn_err();
		let _ = worker.child.wait()
			.context(format!("Failed to reap worker for tomogram {}", worker.name))
			.warn_err();
	}
}


#[cfg(test)]
mod test {

	use galvanic_assert::{assert_that, matchers::*};

	use crate::logging;

	use super::*;


	#[test]
	fn stopped_workers_are_reaped() {
		let _logging = logging::init_test();

		let child = Command::new("sleep")
			.arg("30")
			.spawn()
			.expect("Failed to start sleep");
		let proc_dir = std::path::PathBuf::from(format!("/proc/{}", child.id()));
		let mut running = vec![Worker {
			name: "t1".to_string(),
			child
		}];

		stop_workers(&mut running);

		assert_that!(&running.is_empty(), eq(true));
		// reaped children leave no zombie entry behind
		assert_that!(&proc_dir.exists(), eq(false));
	}


	#[test]
	fn missing_worker_exe() {
		let _logging = logging::init_test();

		let dir = assert_fs::TempDir::new()
			.unwrap();
		let job = JobConfig {
			params_dir: dir.path().join("params"),
			cache_dir: dir.path().join("cache"),
			log_file: dir.path().join("job.log"),
			stop_file: dir.path().join("STOP"),
			workers: 2,
			cpus: 1,
			max_rounds: None,
			tomograms: None
		};
		let names = vec!["t1".to_string(), "t2".to_string()];

		let result = run_batch(&dir.path().join("nope"), "info", &dir.path().join("config.toml"), &job, &names);

		assert_that!(&result.is_err(), eq(true));
	}
}
