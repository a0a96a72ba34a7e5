
use std::fmt;
use std::path::{Path, PathBuf};
use std::process::Command;

use anyhow::{bail, Context, Result};
use tracing::{debug, info};


/// An executable, its argument vector, the folder it runs in, and the files it should leave behind
#[derive(Debug, Clone, PartialEq)]
pub struct Invocation {
	pub program: String,
	pub args: Vec<String>,
	pub cwd: PathBuf,
	pub outputs: Vec<PathBuf>
}

impl Invocation {

	pub fn new(program: impl Into<String>, cwd: impl Into<PathBuf>) -> Self {
		Self {
			program: program.into(),
			args: Vec::new(),
			cwd: cwd.into(),
			outputs: Vec::new()
		}
	}

	pub fn arg(mut self, arg: impl AsRef<Path>) -> Self {
		self.args.push(arg.as_ref().to_string_lossy().to_string());
		self
	}

	pub fn output(mut self, path: impl Into<PathBuf>) -> Self {
		self.outputs.push(path.into());
		self
	}

	/// true when the call has outputs and all of them already exist
	pub fn is_done(&self) -> bool {
		!self.outputs.is_empty()
			&& self.outputs.iter().all(|path| path.exists())
	}
}

impl fmt::Display for Invocation {
	fn fmt(&self, f: &mut fmt::Formatter<'_>) -> fmt::Result {
		write!(f, "{} {:?} (in {})", self.program, self.args, self.cwd.to_string_lossy())
	}
}


#[derive(Debug, Clone, Default)]
pub struct RunOutput {
	pub stdout: String,
	pub stderr: String
}


pub trait Runner {
	/// runs the invocation to completion, failing if it exits badly or leaves any output missing
	fn run(&self, invocation: &Invocation) -> Result<RunOutput>;
}


/// Runs invocations as blocking child processes
pub struct ProcessRunner;

impl Runner for ProcessRunner {

	fn run(&self, invocation: &Invocation) -> Result<RunOutput> {

		info!("Running command: {}", invocation);

		let output = Command::new(&invocation.program)
			.args(&invocation.args)
			.current_dir(&invocation.cwd)
			.output()
			.context(format!("Failed to run command: {}", invocation))?;

		let out = RunOutput {
			stdout: String::from_utf8_lossy(&output.stdout).to_string(),
			stderr: String::from_utf8_lossy(&output.stderr).to_string()
		};
		debug!("{} stdout:\n{}", invocation.program, &out.stdout);

		if !output.status.success() {
			match output.status.code() {
				Some(code) => bail!("command {} exited with code: {}\nSTDOUT:\n{}\nSTDERR:\n{}", invocation, code, out.stdout, out.stderr),
				None => bail!("command {} was killed\nSTDOUT:\n{}\nSTDERR:\n{}", invocation, out.stdout, out.stderr)
			}
		}

		check_outputs(invocation, &out)?;

		Ok(out)
	}
}


pub fn check_outputs(invocation: &Invocation, out: &RunOutput) -> Result<()> {
	for path in &invocation.outputs {
		if !path.exists() {
			bail!("command {} did not produce {}\nSTDOUT:\n{}", invocation, path.to_string_lossy(), out.stdout);
		}
	}
	Ok(())
}


/// Runs the invocation unless its outputs are already there
pub fn run_once(runner: &dyn Runner, invocation: &Invocation) -> Result<()> {
	if invocation.is_done() {
		debug!("Outputs already exist, skipping: {}", invocation);
		return Ok(());
	}
	runner.run(invocation)?;
	Ok(())
}


/// Executable names, resolved through PATH unless given as paths
#[derive(Debug, Clone, PartialEq)]
pub struct Tools {
	pub prm_parser: String,
	pub processchunks: String,
	pub create_aligned_model: String,
	pub model2point: String,
	pub point2model: String
}

impl Default for Tools {
	fn default() -> Self {
		Self {
			prm_parser: "prmParser".to_string(),
			processchunks: "processchunks".to_string(),
			create_aligned_model: "createAlignedModel".to_string(),
			model2point: "model2point".to_string(),
			point2model: "point2model".to_string()
		}
	}
}

impl Tools {

	/// turns the parameter file into the aligner's per-chunk command files
	pub fn prm_parser(&self, dir: &Path, name: &str) -> Invocation {
		Invocation::new(&self.prm_parser, dir)
			.arg(prm_file_name(name))
	}

	/// runs every alignment iteration, sharded across `cpus` local workers
	pub fn processchunks(&self, dir: &Path, name: &str, cpus: usize, iterations: usize) -> Invocation {
		let machines = vec!["localhost"; cpus.max(1)].join(",");
		Invocation::new(&self.processchunks, dir)
			.arg("-g")
			.arg(machines)
			.arg(name)
			.output(dir.join(final_motl_name(name, iterations)))
	}

	/// applies the final motion list to the particle model
	pub fn create_aligned_model(&self, dir: &Path, name: &str, iterations: usize) -> Invocation {
		Invocation::new(&self.create_aligned_model, dir)
			.arg(prm_file_name(name))
			.arg((iterations + 1).to_string())
			.output(dir.join(aligned_model_name(name, iterations)))
	}

	pub fn model2point(&self, dir: &Path, model: &Path, points: &Path) -> Invocation {
		Invocation::new(&self.model2point, dir)
			.arg("-float")
			.arg("-input")
			.arg(model)
			.arg("-output")
			.arg(points)
			.output(points)
	}

	pub fn point2model(&self, dir: &Path, points: &Path, model: &Path) -> Invocation {
		Invocation::new(&self.point2model, dir)
			.arg("-scat")
			.arg("-sphere")
			.arg("5")
			.arg("-input")
			.arg(points)
			.arg("-output")
			.arg(model)
			.output(model)
	}
}


pub fn prm_file_name(name: &str) -> String {
	format!("{}.prm", name)
}

/// the aligner numbers its outputs after the iteration that would come next
pub fn final_motl_name(name: &str, iterations: usize) -> String {
	format!("{}_MOTL_Tom1_Iter{}.csv", name, iterations + 1)
}

pub fn aligned_model_name(name: &str, iterations: usize) -> String {
	format!("{}_Tom1_Iter{}.mod", name, iterations + 1)
}

pub fn aligned_points_name(name: &str) -> String {
	format!("{}_aligned.pts", name)
}


#[cfg(test)]
mod test {

	use galvanic_assert::{assert_that, matchers::*};

	use super::*;


	#[test]
	fn processchunks_args() {
		let dir = Path::new("/data/cache/t1_cache/round_2");
		let inv = Tools::default().processchunks(dir, "t1", 3, 4);
		assert_that!(&inv.program.as_str(), eq("processchunks"));
		assert_that!(&inv.args, eq(vec![
			"-g".to_string(),
			"localhost,localhost,localhost".to_string(),
			"t1".to_string()
		]));
		assert_that!(&inv.outputs, eq(vec![dir.join("t1_MOTL_Tom1_Iter5.csv")]));
	}

	#[test]
	fn model2point_args() {
		let dir = Path::new("/tmp");
		let inv = Tools::default().model2point(dir, Path::new("a.mod"), Path::new("a.pts"));
		let joined = inv.args.join(" ");
		assert_that!(&joined.as_str(), eq("-float -input a.mod -output a.pts"));
		assert_that!(&inv.is_done(), eq(false));
	}

	#[test]
	fn missing_program() {
		let inv = Invocation::new("this-program-does-not-exist-anywhere", "/tmp");
		assert_that!(&ProcessRunner.run(&inv).is_err(), eq(true));
	}
}
