
use std::ops::Deref;
use std::process::ExitCode;

use anyhow::{bail, Result};
use display_error_chain::ErrorChainExt;
use gumdrop::Options;

use sta_expand::commands;
use sta_expand::config::Config;
use sta_expand::logging::{self, ResultExt};


#[derive(Options)]
struct Args {

	#[options(help_flag)]
	help: bool,

	/// settings for log output
	#[options(default = "sta_expand=info")]
	log: String,

	#[options(command)]
	cmd: Option<Command>
}

#[derive(Options)]
enum Command {

	/// Expand every tomogram of a job, each in its own worker process
	Expand(commands::expand::Args),

	/// Expand a single tomogram
	ExpandTomo(commands::expand_tomo::Args),

	/// Sample seeds and save subtomogram and label cubes for detector training
	Extract(commands::extract::Args),

	/// Turn a tomogram's probability maps into particles and patches
	Decluster(commands::decluster::Args)
}


fn main() -> ExitCode {

	// parse arguments
	let args = Args::parse_args_default_or_exit();

	// init logging, nothing can log the error yet if that fails
	if let Err(e) = init_logging(&args) {
		eprintln!("{}", e.deref().chain());
		return ExitCode::FAILURE;
	}

	let Ok(_) = run(args)
		.log_err()
		else { return ExitCode::FAILURE; };

	ExitCode::SUCCESS
}


/// expansion jobs also append to the job log
fn init_logging(args: &Args) -> Result<()> {

	let config = match &args.cmd {
		Some(Command::Expand(cmd)) => Some(&cmd.config),
		Some(Command::ExpandTomo(cmd)) => Some(&cmd.config),
		_ => None
	};

	match config {
		Some(path) => {
			let config = Config::read(path)?;
			logging::init_job(&args.log, &config.job()?.log_file)
		}
		None => logging::init(&args.log)
	}
}


#[tracing::instrument(skip_all, level = 5, name = "StaExpand")]
fn run(args: Args) -> Result<()> {
	match args.cmd {
		Some(Command::Expand(cmd)) => commands::expand::run(&args.log, cmd),
		Some(Command::ExpandTomo(cmd)) => commands::expand_tomo::run(cmd),
		Some(Command::Extract(cmd)) => commands::extract::run(cmd),
		Some(Command::Decluster(cmd)) => commands::decluster::run(cmd),
		None => bail!("No command, try one of:\n{}", Args::command_list().unwrap_or(""))
	}
}
