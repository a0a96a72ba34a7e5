
use std::path::PathBuf;

use anyhow::{bail, Result};
use gumdrop::Options;
use tracing::info;

use crate::config::Config;
use crate::extract::{decluster, write_patches};
use crate::mrc::Volume;


#[derive(Options)]
pub struct Args {

	/// Path to the config file with a [decluster] section
	#[options(free, required)]
	pub config: String,

	/// Probability maps of one tomogram, each carrying its crop origin
	#[options(free)]
	pub maps: Vec<String>,

	/// Name of the tomogram, used for the output files
	#[options(required)]
	pub name: String,

	/// Folder for the particles and patches
	#[options(required)]
	pub out: String
}


pub fn run(args: Args) -> Result<()> {

	if args.maps.is_empty() {
		bail!("No probability maps given");
	}

	let config = Config::read(&args.config)?;
	let params = config.decluster()?.params();

	let maps = args.maps.iter()
		.map(|path| Volume::read(path))
		.collect::<Result<Vec<_>>>()?;

	let patches = decluster(&maps, &params);
	info!("Tomogram {}: {} patches from {} maps", args.name, patches.len(), maps.len());

	write_patches(&PathBuf::from(&args.out), &args.name, &patches)?;

	Ok(())
}
