
pub mod logging;
pub mod config;

pub mod mrc;
pub mod geometry;
pub mod cluster;
pub mod motl;
pub mod aligner;
pub mod params;
pub mod tomogram;
pub mod expand;
pub mod extract;
pub mod detect;
pub mod job;
pub mod batch;

pub mod commands {
	pub mod expand;
	pub mod expand_tomo;
	pub mod extract;
	pub mod decluster;
}
