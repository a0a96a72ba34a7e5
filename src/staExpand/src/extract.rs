
use std::collections::{BTreeSet, HashSet};
use std::f64::consts::PI;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::{debug, info, warn};

use crate::cluster::{cluster_by_count, cluster_by_distance, groups, representatives};
use crate::geometry::{centroid, Point};
use crate::motl::write_points;
use crate::mrc::Volume;


pub type Voxel = [usize; 3];


/// Neighboring activated voxels belong to the same detection, diagonals included
const VOXEL_LINK_DISTANCE: f64 = 1.5;


#[derive(Debug, Clone, PartialEq)]
pub struct SeedSample {
	pub coords: Vec<Voxel>,
	/// eligible voxels before any resampling
	pub available: usize,
	pub requested: usize
}


/// true if a cube of `size` centered on `c` fits inside `n`
fn cube_fits(c: usize, size: usize, n: usize) -> bool {
	c >= size/2 && c + (size - size/2) <= n
}


/// Samples `target_count` cube centers that fit inside the volume and fall on the mask.
/// When `existing` has points, only voxels under (a thinned-out set of) them are eligible.
/// Draws with replacement only if `resample` is set and there are too few eligible voxels.
pub fn sample_seeds(
	shape: [usize; 3],
	target_count: usize,
	cube_size: usize,
	existing: &[Point],
	mask: Option<&Volume>,
	resample: bool,
	rng: &mut fastrand::Rng
) -> Result<SeedSample> {

	if let Some(mask) = mask {
		if mask.shape() != shape {
			bail!("Mask shape {:?} doesn't match the volume shape {:?}", mask.shape(), shape);
		}
	}

	let eligible = |v: &Voxel| -> bool {
		(0 .. 3).all(|i| cube_fits(v[i], cube_size, shape[i]))
			&& mask.map_or(true, |mask| mask.get(v[0], v[1], v[2]) > 0.0)
	};

	// rasterize the thinned-out coordinates, if any
	let occupied =
		if existing.is_empty() {
			None
		} else {
			let keep = representatives(&cluster_by_count(existing, target_count));
			let voxels = keep.into_iter()
				.filter_map(|i| to_voxel(&existing[i], shape))
				.filter(|v| eligible(v))
				.collect::<BTreeSet<_>>()
				.into_iter()
				.collect::<Vec<_>>();
			Some(voxels)
		};

	let available = match &occupied {
		Some(voxels) => voxels.len(),
		None => all_voxels(shape).filter(|v| eligible(v)).count()
	};

	let ranks = choose_ranks(available, target_count, resample, rng);

	// walk the eligible voxels once, picking out the chosen ranks
	let coords = match &occupied {
		Some(voxels) => ranks.iter()
			.map(|&r| voxels[r])
			.collect::<Vec<_>>(),
		None => {
			let mut coords = Vec::with_capacity(ranks.len());
			let mut ranks = ranks.iter().peekable();
			for (r, v) in all_voxels(shape).filter(|v| eligible(v)).enumerate() {
				while ranks.peek() == Some(&&r) {
					coords.push(v);
					ranks.next();
				}
				if ranks.peek().is_none() {
					break;
				}
			}
			coords
		}
	};

	if available < target_count {
		warn!("Only {} of {} requested seeds are available{}", available, target_count,
			if resample { ", resampling" } else { "" });
	} else {
		info!("Sampled {} of {} available seeds", coords.len(), available);
	}

	Ok(SeedSample {
		coords,
		available,
		requested: target_count
	})
}


fn to_voxel(p: &Point, shape: [usize; 3]) -> Option<Voxel> {
	let mut v = [0usize; 3];
	for i in 0 .. 3 {
		let c = p[i].round();
		if !(c >= 0.0 && (c as usize) < shape[i]) {
			return None;
		}
		v[i] = c as usize;
	}
	Some(v)
}


fn all_voxels(shape: [usize; 3]) -> impl Iterator<Item=Voxel> {
	(0 .. shape[2]).flat_map(move |z| {
		(0 .. shape[1]).flat_map(move |y| {
			(0 .. shape[0]).map(move |x| [x, y, z])
		})
	})
}


/// Sorted ranks into `available` items
fn choose_ranks(available: usize, count: usize, resample: bool, rng: &mut fastrand::Rng) -> Vec<usize> {

	if available == 0 {
		return Vec::new();
	}

	if available >= count {
		// Floyd's algorithm: distinct ranks without materializing the whole range
		let mut chosen = HashSet::with_capacity(count);
		for j in (available - count) .. available {
			let t = rng.usize(0 ..= j);
			if !chosen.insert(t) {
				chosen.insert(j);
			}
		}
		let mut ranks = chosen.into_iter().collect::<Vec<_>>();
		ranks.sort();
		ranks
	} else if resample {
		let mut ranks = (0 .. count)
			.map(|_| rng.usize(0 .. available))
			.collect::<Vec<_>>();
		ranks.sort();
		ranks
	} else {
		(0 .. available).collect()
	}
}


/// Copies the cube of `size` around `center`: `size/2` voxels below and `size - size/2` from the center up
pub fn crop_cube(volume: &Volume, center: Voxel, size: usize) -> Result<Volume> {

	let shape = volume.shape();
	for i in 0 .. 3 {
		if !cube_fits(center[i], size, shape[i]) {
			bail!("Cube of size {} at {:?} doesn't fit in volume of shape {:?}", size, center, shape);
		}
	}

	let lo = center.map(|c| c - size/2);
	let mut cube = Volume::new(size, size, size, volume.pixel_size());
	for z in 0 .. size {
		for y in 0 .. size {
			for x in 0 .. size {
				cube.set(x, y, z, volume.get(lo[0] + x, lo[1] + y, lo[2] + z));
			}
		}
	}

	let origin = volume.origin();
	cube.set_origin([
		origin[0] + lo[0] as f64,
		origin[1] + lo[1] as f64,
		origin[2] + lo[2] as f64
	]);

	Ok(cube)
}


#[derive(Debug, Clone, PartialEq)]
pub struct DeclusterParams {
	pub probability_threshold: f32,
	/// detections with fewer activated voxels are noise
	pub min_activated_voxels: usize,
	/// detections closer than this are the same particle, in voxels
	pub dedup_distance: f64,
	/// particles closer than this are the same patch, in voxels
	pub patch_distance: f64,
	pub min_patch_size: usize
}

impl DeclusterParams {

	pub const DEFAULT_THRESHOLD: f32 = 0.1;

	/// Derives the distances from the label radius and the lattice repeat unit (both in voxels)
	pub fn from_unit(label_radius: f64, repeat_unit: f64, min_patch_size: usize) -> Self {
		Self {
			probability_threshold: Self::DEFAULT_THRESHOLD,
			min_activated_voxels: (label_radius.powi(3)*4.0*PI/3.0*0.5) as usize,
			dedup_distance: 0.75*repeat_unit,
			patch_distance: 1.25*repeat_unit,
			min_patch_size
		}
	}
}


/// A spatially connected group of particles
#[derive(Debug, Clone, PartialEq)]
pub struct Patch {
	pub particles: Vec<Point>
}


/// Centroids of the map's detections, in the tomogram's frame
pub fn map_particles(map: &Volume, params: &DeclusterParams) -> Vec<Point> {

	let voxels = map.iter()
		.filter(|(_, _, _, v)| *v > params.probability_threshold)
		.map(|(x, y, z, _)| Point::new(x as f64, y as f64, z as f64))
		.collect::<Vec<_>>();
	if voxels.len() <= params.min_activated_voxels {
		return Vec::new();
	}

	let origin = map.origin();
	let origin = Point::new(origin[0], origin[1], origin[2]);

	groups(&cluster_by_distance(&voxels, VOXEL_LINK_DISTANCE))
		.into_iter()
		.filter(|members| members.len() >= params.min_activated_voxels)
		.filter_map(|members| centroid(members.iter().map(|&i| &voxels[i])))
		.map(|c| c + origin)
		.collect()
}


/// Merges near-duplicate particles into their centroids
pub fn dedup_particles(particles: &[Point], distance: f64) -> Vec<Point> {
	groups(&cluster_by_distance(particles, distance))
		.into_iter()
		.filter_map(|members| centroid(members.iter().map(|&i| &particles[i])))
		.collect()
}


/// Groups particles into patches, dropping the patches that are too small
pub fn group_patches(particles: &[Point], distance: f64, min_size: usize) -> Vec<Patch> {
	groups(&cluster_by_distance(particles, distance))
		.into_iter()
		.filter(|members| members.len() >= min_size)
		.map(|members| Patch {
			particles: members.iter()
				.map(|&i| particles[i])
				.collect()
		})
		.collect()
}


/// Turns all the detection maps of one tomogram into patches of particles
pub fn decluster(maps: &[Volume], params: &DeclusterParams) -> Vec<Patch> {

	let raw = maps.iter()
		.flat_map(|map| map_particles(map, params))
		.collect::<Vec<_>>();
	let particles = dedup_particles(&raw, params.dedup_distance);
	let patches = group_patches(&particles, params.patch_distance, params.min_patch_size);

	debug!("{} maps: {} detections, {} particles, {} patches", maps.len(), raw.len(), particles.len(), patches.len());

	patches
}


/// Writes every patch particle to `{name}.pts`, and `{name}_patches.csv` with patch ids from 1
pub fn write_patches(dir: &Path, name: &str, patches: &[Patch]) -> Result<()> {

	fs::create_dir_all(dir)
		.context(format!("Failed to create folder: {}", dir.to_string_lossy()))?;

	let particles = patches.iter()
		.flat_map(|patch| patch.particles.iter().copied())
		.collect::<Vec<_>>();
	write_points(dir.join(format!("{}.pts", name)), &particles)?;

	let path = dir.join(format!("{}_patches.csv", name));
	let mut writer = csv::Writer::from_path(&path)
		.context(format!("Failed to create patches: {}", path.to_string_lossy()))?;
	writer.write_record(["patch", "x", "y", "z"])?;
	for (i, patch) in patches.iter().enumerate() {
		for p in &patch.particles {
			writer.write_record(&[
				(i + 1).to_string(),
				format!("{:.2}", p.x),
				format!("{:.2}", p.y),
				format!("{:.2}", p.z)
			])?;
		}
	}
	writer.flush()
		.context(format!("Failed to write patches: {}", path.to_string_lossy()))?;

	info!("Wrote {} particles in {} patches to {}", particles.len(), patches.len(), dir.to_string_lossy());

	Ok(())
}


#[cfg(test)]
mod test {

	use galvanic_assert::{assert_that, matchers::*};

	use super::*;


	fn blob(map: &mut Volume, center: Voxel, r: usize, val: f32) {
		for z in center[2] - r ..= center[2] + r {
			for y in center[1] - r ..= center[1] + r {
				for x in center[0] - r ..= center[0] + r {
					map.set(x, y, z, val);
				}
			}
		}
	}

	#[test]
	fn seeds_capped() {
		let mut rng = fastrand::Rng::with_seed(5);
		let sample = sample_seeds([20, 20, 20], 30, 8, &[], None, false, &mut rng)
			.expect("Failed to sample");
		assert_that!(&sample.coords.len(), eq(30));
		assert_that!(&sample.available, eq(13*13*13));
		for v in &sample.coords {
			for i in 0 .. 3 {
				assert_that!(&(v[i] >= 4 && v[i] <= 16), eq(true));
			}
		}
		let distinct = sample.coords.iter().collect::<HashSet<_>>();
		assert_that!(&distinct.len(), eq(30));
	}

	#[test]
	fn seeds_with_mask_and_resampling() {

		let mut mask = Volume::new(20, 20, 20, 1.0);
		mask.set(10, 10, 10, 1.0);
		mask.set(11, 10, 10, 1.0);
		// outside the cube margin
		mask.set(1, 1, 1, 1.0);

		let mut rng = fastrand::Rng::with_seed(7);
		let sample = sample_seeds([20, 20, 20], 5, 8, &[], Some(&mask), false, &mut rng)
			.expect("Failed to sample");
		assert_that!(&sample.available, eq(2));
		assert_that!(&sample.coords, eq(vec![[10, 10, 10], [11, 10, 10]]));

		let sample = sample_seeds([20, 20, 20], 5, 8, &[], Some(&mask), true, &mut rng)
			.expect("Failed to sample");
		assert_that!(&sample.available, eq(2));
		assert_that!(&sample.coords.len(), eq(5));
		for v in &sample.coords {
			assert_that!(&(*v == [10, 10, 10] || *v == [11, 10, 10]), eq(true));
		}
	}

	#[test]
	fn seeds_from_existing() {
		let existing = vec![
			Point::new(10.0, 10.0, 10.0),
			Point::new(10.2, 10.0, 10.0),
			Point::new(30.0, 30.0, 30.0),
			Point::new(30.0, 30.4, 30.0),
			Point::new(1.0, 1.0, 1.0)
		];
		let mut rng = fastrand::Rng::with_seed(1);
		let sample = sample_seeds([40, 40, 40], 3, 8, &existing, None, false, &mut rng)
			.expect("Failed to sample");
		// one point per cluster, and the corner one can't hold a cube
		assert_that!(&sample.available, eq(2));
		assert_that!(&sample.coords, eq(vec![[10, 10, 10], [30, 30, 30]]));
	}

	#[test]
	fn crop() {
		let mut vol = Volume::new(10, 10, 10, 2.0);
		vol.set(5, 5, 5, 1.0);
		vol.set(3, 3, 3, 2.0);
		vol.set(6, 6, 6, 3.0);

		let cube = crop_cube(&vol, [5, 5, 5], 4)
			.expect("Failed to crop");
		assert_that!(&cube.shape(), eq([4, 4, 4]));
		assert_that!(&cube.get(2, 2, 2), eq(1.0));
		assert_that!(&cube.get(0, 0, 0), eq(2.0));
		assert_that!(&cube.get(3, 3, 3), eq(3.0));
		assert_that!(&cube.origin(), eq([3.0, 3.0, 3.0]));

		let cube = crop_cube(&vol, [5, 5, 5], 3)
			.expect("Failed to crop");
		assert_that!(&cube.get(1, 1, 1), eq(1.0));

		assert_that!(&crop_cube(&vol, [1, 5, 5], 4).is_err(), eq(true));
		assert_that!(&crop_cube(&vol, [8, 5, 5], 4).is_err(), eq(true));
	}

	#[test]
	fn decluster_maps() {

		let params = DeclusterParams {
			probability_threshold: 0.5,
			min_activated_voxels: 5,
			dedup_distance: 3.0,
			patch_distance: 12.0,
			min_patch_size: 2
		};

		// two overlapping crops see the same particle, plus a lone speck
		let mut a = Volume::new(30, 30, 30, 1.0);
		blob(&mut a, [10, 10, 10], 1, 0.9);
		blob(&mut a, [20, 10, 10], 1, 0.9);
		a.set(25, 25, 25, 0.9);

		let mut b = Volume::new(30, 30, 30, 1.0);
		b.set_origin([10.0, 0.0, 0.0]);
		blob(&mut b, [10, 10, 10], 1, 0.9);

		// far away, alone, so its patch is too small
		let mut c = Volume::new(30, 30, 30, 1.0);
		c.set_origin([100.0, 100.0, 100.0]);
		blob(&mut c, [10, 10, 10], 1, 0.9);

		let raw = map_particles(&a, &params);
		assert_that!(&raw, eq(vec![Point::new(10.0, 10.0, 10.0), Point::new(20.0, 10.0, 10.0)]));

		let patches = decluster(&[a, b, c], &params);
		assert_that!(&patches.len(), eq(1));
		assert_that!(&patches[0].particles, eq(vec![Point::new(10.0, 10.0, 10.0), Point::new(20.0, 10.0, 10.0)]));
	}

	#[test]
	fn patches_files() {

		let dir = assert_fs::TempDir::new()
			.expect("Failed to create temp dir");
		let patches = vec![
			Patch { particles: vec![Point::new(1.0, 2.0, 3.0), Point::new(4.0, 5.0, 6.0)] },
			Patch { particles: vec![Point::new(7.5, 8.0, 9.0)] }
		];
		write_patches(dir.path(), "t1", &patches)
			.expect("Failed to write patches");

		let csv = fs::read_to_string(dir.path().join("t1_patches.csv"))
			.expect("Failed to read patches");
		assert_that!(&csv.as_str(), eq("patch,x,y,z\n1,1.00,2.00,3.00\n1,4.00,5.00,6.00\n2,7.50,8.00,9.00\n"));

		let points = crate::motl::read_points(dir.path().join("t1.pts"))
			.expect("Failed to read points");
		assert_that!(&points.len(), eq(3));
	}

	#[test]
	fn quiet_map() {
		let params = DeclusterParams::from_unit(2.0, 10.0, 1);
		assert_that!(&params.min_activated_voxels, eq(16));
		let map = Volume::filled(10, 10, 10, 1.0, 0.05);
		assert_that!(&map_particles(&map, &params).len(), eq(0));
	}
}
