
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use tracing::info;

use crate::extract::{crop_cube, Voxel};
use crate::geometry::Point;
use crate::motl::write_points;
use crate::mrc::Volume;


/// Anything that learns from labeled cubes and turns a cube into a same-sized probability map
pub trait Detector {

	type Model;

	fn train(&mut self, dataset: &[TrainingCube]) -> Result<Self::Model>;

	/// returns a probability map with the same shape as the volume
	fn predict(&self, model: &Self::Model, volume: &Volume) -> Result<Volume>;
}


/// A subtomogram and its binary particle label
#[derive(Debug, Clone, PartialEq)]
pub struct TrainingCube {
	pub center: Voxel,
	pub input: Volume,
	pub label: Volume
}


/// Paints a sphere of `radius` voxels around every particle that touches the cube.
/// `origin` is the cube's lowest corner in the tomogram.
pub fn label_cube(size: usize, origin: [f64; 3], particles: &[Point], radius: f64, pixel_size: f64) -> Result<Volume> {

	if size == 0 {
		bail!("Label cubes need at least one voxel");
	}

	let mut label = Volume::new(size, size, size, pixel_size);
	label.set_origin(origin);

	let origin = Point::new(origin[0], origin[1], origin[2]);
	let r2 = radius*radius;

	for particle in particles {

		let local = particle - origin;
		let touches = (0 .. 3).all(|i| local[i] + radius >= 0.0 && local[i] - radius < size as f64);
		if !touches {
			continue;
		}

		// only visit the sphere's bounding box
		let lo = local.map(|c| (c - radius).floor().max(0.0) as usize);
		let hi = local.map(|c| ((c + radius).ceil().max(0.0) as usize).min(size - 1));
		for z in lo.z ..= hi.z {
			for y in lo.y ..= hi.y {
				for x in lo.x ..= hi.x {
					let d = Point::new(x as f64, y as f64, z as f64) - local;
					if d.norm_squared() <= r2 {
						label.set(x, y, z, 1.0);
					}
				}
			}
		}
	}

	Ok(label)
}


pub fn build_training_set(
	volume: &Volume,
	seeds: &[Voxel],
	cube_size: usize,
	particles: &[Point],
	label_radius: f64
) -> Result<Vec<TrainingCube>> {
	seeds.iter()
		.map(|&center| {
			let input = crop_cube(volume, center, cube_size)?;
			let label = label_cube(cube_size, input.origin(), particles, label_radius, volume.pixel_size())?;
			Ok(TrainingCube {
				center,
				input,
				label
			})
		})
		.collect()
}


/// Writes `{name}_{i}.mrc` and `{name}_{i}_label.mrc` for each cube, and the cube centers to `seeds.pts`
pub fn save_training_set(dir: &Path, name: &str, cubes: &[TrainingCube]) -> Result<()> {

	fs::create_dir_all(dir)
		.context(format!("Failed to create folder: {}", dir.to_string_lossy()))?;

	for (i, cube) in cubes.iter().enumerate() {
		cube.input.save(dir.join(format!("{}_{}.mrc", name, i)))?;
		cube.label.save(dir.join(format!("{}_{}_label.mrc", name, i)))?;
	}

	let centers = cubes.iter()
		.map(|cube| Point::new(cube.center[0] as f64, cube.center[1] as f64, cube.center[2] as f64))
		.collect::<Vec<_>>();
	write_points(dir.join("seeds.pts"), &centers)?;

	info!("Saved {} training cubes to {}", cubes.len(), dir.to_string_lossy());

	Ok(())
}


/// Start positions of cubes covering `0 .. n`, the last one flush with the end
pub fn tile_starts(n: usize, size: usize, stride: usize) -> Result<Vec<usize>> {

	if size == 0 || stride == 0 {
		bail!("Tiles need a positive size and stride, got size={}, stride={}", size, stride);
	}
	if n < size {
		bail!("Cube of size {} doesn't fit in an axis of length {}", size, n);
	}

	let mut starts = (0 ..= n - size)
		.step_by(stride)
		.collect::<Vec<_>>();
	if starts.last() != Some(&(n - size)) {
		starts.push(n - size);
	}

	Ok(starts)
}


/// Runs the detector over overlapping cubes of the whole tomogram.
/// Each map carries its cube's origin, so its detections land in the tomogram's frame.
pub fn scan<D: Detector>(
	volume: &Volume,
	detector: &D,
	model: &D::Model,
	cube_size: usize,
	stride: usize
) -> Result<Vec<Volume>> {

	let shape = volume.shape();
	let xs = tile_starts(shape[0], cube_size, stride)?;
	let ys = tile_starts(shape[1], cube_size, stride)?;
	let zs = tile_starts(shape[2], cube_size, stride)?;

	let mut maps = Vec::with_capacity(xs.len()*ys.len()*zs.len());
	for &z in &zs {
		for &y in &ys {
			for &x in &xs {
				let center = [x + cube_size/2, y + cube_size/2, z + cube_size/2];
				let cube = crop_cube(volume, center, cube_size)?;
				let mut map = detector.predict(model, &cube)
					.context(format!("Detector failed on the cube at {:?}", center))?;
				if map.shape() != cube.shape() {
					bail!("Detector returned a map of shape {:?} for a cube of shape {:?}", map.shape(), cube.shape());
				}
				map.set_origin(cube.origin());
				maps.push(map);
			}
		}
	}

	info!("Scanned {} cubes", maps.len());

	Ok(maps)
}


#[cfg(test)]
mod test {

	use galvanic_assert::{assert_that, matchers::*};

	use crate::extract::{decluster, DeclusterParams};
	use super::*;


	/// Learns nothing, calls anything brighter than the cutoff a particle
	struct Brightness;

	impl Detector for Brightness {

		type Model = f32;

		fn train(&mut self, dataset: &[TrainingCube]) -> Result<f32> {
			// the dimmest labeled voxel
			let cutoff = dataset.iter()
				.flat_map(|cube| cube.input.iter().zip(cube.label.iter()))
				.filter(|(_, (_, _, _, l))| *l > 0.0)
				.map(|((_, _, _, v), _)| v)
				.fold(f32::INFINITY, f32::min);
			Ok(cutoff)
		}

		fn predict(&self, model: &f32, volume: &Volume) -> Result<Volume> {
			let [nx, ny, nz] = volume.shape();
			let mut map = Volume::new(nx, ny, nz, volume.pixel_size());
			for (x, y, z, v) in volume.iter() {
				if v >= *model {
					map.set(x, y, z, 1.0);
				}
			}
			Ok(map)
		}
	}


	fn tomogram(particles: &[Point]) -> Volume {
		let mut vol = Volume::new(40, 40, 40, 1.0);
		for p in particles {
			for dz in -1i32 ..= 1 {
				for dy in -1i32 ..= 1 {
					for dx in -1i32 ..= 1 {
						vol.set((p.x as i32 + dx) as usize, (p.y as i32 + dy) as usize, (p.z as i32 + dz) as usize, 5.0);
					}
				}
			}
		}
		vol
	}

	#[test]
	fn tiles() {
		assert_that!(&tile_starts(10, 4, 3).unwrap(), eq(vec![0, 3, 6]));
		assert_that!(&tile_starts(10, 4, 4).unwrap(), eq(vec![0, 4, 6]));
		assert_that!(&tile_starts(4, 4, 2).unwrap(), eq(vec![0]));
		assert_that!(&tile_starts(3, 4, 2).is_err(), eq(true));
	}

	#[test]
	fn label() {
		let particles = vec![Point::new(12.0, 12.0, 12.0), Point::new(100.0, 0.0, 0.0)];
		let label = label_cube(8, [10.0, 10.0, 10.0], &particles, 1.0, 1.0)
			.expect("Failed to label cube");
		let count = label.iter()
			.filter(|(_, _, _, v)| *v > 0.0)
			.count();
		// the center and its 6 face neighbors
		assert_that!(&count, eq(7));
		assert_that!(&label.get(2, 2, 2), eq(1.0));
		assert_that!(&label.get(3, 3, 2), eq(0.0));
		assert_that!(&label.origin(), eq([10.0, 10.0, 10.0]));
	}

	#[test]
	fn empty_label_cube() {
		let particles = vec![Point::new(10.0, 10.0, 10.0)];
		assert_that!(&label_cube(0, [10.0, 10.0, 10.0], &particles, 2.0, 1.0).is_err(), eq(true));
	}

	#[test]
	fn train_and_scan() {

		let particles = vec![
			Point::new(10.0, 10.0, 10.0),
			Point::new(16.0, 10.0, 10.0),
			Point::new(30.0, 30.0, 30.0)
		];
		let vol = tomogram(&particles);

		let cubes = build_training_set(&vol, &[[12, 12, 12]], 16, &particles, 0.0)
			.expect("Failed to build training set");
		assert_that!(&cubes.len(), eq(1));
		assert_that!(&cubes[0].input.origin(), eq([4.0, 4.0, 4.0]));

		let mut detector = Brightness;
		let model = detector.train(&cubes)
			.expect("Failed to train");
		assert_that!(&model, eq(5.0));

		let maps = scan(&vol, &detector, &model, 16, 12)
			.expect("Failed to scan");
		// starts 0, 12, 24 on every axis
		assert_that!(&maps.len(), eq(27));

		let params = DeclusterParams {
			probability_threshold: 0.5,
			// cubes that clip a particle only see a 9 voxel slab of it
			min_activated_voxels: 10,
			dedup_distance: 2.0,
			patch_distance: 8.0,
			min_patch_size: 2
		};
		let patches = decluster(&maps, &params);
		assert_that!(&patches.len(), eq(1));
		assert_that!(&patches[0].particles, eq(vec![Point::new(10.0, 10.0, 10.0), Point::new(16.0, 10.0, 10.0)]));
	}

	#[test]
	fn save() {

		let dir = assert_fs::TempDir::new()
			.expect("Failed to create temp dir");

		let vol = Volume::filled(20, 20, 20, 2.0, 1.0);
		let cubes = build_training_set(&vol, &[[5, 5, 5], [10, 10, 10]], 6, &[Point::new(10.0, 10.0, 10.0)], 2.0)
			.expect("Failed to build training set");
		save_training_set(dir.path(), "t1", &cubes)
			.expect("Failed to save");

		for file in ["t1_0.mrc", "t1_0_label.mrc", "t1_1.mrc", "t1_1_label.mrc", "seeds.pts"] {
			assert_that!(&dir.path().join(file).exists(), eq(true));
		}
		let label = Volume::read(dir.path().join("t1_1_label.mrc"))
			.expect("Failed to read label");
		assert_that!(&label.get(3, 3, 3), eq(1.0));
		assert_that!(&label.origin(), eq([7.0, 7.0, 7.0]));
	}
}
