
// MRC file (from the Medical Research Council, in the UK)
// https://en.wikipedia.org/wiki/MRC_(file_format)

// format specification:
// https://www.ccpem.ac.uk/mrc_format/mrc2014.php

use std::fs::File;
use std::io::{BufReader, BufWriter, Cursor, Read, Seek, SeekFrom, Write};
use std::path::Path;

use anyhow::{bail, Context, Result};
use byteorder::{ByteOrder, ReadBytesExt, WriteBytesExt, BE, LE};

use crate::geometry::Point;


const HEADER_BYTES: usize = 1024;


#[derive(Debug, Clone, PartialEq)]
pub struct MrcHeader {
	pub nx: usize,
	pub ny: usize,
	pub nz: usize,
	pub mode: i32,
	pub sampling: [i32; 3],
	pub cell: [f32; 3],
	pub origin: [f32; 3],
	pub nsymbt: usize,
	pub little_endian: bool
}

impl MrcHeader {

	/// reads only the header, the voxels stay on disk
	pub fn read(path: impl AsRef<Path>) -> Result<Self> {
		let path = path.as_ref();
		let mut file = File::open(path)
			.context(format!("Failed to open MRC file: {}", path.to_string_lossy()))?;
		let mut buf = [0u8; HEADER_BYTES];
		file.read_exact(&mut buf)
			.context(format!("Failed to read MRC header: {}", path.to_string_lossy()))?;
		Self::parse(&buf)
			.context(format!("Invalid MRC header: {}", path.to_string_lossy()))
	}

	fn parse(buf: &[u8; HEADER_BYTES]) -> Result<Self> {

		// the machine stamp lives in word 54
		let little_endian = match &buf[212 .. 214] {
			[0x11, 0x11] => false,
			// old files often have a zeroed stamp, those are almost always little-endian
			_ => true
		};

		if little_endian {
			Self::parse_as::<LE>(buf, true)
		} else {
			Self::parse_as::<BE>(buf, false)
		}
	}

	fn parse_as<E: ByteOrder>(buf: &[u8; HEADER_BYTES], little_endian: bool) -> Result<Self> {

		let mut cursor = Cursor::new(&buf[..]);

		// words 1-4
		let nx = cursor.read_i32::<E>()?;
		let ny = cursor.read_i32::<E>()?;
		let nz = cursor.read_i32::<E>()?;
		let mode = cursor.read_i32::<E>()?;
		if nx <= 0 || ny <= 0 || nz <= 0 {
			bail!("Invalid dimensions: {}x{}x{}", nx, ny, nz);
		}

		// skip nxstart etc, words 8-10 are the sampling
		cursor.seek(SeekFrom::Start(4*7))?;
		let sampling = [
			cursor.read_i32::<E>()?,
			cursor.read_i32::<E>()?,
			cursor.read_i32::<E>()?
		];

		// words 11-13
		let cell = [
			cursor.read_f32::<E>()?,
			cursor.read_f32::<E>()?,
			cursor.read_f32::<E>()?
		];

		// word 24
		cursor.seek(SeekFrom::Start(4*23))?;
		let nsymbt = cursor.read_i32::<E>()?;

		// words 50-52
		cursor.seek(SeekFrom::Start(4*49))?;
		let origin = [
			cursor.read_f32::<E>()?,
			cursor.read_f32::<E>()?,
			cursor.read_f32::<E>()?
		];

		Ok(Self {
			nx: nx as usize,
			ny: ny as usize,
			nz: nz as usize,
			mode,
			sampling,
			cell,
			origin,
			nsymbt: nsymbt.max(0) as usize,
			little_endian
		})
	}

	/// Å per voxel, along x
	pub fn pixel_size(&self) -> f64 {
		if self.sampling[0] > 0 && self.cell[0] > 0.0 {
			self.cell[0] as f64/self.sampling[0] as f64
		} else {
			1.0
		}
	}

	pub fn boundary(&self) -> Point {
		Point::new(self.nx as f64, self.ny as f64, self.nz as f64)
	}
}


/// A 3D scalar grid, stored z(y(x)) like the file.
#[derive(Debug, Clone, PartialEq)]
pub struct Volume {
	nx: usize,
	ny: usize,
	nz: usize,
	pixel_size: f64,
	/// in voxels
	origin: [f64; 3],
	voxels: Vec<f32>
}

impl Volume {

	pub fn new(nx: usize, ny: usize, nz: usize, pixel_size: f64) -> Self {
		Self {
			nx,
			ny,
			nz,
			pixel_size,
			origin: [0.0; 3],
			voxels: vec![0f32; nx*ny*nz]
		}
	}

	pub fn filled(nx: usize, ny: usize, nz: usize, pixel_size: f64, val: f32) -> Self {
		let mut vol = Self::new(nx, ny, nz, pixel_size);
		vol.voxels.fill(val);
		vol
	}

	pub fn shape(&self) -> [usize; 3] {
		[self.nx, self.ny, self.nz]
	}

	pub fn boundary(&self) -> Point {
		Point::new(self.nx as f64, self.ny as f64, self.nz as f64)
	}

	pub fn pixel_size(&self) -> f64 {
		self.pixel_size
	}

	pub fn origin(&self) -> [f64; 3] {
		self.origin
	}

	pub fn set_origin(&mut self, origin: [f64; 3]) {
		self.origin = origin;
	}

	fn index(&self, x: usize, y: usize, z: usize) -> usize {
		z*self.nx*self.ny + y*self.nx + x
	}

	pub fn contains(&self, x: usize, y: usize, z: usize) -> bool {
		x < self.nx && y < self.ny && z < self.nz
	}

	pub fn get(&self, x: usize, y: usize, z: usize) -> f32 {
		self.voxels[self.index(x, y, z)]
	}

	pub fn set(&mut self, x: usize, y: usize, z: usize, val: f32) {
		let i = self.index(x, y, z);
		self.voxels[i] = val;
	}

	/// visits every voxel as (x, y, z, value), in file order
	pub fn iter(&self) -> impl Iterator<Item=(usize, usize, usize, f32)> + '_ {
		let nx = self.nx;
		let ny = self.ny;
		self.voxels.iter()
			.enumerate()
			.map(move |(i, &v)| (i % nx, (i/nx) % ny, i/(nx*ny), v))
	}

	pub fn read(path: impl AsRef<Path>) -> Result<Self> {

		let path = path.as_ref();
		let header = MrcHeader::read(path)?;

		let file = File::open(&path)
			.context(format!("Failed to open MRC file: {}", path.to_string_lossy()))?;
		let mut reader = BufReader::new(file);
		reader.seek(SeekFrom::Start((HEADER_BYTES + header.nsymbt) as u64))
			.context(format!("Failed to skip MRC header: {}", path.to_string_lossy()))?;

		let count = header.nx*header.ny*header.nz;
		let voxels =
			if header.little_endian {
				read_voxels::<LE>(&mut reader, header.mode, count)
			} else {
				read_voxels::<BE>(&mut reader, header.mode, count)
			}
			.context(format!("Failed to read MRC voxels: {}", path.to_string_lossy()))?;

		let pixel_size = header.pixel_size();
		Ok(Self {
			nx: header.nx,
			ny: header.ny,
			nz: header.nz,
			pixel_size,
			origin: [
				header.origin[0] as f64/pixel_size,
				header.origin[1] as f64/pixel_size,
				header.origin[2] as f64/pixel_size
			],
			voxels
		})
	}

	pub fn save(&self, path: impl AsRef<Path>) -> Result<()> {

		let path = path.as_ref();

		let mut file = File::create(&path)
			.context(format!("Failed to open file for writing: {}", path.to_string_lossy()))?;
		let mut writer = BufWriter::new(&mut file);

		// first, write the header: it's 256 (4-byte) words, or 1024 bytes total

		// write the dimensions (words 1-3)
		writer.write_i32::<LE>(self.nx as i32)?;
		writer.write_i32::<LE>(self.ny as i32)?;
		writer.write_i32::<LE>(self.nz as i32)?;

		// use mode 2: 32 bit float
		writer.write_i32::<LE>(2)?;

		// nxstart, nystart, nzstart
		writer.write_all(&[0u8; 4*3])?;

		// sampling (words 8-10), then cell lengths in Å (words 11-13)
		writer.write_i32::<LE>(self.nx as i32)?;
		writer.write_i32::<LE>(self.ny as i32)?;
		writer.write_i32::<LE>(self.nz as i32)?;
		writer.write_f32::<LE>((self.nx as f64*self.pixel_size) as f32)?;
		writer.write_f32::<LE>((self.ny as f64*self.pixel_size) as f32)?;
		writer.write_f32::<LE>((self.nz as f64*self.pixel_size) as f32)?;

		// cell angles (words 14-16)
		for _ in 0 .. 3 {
			writer.write_f32::<LE>(90.0)?;
		}

		// axis mapping (words 17-19)
		writer.write_i32::<LE>(1)?;
		writer.write_i32::<LE>(2)?;
		writer.write_i32::<LE>(3)?;

		// stats (words 20-22)
		let (min, max, mean) = self.stats();
		writer.write_f32::<LE>(min)?;
		writer.write_f32::<LE>(max)?;
		writer.write_f32::<LE>(mean)?;

		// we're at word 23 now: space group 1, then no extended header
		writer.write_i32::<LE>(1)?;
		writer.write_i32::<LE>(0)?;

		// we're at word 25 now: skip to word 50
		writer.write_all(&[0u8; 4*(50 - 25)])?;

		// origin, in Å (words 50-52)
		for o in self.origin {
			writer.write_f32::<LE>((o*self.pixel_size) as f32)?;
		}

		// word 53, then the machine stamp: signal little-endianess (note 11)
		writer.write_all(b"MAP ")?;
		writer.write_all(&[0x44, 0x44, 0x00, 0x00])?;

		// we're at word 55 now: skip to the end of the header (word 257)
		writer.write_all(&[0u8; 4*(257 - 55)])?;

		// write the voxels: z(y(x)) order
		for v in &self.voxels {
			writer.write_f32::<LE>(*v)?;
		}

		// write buffers should be flushed before dropping
		writer.flush()?;

		Ok(())
	}

	fn stats(&self) -> (f32, f32, f32) {
		if self.voxels.is_empty() {
			return (0.0, 0.0, 0.0);
		}
		let mut min = f32::INFINITY;
		let mut max = f32::NEG_INFINITY;
		let mut sum = 0f64;
		for &v in &self.voxels {
			min = min.min(v);
			max = max.max(v);
			sum += v as f64;
		}
		(min, max, (sum/self.voxels.len() as f64) as f32)
	}
}


fn read_voxels<E: ByteOrder>(reader: &mut impl Read, mode: i32, count: usize) -> Result<Vec<f32>> {
	let mut voxels = Vec::with_capacity(count);
	for _ in 0 .. count {
		let v = match mode {
			0 => reader.read_i8()? as f32,
			1 => reader.read_i16::<E>()? as f32,
			2 => reader.read_f32::<E>()?,
			6 => reader.read_u16::<E>()? as f32,
			_ => bail!("Unsupported MRC mode: {}", mode)
		};
		voxels.push(v);
	}
	Ok(voxels)
}


#[cfg(test)]
mod test {

	use assert_fs::TempDir;
	use galvanic_assert::{assert_that, matchers::*};

	use super::*;


	#[test]
	fn save_read() {

		let dir = TempDir::new()
			.expect("Failed to make temp folder");
		let path = dir.path().join("vol.mrc");

		let mut vol = Volume::new(4, 3, 2, 2.5);
		vol.set(1, 2, 1, 7.0);
		vol.set(3, 0, 0, -1.5);
		vol.set_origin([10.0, 20.0, 30.0]);
		vol.save(&path)
			.expect("Failed to save");

		let header = MrcHeader::read(&path)
			.expect("Failed to read header");
		assert_that!(&header.nx, eq(4));
		assert_that!(&header.ny, eq(3));
		assert_that!(&header.nz, eq(2));
		assert_that!(&header.mode, eq(2));
		assert_that!(&header.little_endian, eq(true));
		assert_that!(&((header.pixel_size() - 2.5).abs() < 1e-6), eq(true));

		let vol2 = Volume::read(&path)
			.expect("Failed to read volume");
		assert_that!(&vol2.shape(), eq([4, 3, 2]));
		assert_that!(&vol2.get(1, 2, 1), eq(7.0));
		assert_that!(&vol2.get(3, 0, 0), eq(-1.5));
		assert_that!(&vol2.get(0, 0, 0), eq(0.0));
		assert_that!(&((vol2.origin()[2] - 30.0).abs() < 1e-4), eq(true));
	}

	#[test]
	fn iter_coords() {
		let mut vol = Volume::new(3, 4, 5, 1.0);
		vol.set(2, 3, 4, 1.0);
		let hot = vol.iter()
			.filter(|(_, _, _, v)| *v > 0.0)
			.map(|(x, y, z, _)| (x, y, z))
			.collect::<Vec<_>>();
		assert_that!(&hot, eq(vec![(2, 3, 4)]));
	}
}
