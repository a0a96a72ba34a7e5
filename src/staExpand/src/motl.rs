
use std::fmt::Write as _;
use std::fs;
use std::path::Path;

use anyhow::{bail, Context, Result};
use csv::{ReaderBuilder, StringRecord, Trim, WriterBuilder};

use crate::geometry::{Angles, Point};


/// Field offsets (zero-based) of a motion-list row
pub mod schema {

	/// cross-correlation coefficient
	pub const CCC: usize = 0;
	/// 1-based particle index, reassigned whenever the list is written
	pub const INDEX: usize = 3;
	/// translational refinement, in voxels
	pub const X_OFFSET: usize = 10;
	pub const Y_OFFSET: usize = 11;
	pub const Z_OFFSET: usize = 12;
	/// Euler angles, in degrees: Z by rot, X by tilt, then Z by psi
	pub const ROT: usize = 16;
	pub const TILT: usize = 17;
	pub const PSI: usize = 18;

	/// rows shorter than this can't hold the angles
	pub const MIN_FIELDS: usize = 19;
	/// rows are padded to this width when written
	pub const NUM_FIELDS: usize = 20;

	pub const DEFAULT_HEADER: [&str; NUM_FIELDS] = [
		"CCC", "reserved", "reserved", "pIndex", "wedgeWT",
		"NA", "NA", "NA", "NA", "NA",
		"xOffset", "yOffset", "zOffset", "NA", "NA",
		"reserved", "EulerZ(1)", "EulerX(2)", "EulerZ(3)", "reserved"
	];
}


#[derive(Debug, Clone, PartialEq)]
pub struct MotlRow {
	pub ccc: f64,
	pub index: u32,
	pub offset: Point,
	pub angles: Angles,
	/// every field as read, the named fields are written over these
	fields: StringRecord
}

impl MotlRow {

	pub fn new(index: u32, angles: Angles) -> Self {
		Self {
			ccc: 1.0,
			index,
			offset: Point::zeros(),
			angles,
			fields: StringRecord::from(vec!["0"; schema::NUM_FIELDS])
		}
	}

	fn parse(fields: StringRecord) -> Result<Self> {

		if fields.len() < schema::MIN_FIELDS {
			bail!("Expected at least {} fields, found {}", schema::MIN_FIELDS, fields.len());
		}

		let num = |i: usize| -> Result<f64> {
			let field = &fields[i];
			field.parse::<f64>()
				.context(format!("Field {} is not a number: {}", i, field))
		};

		let angles = Angles::new(num(schema::ROT)?, num(schema::TILT)?, num(schema::PSI)?);
		if !angles.is_finite() {
			bail!("Angles are not finite: {:?}", angles);
		}

		Ok(Self {
			ccc: num(schema::CCC)?,
			index: num(schema::INDEX)? as u32,
			offset: Point::new(num(schema::X_OFFSET)?, num(schema::Y_OFFSET)?, num(schema::Z_OFFSET)?),
			angles,
			fields
		})
	}

	fn record(&self) -> Vec<String> {
		let mut fields = self.fields.iter()
			.map(str::to_string)
			.collect::<Vec<_>>();
		if fields.len() < schema::NUM_FIELDS {
			fields.resize(schema::NUM_FIELDS, "0".to_string());
		}
		fields[schema::CCC] = self.ccc.to_string();
		fields[schema::INDEX] = self.index.to_string();
		fields[schema::X_OFFSET] = self.offset.x.to_string();
		fields[schema::Y_OFFSET] = self.offset.y.to_string();
		fields[schema::Z_OFFSET] = self.offset.z.to_string();
		fields[schema::ROT] = self.angles.rot.to_string();
		fields[schema::TILT] = self.angles.tilt.to_string();
		fields[schema::PSI] = self.angles.psi.to_string();
		fields
	}
}


#[derive(Debug, Clone, PartialEq)]
pub struct MotionList {
	/// passed through untouched
	pub header: StringRecord,
	pub rows: Vec<MotlRow>
}

impl MotionList {

	pub fn new(header: StringRecord) -> Self {
		Self {
			header,
			rows: Vec::new()
		}
	}

	pub fn with_default_header() -> Self {
		Self::new(StringRecord::from(&schema::DEFAULT_HEADER[..]))
	}

	pub fn read(path: impl AsRef<Path>) -> Result<Self> {

		let path = path.as_ref();
		let mut reader = ReaderBuilder::new()
			.has_headers(true)
			.flexible(true)
			.trim(Trim::All)
			.from_path(path)
			.context(format!("Failed to open motion list: {}", path.to_string_lossy()))?;

		let header = reader.headers()
			.context(format!("Failed to read motion list header: {}", path.to_string_lossy()))?
			.clone();
		if header.is_empty() {
			bail!("Motion list has no header: {}", path.to_string_lossy());
		}

		let mut rows = Vec::new();
		for record in reader.records() {
			let record = record
				.context(format!("Failed to read motion list: {}", path.to_string_lossy()))?;
			let line = record.position()
				.map(|pos| pos.line())
				.unwrap_or(0);
			let row = MotlRow::parse(record)
				.context(format!("Invalid row, line {} of {}", line, path.to_string_lossy()))?;
			rows.push(row);
		}

		Ok(Self {
			header,
			rows
		})
	}

	/// writes the rows with fresh 1-based indices
	pub fn write(&self, path: impl AsRef<Path>) -> Result<()> {

		let path = path.as_ref();
		let mut writer = WriterBuilder::new()
			.flexible(true)
			.from_path(path)
			.context(format!("Failed to create motion list: {}", path.to_string_lossy()))?;

		writer.write_record(&self.header)?;
		for (i, row) in self.rows.iter().enumerate() {
			let mut row = row.clone();
			row.index = i as u32 + 1;
			writer.write_record(row.record())?;
		}
		writer.flush()
			.context(format!("Failed to write motion list: {}", path.to_string_lossy()))
	}

	pub fn len(&self) -> usize {
		self.rows.len()
	}

	pub fn is_empty(&self) -> bool {
		self.rows.is_empty()
	}

	/// keeps only the rows at `indices`, in that order
	pub fn select(&self, indices: &[usize]) -> Self {
		Self {
			header: self.header.clone(),
			rows: indices.iter()
				.map(|&i| self.rows[i].clone())
				.collect()
		}
	}
}


/// One `x y z` row per particle, no header
pub fn read_points(path: impl AsRef<Path>) -> Result<Vec<Point>> {

	let path = path.as_ref();
	let content = fs::read_to_string(path)
		.context(format!("Failed to read points: {}", path.to_string_lossy()))?;

	let mut points = Vec::new();
	for (linei, line) in content.lines().enumerate() {
		if line.trim().is_empty() {
			continue;
		}
		let coords = line.split_whitespace()
			.map(|v| v.parse::<f64>())
			.collect::<Result<Vec<_>,_>>()
			.context(format!("Failed to read coords, line {} of {}", linei + 1, path.to_string_lossy()))?;
		// some tools prefix object/contour numbers, the coords are always last
		if coords.len() < 3 {
			bail!("Missing coords, line {} of {}", linei + 1, path.to_string_lossy());
		}
		let n = coords.len();
		points.push(Point::new(coords[n - 3], coords[n - 2], coords[n - 1]));
	}

	Ok(points)
}

pub fn write_points(path: impl AsRef<Path>, points: &[Point]) -> Result<()> {
	let path = path.as_ref();
	let mut out = String::new();
	for p in points {
		writeln!(out, "{} {} {}", p.x, p.y, p.z)?;
	}
	fs::write(path, out)
		.context(format!("Failed to write points: {}", path.to_string_lossy()))
}


/// One `x,y,z` row per particle, no header
pub fn read_rot_axes(path: impl AsRef<Path>) -> Result<Vec<Point>> {

	let path = path.as_ref();
	let mut reader = ReaderBuilder::new()
		.has_headers(false)
		.trim(Trim::All)
		.from_path(path)
		.context(format!("Failed to open rotation axes: {}", path.to_string_lossy()))?;

	let mut axes = Vec::new();
	for record in reader.records() {
		let record = record
			.context(format!("Failed to read rotation axes: {}", path.to_string_lossy()))?;
		let line = record.position()
			.map(|pos| pos.line())
			.unwrap_or(0);
		let values = record.iter()
			.map(|v| v.parse::<f64>())
			.collect::<Result<Vec<_>,_>>()
			.context(format!("Failed to read axis, line {} of {}", line, path.to_string_lossy()))?;
		let [x, y, z] = values[..]
			else { bail!("Expected 3 values, line {} of {}", line, path.to_string_lossy()); };
		axes.push(Point::new(x, y, z));
	}

	Ok(axes)
}

pub fn write_rot_axes(path: impl AsRef<Path>, axes: &[Point]) -> Result<()> {

	let path = path.as_ref();
	let mut writer = WriterBuilder::new()
		.has_headers(false)
		.from_path(path)
		.context(format!("Failed to create rotation axes: {}", path.to_string_lossy()))?;

	for a in axes {
		writer.write_record(&[
			format!("{:.2}", a.x),
			format!("{:.2}", a.y),
			format!("{:.2}", a.z)
		])?;
	}
	writer.flush()
		.context(format!("Failed to write rotation axes: {}", path.to_string_lossy()))
}


#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub enum Source {
	/// picked by hand, before any round
	Manual,
	/// proposed by an expansion round
	Expanded
}


/// Where a particle came from
#[derive(Debug, Clone, Copy, PartialEq, Eq)]
pub struct Provenance {
	/// -1 for the initial picks
	pub round: i32,
	pub source: Source,
	/// row of the particle it was proposed by, in the list its round started from
	pub parent: Option<usize>
}

impl Provenance {

	pub const MANUAL: Provenance = Provenance {
		round: -1,
		source: Source::Manual,
		parent: None
	};

	pub fn expanded(round: i32, parent: usize) -> Self {
		Self {
			round,
			source: Source::Expanded,
			parent: Some(parent)
		}
	}
}


/// One `round,source,parent` row per particle, in the same order as its motion list
pub fn read_provenance(path: impl AsRef<Path>) -> Result<Vec<Provenance>> {

	let path = path.as_ref();
	let mut reader = ReaderBuilder::new()
		.has_headers(true)
		.trim(Trim::All)
		.from_path(path)
		.context(format!("Failed to open provenance: {}", path.to_string_lossy()))?;

	let mut out = Vec::new();
	for record in reader.records() {
		let record = record
			.context(format!("Failed to read provenance: {}", path.to_string_lossy()))?;
		let line = record.position()
			.map(|pos| pos.line())
			.unwrap_or(0);
		let [round, source, parent] = [0, 1, 2].map(|i| record.get(i).unwrap_or(""));
		let round = round.parse::<i32>()
			.context(format!("Invalid round, line {} of {}", line, path.to_string_lossy()))?;
		let source = match source {
			"manual" => Source::Manual,
			"expanded" => Source::Expanded,
			other => bail!("Unknown source {}, line {} of {}", other, line, path.to_string_lossy())
		};
		let parent =
			if parent.is_empty() {
				None
			} else {
				Some(parent.parse::<usize>()
					.context(format!("Invalid parent, line {} of {}", line, path.to_string_lossy()))?)
			};
		out.push(Provenance {
			round,
			source,
			parent
		});
	}

	Ok(out)
}

pub fn write_provenance(path: impl AsRef<Path>, provenance: &[Provenance]) -> Result<()> {

	let path = path.as_ref();
	let mut writer = WriterBuilder::new()
		.from_path(path)
		.context(format!("Failed to create provenance: {}", path.to_string_lossy()))?;

	writer.write_record(["round", "source", "parent"])?;
	for p in provenance {
		let source = match p.source {
			Source::Manual => "manual",
			Source::Expanded => "expanded"
		};
		writer.write_record([
			p.round.to_string(),
			source.to_string(),
			p.parent.map(|i| i.to_string()).unwrap_or_default()
		])?;
	}
	writer.flush()
		.context(format!("Failed to write provenance: {}", path.to_string_lossy()))
}
