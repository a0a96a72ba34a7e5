
use nalgebra::{Matrix3, Vector3};


/// A position in voxel coordinates
pub type Point = Vector3<f64>;

pub type Rotation = Matrix3<f64>;


/// Euler angles in degrees, in the aligner's ZXZ convention
#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Angles {
	pub rot: f64,
	pub tilt: f64,
	pub psi: f64
}

impl Angles {

	pub const ZERO: Angles = Angles {
		rot: 0.0,
		tilt: 0.0,
		psi: 0.0
	};

	pub fn new(rot: f64, tilt: f64, psi: f64) -> Self {
		Self {
			rot,
			tilt,
			psi
		}
	}

	pub fn is_finite(&self) -> bool {
		self.rot.is_finite() && self.tilt.is_finite() && self.psi.is_finite()
	}

	pub fn matrix(&self) -> Rotation {
		rotation_matrix(self.rot, self.tilt, self.psi)
	}
}


fn rz(degrees: f64) -> Rotation {
	let (s, c) = degrees.to_radians().sin_cos();
	Matrix3::new(
		c, -s, 0.0,
		s, c, 0.0,
		0.0, 0.0, 1.0
	)
}

fn rx(degrees: f64) -> Rotation {
	let (s, c) = degrees.to_radians().sin_cos();
	Matrix3::new(
		1.0, 0.0, 0.0,
		0.0, c, -s,
		0.0, s, c
	)
}


/// Rotates a column vector about Z by `rot`, then X by `tilt`, then Z by `psi`.
/// All angles are in degrees.
pub fn rotation_matrix(rot: f64, tilt: f64, psi: f64) -> Rotation {
	rz(psi)*rx(tilt)*rz(rot)
}


/// The particle's local Y axis after rotation, rounded to 2 decimals
pub fn rotated_y_axis(rotation: &Rotation) -> Point {
	let axis = rotation*Vector3::y();
	axis.map(|v| {
		let v = (v*100.0).round()/100.0;
		// don't write -0.00
		if v == 0.0 { 0.0 } else { v }
	})
}


/// true iff every coordinate lies strictly between `margin` and `boundary - margin`
pub fn in_boundary(point: &Point, boundary: &Point, margin: f64) -> bool {
	(0 .. 3).all(|i| point[i] > margin && point[i] < boundary[i] - margin)
}


/// Distance to the nearest member of `points`, or infinity when there are none
pub fn closest_distance<'a>(point: &Point, points: impl IntoIterator<Item=&'a Point>) -> f64 {
	points.into_iter()
		.map(|p| (p - point).norm())
		.fold(f64::INFINITY, f64::min)
}


pub fn centroid<'a>(points: impl IntoIterator<Item=&'a Point>) -> Option<Point> {
	let mut sum = Point::zeros();
	let mut count = 0usize;
	for p in points {
		sum += p;
		count += 1;
	}
	if count == 0 {
		None
	} else {
		Some(sum/count as f64)
	}
}


/// Every particle placed so far in a tomogram, across all rounds.
/// Only grows: accepted candidates are pushed as soon as they're accepted.
#[derive(Debug, Clone, Default)]
pub struct PlacedIndex {
	points: Vec<Point>
}

impl PlacedIndex {

	pub fn new() -> Self {
		Self::default()
	}

	pub fn from_points(points: impl IntoIterator<Item=Point>) -> Self {
		Self {
			points: points.into_iter().collect()
		}
	}

	pub fn len(&self) -> usize {
		self.points.len()
	}

	pub fn is_empty(&self) -> bool {
		self.points.is_empty()
	}

	pub fn points(&self) -> &[Point] {
		&self.points
	}

	pub fn push(&mut self, point: Point) {
		self.points.push(point);
	}

	pub fn extend(&mut self, points: impl IntoIterator<Item=Point>) {
		self.points.extend(points);
	}

	pub fn closest_distance(&self, point: &Point) -> f64 {
		closest_distance(point, &self.points)
	}
}
