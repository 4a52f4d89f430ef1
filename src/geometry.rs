use std::ops::Index;

use glam::Vec3;

pub mod ray;

pub use ray::Ray;

#[derive(Clone, Copy, Debug, PartialEq, Eq)]
#[repr(u8)]
pub enum Axis {
    X = 0,
    Y = 1,
    Z = 2,
}

impl Axis {
    pub const ALL: [Axis; 3] = [Axis::X, Axis::Y, Axis::Z];

    pub fn from_index(i: usize) -> Self {
        match i {
            0 => Axis::X,
            1 => Axis::Y,
            _ => Axis::Z,
        }
    }

    /// The two axes orthogonal to this one.
    pub fn others(self) -> (Axis, Axis) {
        match self {
            Axis::X => (Axis::Y, Axis::Z),
            Axis::Y => (Axis::X, Axis::Z),
            Axis::Z => (Axis::X, Axis::Y),
        }
    }
}

#[derive(Debug, Clone, Copy, PartialEq)]
pub struct Aabb {
    pub min: Vec3,
    pub max: Vec3,
}

impl Aabb {
    pub fn new(a: Vec3, b: Vec3) -> Self {
        let min = Vec3::min(a, b);
        let max = Vec3::max(a, b);
        Self { min, max }
    }

    pub fn union_point(self, b: Vec3) -> Self {
        let min = Vec3::min(self.min, b);
        let max = Vec3::max(self.max, b);
        Self { min, max }
    }

    pub fn union_aabb(self, b: Aabb) -> Self {
        let min = Vec3::min(self.min, b.min);
        let max = Vec3::max(self.max, b.max);
        Self { min, max }
    }

    pub fn intersection(self, b: Aabb) -> Self {
        Self {
            min: Vec3::max(self.min, b.min),
            max: Vec3::min(self.max, b.max),
        }
    }

    pub fn fits_within(&self, other: Aabb) -> bool {
        self.min.cmpge(other.min).all() && self.max.cmple(other.max).all()
    }

    pub fn contains_point(&self, p: Vec3) -> bool {
        p.cmpge(self.min).all() && p.cmple(self.max).all()
    }

    pub fn diagonal(&self) -> Vec3 {
        self.max - self.min
    }

    /// Position of `other` relative to the box, normalized so that the box
    /// corners map to 0 and 1. Degenerate axes stay unnormalized.
    pub fn offset_of(&self, other: Vec3) -> Vec3 {
        let mut off = other - self.min;
        if self.max.x > self.min.x {
            off.x /= self.max.x - self.min.x;
        }
        if self.max.y > self.min.y {
            off.y /= self.max.y - self.min.y;
        }
        if self.max.z > self.min.z {
            off.z /= self.max.z - self.min.z;
        }
        off
    }

    pub fn area(&self) -> f32 {
        let d = self.diagonal();
        2. * (d.x * d.y + d.x * d.z + d.z * d.y)
    }

    pub fn center(&self) -> Vec3 {
        (self.min + self.max) / 2.
    }

    pub fn max_axis(&self) -> Axis {
        let diag = self.diagonal();
        if diag.x > diag.y && diag.x > diag.z {
            Axis::X
        } else if diag.y > diag.z {
            Axis::Y
        } else {
            Axis::Z
        }
    }

    pub fn is_degenerate(&self) -> bool {
        !self.min.cmple(self.max).all()
    }

    pub fn is_finite(&self) -> bool {
        self.min.is_finite() && self.max.is_finite()
    }

    /// The two halves of the box split by an axial plane.
    pub fn split_at(&self, axis: Axis, position: f32) -> (Aabb, Aabb) {
        let mut left = *self;
        let mut right = *self;
        left.max[axis as usize] = position;
        right.min[axis as usize] = position;
        (left, right)
    }

    pub const EMPTY: Aabb = Aabb {
        min: Vec3::splat(f32::MAX),
        max: Vec3::splat(f32::MIN),
    };
}

impl Index<bool> for Aabb {
    type Output = Vec3;

    fn index(&self, index: bool) -> &Self::Output {
        match index {
            true => &self.max,
            false => &self.min,
        }
    }
}

/// Slab test between a ray and a box. Returns the parametric entry and exit
/// distances when the slab interval is non-empty and overlaps the ray's
/// valid interval. An origin inside the box reports `tmin <= 0`.
///
/// Original: An Efficient and Robust Ray-Box Intersection Algorithm.
/// https://people.csail.mit.edu/amy/papers/box-jgt.pdf
pub fn ray_aabb_test(aabb: &Aabb, ray: &Ray) -> Option<(f32, f32)> {
    let dir_is_neg = ray.dir_is_neg();

    let mut tmin = (aabb[dir_is_neg.x].x - ray.orig.x) * ray.inv_dir.x;
    let mut tmax = (aabb[!dir_is_neg.x].x - ray.orig.x) * ray.inv_dir.x;
    let tymin = (aabb[dir_is_neg.y].y - ray.orig.y) * ray.inv_dir.y;
    let tymax = (aabb[!dir_is_neg.y].y - ray.orig.y) * ray.inv_dir.y;

    if tmin > tymax || tymin > tmax {
        return None;
    }
    if tymin > tmin {
        tmin = tymin;
    }
    if tymax < tmax {
        tmax = tymax;
    }

    let tzmin = (aabb[dir_is_neg.z].z - ray.orig.z) * ray.inv_dir.z;
    let tzmax = (aabb[!dir_is_neg.z].z - ray.orig.z) * ray.inv_dir.z;

    if tmin > tzmax || tzmin > tmax {
        return None;
    }
    if tzmin > tmin {
        tmin = tzmin;
    }
    if tzmax < tmax {
        tmax = tzmax;
    }

    if tmin <= ray.tmax && tmax >= ray.tmin {
        Some((tmin, tmax))
    } else {
        None
    }
}
