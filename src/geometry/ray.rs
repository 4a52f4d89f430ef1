use glam::{BVec3, Vec3};

/// A ray with its valid parametric interval. `inv_dir` is cached for the
/// slab tests; zero direction components map to infinite components, which
/// the tests handle. Traversal clamps `tmax` whenever a closer hit is
/// confirmed.
#[derive(Clone, PartialEq, Debug)]
pub struct Ray {
    pub orig: Vec3,
    pub dir: Vec3,
    pub inv_dir: Vec3,
    pub tmin: f32,
    pub tmax: f32,
}

impl Ray {
    pub fn new(orig: Vec3, dir: Vec3) -> Self {
        Self::with_interval(orig, dir, 0., f32::INFINITY)
    }

    pub fn with_interval(orig: Vec3, dir: Vec3, tmin: f32, tmax: f32) -> Self {
        Self {
            orig,
            dir,
            inv_dir: Vec3::ONE / dir,
            tmin,
            tmax,
        }
    }

    pub fn dir_is_neg(&self) -> BVec3 {
        self.inv_dir.cmplt(Vec3::ZERO)
    }

    pub fn at(&self, t: f32) -> Vec3 {
        self.orig + self.dir * t
    }

    pub fn interval_overlaps(&self, t0: f32, t1: f32) -> bool {
        t0 <= self.tmax && t1 >= self.tmin
    }
}
