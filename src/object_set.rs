use glam::Vec2;

use crate::geometry::{Aabb, Axis, Ray};

/// Closest confirmed hit of a ray query. `object == RayHit::NO_OBJECT`
/// means no hit; `uv` are the barycentric coordinates of the hit.
#[derive(Clone, Copy, Debug, PartialEq)]
pub struct RayHit {
    pub object: u32,
    pub uv: Vec2,
}

impl RayHit {
    pub const NO_OBJECT: u32 = u32::MAX;

    pub const NONE: RayHit = RayHit {
        object: Self::NO_OBJECT,
        uv: Vec2::ZERO,
    };

    pub fn is_hit(&self) -> bool {
        self.object != Self::NO_OBJECT
    }
}

/// The geometry collection an acceleration structure is built over and
/// queried against. Objects are addressed by dense indices `0..object_count`
/// (`RayHit::NO_OBJECT` is reserved for the miss sentinel).
pub trait ObjectSet {
    fn object_count(&self) -> u32;

    /// Bounds of the whole set.
    fn bounds(&self) -> Aabb;

    fn object_bounds(&self, id: u32) -> Aabb;

    /// Tests the ray against one object. On a hit inside the ray's valid
    /// interval this clamps `ray.tmax` and rewrites `hit`; on a miss both
    /// are left untouched.
    fn ray_intersect(&self, ray: &mut Ray, hit: &mut RayHit, id: u32);

    /// Batched form used by leaf ranges of the wide tree.
    fn ray_intersect_span(&self, ray: &mut Ray, hit: &mut RayHit, ids: &[u32]) {
        for &id in ids {
            self.ray_intersect(ray, hit, id);
        }
    }

    /// Reorders the set so that the old object `perm[i]` becomes object `i`.
    /// Only legal between builds, never during traversal.
    fn remap(&mut self, perm: &[u32]);
}

/// Object sets that can clip their primitives against an axial plane,
/// needed by the KD builder's split evaluation.
pub trait ClipObjectSet: ObjectSet {
    /// The two sub-boxes of object `id` restricted to `parent` and split by
    /// the plane `axis = position`.
    fn clip_object(&self, id: u32, parent: &Aabb, axis: Axis, position: f32) -> (Aabb, Aabb);
}
