//! Acceleration structures for single-ray queries over triangle meshes: a
//! uniform grid with 3D-DDA traversal, binary and 4-wide bounding-volume
//! hierarchies, and a surface-area-heuristic KD-tree with perfect triangle
//! clipping, together with the mailboxes and scratch storage their
//! traversal kernels share.
//!
//! A caller owns an [`ObjectSet`], builds a structure over it, then issues
//! rays through the matching `raycast_*` kernel. Structures are read-only
//! after the build; concurrent queries each need their own [`Ray`],
//! mailbox and [`Scratch`].

pub mod bvh;
pub mod clip;
pub mod error;
pub mod geometry;
pub mod grid;
pub mod kdtree;
pub mod mailbox;
pub mod mesh;
pub mod object_set;
pub mod ply_loader;
pub mod ppm;
pub mod qbvh;
pub mod scratch;
pub mod stats;
pub mod util;

pub use bvh::{raycast_bvh, AabbTree, BinnedSahBuilder, MedianCutBuilder, TreeBuilder};
pub use error::BuildError;
pub use geometry::{ray_aabb_test, Aabb, Axis, Ray};
pub use grid::{raycast_grid, UniformGrid};
pub use kdtree::{raycast_kdtree, KdTree, SahKdBuilder};
pub use mailbox::{DirectMapMailbox, FifoMailbox, Mailbox, NullMailbox, SimdFifoMailbox};
pub use mesh::BasicMesh;
pub use object_set::{ClipObjectSet, ObjectSet, RayHit};
pub use qbvh::{raycast_qbvh, Qbvh};
pub use scratch::{Scratch, ScratchArray};

#[cfg(test)]
pub(crate) mod test_support {
    use std::cell::Cell;

    use glam::vec3;
    use rand::{rngs::SmallRng, Rng};

    use crate::geometry::{Aabb, Axis, Ray};
    use crate::mesh::BasicMesh;
    use crate::object_set::{ClipObjectSet, ObjectSet, RayHit};

    /// Soup of small triangles scattered through the unit cube.
    pub fn random_soup(rng: &mut SmallRng, count: usize) -> BasicMesh {
        let mut triangles = Vec::with_capacity(count);
        for _ in 0..count {
            let c = vec3(rng.gen(), rng.gen(), rng.gen());
            let edge = |rng: &mut SmallRng| (vec3(rng.gen(), rng.gen(), rng.gen()) - 0.5) * 0.3;
            triangles.push([c, c + edge(rng), c + edge(rng)]);
        }
        BasicMesh::from_triangles(&triangles)
    }

    /// Rays starting around the soup and aimed at random interior targets.
    pub fn random_rays(rng: &mut SmallRng, count: usize) -> Vec<Ray> {
        (0..count)
            .map(|_| {
                let orig = vec3(
                    rng.gen::<f32>() * 4. - 1.5,
                    rng.gen::<f32>() * 4. - 1.5,
                    rng.gen::<f32>() * 4. - 1.5,
                );
                let target = vec3(rng.gen(), rng.gen(), rng.gen());
                Ray::new(orig, (target - orig).normalize())
            })
            .collect()
    }

    /// Reference caster: tests every object in index order.
    pub fn brute_force_raycast<S: ObjectSet>(objects: &S, ray: &mut Ray, hit: &mut RayHit) {
        for id in 0..objects.object_count() {
            objects.ray_intersect(ray, hit, id);
        }
    }

    /// Wraps an object set and counts how often its intersection callback
    /// runs, for asserting mailbox and traversal efficiency properties.
    pub struct CountingSet<S> {
        inner: S,
        calls: Cell<usize>,
    }

    impl<S> CountingSet<S> {
        pub fn new(inner: S) -> Self {
            Self {
                inner,
                calls: Cell::new(0),
            }
        }

        pub fn calls(&self) -> usize {
            self.calls.get()
        }

        pub fn reset(&self) {
            self.calls.set(0);
        }
    }

    impl<S: ObjectSet> ObjectSet for CountingSet<S> {
        fn object_count(&self) -> u32 {
            self.inner.object_count()
        }

        fn bounds(&self) -> Aabb {
            self.inner.bounds()
        }

        fn object_bounds(&self, id: u32) -> Aabb {
            self.inner.object_bounds(id)
        }

        fn ray_intersect(&self, ray: &mut Ray, hit: &mut RayHit, id: u32) {
            self.calls.set(self.calls.get() + 1);
            self.inner.ray_intersect(ray, hit, id);
        }

        fn ray_intersect_span(&self, ray: &mut Ray, hit: &mut RayHit, ids: &[u32]) {
            self.calls.set(self.calls.get() + ids.len());
            self.inner.ray_intersect_span(ray, hit, ids);
        }

        fn remap(&mut self, perm: &[u32]) {
            self.inner.remap(perm);
        }
    }

    impl<S: ClipObjectSet> ClipObjectSet for CountingSet<S> {
        fn clip_object(&self, id: u32, parent: &Aabb, axis: Axis, position: f32) -> (Aabb, Aabb) {
            self.inner.clip_object(id, parent, axis, position)
        }
    }
}
